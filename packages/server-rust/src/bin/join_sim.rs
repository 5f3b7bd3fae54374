//! `joingate-sim`: fires a burst of concurrent joins at one in-memory party
//! and reports how they were resolved.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::NaiveTime;
use clap::{Parser, ValueEnum};
use joingate_core::{
    FixedClock, Gender, MemberId, MemberRef, Party, PartyId, SystemClock, WallClock,
};
use joingate_server::config::{CoordinationMode, JoinConfig};
use joingate_server::lock::InMemoryFairLock;
use joingate_server::service::{build_join_pipeline, JoinRequest};
use joingate_server::store::InMemoryPartyStore;
use joingate_server::telemetry::{init_tracing, LogFormat};
use joingate_server::JoinCoordinator;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

const PARTY: PartyId = PartyId(1);
const HOST: MemberId = MemberId(0);

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Pick by time of day.
    Auto,
    Pessimistic,
    Optimistic,
}

#[derive(Parser, Debug)]
#[command(name = "joingate-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Party capacity, host included.
    #[arg(long, default_value_t = 10, env = "JOINGATE_CAPACITY")]
    capacity: u32,

    /// Number of concurrent joiners.
    #[arg(long, default_value_t = 100)]
    joiners: u64,

    #[arg(long, value_enum, default_value_t = ModeArg::Auto)]
    mode: ModeArg,

    /// Pretend the wall clock reads this time (HH:MM:SS).
    #[arg(long)]
    at: Option<NaiveTime>,

    /// Only admit joiners of the host's gender.
    #[arg(long)]
    same_gender_only: bool,

    /// Make every store call fail.
    #[arg(long)]
    store_outage: bool,

    /// Pause between a store read and its write, in milliseconds.
    #[arg(long, default_value_t = 1)]
    think_time_ms: u64,

    /// Seed for joiner genders.
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// JSON configuration file; missing fields take their defaults.
    #[arg(long, env = "JOINGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Print the summary as JSON.
    #[arg(long)]
    json: bool,

    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

fn load_config(args: &Args) -> anyhow::Result<JoinConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            JoinConfig::from_json(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => JoinConfig::default(),
    };
    match args.mode {
        ModeArg::Auto => {}
        ModeArg::Pessimistic => config.forced_mode = Some(CoordinationMode::Pessimistic),
        ModeArg::Optimistic => config.forced_mode = Some(CoordinationMode::Optimistic),
    }
    Ok(config)
}

fn seed_store(args: &Args) -> InMemoryPartyStore {
    let store = InMemoryPartyStore::new().with_think_time(Duration::from_millis(args.think_time_ms));
    let host = MemberRef::new(HOST, Gender::Female);
    store.register_member(host);
    store.insert_party(Party::new(PARTY, args.capacity, host, args.same_gender_only));

    let mut rng = StdRng::seed_from_u64(args.seed);
    for id in 1..=args.joiners {
        let gender = if rng.random_bool(0.5) {
            Gender::Female
        } else {
            Gender::Male
        };
        store.register_member(MemberRef::new(MemberId(id), gender));
    }
    store.set_available(!args.store_outage);
    store
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format)?;

    let config = load_config(&args)?;
    let clock: Arc<dyn WallClock> = match args.at {
        Some(time) => Arc::new(FixedClock::new(time)),
        None => Arc::new(SystemClock),
    };
    let store = Arc::new(seed_store(&args));
    let coordinator = Arc::new(JoinCoordinator::new(
        store.clone(),
        Arc::new(InMemoryFairLock::new()),
        clock,
        config,
    ));
    tracing::info!(
        mode = %coordinator.current_mode(),
        capacity = args.capacity,
        joiners = args.joiners,
        "starting simulation"
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, cancelling waiting joins");
                cancel.cancel();
            }
        }
    });

    let pipeline = build_join_pipeline(Arc::clone(&coordinator));
    let mut joins = JoinSet::new();
    for id in 1..=args.joiners {
        let request = JoinRequest::new(id, PARTY, MemberId(id)).with_cancel(cancel.clone());
        joins.spawn(pipeline.clone().oneshot(request));
    }

    let mut outcomes: BTreeMap<&'static str, u64> = BTreeMap::new();
    while let Some(joined) = joins.join_next().await {
        let outcome = match joined.context("join task panicked")? {
            Ok(_) => "joined",
            Err(err) => err.code(),
        };
        *outcomes.entry(outcome).or_default() += 1;
    }

    let party = store.party(PARTY).context("party vanished")?;
    let breaker = coordinator.breaker().metrics();

    if args.json {
        let summary = serde_json::json!({
            "mode": coordinator.current_mode(),
            "outcomes": outcomes,
            "party": party,
            "breaker": breaker,
            "store_calls": store.join_calls(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("mode:         {}", coordinator.current_mode());
        for (outcome, count) in &outcomes {
            println!("{outcome:<22}{count}");
        }
        println!(
            "participants: {}/{} (version {})",
            party.current_participants(),
            party.capacity(),
            party.version()
        );
        println!("store calls:  {}", store.join_calls());
        println!("breaker:      {:?}", breaker.state);
    }
    Ok(())
}
