//! In-process fair lock.
//!
//! Per key: one holder with a lease deadline, and a FIFO queue of waiters.
//! A released or expired lock is handed directly to the head of the queue,
//! so a late arrival can never overtake someone already waiting.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::coordination::mutex::{DistributedMutex, LockToken, MutexError};

struct Holder {
    holder_id: String,
    fencing: u64,
    lease_until: Instant,
}

impl Holder {
    fn matches(&self, token: &LockToken) -> bool {
        self.fencing == token.fencing && self.holder_id == token.holder_id
    }
}

struct Waiter {
    ticket: u64,
    lease: Duration,
    notify: oneshot::Sender<LockToken>,
}

#[derive(Default)]
struct KeyState {
    holder: Option<Holder>,
    waiters: VecDeque<Waiter>,
}

impl KeyState {
    fn is_idle(&self) -> bool {
        self.holder.is_none() && self.waiters.is_empty()
    }
}

struct Shared {
    keys: Mutex<HashMap<String, KeyState>>,
    next_fencing: AtomicU64,
    next_ticket: AtomicU64,
}

impl Shared {
    fn new_token(&self, key: &str) -> LockToken {
        LockToken {
            key: key.to_owned(),
            holder_id: uuid::Uuid::new_v4().to_string(),
            fencing: self.next_fencing.fetch_add(1, Ordering::Relaxed) + 1,
        }
    }

    /// Hands the lock to the first waiter still listening. Caller holds the
    /// map lock and has already cleared the holder.
    fn promote_next(&self, key: &str, state: &mut KeyState, now: Instant) {
        while let Some(waiter) = state.waiters.pop_front() {
            let token = self.new_token(key);
            state.holder = Some(Holder {
                holder_id: token.holder_id.clone(),
                fencing: token.fencing,
                lease_until: now + waiter.lease,
            });
            if waiter.notify.send(token).is_ok() {
                tracing::trace!(key, ticket = waiter.ticket, "lock handed to next waiter");
                return;
            }
            state.holder = None;
        }
    }

    /// Frees a holder whose lease has run out and promotes the next waiter.
    fn reap_expired(&self, key: &str, state: &mut KeyState, now: Instant) {
        let expired = state
            .holder
            .as_ref()
            .is_some_and(|holder| holder.lease_until <= now);
        if expired {
            if let Some(holder) = state.holder.take() {
                tracing::warn!(key, fencing = holder.fencing, "lock lease expired without release");
            }
            self.promote_next(key, state, now);
        }
    }

    fn holder_expiry(&self, key: &str) -> Option<Instant> {
        let keys = self.keys.lock();
        keys.get(key)
            .and_then(|state| state.holder.as_ref())
            .map(|holder| holder.lease_until)
    }

    fn reap(&self, key: &str) {
        let mut keys = self.keys.lock();
        self.reap_and_prune(&mut keys, key, Instant::now());
    }

    /// Reaps `key` and drops its entry once nobody holds or waits on it.
    fn reap_and_prune(&self, keys: &mut HashMap<String, KeyState>, key: &str, now: Instant) {
        if let Some(state) = keys.get_mut(key) {
            self.reap_expired(key, state, now);
            if state.is_idle() {
                keys.remove(key);
            }
        }
    }

    /// Releases the lock held by `token`, if it still is, and promotes.
    fn release_token(&self, token: &LockToken) -> bool {
        let now = Instant::now();
        let mut keys = self.keys.lock();
        let Some(state) = keys.get_mut(&token.key) else {
            return false;
        };
        let held = state.holder.as_ref().is_some_and(|holder| holder.matches(token));
        if held {
            state.holder = None;
            self.promote_next(&token.key, state, now);
        }
        if state.is_idle() {
            keys.remove(&token.key);
        }
        held
    }
}

enum Entry {
    Granted(LockToken),
    Queued {
        ticket: u64,
        rx: oneshot::Receiver<LockToken>,
    },
}

/// A queued acquisition. Dropping it before the grant is observed withdraws
/// from the queue, or releases a grant that already landed.
struct PendingWaiter<'a> {
    shared: &'a Shared,
    key: &'a str,
    ticket: u64,
    rx: oneshot::Receiver<LockToken>,
    done: bool,
}

impl PendingWaiter<'_> {
    /// Gives up waiting. A grant that landed concurrently is kept.
    fn withdraw(&mut self) -> Option<LockToken> {
        self.done = true;
        let mut keys = self.shared.keys.lock();
        if let Ok(token) = self.rx.try_recv() {
            return Some(token);
        }
        if let Some(state) = keys.get_mut(self.key) {
            state.waiters.retain(|waiter| waiter.ticket != self.ticket);
            if state.is_idle() {
                keys.remove(self.key);
            }
        }
        None
    }
}

impl Drop for PendingWaiter<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Some(token) = self.withdraw() {
            tracing::debug!(key = self.key, "waiter cancelled after grant, releasing");
            self.shared.release_token(&token);
        }
    }
}

/// Fair, lease-bounded lock shared within one process.
///
/// Cheap to clone; clones share the same lock table. Suitable for a single
/// node and for tests. Multi-node deployments plug a networked provider in
/// behind the same [`DistributedMutex`] trait.
#[derive(Clone)]
pub struct InMemoryFairLock {
    shared: Arc<Shared>,
}

impl InMemoryFairLock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                keys: Mutex::new(HashMap::new()),
                next_fencing: AtomicU64::new(0),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    /// Returns `true` if `key` has a holder whose lease is still running.
    #[must_use]
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.shared
            .keys
            .lock()
            .get(key)
            .and_then(|state| state.holder.as_ref())
            .is_some_and(|holder| holder.lease_until > now)
    }

    /// Number of acquisitions queued on `key`.
    #[must_use]
    pub fn waiting(&self, key: &str) -> usize {
        self.shared
            .keys
            .lock()
            .get(key)
            .map_or(0, |state| state.waiters.len())
    }

    fn enqueue_or_grant(&self, key: &str, lease: Duration) -> Entry {
        let now = Instant::now();
        let mut keys = self.shared.keys.lock();
        let state = keys.entry(key.to_owned()).or_default();
        self.shared.reap_expired(key, state, now);

        if state.is_idle() {
            let token = self.shared.new_token(key);
            state.holder = Some(Holder {
                holder_id: token.holder_id.clone(),
                fencing: token.fencing,
                lease_until: now + lease,
            });
            return Entry::Granted(token);
        }

        let ticket = self.shared.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (notify, rx) = oneshot::channel();
        state.waiters.push_back(Waiter {
            ticket,
            lease,
            notify,
        });
        Entry::Queued { ticket, rx }
    }
}

impl Default for InMemoryFairLock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DistributedMutex for InMemoryFairLock {
    async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockToken>, MutexError> {
        let deadline = Instant::now() + wait;
        let (ticket, rx) = match self.enqueue_or_grant(key, lease) {
            Entry::Granted(token) => return Ok(Some(token)),
            Entry::Queued { ticket, rx } => (ticket, rx),
        };

        let mut pending = PendingWaiter {
            shared: &self.shared,
            key,
            ticket,
            rx,
            done: false,
        };

        loop {
            let wake_at = self
                .shared
                .holder_expiry(key)
                .map_or(deadline, |expiry| expiry.min(deadline));

            tokio::select! {
                biased;
                granted = &mut pending.rx => {
                    pending.done = true;
                    return Ok(granted.ok());
                }
                () = tokio::time::sleep_until(wake_at) => {
                    if Instant::now() >= deadline {
                        // A lease running out at the deadline still hands over.
                        self.shared.reap(key);
                        return Ok(pending.withdraw());
                    }
                    self.shared.reap(key);
                }
            }
        }
    }

    async fn is_held_by(&self, token: &LockToken) -> Result<bool, MutexError> {
        let now = Instant::now();
        let mut keys = self.shared.keys.lock();
        self.shared.reap_and_prune(&mut keys, &token.key, now);
        Ok(keys
            .get(&token.key)
            .and_then(|state| state.holder.as_ref())
            .is_some_and(|holder| holder.matches(token) && holder.lease_until > now))
    }

    async fn release(&self, token: &LockToken) -> Result<(), MutexError> {
        if !self.shared.release_token(token) {
            tracing::debug!(key = %token.key, fencing = token.fencing, "release of lock not held");
        }
        Ok(())
    }
}
