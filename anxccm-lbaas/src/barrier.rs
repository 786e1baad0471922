//! Reusable rendezvous barrier.
//!
//! A fixed set of registered parties meets once per round: every party
//! calls `arrive`, the last one to arrive runs the round's work exactly once,
//! and every party of the round receives a clone of the result. Then the
//! barrier re-arms for the next round.
//!
//! A party that is finished calls `leave`; the remaining parties no longer
//! wait for it, which may complete the current round. Cancelling the token
//! passed to `arrive` unblocks that caller; cancelling the round's leader
//! releases everybody of that round with `Canceled`.
//!
//! The party map sits behind a plain mutex that is never held across an
//! await or a channel send. Each waiting party owns a oneshot receiver; the
//! leader takes all senders out of the map before it starts the work.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RendezvousError {
    #[error("party is not registered")]
    Unregistered,

    #[error("party is already waiting in this round")]
    AlreadyWaiting,

    #[error("canceled")]
    Canceled,
}

type Outcome<T> = Result<T, RendezvousError>;

struct Parties<K, T> {
    /// `Some` once the party arrived in the current round.
    waiting: HashMap<K, Option<oneshot::Sender<Outcome<T>>>>,
    leading: bool,
    rounds: u64,
}

/// Cyclic barrier whose last arrival does the work for everybody.
pub struct Rendezvous<K, T> {
    parties: Mutex<Parties<K, T>>,
    changed: Notify,
}

impl<K, T> Default for Rendezvous<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Rendezvous<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            parties: Mutex::new(Parties {
                waiting: HashMap::new(),
                leading: false,
                rounds: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Parties<K, T>> {
        self.parties.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a party. Returns false if it was registered already.
    pub fn register(&self, key: K) -> bool {
        let mut parties = self.lock();
        if parties.waiting.contains_key(&key) {
            return false;
        }
        parties.waiting.insert(key, None);
        true
    }

    /// Number of parties a round waits for.
    pub fn parties(&self) -> usize {
        self.lock().waiting.len()
    }

    /// Number of completed rounds.
    pub fn rounds(&self) -> u64 {
        self.lock().rounds
    }

    /// Remove a party for good.
    pub fn leave(&self, key: &K) -> Result<(), RendezvousError> {
        {
            let mut parties = self.lock();
            if parties.waiting.remove(key).is_none() {
                return Err(RendezvousError::Unregistered);
            }
        }
        // The leaver might have been the last one the others waited for.
        self.changed.notify_waiters();
        Ok(())
    }

    /// Wait until every registered party arrived, then return the round's result.
    ///
    /// `work` runs only if this caller completes the round.
    pub async fn arrive<F, Fut>(
        &self,
        key: &K,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, RendezvousError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut rx = {
            let mut parties = self.lock();
            let slot = parties
                .waiting
                .get_mut(key)
                .ok_or(RendezvousError::Unregistered)?;
            if slot.is_some() {
                return Err(RendezvousError::AlreadyWaiting);
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(tx);
            rx
        };

        let mut work = Some(work);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(f) = work.take() {
                match self.claim() {
                    Some(senders) => {
                        let mut round = Round {
                            barrier: self,
                            senders,
                        };
                        let outcome = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => Err(RendezvousError::Canceled),
                            value = f() => Ok(value),
                        };
                        round.release(outcome);
                    }
                    None => work = Some(f),
                }
            }

            tokio::select! {
                biased;
                outcome = &mut rx => {
                    return outcome.unwrap_or(Err(RendezvousError::Canceled));
                }
                _ = cancel.cancelled() => {
                    self.withdraw(key);
                    return Err(RendezvousError::Canceled);
                }
                _ = &mut notified => {}
            }
        }
    }

    /// Become the round's leader if everybody arrived and nobody leads yet.
    fn claim(&self) -> Option<Vec<oneshot::Sender<Outcome<T>>>> {
        let mut parties = self.lock();
        if parties.leading
            || parties.waiting.is_empty()
            || parties.waiting.values().any(Option::is_none)
        {
            return None;
        }
        parties.leading = true;
        Some(
            parties
                .waiting
                .values_mut()
                .filter_map(Option::take)
                .collect(),
        )
    }

    fn withdraw(&self, key: &K) {
        if let Some(slot) = self.lock().waiting.get_mut(key) {
            *slot = None;
        }
    }
}

/// A round being led. Releasing it, or dropping it half way, re-arms the barrier.
struct Round<'a, K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    barrier: &'a Rendezvous<K, T>,
    senders: Vec<oneshot::Sender<Outcome<T>>>,
}

impl<K, T> Round<'_, K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn release(&mut self, outcome: Outcome<T>) {
        let senders = std::mem::take(&mut self.senders);
        let round = {
            let mut parties = self.barrier.lock();
            parties.leading = false;
            parties.rounds += 1;
            parties.rounds
        };
        debug!(round, released = senders.len(), "Rendezvous round complete");
        for tx in senders {
            // Receiver gone means that party was canceled meanwhile.
            let _ = tx.send(outcome.clone());
        }
        self.barrier.changed.notify_waiters();
    }
}

impl<K, T> Drop for Round<'_, K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    fn drop(&mut self) {
        if !self.senders.is_empty() {
            self.release(Err(RendezvousError::Canceled));
        }
    }
}
