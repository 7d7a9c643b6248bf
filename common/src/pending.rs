//! Request/response correlation.
//!
//! A [`PendingTable`] maps request identifiers to the caller waiting on them.
//! Each entry is settled at most once: by [`PendingTable::settle`] when the
//! matching reply arrives, by its deadline, or by
//! [`PendingTable::reject_all`] when the owning connection goes away.
//! Whichever happens first removes the entry; the others become no-ops.

use std::{
    collections::HashMap,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::oneshot, time::Instant};

type Settle<T, E> = oneshot::Sender<Result<T, E>>;

struct Entry<T, E> {
    issued_at: Instant,
    settle: Settle<T, E>,
}

pub struct PendingTable<K, T, E> {
    entries: Arc<Mutex<HashMap<K, Entry<T, E>>>>,
}

impl<K, T, E> Clone for PendingTable<K, T, E> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<K, T, E> Default for PendingTable<K, T, E> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Returned by [`PendingTable::register`] when the identifier is already
/// outstanding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("request identifier is already outstanding")]
pub struct DuplicateId;

impl<K, T, E> PendingTable<K, T, E>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Entry<T, E>>> {
        // Entries hold no invariants a panicking holder could break.
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `id` with a deadline `timeout` from now.
    pub fn register(&self, id: K, timeout: Duration) -> Result<Waiter<K, T, E>, DuplicateId> {
        let mut entries = self.lock();
        if entries.contains_key(&id) {
            return Err(DuplicateId);
        }
        let (settle, rx) = oneshot::channel();
        let issued_at = Instant::now();
        let deadline = issued_at + timeout;
        entries.insert(id.clone(), Entry { issued_at, settle });
        Ok(Waiter {
            id: Some(id),
            rx,
            deadline,
            table: self.clone(),
        })
    }

    /// Settles the entry for `id`. Returns `false` when nothing was waiting,
    /// i.e. the entry already timed out, was rejected, or never existed.
    pub fn settle(&self, id: &K, outcome: Result<T, E>) -> bool {
        let Some(entry) = self.lock().remove(id) else {
            return false;
        };
        entry.settle.send(outcome).is_ok()
    }

    /// Rejects every outstanding entry and empties the table. Returns how many
    /// entries were rejected.
    pub fn reject_all(&self, error: impl Fn() -> E) -> usize {
        let drained: Vec<Entry<T, E>> = self.lock().drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.settle.send(Err(error()));
        }
        count
    }

    #[cfg(test)]
    fn contains(&self, id: &K) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Age of the oldest outstanding entry, if any.
    pub fn oldest(&self) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .values()
            .map(|entry| now.saturating_duration_since(entry.issued_at))
            .max()
    }

    /// Removes `id` without settling it. Used by the deadline path.
    fn take(&self, id: &K) -> bool {
        self.lock().remove(id).is_some()
    }
}

/// The caller's side of one registered entry.
///
/// Dropping a waiter before it resolves removes its entry from the table.
pub struct Waiter<K, T, E>
where
    K: Eq + Hash + Clone,
{
    id: Option<K>,
    rx: oneshot::Receiver<Result<T, E>>,
    deadline: Instant,
    table: PendingTable<K, T, E>,
}

impl<K, T, E> Waiter<K, T, E>
where
    K: Eq + Hash + Clone,
{
    #[cfg(test)]
    fn id(&self) -> Option<&K> {
        self.id.as_ref()
    }

    /// Waits for the entry to be settled or for its deadline, whichever comes
    /// first. `timed_out` builds the error returned on expiry; `abandoned` is
    /// returned if the table dropped the entry without settling it.
    pub async fn wait(
        mut self,
        timed_out: impl FnOnce() -> E,
        abandoned: impl FnOnce() -> E,
    ) -> Result<T, E> {
        let deadline = self.deadline;
        let outcome = tokio::select! {
            res = &mut self.rx => res.unwrap_or_else(|_| Err(abandoned())),
            _ = tokio::time::sleep_until(deadline) => {
                let removed = match self.id.as_ref() {
                    Some(id) => self.table.take(id),
                    None => false,
                };
                if removed {
                    Err(timed_out())
                } else {
                    // A settle won the race; its value is already in flight.
                    (&mut self.rx).await.unwrap_or_else(|_| Err(abandoned()))
                }
            }
        };
        self.id = None;
        outcome
    }
}

impl<K, T, E> Drop for Waiter<K, T, E>
where
    K: Eq + Hash + Clone,
{
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.table.take(&id);
        }
    }
}
