//! Per-key FIFO serialization
//!
//! [`RequestGate::enter`] reserves a place in the queue for a key
//! synchronously, so a caller that enters before spawning work keeps its
//! position even if the spawned task runs late. Holders for the same key
//! run strictly in entry order; different keys never wait on each other.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

/// Release signal left behind by the most recent entrant for a key
struct Lane {
    seq: u64,
    released: oneshot::Receiver<()>,
}

pub struct RequestGate<K>
where
    K: Eq + Hash,
{
    lanes: Arc<DashMap<K, Lane>>,
    next_seq: Arc<AtomicU64>,
}

impl<K> Clone for RequestGate<K>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            lanes: self.lanes.clone(),
            next_seq: self.next_seq.clone(),
        }
    }
}

impl<K> Default for RequestGate<K>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            lanes: Arc::new(DashMap::new()),
            next_seq: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<K> std::fmt::Debug for RequestGate<K>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("active_keys", &self.lanes.len())
            .finish()
    }
}

impl<K> RequestGate<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next place in line for `key`
    pub fn enter(&self, key: K) -> GateTicket<K> {
        let (release, released) = oneshot::channel();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .lanes
            .insert(key.clone(), Lane { seq, released })
            .map(|lane| lane.released);

        GateTicket {
            guard: Some(GateGuard {
                gate: self.clone(),
                key,
                seq,
                release: Some(release),
            }),
            previous,
        }
    }

    /// Hold `key` only if nobody else holds or waits for it
    pub fn try_enter(&self, key: K) -> Option<GateGuard<K>> {
        match self.lanes.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                let (release, released) = oneshot::channel();
                let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                entry.insert(Lane { seq, released });
                Some(GateGuard {
                    gate: self.clone(),
                    key,
                    seq,
                    release: Some(release),
                })
            }
        }
    }

    /// Number of keys with a holder or waiter
    pub fn active_keys(&self) -> usize {
        self.lanes.len()
    }

    fn clear_lane(&self, key: &K, seq: u64) {
        self.lanes.remove_if(key, |_, lane| lane.seq == seq);
    }
}

/// A reserved place in line that has not started yet
pub struct GateTicket<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    guard: Option<GateGuard<K>>,
    previous: Option<oneshot::Receiver<()>>,
}

impl<K> GateTicket<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Wait for every earlier entrant to release, then hold the key
    pub async fn acquire(mut self) -> GateGuard<K> {
        // Left in place while waiting so a cancelled acquire still hands off
        // in order through Drop. A dropped sender is the release signal.
        if let Some(previous) = self.previous.as_mut() {
            let _ = previous.await;
        }
        self.previous = None;
        self.take_guard()
    }

    /// Hold the key if every earlier entrant has already released
    pub fn try_acquire(mut self) -> Result<GateGuard<K>, Self> {
        match self.previous.as_mut().map(|previous| previous.try_recv()) {
            Some(Err(TryRecvError::Empty)) => Err(self),
            _ => {
                self.previous = None;
                Ok(self.take_guard())
            }
        }
    }

    fn take_guard(&mut self) -> GateGuard<K> {
        match self.guard.take() {
            Some(guard) => guard,
            None => unreachable!("gate ticket guard taken twice"),
        }
    }
}

impl<K> Drop for GateTicket<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        let (Some(guard), Some(previous)) = (self.guard.take(), self.previous.take()) else {
            return;
        };
        // Abandoned while still queued: pass the release along only once the
        // earlier holder is done, so later entrants keep their ordering.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = previous.await;
                    drop(guard);
                });
            }
            Err(_) => drop(guard),
        }
    }
}

/// Exclusive hold on a key, released on drop
pub struct GateGuard<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    gate: RequestGate<K>,
    key: K,
    seq: u64,
    release: Option<oneshot::Sender<()>>,
}

impl<K> GateGuard<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K> Drop for GateGuard<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        drop(self.release.take());
        self.gate.clear_lane(&self.key, self.seq);
    }
}
