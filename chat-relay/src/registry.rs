//! Membership tracking for connected peers.
//!
//! The registry is the only state shared between sessions. Two front-ends
//! wrap the same [`Members`] table:
//!
//! - [`Registry`] guards it with a `std::sync::Mutex` for the
//!   thread-per-connection relay.
//! - [`AsyncRegistry`] guards it with a `tokio::sync::Mutex` for the
//!   cooperative chat server, where a task may suspend between taking a
//!   snapshot and sending to it.
//!
//! Neither front-end hands out the table itself, so every access goes through
//! the lock. No I/O happens here; the lock is held only while the table is
//! mutated or copied.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

/// Server-assigned identity of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out monotonically increasing [`PeerId`]s.
#[derive(Debug)]
pub struct PeerIds {
    next: AtomicU64,
}

impl PeerIds {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next_id(&self) -> PeerId {
        PeerId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for PeerIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Upper bound on concurrently registered peers.
///
/// Built from a plain count where `0` means unlimited, matching the
/// `--capacity` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    Unlimited,
    Limited(usize),
}

impl Capacity {
    fn admits(self, current: usize) -> bool {
        match self {
            Capacity::Unlimited => true,
            Capacity::Limited(max) => current < max,
        }
    }
}

impl From<usize> for Capacity {
    fn from(value: usize) -> Self {
        match value {
            0 => Capacity::Unlimited,
            max => Capacity::Limited(max),
        }
    }
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capacity::Unlimited => f.write_str("unlimited"),
            Capacity::Limited(max) => write!(f, "{max}"),
        }
    }
}

/// The table both registry flavours protect.
#[derive(Debug)]
struct Members<H> {
    capacity: Capacity,
    peers: BTreeMap<PeerId, H>,
}

impl<H: Clone> Members<H> {
    fn new(capacity: Capacity) -> Self {
        Self {
            capacity,
            peers: BTreeMap::new(),
        }
    }

    fn insert(&mut self, id: PeerId, handle: H) -> bool {
        if self.peers.contains_key(&id) || !self.capacity.admits(self.peers.len()) {
            return false;
        }
        self.peers.insert(id, handle);
        true
    }

    fn remove(&mut self, id: PeerId) -> Option<H> {
        self.peers.remove(&id)
    }

    fn snapshot(&self, excluding: Option<PeerId>) -> Vec<(PeerId, H)> {
        self.peers
            .iter()
            .filter(|(id, _)| Some(**id) != excluding)
            .map(|(id, handle)| (*id, handle.clone()))
            .collect()
    }

    fn drain(&mut self) -> Vec<(PeerId, H)> {
        std::mem::take(&mut self.peers).into_iter().collect()
    }
}

/// Registry for sessions running on their own OS threads.
#[derive(Debug)]
pub struct Registry<H> {
    members: Mutex<Members<H>>,
}

impl<H: Clone> Registry<H> {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            members: Mutex::new(Members::new(capacity)),
        }
    }

    /// Adds `handle` under `id`. Returns `false`, leaving the registry
    /// untouched, when the capacity is already reached or `id` is taken.
    pub fn register(&self, id: PeerId, handle: H) -> bool {
        self.lock().insert(id, handle)
    }

    /// Removes `id`. Removing an absent id is a no-op and returns `None`.
    pub fn deregister(&self, id: PeerId) -> Option<H> {
        self.lock().remove(id)
    }

    /// Copies every registered handle except `excluding`, atomically.
    pub fn snapshot(&self, excluding: Option<PeerId>) -> Vec<(PeerId, H)> {
        self.lock().snapshot(excluding)
    }

    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every handle, used when the server stops.
    pub fn drain(&self) -> Vec<(PeerId, H)> {
        self.lock().drain()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Members<H>> {
        // Every mutation is a single insert or remove, so a poisoned table is still consistent.
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Registry for sessions multiplexed as tasks on one runtime thread.
#[derive(Debug)]
pub struct AsyncRegistry<H> {
    members: tokio::sync::Mutex<Members<H>>,
}

impl<H: Clone> AsyncRegistry<H> {
    pub fn new(capacity: Capacity) -> Self {
        Self {
            members: tokio::sync::Mutex::new(Members::new(capacity)),
        }
    }

    pub async fn register(&self, id: PeerId, handle: H) -> bool {
        self.members.lock().await.insert(id, handle)
    }

    pub async fn deregister(&self, id: PeerId) -> Option<H> {
        self.members.lock().await.remove(id)
    }

    pub async fn snapshot(&self, excluding: Option<PeerId>) -> Vec<(PeerId, H)> {
        self.members.lock().await.snapshot(excluding)
    }

    pub async fn len(&self) -> usize {
        self.members.lock().await.peers.len()
    }

    pub async fn drain(&self) -> Vec<(PeerId, H)> {
        self.members.lock().await.drain()
    }
}
