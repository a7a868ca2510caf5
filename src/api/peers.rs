//! Peer broadcast and subscription
//!
//! The session publishes its own throttled position through a [`PeerStore`]
//! and mirrors everyone else's into a [`PeerTracker`]. Updates are applied
//! last-received-wins; an update with `sharing = false` removes the peer.

use crate::algorithms::geometry::{haversine_distance, initial_bearing};
use crate::core::Coordinate;
use crate::hardware::RecoveryStrategy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Record written to, and received from, the shared store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerUpdate {
    pub peer_id: String,
    pub lat: f64,
    pub lng: f64,
    pub sharing: bool,
    pub timestamp_ms: u64,
}

/// Errors raised by the shared store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("write failed: {reason}")]
    WriteFailed { reason: String },
    #[error("subscription to '{scope}' closed")]
    SubscriptionClosed { scope: String },
    #[error("peer store unavailable")]
    Unavailable,
}

impl StoreError {
    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            StoreError::WriteFailed { .. } => RecoveryStrategy::RetryNextSample,
            StoreError::SubscriptionClosed { .. } | StoreError::Unavailable => {
                RecoveryStrategy::DisableComponent
            }
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared real-time key/value store scoped by session
pub trait PeerStore: Send {
    /// Write the caller's own record
    fn upsert(&self, self_id: &str, scope: &str, update: &PeerUpdate) -> StoreResult<()>;

    /// Every record currently stored for `scope`
    fn snapshot(&self, scope: &str) -> StoreResult<Vec<PeerUpdate>>;

    /// Stream of subsequent writes to `scope`, including the caller's own
    fn subscribe(&self, scope: &str) -> StoreResult<mpsc::Receiver<PeerUpdate>>;
}

/// A peer as seen from the local fused position
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerPosition {
    pub peer_id: String,
    pub lat: f64,
    pub lng: f64,
    pub last_update_ms: u64,
    pub distance_m: Option<f64>,
    pub bearing_deg: Option<f64>,
}

impl PeerPosition {
    fn annotate(&mut self, origin: Option<Coordinate>) {
        match origin {
            Some(origin) => {
                let target = Coordinate::new(self.lat, self.lng);
                self.distance_m = Some(haversine_distance(&origin, &target));
                self.bearing_deg = Some(initial_bearing(&origin, &target));
            }
            None => {
                self.distance_m = None;
                self.bearing_deg = None;
            }
        }
    }
}

/// Effect of one incoming update on the peer map
#[derive(Debug, Clone, PartialEq)]
pub enum PeerChange {
    Upserted(PeerPosition),
    Removed(String),
    /// Self-originated, invalid, or removal of an unknown peer
    Ignored,
}

/// Live map of the other participants
#[derive(Debug, Clone)]
pub struct PeerTracker {
    self_id: String,
    peers: HashMap<String, PeerPosition>,
    origin: Option<Coordinate>,
}

impl PeerTracker {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            peers: HashMap::new(),
            origin: None,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn apply(&mut self, update: &PeerUpdate) -> PeerChange {
        if update.peer_id == self.self_id {
            return PeerChange::Ignored;
        }

        if !update.sharing {
            return match self.peers.remove(&update.peer_id) {
                Some(_) => {
                    debug!(peer = %update.peer_id, "peer stopped sharing");
                    PeerChange::Removed(update.peer_id.clone())
                }
                None => PeerChange::Ignored,
            };
        }

        if !Coordinate::new(update.lat, update.lng).is_valid() {
            warn!(peer = %update.peer_id, "dropping peer update with invalid coordinates");
            return PeerChange::Ignored;
        }

        let mut position = PeerPosition {
            peer_id: update.peer_id.clone(),
            lat: update.lat,
            lng: update.lng,
            last_update_ms: update.timestamp_ms,
            distance_m: None,
            bearing_deg: None,
        };
        position.annotate(self.origin);
        self.peers.insert(update.peer_id.clone(), position.clone());
        PeerChange::Upserted(position)
    }

    /// Move the local reference point and re-annotate every peer
    pub fn set_origin(&mut self, origin: Coordinate) {
        self.origin = Some(origin);
        for peer in self.peers.values_mut() {
            peer.annotate(self.origin);
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerPosition> {
        self.peers.get(peer_id)
    }

    /// Peers nearest first; unannotated peers last, ties by id
    pub fn positions(&self) -> Vec<PeerPosition> {
        let mut peers: Vec<PeerPosition> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| {
            let by_distance = match (a.distance_m, b.distance_m) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            by_distance.then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<String, HashMap<String, PeerUpdate>>,
    subscribers: HashMap<String, Vec<mpsc::Sender<PeerUpdate>>>,
    failing_writes: u32,
    write_count: u32,
    offline: bool,
}

/// Process-local store used by tests and the demo binary
///
/// Clones share state, so a test can keep one handle while the session owns
/// another.
#[derive(Debug, Clone)]
pub struct InMemoryPeerStore {
    state: Arc<Mutex<StoreState>>,
    channel_capacity: usize,
}

impl Default for InMemoryPeerStore {
    fn default() -> Self {
        Self::new(crate::core::EVENT_CHANNEL_CAPACITY)
    }
}

impl InMemoryPeerStore {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Make the next `count` writes fail
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().failing_writes = count;
    }

    /// Take the store offline; every call fails with [`StoreError::Unavailable`] until restored
    pub fn set_available(&self, available: bool) {
        self.state.lock().offline = !available;
    }

    /// Drop every subscriber of `scope`, as a backend does when it closes a channel
    pub fn disconnect(&self, scope: &str) {
        self.state.lock().subscribers.remove(scope);
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u32 {
        self.state.lock().write_count
    }

    pub fn record(&self, scope: &str, peer_id: &str) -> Option<PeerUpdate> {
        self.state
            .lock()
            .records
            .get(scope)
            .and_then(|records| records.get(peer_id))
            .cloned()
    }

    /// Live subscribers for `scope`
    pub fn subscriber_count(&self, scope: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(scope)
            .map(|subscribers| subscribers.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl PeerStore for InMemoryPeerStore {
    fn upsert(&self, self_id: &str, scope: &str, update: &PeerUpdate) -> StoreResult<()> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(StoreError::Unavailable);
        }
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::WriteFailed {
                reason: "injected failure".to_string(),
            });
        }

        let record = PeerUpdate {
            peer_id: self_id.to_string(),
            ..update.clone()
        };
        state
            .records
            .entry(scope.to_string())
            .or_default()
            .insert(self_id.to_string(), record.clone());
        state.write_count += 1;

        if let Some(subscribers) = state.subscribers.get_mut(scope) {
            subscribers.retain(|tx| !tx.is_closed());
            for tx in subscribers.iter() {
                if tx.try_send(record.clone()).is_err() {
                    warn!(scope, "subscriber lagging, update dropped");
                }
            }
        }
        Ok(())
    }

    fn snapshot(&self, scope: &str) -> StoreResult<Vec<PeerUpdate>> {
        let state = self.state.lock();
        if state.offline {
            return Err(StoreError::Unavailable);
        }
        let mut records: Vec<PeerUpdate> = state
            .records
            .get(scope)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        Ok(records)
    }

    fn subscribe(&self, scope: &str) -> StoreResult<mpsc::Receiver<PeerUpdate>> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(StoreError::Unavailable);
        }
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        state
            .subscribers
            .entry(scope.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
