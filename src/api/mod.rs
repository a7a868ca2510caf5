//! Outward-facing session API
//!
//! [`session::TrackingSession`] is the single entry point for callers; the
//! peer layer is exposed for store implementations and tests.

pub mod peers;
pub mod session;

pub use peers::{InMemoryPeerStore, PeerChange, PeerPosition, PeerStore, PeerTracker, PeerUpdate, StoreError};
pub use session::{Diagnostics, SensorSuite, SessionError, SessionUpdate, TrackingSession};
