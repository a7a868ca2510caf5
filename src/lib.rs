//! Multi-source location fusion
//!
//! Combines satellite positioning, Bluetooth beacon ranging and network
//! quality signals into one best-estimate position. Sampling adapts to
//! movement and battery state, and the fused position is shared with the
//! other participants of a session.

pub mod core;
pub mod algorithms;
pub mod processing;
pub mod utils;
pub mod hardware;
pub mod api;

// Re-export commonly used types
pub use crate::core::{Coordinate, FusedPosition, PositionSample, PositionSource, SignalQuality};
pub use crate::algorithms::geometry::{haversine_distance, initial_bearing, ArrivalDetector, ArrivalEvent};
pub use crate::algorithms::trilateration::{BeaconEngine, BeaconRegistry, BeaconRegistryEntry, IndoorPosition};
pub use crate::processing::motion::{MovementState, TrackingMode};
pub use crate::hardware::{SensorError, SensorEvent, SensorKind, SensorResult};
pub use crate::utils::config::{ConfigurationManager, TrackingConfig};
pub use crate::api::{
    Diagnostics, InMemoryPeerStore, PeerPosition, PeerStore, PeerUpdate, SensorSuite,
    SessionError, SessionUpdate, TrackingSession,
};
