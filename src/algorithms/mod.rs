//! Positioning algorithms

pub mod geometry;
pub mod trilateration;

pub use geometry::{haversine_distance, initial_bearing, ArrivalDetector, ArrivalEvent};
pub use trilateration::{BeaconEngine, BeaconRegistry, BeaconRegistryEntry, IndoorPosition};
