//! Tuned constants for the fusion pipeline
//!
//! These values were tuned empirically in the field. Configuration defaults are
//! taken from here; change them through `TrackingConfig` rather than in place.

/// Mean Earth radius used by the haversine formula (m)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Exponential smoothing factor applied to each new GPS latitude/longitude
pub const POSITION_SMOOTHING_FACTOR: f64 = 0.3;

/// Exponential smoothing factor applied to compass heading
pub const HEADING_SMOOTHING_FACTOR: f64 = 0.15;

/// Number of speed readings in the rolling average
pub const SPEED_WINDOW: usize = 5;

/// Movement thresholds (m/s)
pub const WALKING_SPEED_MPS: f64 = 1.0;
pub const RUNNING_SPEED_MPS: f64 = 2.8;
pub const DRIVING_SPEED_MPS: f64 = 8.3;

/// Battery thresholds for adaptive mode selection (fraction of full charge)
pub const CRITICAL_BATTERY_LEVEL: f64 = 0.15;
pub const LOW_BATTERY_LEVEL: f64 = 0.30;

/// Accuracy / altitude history length for environment detection
pub const ENVIRONMENT_WINDOW: usize = 10;

/// Accuracy classification thresholds (m)
pub const GOOD_ACCURACY_M: f64 = 10.0;
pub const POOR_ACCURACY_M: f64 = 30.0;
pub const EXCELLENT_ACCURACY_M: f64 = 5.0;

/// Accuracy standard deviation below which the signal is stable (m)
pub const STABLE_SIGNAL_STDDEV_M: f64 = 5.0;

/// Altitude delta variance below which altitude change is minimal (m²)
pub const MINIMAL_ALTITUDE_VARIANCE: f64 = 4.0;

/// Indoor score weights
pub const SCORE_POOR_ACCURACY: i32 = 40;
pub const SCORE_UNKNOWN_ACCURACY: i32 = 20;
pub const SCORE_FLUCTUATING_SIGNAL: i32 = 30;
pub const SCORE_ALTITUDE_CHANGE: i32 = 20;
pub const SCORE_EXCELLENT_FIX_PENALTY: i32 = -30;

/// Indoor score at or above which the device is considered indoors
pub const INDOOR_SCORE_THRESHOLD: i32 = 50;

/// Network override accuracy caps by confidence tier (m)
pub const NETWORK_CAP_HIGH_M: f64 = 50.0;
pub const NETWORK_CAP_MEDIUM_M: f64 = 100.0;
pub const NETWORK_CAP_LOW_M: f64 = 200.0;

/// Override blend weights by confidence tier
pub const BLEND_WEIGHT_HIGH: f64 = 0.6;
pub const BLEND_WEIGHT_MEDIUM: f64 = 0.4;

/// Beacon silence after which an observation is evicted (ms)
pub const BEACON_EVICTION_MS: u64 = 10_000;

/// Log-distance path loss exponent for indoor environments
pub const PATH_LOSS_EXPONENT: f64 = 2.5;

/// Floor applied to beacon distance before weighting (m)
pub const MIN_BEACON_DISTANCE_M: f64 = 0.1;

/// Upper bound on multi-beacon accuracy (m)
pub const MAX_BEACON_ACCURACY_M: f64 = 20.0;

/// Extra uncertainty added when only one beacon is heard (m)
pub const SINGLE_BEACON_PENALTY_M: f64 = 10.0;

/// Diagnostic accuracy history capacity
pub const ACCURACY_HISTORY_CAPACITY: usize = 100;

/// Default radius for arrival detection (m)
pub const DEFAULT_ARRIVAL_RADIUS_M: f64 = 50.0;

/// Capacity of the sensor event and peer subscription channels
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
