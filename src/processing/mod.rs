//! Signal processing pipeline
//!
//! Motion classification, environment detection, smoothing and the fusion
//! hub that turns raw samples into the single fused position.

pub mod environment;
pub mod fusion;
pub mod motion;
pub mod smoothing;

pub use environment::{EnvironmentDetector, EnvironmentEstimate, NetworkConfidence, NetworkOverride};
pub use fusion::{fuse_gps_sample, FusionCore, FusionInputs, OutboundThrottle};
pub use motion::{
    AcquisitionOptions, BatteryImpact, BatteryStatus, MotionController, MotionProfile,
    MovementState, TrackingMode,
};
pub use smoothing::HeadingSmoother;
