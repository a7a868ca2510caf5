//! Signal source abstraction
//!
//! Every platform sensor sits behind a capability-checked strategy trait. A
//! source is checked once with `is_supported`; unsupported sources are replaced
//! by [`UnsupportedSource`] so the rest of the pipeline keeps running. Running
//! sources push [`SensorEvent`]s into a bounded channel owned by the session.

pub mod error;
pub mod mock;

pub use error::{RecoveryStrategy, SensorError, SensorKind, SensorResult};
pub use mock::{MockConnectionInfo, MockPositionSource, MockSourceHandle, MockStreamSource};

use crate::algorithms::geometry::normalize_degrees;
use crate::core::PositionSample;
use crate::processing::motion::{AcquisitionOptions, BatteryStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Sending half handed to running sources
pub type EventSink = mpsc::Sender<SensorEvent>;

/// One event from any signal source
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Position(PositionSample),
    PositionError(SensorError),
    BeaconScan(BeaconScanResult),
    Orientation(OrientationReading),
    Battery(BatteryStatus),
}

/// One device seen during a BLE scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconScanResult {
    pub device_id: String,
    /// Signal strength (dBm)
    pub rssi: i32,
    pub advertised_name: Option<String>,
    pub timestamp_ms: u64,
}

/// Compass reading in one of the two platform conventions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrientationReading {
    /// Degrees clockwise from north, used as-is
    CompassHeading(f64),
    /// Device rotation around z, counter-clockwise; heading is 360 - alpha
    Alpha(f64),
}

impl OrientationReading {
    /// Heading in degrees within [0, 360)
    pub fn heading_deg(&self) -> Option<f64> {
        let raw = match *self {
            OrientationReading::CompassHeading(heading) => heading,
            OrientationReading::Alpha(alpha) => 360.0 - alpha,
        };
        raw.is_finite().then(|| normalize_degrees(raw))
    }
}

/// Best-effort network quality information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// e.g. "wifi", "4g", "3g", "2g", "slow-2g"
    pub effective_type: String,
    pub downlink_mbps: Option<f64>,
    pub rtt_ms: Option<u64>,
}

/// Satellite position provider
#[async_trait]
pub trait PositionSource: Send {
    fn is_supported(&self) -> bool;

    /// One-shot fix; callers wrap this in the mode's timeout
    async fn request_fix(&mut self, options: &AcquisitionOptions) -> SensorResult<PositionSample>;

    /// Begin continuous delivery of `SensorEvent::Position` into `sink`
    fn start_watch(&mut self, options: &AcquisitionOptions, sink: EventSink) -> SensorResult<()>;

    /// Release the OS watch handle; must be safe to call when not watching
    fn stop_watch(&mut self);

    fn is_active(&self) -> bool;
}

/// BLE scanner delivering `SensorEvent::BeaconScan`
pub trait BeaconScanner: Send {
    fn is_supported(&self) -> bool;
    fn start(&mut self, sink: EventSink) -> SensorResult<()>;
    fn stop(&mut self);
    fn is_active(&self) -> bool;
}

/// Compass provider delivering `SensorEvent::Orientation`
pub trait OrientationSource: Send {
    fn is_supported(&self) -> bool;
    fn start(&mut self, sink: EventSink) -> SensorResult<()>;
    fn stop(&mut self);
    fn is_active(&self) -> bool;
}

/// Network information provider; `None` when the platform has no such API
pub trait ConnectionInfoSource: Send {
    fn connection_info(&self) -> Option<ConnectionInfo>;
}

/// Fallback for any capability the platform lacks
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedSource {
    sensor: Option<SensorKind>,
}

impl UnsupportedSource {
    pub fn new(sensor: SensorKind) -> Self {
        Self {
            sensor: Some(sensor),
        }
    }

    fn error(&self, fallback: SensorKind) -> SensorError {
        SensorError::Unavailable {
            sensor: self.sensor.unwrap_or(fallback),
        }
    }
}

#[async_trait]
impl PositionSource for UnsupportedSource {
    fn is_supported(&self) -> bool {
        false
    }

    async fn request_fix(&mut self, _options: &AcquisitionOptions) -> SensorResult<PositionSample> {
        Err(self.error(SensorKind::Gps))
    }

    fn start_watch(&mut self, _options: &AcquisitionOptions, _sink: EventSink) -> SensorResult<()> {
        Err(self.error(SensorKind::Gps))
    }

    fn stop_watch(&mut self) {}

    fn is_active(&self) -> bool {
        false
    }
}

impl BeaconScanner for UnsupportedSource {
    fn is_supported(&self) -> bool {
        false
    }

    fn start(&mut self, _sink: EventSink) -> SensorResult<()> {
        Err(self.error(SensorKind::Bluetooth))
    }

    fn stop(&mut self) {}

    fn is_active(&self) -> bool {
        false
    }
}

impl OrientationSource for UnsupportedSource {
    fn is_supported(&self) -> bool {
        false
    }

    fn start(&mut self, _sink: EventSink) -> SensorResult<()> {
        Err(self.error(SensorKind::Orientation))
    }

    fn stop(&mut self) {}

    fn is_active(&self) -> bool {
        false
    }
}

impl ConnectionInfoSource for UnsupportedSource {
    fn connection_info(&self) -> Option<ConnectionInfo> {
        None
    }
}
