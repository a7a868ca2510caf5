//! Core data types for the fusion pipeline

use serde::{Deserialize, Serialize};

/// Geodetic coordinate in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// Origin of a position value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Gps,
    Indoor,
    Wifi,
    Network,
    /// GPS blended with a network override
    Hybrid,
}

/// One raw reading from a position sensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSample {
    pub lat: f64,
    pub lng: f64,
    /// Horizontal accuracy radius (m)
    pub accuracy_m: f64,
    pub speed_mps: Option<f64>,
    pub heading_deg: Option<f64>,
    pub altitude_m: Option<f64>,
    pub timestamp_ms: u64,
    pub source: PositionSource,
}

impl PositionSample {
    /// GPS sample with only the mandatory fields set
    pub fn gps(lat: f64, lng: f64, accuracy_m: f64, timestamp_ms: u64) -> Self {
        Self {
            lat,
            lng,
            accuracy_m,
            speed_mps: None,
            heading_deg: None,
            altitude_m: None,
            timestamp_ms,
            source: PositionSource::Gps,
        }
    }

    pub fn with_speed(mut self, speed_mps: f64) -> Self {
        self.speed_mps = Some(speed_mps);
        self
    }

    pub fn with_altitude(mut self, altitude_m: f64) -> Self {
        self.altitude_m = Some(altitude_m);
        self
    }

    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }
}

/// Best-estimate position combining every available source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedPosition {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub source: PositionSource,
    pub floor: Option<i32>,
    pub venue_id: Option<String>,
    pub zone_name: Option<String>,
    pub timestamp_ms: u64,
}

impl FusedPosition {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    pub fn signal_quality(&self) -> SignalQuality {
        SignalQuality::from_accuracy(self.accuracy_m)
    }
}

/// Coarse signal quality indicator for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalQuality {
    Good,
    Fair,
    Poor,
}

impl SignalQuality {
    pub fn from_accuracy(accuracy_m: f64) -> Self {
        if accuracy_m <= 10.0 {
            SignalQuality::Good
        } else if accuracy_m <= 30.0 {
            SignalQuality::Fair
        } else {
            SignalQuality::Poor
        }
    }
}

/// Diagnostic record of one fused update
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracyHistoryPoint {
    pub timestamp_ms: u64,
    pub accuracy_m: f64,
    pub source: PositionSource,
}
