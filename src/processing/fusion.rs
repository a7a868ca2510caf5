//! Position fusion
//!
//! Each GPS sample is smoothed, optionally blended with the network override
//! while indoors, and finally replaced by the beacon position when that is
//! strictly more accurate. Beacon scans between samples refresh an indoor fix
//! unconditionally. [`fuse_gps_sample`] is the pure core of that step;
//! [`FusionCore`] holds the state between steps plus heading, diagnostic
//! history and the outbound throttle.

use crate::algorithms::trilateration::IndoorPosition;
use crate::core::{
    AccuracyHistoryPoint, Coordinate, FusedPosition, PositionSample, PositionSource,
    SignalQuality, ACCURACY_HISTORY_CAPACITY, BLEND_WEIGHT_HIGH, BLEND_WEIGHT_MEDIUM,
    HEADING_SMOOTHING_FACTOR, POSITION_SMOOTHING_FACTOR,
};
use crate::hardware::{OrientationReading, SensorError};
use crate::processing::environment::{EnvironmentEstimate, NetworkConfidence, NetworkOverride};
use crate::processing::smoothing::{lerp, smooth_coordinate, HeadingSmoother};
use crate::utils::config::SmoothingConfig;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Side inputs to one fusion step
#[derive(Debug, Clone, Copy)]
pub struct FusionInputs<'a> {
    pub environment: &'a EnvironmentEstimate,
    pub network_override: Option<&'a NetworkOverride>,
    pub indoor: Option<&'a IndoorPosition>,
}

/// Result of one fusion step
#[derive(Debug, Clone, PartialEq)]
pub struct FusionStep {
    /// New state of the GPS smoothing filter
    pub smoothed: Coordinate,
    pub fused: FusedPosition,
}

/// Weight given to the network override when blending
pub fn blend_weight(confidence: NetworkConfidence) -> Option<f64> {
    match confidence {
        NetworkConfidence::High => Some(BLEND_WEIGHT_HIGH),
        NetworkConfidence::Medium => Some(BLEND_WEIGHT_MEDIUM),
        NetworkConfidence::Low => None,
    }
}

/// Beacon position that should replace `current`, if any
///
/// A satellite or blended fix is only replaced by a strictly more accurate
/// beacon position. An earlier beacon fix is always superseded, since the
/// beacons behind it may have been evicted.
pub fn prefer_indoor(current: &FusedPosition, indoor: &IndoorPosition) -> Option<FusedPosition> {
    if current.source == PositionSource::Indoor {
        Some(indoor_to_fused(indoor, indoor.timestamp_ms))
    } else if indoor.accuracy_m < current.accuracy_m {
        Some(indoor_to_fused(indoor, current.timestamp_ms.max(indoor.timestamp_ms)))
    } else {
        None
    }
}

fn indoor_to_fused(indoor: &IndoorPosition, timestamp_ms: u64) -> FusedPosition {
    FusedPosition {
        lat: indoor.lat,
        lng: indoor.lng,
        accuracy_m: indoor.accuracy_m,
        source: PositionSource::Indoor,
        floor: Some(indoor.floor),
        venue_id: Some(indoor.venue_id.clone()),
        zone_name: Some(indoor.zone_name.clone()),
        timestamp_ms,
    }
}

/// One pure fusion step for a GPS sample
pub fn fuse_gps_sample(
    previous_smoothed: Option<Coordinate>,
    sample: &PositionSample,
    inputs: &FusionInputs<'_>,
    position_factor: f64,
) -> FusionStep {
    let smoothed = smooth_coordinate(previous_smoothed, sample.coordinate(), position_factor);

    let mut fused = FusedPosition {
        lat: smoothed.lat,
        lng: smoothed.lng,
        accuracy_m: sample.accuracy_m,
        source: sample.source,
        floor: None,
        venue_id: None,
        zone_name: None,
        timestamp_ms: sample.timestamp_ms,
    };

    if inputs.environment.is_indoor {
        if let Some(network) = inputs.network_override {
            if let Some(weight) = blend_weight(network.confidence) {
                let blended = lerp(smoothed, Coordinate::new(network.lat, network.lng), weight);
                fused.lat = blended.lat;
                fused.lng = blended.lng;
                fused.accuracy_m = sample.accuracy_m.min(network.accuracy_m);
                fused.source = PositionSource::Hybrid;
            }
        }
    }

    if let Some(indoor) = inputs.indoor {
        if let Some(replacement) = prefer_indoor(&fused, indoor) {
            fused = replacement;
        }
    }

    FusionStep { smoothed, fused }
}

/// Minimum-interval gate for outbound writes
///
/// Samples arriving inside the window are not queued; the next write after
/// the window carries whatever is current at that time.
#[derive(Debug, Clone, Default)]
pub struct OutboundThrottle {
    last_forwarded_ms: Option<u64>,
}

impl OutboundThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true and records the write when the window has elapsed
    pub fn try_acquire(&mut self, now_ms: u64, interval_ms: u64) -> bool {
        let open = match self.last_forwarded_ms {
            Some(last) => now_ms.saturating_sub(last) >= interval_ms,
            None => true,
        };
        if open {
            self.last_forwarded_ms = Some(now_ms);
        }
        open
    }

    pub fn last_forwarded_ms(&self) -> Option<u64> {
        self.last_forwarded_ms
    }

    pub fn reset(&mut self) {
        self.last_forwarded_ms = None;
    }
}

/// Stateful fusion hub
pub struct FusionCore {
    position_factor: f64,
    smoothed: Option<Coordinate>,
    fused: Option<FusedPosition>,
    heading: HeadingSmoother,
    history: VecDeque<AccuracyHistoryPoint>,
    history_capacity: usize,
    throttle: OutboundThrottle,
    degraded: bool,
    stale: bool,
}

impl Default for FusionCore {
    fn default() -> Self {
        Self {
            position_factor: POSITION_SMOOTHING_FACTOR,
            smoothed: None,
            fused: None,
            heading: HeadingSmoother::new(HEADING_SMOOTHING_FACTOR),
            history: VecDeque::with_capacity(ACCURACY_HISTORY_CAPACITY),
            history_capacity: ACCURACY_HISTORY_CAPACITY,
            throttle: OutboundThrottle::new(),
            degraded: false,
            stale: false,
        }
    }
}

impl FusionCore {
    pub fn new(config: &SmoothingConfig) -> Self {
        Self {
            position_factor: config.position_factor,
            heading: HeadingSmoother::new(config.heading_factor),
            history: VecDeque::with_capacity(config.history_capacity),
            history_capacity: config.history_capacity.max(1),
            ..Self::default()
        }
    }

    pub fn current(&self) -> Option<&FusedPosition> {
        self.fused.as_ref()
    }

    pub fn heading(&self) -> Option<f64> {
        self.heading.heading()
    }

    /// Poor before the first fix and while the current fix is degraded or stale
    pub fn signal_quality(&self) -> SignalQuality {
        match &self.fused {
            Some(fused) if !self.degraded && !self.stale => fused.signal_quality(),
            _ => SignalQuality::Poor,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// True once the beacons behind the current indoor fix are all gone
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    /// Diagnostic history, oldest first
    pub fn history(&self) -> impl Iterator<Item = &AccuracyHistoryPoint> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn ingest_gps(&mut self, sample: &PositionSample, inputs: &FusionInputs<'_>) -> FusedPosition {
        let step = fuse_gps_sample(self.smoothed, sample, inputs, self.position_factor);
        self.smoothed = Some(step.smoothed);
        debug!(
            lat = step.fused.lat,
            lng = step.fused.lng,
            accuracy = step.fused.accuracy_m,
            source = ?step.fused.source,
            "fused gps sample"
        );
        self.commit(step.fused.clone());
        step.fused
    }

    /// Re-run the beacon rule after a scan; returns the position if it changed
    pub fn ingest_indoor(&mut self, indoor: &IndoorPosition) -> Option<FusedPosition> {
        let replacement = match &self.fused {
            Some(current) => prefer_indoor(current, indoor)?,
            None => indoor_to_fused(indoor, indoor.timestamp_ms),
        };
        if !self.stale && self.fused.as_ref() == Some(&replacement) {
            return None;
        }
        debug!(
            floor = indoor.floor,
            accuracy = indoor.accuracy_m,
            beacons = indoor.beacon_count,
            "beacon position preferred"
        );
        self.commit(replacement.clone());
        Some(replacement)
    }

    pub fn ingest_heading(&mut self, reading: &OrientationReading) -> Option<f64> {
        let raw = reading.heading_deg()?;
        Some(self.heading.update(raw))
    }

    /// Keep the last fix but report poor quality until the next good sample
    pub fn note_sensor_error(&mut self, error: &SensorError) {
        warn!(%error, "position sensor degraded");
        self.degraded = true;
    }

    /// No beacon estimate is left; an indoor fix stops counting as fresh
    pub fn expire_indoor(&mut self) -> bool {
        match &self.fused {
            Some(fused) if fused.source == PositionSource::Indoor && !self.stale => {
                debug!("indoor fix expired with its beacons");
                self.stale = true;
                true
            }
            _ => false,
        }
    }

    /// Throttle-gated copy of the current position for outbound writes
    pub fn take_outbound(&mut self, now_ms: u64, interval_ms: u64) -> Option<FusedPosition> {
        let fused = self.fused.as_ref()?;
        if self.throttle.try_acquire(now_ms, interval_ms) {
            Some(fused.clone())
        } else {
            None
        }
    }

    /// Forget per-session state; the last fix and its history are kept
    pub fn reset_session(&mut self) {
        self.throttle.reset();
        self.heading.reset();
    }

    fn commit(&mut self, fused: FusedPosition) {
        while self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(AccuracyHistoryPoint {
            timestamp_ms: fused.timestamp_ms,
            accuracy_m: fused.accuracy_m,
            source: fused.source,
        });
        self.fused = Some(fused);
        self.degraded = false;
        self.stale = false;
    }
}
