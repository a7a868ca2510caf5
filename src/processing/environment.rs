//! Indoor/outdoor detection from GPS quality
//!
//! GPS accuracy degrades and fluctuates under a roof, and altitude readings
//! jump around when the fix is poor. A small additive score over those
//! indicators decides whether the device is indoors. Indoors with a poor fix,
//! a network-assisted override anchored on the last good fix is produced for
//! the fusion core.

use crate::core::{
    Coordinate, PositionSample, ENVIRONMENT_WINDOW, EXCELLENT_ACCURACY_M, GOOD_ACCURACY_M,
    INDOOR_SCORE_THRESHOLD, MINIMAL_ALTITUDE_VARIANCE, NETWORK_CAP_HIGH_M, NETWORK_CAP_LOW_M,
    NETWORK_CAP_MEDIUM_M, POOR_ACCURACY_M, SCORE_ALTITUDE_CHANGE, SCORE_EXCELLENT_FIX_PENALTY,
    SCORE_FLUCTUATING_SIGNAL, SCORE_POOR_ACCURACY, SCORE_UNKNOWN_ACCURACY, STABLE_SIGNAL_STDDEV_M,
};
use crate::hardware::ConnectionInfo;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

/// Minimum readings before spread statistics are meaningful
const MIN_READINGS_FOR_SPREAD: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpsAccuracyClass {
    Good,
    Poor,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStability {
    Stable,
    Fluctuating,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AltitudeChange {
    Minimal,
    Significant,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentIndicators {
    pub gps_accuracy: GpsAccuracyClass,
    pub signal_stability: SignalStability,
    pub altitude_change: AltitudeChange,
}

/// Indoor/outdoor estimate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentEstimate {
    pub is_indoor: bool,
    /// score / 100, in [0, 1]
    pub confidence: f64,
    /// Raw indoor score in [0, 100]
    pub score: i32,
    pub indicators: EnvironmentIndicators,
}

impl Default for EnvironmentEstimate {
    fn default() -> Self {
        Self {
            is_indoor: false,
            confidence: 0.0,
            score: 0,
            indicators: EnvironmentIndicators {
                gps_accuracy: GpsAccuracyClass::Unknown,
                signal_stability: SignalStability::Unknown,
                altitude_change: AltitudeChange::Unknown,
            },
        }
    }
}

/// Trust placed in a network-derived position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkConfidence {
    High,
    Medium,
    Low,
}

impl NetworkConfidence {
    /// Grade a connection; no information at all is Low
    pub fn from_connection(info: Option<&ConnectionInfo>) -> Self {
        let Some(info) = info else {
            return NetworkConfidence::Low;
        };
        let Some(rtt_ms) = info.rtt_ms else {
            return NetworkConfidence::Low;
        };

        let kind = info.effective_type.to_ascii_lowercase();
        let fast = matches!(kind.as_str(), "wifi" | "ethernet" | "4g" | "5g");
        let usable = fast || kind == "3g";

        if fast && rtt_ms < 100 {
            NetworkConfidence::High
        } else if usable && rtt_ms < 300 {
            NetworkConfidence::Medium
        } else {
            NetworkConfidence::Low
        }
    }

    pub fn accuracy_cap_m(&self) -> f64 {
        match self {
            NetworkConfidence::High => NETWORK_CAP_HIGH_M,
            NetworkConfidence::Medium => NETWORK_CAP_MEDIUM_M,
            NetworkConfidence::Low => NETWORK_CAP_LOW_M,
        }
    }
}

/// Network-assisted position used while indoors with a poor GPS fix
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkOverride {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub confidence: NetworkConfidence,
    pub timestamp_ms: u64,
}

/// Rolling indoor/outdoor detector
pub struct EnvironmentDetector {
    accuracies: VecDeque<f64>,
    altitudes: VecDeque<f64>,
    window: usize,
    last_good_fix: Option<Coordinate>,
    estimate: EnvironmentEstimate,
    network_override: Option<NetworkOverride>,
}

impl Default for EnvironmentDetector {
    fn default() -> Self {
        Self::new(ENVIRONMENT_WINDOW)
    }
}

impl EnvironmentDetector {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            accuracies: VecDeque::with_capacity(window),
            altitudes: VecDeque::with_capacity(window),
            window,
            last_good_fix: None,
            estimate: EnvironmentEstimate::default(),
            network_override: None,
        }
    }

    pub fn estimate(&self) -> &EnvironmentEstimate {
        &self.estimate
    }

    pub fn network_override(&self) -> Option<&NetworkOverride> {
        self.network_override.as_ref()
    }

    /// Feed a GPS sample and recompute the estimate
    pub fn update(
        &mut self,
        sample: &PositionSample,
        connection: Option<&ConnectionInfo>,
    ) -> EnvironmentEstimate {
        push_bounded(&mut self.accuracies, sample.accuracy_m, self.window);
        if let Some(altitude) = sample.altitude_m {
            push_bounded(&mut self.altitudes, altitude, self.window);
        }
        if sample.accuracy_m <= POOR_ACCURACY_M || self.last_good_fix.is_none() {
            self.last_good_fix = Some(sample.coordinate());
        }

        self.estimate = self.classify(sample.accuracy_m);

        if self.estimate.is_indoor && sample.accuracy_m > POOR_ACCURACY_M {
            let confidence = NetworkConfidence::from_connection(connection);
            let anchor = self.last_good_fix.unwrap_or_else(|| sample.coordinate());
            self.network_override = Some(NetworkOverride {
                lat: anchor.lat,
                lng: anchor.lng,
                accuracy_m: sample.accuracy_m.min(confidence.accuracy_cap_m()),
                confidence,
                timestamp_ms: sample.timestamp_ms,
            });
        } else if !self.estimate.is_indoor {
            self.network_override = None;
        }

        debug!(
            score = self.estimate.score,
            indoor = self.estimate.is_indoor,
            has_override = self.network_override.is_some(),
            "environment updated"
        );
        self.estimate
    }

    fn classify(&self, current_accuracy: f64) -> EnvironmentEstimate {
        let indicators = EnvironmentIndicators {
            gps_accuracy: self.gps_accuracy(current_accuracy),
            signal_stability: self.signal_stability(),
            altitude_change: self.altitude_change(),
        };

        let mut score = match indicators.gps_accuracy {
            GpsAccuracyClass::Poor => SCORE_POOR_ACCURACY,
            GpsAccuracyClass::Unknown => SCORE_UNKNOWN_ACCURACY,
            GpsAccuracyClass::Good => 0,
        };
        if indicators.signal_stability == SignalStability::Fluctuating {
            score += SCORE_FLUCTUATING_SIGNAL;
        }
        if indicators.altitude_change == AltitudeChange::Significant
            && indicators.gps_accuracy == GpsAccuracyClass::Poor
        {
            score += SCORE_ALTITUDE_CHANGE;
        }
        if current_accuracy < EXCELLENT_ACCURACY_M {
            score += SCORE_EXCELLENT_FIX_PENALTY;
        }
        let score = score.clamp(0, 100);

        EnvironmentEstimate {
            is_indoor: score >= INDOOR_SCORE_THRESHOLD,
            confidence: score as f64 / 100.0,
            score,
            indicators,
        }
    }

    /// Pessimistic of the window average and the current reading
    fn gps_accuracy(&self, current_accuracy: f64) -> GpsAccuracyClass {
        let Some(average) = mean(&self.accuracies) else {
            return GpsAccuracyClass::Unknown;
        };
        let effective = average.max(current_accuracy);
        if effective < GOOD_ACCURACY_M {
            GpsAccuracyClass::Good
        } else if effective > POOR_ACCURACY_M {
            GpsAccuracyClass::Poor
        } else {
            GpsAccuracyClass::Unknown
        }
    }

    fn signal_stability(&self) -> SignalStability {
        if self.accuracies.len() < MIN_READINGS_FOR_SPREAD {
            return SignalStability::Unknown;
        }
        match variance(self.accuracies.iter().copied()) {
            Some(v) if v.sqrt() < STABLE_SIGNAL_STDDEV_M => SignalStability::Stable,
            Some(_) => SignalStability::Fluctuating,
            None => SignalStability::Unknown,
        }
    }

    fn altitude_change(&self) -> AltitudeChange {
        if self.altitudes.len() < MIN_READINGS_FOR_SPREAD {
            return AltitudeChange::Unknown;
        }
        let deltas = self
            .altitudes
            .iter()
            .zip(self.altitudes.iter().skip(1))
            .map(|(a, b)| b - a);
        match variance(deltas) {
            Some(v) if v < MINIMAL_ALTITUDE_VARIANCE => AltitudeChange::Minimal,
            Some(_) => AltitudeChange::Significant,
            None => AltitudeChange::Unknown,
        }
    }

    pub fn reset(&mut self) {
        self.accuracies.clear();
        self.altitudes.clear();
        self.last_good_fix = None;
        self.estimate = EnvironmentEstimate::default();
        self.network_override = None;
    }
}

fn push_bounded(buffer: &mut VecDeque<f64>, value: f64, capacity: usize) {
    while buffer.len() >= capacity {
        buffer.pop_front();
    }
    buffer.push_back(value);
}

fn mean(values: &VecDeque<f64>) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Population variance
fn variance<I: Iterator<Item = f64>>(values: I) -> Option<f64> {
    let values: Vec<f64> = values.collect();
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    Some(values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n)
}
