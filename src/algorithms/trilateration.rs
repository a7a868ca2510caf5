//! BLE beacon positioning
//!
//! Scan results are matched against a registry of surveyed beacons, ranged with
//! a log-distance path loss model and combined with an inverse-square weighted
//! centroid. The engine is inert when the platform has no Bluetooth.

use crate::core::{
    BEACON_EVICTION_MS, MAX_BEACON_ACCURACY_M, MIN_BEACON_DISTANCE_M, PATH_LOSS_EXPONENT,
    SINGLE_BEACON_PENALTY_M,
};
use crate::utils::config::BeaconConfig;
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

/// Surveyed beacon from the venue registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconRegistryEntry {
    pub beacon_id: String,
    pub lat: f64,
    pub lng: f64,
    pub floor: i32,
    /// Calibrated RSSI at 1 m (dBm)
    pub tx_power: i32,
    pub venue_id: String,
    pub zone_name: String,
}

/// Registry loading errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read beacon registry '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse beacon registry: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("beacon '{beacon_id}' has invalid tx_power {tx_power}")]
    InvalidTxPower { beacon_id: String, tx_power: i32 },
}

/// Normalise a beacon or device identifier for matching
///
/// UUIDs arrive upper- or lower-case, with or without dashes, colons or braces.
pub fn normalize_beacon_id(id: &str) -> String {
    id.chars()
        .filter(|c| !matches!(c, '-' | ':' | '{' | '}') && !c.is_whitespace())
        .flat_map(|c| c.to_lowercase())
        .collect()
}

/// Read-only lookup of registered beacons
#[derive(Debug, Clone, Default)]
pub struct BeaconRegistry {
    entries: HashMap<String, BeaconRegistryEntry>,
}

impl BeaconRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<BeaconRegistryEntry>) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for entry in entries {
            if entry.tx_power >= 0 {
                return Err(RegistryError::InvalidTxPower {
                    beacon_id: entry.beacon_id,
                    tx_power: entry.tx_power,
                });
            }
            registry
                .entries
                .insert(normalize_beacon_id(&entry.beacon_id), entry);
        }
        Ok(registry)
    }

    pub fn from_json_str(json: &str) -> Result<Self, RegistryError> {
        let entries: Vec<BeaconRegistryEntry> = serde_json::from_str(json)?;
        Self::from_entries(entries)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let content = fs::read_to_string(&path).map_err(|source| RegistryError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;
        Self::from_json_str(&content)
    }

    pub fn lookup(&self, device_id: &str) -> Option<&BeaconRegistryEntry> {
        self.entries.get(&normalize_beacon_id(device_id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Current ranging state of one heard beacon
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BeaconObservation {
    pub beacon_id: String,
    pub rssi: i32,
    pub distance_m: f64,
    pub last_seen_ms: u64,
}

/// Position derived from beacon ranging
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndoorPosition {
    pub lat: f64,
    pub lng: f64,
    pub accuracy_m: f64,
    pub floor: i32,
    pub venue_id: String,
    pub zone_name: String,
    pub beacon_count: usize,
    pub timestamp_ms: u64,
}

/// Convert RSSI to distance with the log-distance path loss model
///
/// Returns `None` for an RSSI of zero, which scanners report when the value is
/// unknown.
pub fn rssi_to_distance(rssi: i32, tx_power: i32, path_loss_exponent: f64) -> Option<f64> {
    if rssi == 0 || tx_power == 0 {
        return None;
    }

    let ratio = rssi as f64 / tx_power as f64;
    if ratio < 1.0 {
        Some(ratio.powi(10))
    } else {
        Some(10f64.powf((tx_power - rssi) as f64 / (10.0 * path_loss_exponent)))
    }
}

#[derive(Debug, Clone)]
struct DetectedBeacon {
    entry: BeaconRegistryEntry,
    rssi: i32,
    last_seen_ms: u64,
}

/// BLE beacon positioning engine
pub struct BeaconEngine {
    registry: BeaconRegistry,
    detected: HashMap<String, DetectedBeacon>,
    eviction_ms: u64,
    path_loss_exponent: f64,
    min_distance_m: f64,
    max_accuracy_m: f64,
    single_beacon_penalty_m: f64,
    supported: bool,
}

impl BeaconEngine {
    pub fn new(registry: BeaconRegistry) -> Self {
        Self {
            registry,
            detected: HashMap::new(),
            eviction_ms: BEACON_EVICTION_MS,
            path_loss_exponent: PATH_LOSS_EXPONENT,
            min_distance_m: MIN_BEACON_DISTANCE_M,
            max_accuracy_m: MAX_BEACON_ACCURACY_M,
            single_beacon_penalty_m: SINGLE_BEACON_PENALTY_M,
            supported: true,
        }
    }

    pub fn with_config(registry: BeaconRegistry, config: &BeaconConfig) -> Self {
        Self {
            eviction_ms: config.eviction_window_ms,
            path_loss_exponent: config.path_loss_exponent,
            min_distance_m: config.min_distance_m,
            max_accuracy_m: config.max_accuracy_m,
            single_beacon_penalty_m: config.single_beacon_penalty_m,
            ..Self::new(registry)
        }
    }

    /// Engine that ignores every scan result
    pub fn unsupported() -> Self {
        let mut engine = Self::new(BeaconRegistry::new());
        engine.supported = false;
        engine
    }

    pub fn is_supported(&self) -> bool {
        self.supported
    }

    /// Record the capability detected at startup; disabling clears all state
    pub fn set_supported(&mut self, supported: bool) {
        self.supported = supported;
        if !supported {
            self.detected.clear();
        }
    }

    pub fn registry(&self) -> &BeaconRegistry {
        &self.registry
    }

    /// Handle one scan callback; returns true if the device is a known beacon
    ///
    /// Every call is a scan cycle, so stale entries are purged afterwards.
    pub fn record_scan(&mut self, device_id: &str, rssi: i32, now_ms: u64) -> bool {
        if !self.supported {
            return false;
        }

        let matched = match self.registry.lookup(device_id) {
            Some(entry) if rssi != 0 => {
                let key = normalize_beacon_id(&entry.beacon_id);
                self.detected.insert(
                    key,
                    DetectedBeacon {
                        entry: entry.clone(),
                        rssi,
                        last_seen_ms: now_ms,
                    },
                );
                true
            }
            Some(_) => {
                warn!(device_id, "ignoring beacon report without rssi");
                false
            }
            None => false,
        };

        let purged = self.purge_stale(now_ms);
        if purged > 0 {
            debug!(purged, "evicted silent beacons");
        }
        matched
    }

    /// Drop beacons not heard within the eviction window
    pub fn purge_stale(&mut self, now_ms: u64) -> usize {
        let before = self.detected.len();
        let window = self.eviction_ms;
        self.detected
            .retain(|_, beacon| now_ms.saturating_sub(beacon.last_seen_ms) <= window);
        before - self.detected.len()
    }

    pub fn clear(&mut self) {
        self.detected.clear();
    }

    fn distance_for(&self, beacon: &DetectedBeacon) -> Option<f64> {
        rssi_to_distance(beacon.rssi, beacon.entry.tx_power, self.path_loss_exponent)
    }

    fn ranked(&self) -> Vec<&DetectedBeacon> {
        let mut beacons: Vec<&DetectedBeacon> = self.detected.values().collect();
        beacons.sort_by(|a, b| {
            b.rssi
                .cmp(&a.rssi)
                .then_with(|| a.entry.beacon_id.cmp(&b.entry.beacon_id))
        });
        beacons
    }

    /// Heard beacons, strongest signal first
    pub fn observations(&self) -> Vec<BeaconObservation> {
        self.ranked()
            .into_iter()
            .filter_map(|beacon| {
                self.distance_for(beacon).map(|distance_m| BeaconObservation {
                    beacon_id: beacon.entry.beacon_id.clone(),
                    rssi: beacon.rssi,
                    distance_m,
                    last_seen_ms: beacon.last_seen_ms,
                })
            })
            .collect()
    }

    /// Registry entry of the strongest heard beacon
    pub fn primary_beacon(&self) -> Option<&BeaconRegistryEntry> {
        self.ranked().first().map(|beacon| &beacon.entry)
    }

    /// Current indoor position estimate, if any beacon is in range
    pub fn estimate(&self) -> Option<IndoorPosition> {
        if !self.supported {
            return None;
        }

        let ranged: Vec<(&DetectedBeacon, f64)> = self
            .ranked()
            .into_iter()
            .filter_map(|beacon| self.distance_for(beacon).map(|d| (beacon, d)))
            .collect();

        let (primary, _) = *ranged.first()?;
        let timestamp_ms = ranged
            .iter()
            .map(|(beacon, _)| beacon.last_seen_ms)
            .max()
            .unwrap_or(primary.last_seen_ms);

        let (position, accuracy_m) = if ranged.len() == 1 {
            let (beacon, distance) = ranged[0];
            (
                Vector2::new(beacon.entry.lat, beacon.entry.lng),
                distance + self.single_beacon_penalty_m,
            )
        } else {
            let mut weighted_sum = Vector2::<f64>::zeros();
            let mut total_weight = 0.0;
            for (beacon, distance) in &ranged {
                let weight = 1.0 / distance.max(self.min_distance_m).powi(2);
                weighted_sum += Vector2::new(beacon.entry.lat, beacon.entry.lng) * weight;
                total_weight += weight;
            }

            let nearest = ranged
                .iter()
                .map(|(_, d)| *d)
                .fold(f64::INFINITY, f64::min);
            let accuracy_factor = (4.0 - ranged.len() as f64).max(1.0);

            (
                weighted_sum / total_weight,
                (nearest * accuracy_factor).min(self.max_accuracy_m),
            )
        };

        Some(IndoorPosition {
            lat: position.x,
            lng: position.y,
            accuracy_m,
            floor: primary.entry.floor,
            venue_id: primary.entry.venue_id.clone(),
            zone_name: primary.entry.zone_name.clone(),
            beacon_count: ranged.len(),
            timestamp_ms,
        })
    }
}
