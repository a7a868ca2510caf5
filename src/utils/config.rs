use crate::core::{
    ACCURACY_HISTORY_CAPACITY, BEACON_EVICTION_MS, DEFAULT_ARRIVAL_RADIUS_M, ENVIRONMENT_WINDOW,
    EVENT_CHANNEL_CAPACITY, HEADING_SMOOTHING_FACTOR, MAX_BEACON_ACCURACY_M,
    MIN_BEACON_DISTANCE_M, PATH_LOSS_EXPONENT, POSITION_SMOOTHING_FACTOR,
    SINGLE_BEACON_PENALTY_M, SPEED_WINDOW,
};
use crate::processing::motion::TrackingMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Complete tracking configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub motion: MotionConfig,
    pub smoothing: SmoothingConfig,
    pub environment: EnvironmentConfig,
    pub beacon: BeaconConfig,
    pub session: SessionConfig,
}

/// Sampling controller settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Mode used until the user or the battery logic changes it
    pub initial_mode: TrackingMode,
    /// Let battery state override the selected mode
    pub adaptive_battery: bool,
    /// Number of speed readings averaged before classification
    pub speed_window: usize,
}

/// Position and heading smoothing settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    /// Weight of each new GPS fix in the exponential filter, in [0, 1)
    pub position_factor: f64,
    /// Weight of each new compass reading, in [0, 1)
    pub heading_factor: f64,
    /// Capacity of the diagnostic accuracy history
    pub history_capacity: usize,
}

/// Indoor/outdoor detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Readings kept for accuracy and altitude statistics
    pub window: usize,
}

/// Beacon ranging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeaconConfig {
    /// Silence after which a beacon is dropped (milliseconds)
    pub eviction_window_ms: u64,
    /// Log-distance path loss exponent
    pub path_loss_exponent: f64,
    /// Distance floor for centroid weights (meters)
    pub min_distance_m: f64,
    /// Upper bound on multi-beacon accuracy (meters)
    pub max_accuracy_m: f64,
    /// Uncertainty added with a single beacon (meters)
    pub single_beacon_penalty_m: f64,
    /// Optional JSON registry loaded at session creation
    pub registry_path: Option<String>,
}

/// Session wiring settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Radius around the destination that counts as arrived (meters)
    pub arrival_radius_m: f64,
    /// Capacity of the sensor event and peer subscription channels
    pub event_channel_capacity: usize,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            initial_mode: TrackingMode::Balanced,
            adaptive_battery: true,
            speed_window: SPEED_WINDOW,
        }
    }
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            position_factor: POSITION_SMOOTHING_FACTOR,
            heading_factor: HEADING_SMOOTHING_FACTOR,
            history_capacity: ACCURACY_HISTORY_CAPACITY,
        }
    }
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            window: ENVIRONMENT_WINDOW,
        }
    }
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            eviction_window_ms: BEACON_EVICTION_MS,
            path_loss_exponent: PATH_LOSS_EXPONENT,
            min_distance_m: MIN_BEACON_DISTANCE_M,
            max_accuracy_m: MAX_BEACON_ACCURACY_M,
            single_beacon_penalty_m: SINGLE_BEACON_PENALTY_M,
            registry_path: None,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            arrival_radius_m: DEFAULT_ARRIVAL_RADIUS_M,
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid parameter '{parameter}' = '{value}': {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },
    #[error("I/O error: {message}")]
    IoError { message: String },
    #[error("serialization error: {message}")]
    SerializationError { message: String },
}

impl ConfigError {
    fn invalid(parameter: &str, value: impl ToString, reason: &str) -> Self {
        ConfigError::InvalidParameter {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Outcome of validating a configuration
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl TrackingConfig {
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        for (name, factor) in [
            ("smoothing.position_factor", self.smoothing.position_factor),
            ("smoothing.heading_factor", self.smoothing.heading_factor),
        ] {
            if !(0.0..1.0).contains(&factor) {
                result
                    .errors
                    .push(ConfigError::invalid(name, factor, "must be in [0, 1)"));
            }
        }

        for (name, value) in [
            ("motion.speed_window", self.motion.speed_window),
            ("smoothing.history_capacity", self.smoothing.history_capacity),
            ("environment.window", self.environment.window),
            ("session.event_channel_capacity", self.session.event_channel_capacity),
        ] {
            if value == 0 {
                result
                    .errors
                    .push(ConfigError::invalid(name, value, "must be greater than zero"));
            }
        }

        if self.environment.window < 3 {
            result.warnings.push(
                "environment.window below 3 leaves signal stability permanently unknown"
                    .to_string(),
            );
        }

        if self.beacon.eviction_window_ms == 0 {
            result.errors.push(ConfigError::invalid(
                "beacon.eviction_window_ms",
                self.beacon.eviction_window_ms,
                "must be greater than zero",
            ));
        }
        if self.beacon.path_loss_exponent <= 0.0 {
            result.errors.push(ConfigError::invalid(
                "beacon.path_loss_exponent",
                self.beacon.path_loss_exponent,
                "must be positive",
            ));
        }
        if self.beacon.min_distance_m <= 0.0 {
            result.errors.push(ConfigError::invalid(
                "beacon.min_distance_m",
                self.beacon.min_distance_m,
                "must be positive",
            ));
        }
        if self.beacon.max_accuracy_m <= 0.0 {
            result.errors.push(ConfigError::invalid(
                "beacon.max_accuracy_m",
                self.beacon.max_accuracy_m,
                "must be positive",
            ));
        }
        if self.session.arrival_radius_m < 0.0 {
            result.errors.push(ConfigError::invalid(
                "session.arrival_radius_m",
                self.session.arrival_radius_m,
                "must not be negative",
            ));
        }

        result
    }
}

/// Loads, validates and persists the tracking configuration
pub struct ConfigurationManager {
    config: TrackingConfig,
    config_file_path: Option<String>,
    is_modified: bool,
}

impl Default for ConfigurationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationManager {
    pub fn new() -> Self {
        Self {
            config: TrackingConfig::default(),
            config_file_path: None,
            is_modified: false,
        }
    }

    /// Create configuration manager and load from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut manager = Self::new();
        manager.load_from_file(path)?;
        Ok(manager)
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Replace the configuration after validation
    pub fn update_config(&mut self, config: TrackingConfig) -> Result<(), ConfigError> {
        let validation = config.validate();
        if let Some(error) = validation.errors.into_iter().next() {
            return Err(error);
        }

        self.config = config;
        self.is_modified = true;
        Ok(())
    }

    /// Load configuration from JSON file
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content = fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            message: format!("Failed to read config file '{}': {}", path_str, e),
        })?;

        let config: TrackingConfig =
            serde_json::from_str(&content).map_err(|e| ConfigError::SerializationError {
                message: format!("Failed to parse config file '{}': {}", path_str, e),
            })?;

        let validation = config.validate();
        if let Some(error) = validation.errors.into_iter().next() {
            return Err(error);
        }
        for warning in &validation.warnings {
            tracing::warn!(path = %path_str, "{}", warning);
        }

        self.config = config;
        self.config_file_path = Some(path_str);
        self.is_modified = false;
        Ok(())
    }

    /// Save configuration to JSON file
    pub fn save_to_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let content =
            serde_json::to_string_pretty(&self.config).map_err(|e| ConfigError::SerializationError {
                message: format!("Failed to serialize config: {}", e),
            })?;

        fs::write(&path, content).map_err(|e| ConfigError::IoError {
            message: format!("Failed to write config file '{}': {}", path_str, e),
        })?;

        self.config_file_path = Some(path_str);
        self.is_modified = false;
        Ok(())
    }

    /// Save to the currently loaded file path
    pub fn save(&mut self) -> Result<(), ConfigError> {
        if let Some(path) = self.config_file_path.clone() {
            self.save_to_file(path)
        } else {
            Err(ConfigError::IoError {
                message: "No file path set for saving configuration".to_string(),
            })
        }
    }

    pub fn is_modified(&self) -> bool {
        self.is_modified
    }

    /// Change the startup tracking mode
    pub fn set_initial_mode(&mut self, mode: TrackingMode) -> TrackingMode {
        let old = self.config.motion.initial_mode;
        self.config.motion.initial_mode = mode;
        self.is_modified = true;
        old
    }

    pub fn set_adaptive_battery(&mut self, enabled: bool) -> bool {
        let old = self.config.motion.adaptive_battery;
        self.config.motion.adaptive_battery = enabled;
        self.is_modified = true;
        old
    }

    /// Adjust the arrival radius at runtime
    pub fn set_arrival_radius(&mut self, radius_m: f64) -> Result<f64, ConfigError> {
        if !(0.0..=10_000.0).contains(&radius_m) {
            return Err(ConfigError::invalid(
                "session.arrival_radius_m",
                radius_m,
                "must be between 0 and 10000 meters",
            ));
        }
        let old = self.config.session.arrival_radius_m;
        self.config.session.arrival_radius_m = radius_m;
        self.is_modified = true;
        Ok(old)
    }
}
