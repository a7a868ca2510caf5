//! Sensor error types and recovery policy

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Which signal source raised an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Gps,
    Bluetooth,
    Orientation,
    Network,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorKind::Gps => "gps",
            SensorKind::Bluetooth => "bluetooth",
            SensorKind::Orientation => "orientation",
            SensorKind::Network => "network",
        };
        f.write_str(name)
    }
}

/// Errors raised by signal sources
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// The user refused access; only an explicit re-grant clears this
    #[error("permission denied for {sensor}")]
    PermissionDenied { sensor: SensorKind },
    /// No reading within the acquisition timeout
    #[error("{sensor} timed out after {timeout_ms}ms")]
    Timeout { sensor: SensorKind, timeout_ms: u64 },
    /// The platform lacks the capability
    #[error("{sensor} is not available on this device")]
    Unavailable { sensor: SensorKind },
}

/// Result type for sensor operations
pub type SensorResult<T> = Result<T, SensorError>;

/// What the pipeline does after a sensor error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    /// Stop asking until the user grants access again
    AwaitUserGrant,
    /// Keep the last fix and try again at the next scheduled sample
    RetryNextSample,
    /// Disable the dependent component for this session
    DisableComponent,
}

impl SensorError {
    pub fn sensor(&self) -> SensorKind {
        match self {
            SensorError::PermissionDenied { sensor }
            | SensorError::Timeout { sensor, .. }
            | SensorError::Unavailable { sensor } => *sensor,
        }
    }

    pub fn recovery_strategy(&self) -> RecoveryStrategy {
        match self {
            SensorError::PermissionDenied { .. } => RecoveryStrategy::AwaitUserGrant,
            SensorError::Timeout { .. } => RecoveryStrategy::RetryNextSample,
            SensorError::Unavailable { .. } => RecoveryStrategy::DisableComponent,
        }
    }

    /// Whether the session keeps polling this sensor
    pub fn is_recoverable(&self) -> bool {
        matches!(self.recovery_strategy(), RecoveryStrategy::RetryNextSample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recovery_strategies() {
        let denied = SensorError::PermissionDenied {
            sensor: SensorKind::Gps,
        };
        let timeout = SensorError::Timeout {
            sensor: SensorKind::Gps,
            timeout_ms: 10_000,
        };
        let missing = SensorError::Unavailable {
            sensor: SensorKind::Bluetooth,
        };

        assert_eq!(denied.recovery_strategy(), RecoveryStrategy::AwaitUserGrant);
        assert_eq!(timeout.recovery_strategy(), RecoveryStrategy::RetryNextSample);
        assert_eq!(missing.recovery_strategy(), RecoveryStrategy::DisableComponent);
        assert!(timeout.is_recoverable());
        assert!(!denied.is_recoverable());
        assert_eq!(missing.sensor(), SensorKind::Bluetooth);
    }

    #[test]
    fn test_error_messages() {
        let timeout = SensorError::Timeout {
            sensor: SensorKind::Gps,
            timeout_ms: 15_000,
        };
        assert_eq!(timeout.to_string(), "gps timed out after 15000ms");
    }
}
