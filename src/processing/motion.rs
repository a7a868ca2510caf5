//! Movement classification and adaptive sampling control
//!
//! Speed readings are averaged over a short window and bucketed into a
//! movement state. The update interval is looked up from a fixed table keyed by
//! (tracking mode, movement state); battery state may override the mode.

use crate::algorithms::geometry::haversine_distance;
use crate::core::{
    PositionSample, CRITICAL_BATTERY_LEVEL, DRIVING_SPEED_MPS, LOW_BATTERY_LEVEL,
    RUNNING_SPEED_MPS, SPEED_WINDOW, WALKING_SPEED_MPS,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::info;

/// User or battery selected sampling aggressiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    HighAccuracy,
    Balanced,
    BatterySaver,
}

/// Coarse travel speed classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementState {
    Stationary,
    Walking,
    Running,
    Driving,
}

impl MovementState {
    pub const ALL: [MovementState; 4] = [
        MovementState::Stationary,
        MovementState::Walking,
        MovementState::Running,
        MovementState::Driving,
    ];

    /// Classify an averaged speed (m/s)
    pub fn from_speed(speed_mps: f64) -> Self {
        if speed_mps >= DRIVING_SPEED_MPS {
            MovementState::Driving
        } else if speed_mps >= RUNNING_SPEED_MPS {
            MovementState::Running
        } else if speed_mps >= WALKING_SPEED_MPS {
            MovementState::Walking
        } else {
            MovementState::Stationary
        }
    }
}

/// Parameters handed to the position source for each acquisition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionOptions {
    pub desired_accuracy_m: f64,
    pub max_sample_age_ms: u64,
    pub timeout_ms: u64,
}

impl TrackingMode {
    pub const ALL: [TrackingMode; 3] = [
        TrackingMode::HighAccuracy,
        TrackingMode::Balanced,
        TrackingMode::BatterySaver,
    ];

    /// Update interval in milliseconds for the given movement state
    pub fn update_interval_ms(&self, state: MovementState) -> u64 {
        use MovementState::*;
        match (self, state) {
            (TrackingMode::HighAccuracy, Stationary) => 5_000,
            (TrackingMode::HighAccuracy, Walking) => 3_000,
            (TrackingMode::HighAccuracy, Running) => 2_000,
            (TrackingMode::HighAccuracy, Driving) => 1_000,
            (TrackingMode::Balanced, Stationary) => 30_000,
            (TrackingMode::Balanced, Walking) => 10_000,
            (TrackingMode::Balanced, Running) => 5_000,
            (TrackingMode::Balanced, Driving) => 3_000,
            (TrackingMode::BatterySaver, Stationary) => 60_000,
            (TrackingMode::BatterySaver, Walking) => 30_000,
            (TrackingMode::BatterySaver, Running) => 15_000,
            (TrackingMode::BatterySaver, Driving) => 10_000,
        }
    }

    pub fn acquisition_options(&self) -> AcquisitionOptions {
        match self {
            TrackingMode::HighAccuracy => AcquisitionOptions {
                desired_accuracy_m: 10.0,
                max_sample_age_ms: 0,
                timeout_ms: 10_000,
            },
            TrackingMode::Balanced => AcquisitionOptions {
                desired_accuracy_m: 50.0,
                max_sample_age_ms: 10_000,
                timeout_ms: 15_000,
            },
            TrackingMode::BatterySaver => AcquisitionOptions {
                desired_accuracy_m: 100.0,
                max_sample_age_ms: 60_000,
                timeout_ms: 20_000,
            },
        }
    }
}

/// Diagnostic estimate of the battery cost of the current profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatteryImpact {
    Low,
    Medium,
    High,
}

impl BatteryImpact {
    pub fn estimate(mode: TrackingMode, state: MovementState) -> Self {
        match (mode, state) {
            (TrackingMode::HighAccuracy, MovementState::Stationary) => BatteryImpact::Medium,
            (TrackingMode::HighAccuracy, _) => BatteryImpact::High,
            (TrackingMode::Balanced, MovementState::Running | MovementState::Driving) => {
                BatteryImpact::Medium
            }
            (TrackingMode::Balanced, _) => BatteryImpact::Low,
            (TrackingMode::BatterySaver, _) => BatteryImpact::Low,
        }
    }
}

/// Battery reading from the platform
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatteryStatus {
    /// Charge level in [0, 1]
    pub level: f64,
    pub charging: bool,
}

/// Snapshot of the sampling profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionProfile {
    pub tracking_mode: TrackingMode,
    pub movement_state: MovementState,
    pub update_interval_ms: u64,
}

/// Rolling speed classifier and sampling controller
pub struct MotionController {
    speeds: VecDeque<f64>,
    window: usize,
    previous: Option<PositionSample>,
    movement_state: MovementState,
    tracking_mode: TrackingMode,
    adaptive_battery: bool,
    battery: Option<BatteryStatus>,
}

impl MotionController {
    pub fn new(initial_mode: TrackingMode) -> Self {
        Self {
            speeds: VecDeque::with_capacity(SPEED_WINDOW),
            window: SPEED_WINDOW,
            previous: None,
            movement_state: MovementState::Stationary,
            tracking_mode: initial_mode,
            adaptive_battery: true,
            battery: None,
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn with_adaptive_battery(mut self, enabled: bool) -> Self {
        self.adaptive_battery = enabled;
        self
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.tracking_mode
    }

    pub fn movement_state(&self) -> MovementState {
        self.movement_state
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.tracking_mode.update_interval_ms(self.movement_state)
    }

    pub fn acquisition_options(&self) -> AcquisitionOptions {
        self.tracking_mode.acquisition_options()
    }

    pub fn battery_impact(&self) -> BatteryImpact {
        BatteryImpact::estimate(self.tracking_mode, self.movement_state)
    }

    pub fn battery(&self) -> Option<BatteryStatus> {
        self.battery
    }

    pub fn is_adaptive(&self) -> bool {
        self.adaptive_battery
    }

    pub fn profile(&self) -> MotionProfile {
        MotionProfile {
            tracking_mode: self.tracking_mode,
            movement_state: self.movement_state,
            update_interval_ms: self.update_interval_ms(),
        }
    }

    /// Averaged speed over the window, zero before any reading
    pub fn average_speed(&self) -> f64 {
        if self.speeds.is_empty() {
            0.0
        } else {
            self.speeds.iter().sum::<f64>() / self.speeds.len() as f64
        }
    }

    /// Feed a position sample; returns the new state when it changed
    pub fn record_sample(&mut self, sample: &PositionSample) -> Option<MovementState> {
        let speed = sample
            .speed_mps
            .filter(|s| s.is_finite() && *s >= 0.0)
            .or_else(|| self.derive_speed(sample));
        self.previous = Some(sample.clone());

        match speed {
            Some(speed) => self.record_speed(speed),
            None => None,
        }
    }

    /// Feed a raw speed reading (m/s); returns the new state when it changed
    pub fn record_speed(&mut self, speed_mps: f64) -> Option<MovementState> {
        if self.speeds.len() == self.window {
            self.speeds.pop_front();
        }
        self.speeds.push_back(speed_mps.max(0.0));

        let state = MovementState::from_speed(self.average_speed());
        if state != self.movement_state {
            info!(from = ?self.movement_state, to = ?state, "movement state changed");
            self.movement_state = state;
            Some(state)
        } else {
            None
        }
    }

    fn derive_speed(&self, sample: &PositionSample) -> Option<f64> {
        let previous = self.previous.as_ref()?;
        let elapsed_ms = sample.timestamp_ms.checked_sub(previous.timestamp_ms)?;
        if elapsed_ms == 0 {
            return None;
        }
        let distance = haversine_distance(&previous.coordinate(), &sample.coordinate());
        Some(distance / (elapsed_ms as f64 / 1000.0))
    }

    /// Select a mode manually
    ///
    /// With adaptive battery enabled the next battery update may override it.
    pub fn set_tracking_mode(&mut self, mode: TrackingMode) {
        if mode != self.tracking_mode {
            info!(from = ?self.tracking_mode, to = ?mode, "tracking mode set");
        }
        self.tracking_mode = mode;
    }

    pub fn set_adaptive_battery(&mut self, enabled: bool) {
        self.adaptive_battery = enabled;
        if enabled {
            if let Some(status) = self.battery {
                self.apply_battery_rules(status);
            }
        }
    }

    /// Feed a battery reading; returns the new mode when it changed
    pub fn update_battery(&mut self, status: BatteryStatus) -> Option<TrackingMode> {
        self.battery = Some(status);
        if !self.adaptive_battery {
            return None;
        }
        self.apply_battery_rules(status)
    }

    fn apply_battery_rules(&mut self, status: BatteryStatus) -> Option<TrackingMode> {
        let target = if status.charging {
            TrackingMode::HighAccuracy
        } else if status.level < CRITICAL_BATTERY_LEVEL {
            TrackingMode::BatterySaver
        } else if status.level < LOW_BATTERY_LEVEL
            && self.tracking_mode == TrackingMode::HighAccuracy
        {
            TrackingMode::Balanced
        } else {
            self.tracking_mode
        };

        if target != self.tracking_mode {
            info!(
                from = ?self.tracking_mode,
                to = ?target,
                level = status.level,
                charging = status.charging,
                "battery changed tracking mode"
            );
            self.tracking_mode = target;
            Some(target)
        } else {
            None
        }
    }

    /// Forget speed history, keeping mode and battery state
    pub fn reset(&mut self) {
        self.speeds.clear();
        self.previous = None;
        self.movement_state = MovementState::Stationary;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds() {
        assert_eq!(MovementState::from_speed(0.0), MovementState::Stationary);
        assert_eq!(MovementState::from_speed(0.99), MovementState::Stationary);
        assert_eq!(MovementState::from_speed(1.0), MovementState::Walking);
        assert_eq!(MovementState::from_speed(2.8), MovementState::Running);
        assert_eq!(MovementState::from_speed(8.29), MovementState::Running);
        assert_eq!(MovementState::from_speed(8.3), MovementState::Driving);
    }

    #[test]
    fn test_classification_is_monotonic() {
        let mut previous = MovementState::from_speed(0.0);
        for i in 1..=2000 {
            let state = MovementState::from_speed(i as f64 * 0.01);
            assert!(previous <= state);
            previous = state;
        }
    }

    #[test]
    fn test_interval_table() {
        use MovementState::*;
        let expected = [
            (TrackingMode::HighAccuracy, [5_000, 3_000, 2_000, 1_000]),
            (TrackingMode::Balanced, [30_000, 10_000, 5_000, 3_000]),
            (TrackingMode::BatterySaver, [60_000, 30_000, 15_000, 10_000]),
        ];
        for (mode, intervals) in expected.iter() {
            for (state, interval) in [Stationary, Walking, Running, Driving].iter().zip(intervals) {
                assert_eq!(mode.update_interval_ms(*state), *interval);
            }
        }
    }

    #[test]
    fn test_intervals_shrink_with_speed() {
        for mode in TrackingMode::ALL {
            let intervals: Vec<u64> = MovementState::ALL
                .iter()
                .map(|s| mode.update_interval_ms(*s))
                .collect();
            assert!(intervals.windows(2).all(|w| w[0] > w[1]));
        }
    }

    #[test]
    fn test_acquisition_timeouts_in_range() {
        for mode in TrackingMode::ALL {
            let options = mode.acquisition_options();
            assert!((10_000..=20_000).contains(&options.timeout_ms));
        }
    }

    #[test]
    fn test_stationary_balanced_scenario() {
        let mut controller = MotionController::new(TrackingMode::Balanced);
        controller.update_battery(BatteryStatus {
            level: 0.8,
            charging: false,
        });
        controller.record_speed(0.0);

        assert_eq!(controller.movement_state(), MovementState::Stationary);
        assert_eq!(controller.tracking_mode(), TrackingMode::Balanced);
        assert_eq!(controller.update_interval_ms(), 30_000);
    }

    #[test]
    fn test_driving_high_accuracy_scenario() {
        let mut controller = MotionController::new(TrackingMode::HighAccuracy);
        for _ in 0..5 {
            controller.record_speed(9.0);
        }
        assert_eq!(controller.movement_state(), MovementState::Driving);
        assert!(controller.update_interval_ms() <= 1_000);
        assert_eq!(controller.battery_impact(), BatteryImpact::High);
    }

    #[test]
    fn test_rolling_average_damps_spikes() {
        let mut controller = MotionController::new(TrackingMode::Balanced);
        for _ in 0..4 {
            controller.record_speed(0.0);
        }
        // one spurious 4 m/s reading averages to 0.8 m/s
        controller.record_speed(4.0);
        assert_eq!(controller.movement_state(), MovementState::Stationary);
    }

    #[test]
    fn test_window_keeps_last_readings_only() {
        let mut controller = MotionController::new(TrackingMode::Balanced);
        for _ in 0..5 {
            controller.record_speed(10.0);
        }
        for _ in 0..5 {
            controller.record_speed(1.5);
        }
        assert!((controller.average_speed() - 1.5).abs() < 1e-9);
        assert_eq!(controller.movement_state(), MovementState::Walking);
    }

    #[test]
    fn test_speed_derived_from_positions() {
        let mut controller = MotionController::new(TrackingMode::Balanced);
        controller.record_sample(&PositionSample::gps(0.0, 0.0, 5.0, 0));
        // ~111 m north in 10 s = ~11 m/s
        let changed = controller.record_sample(&PositionSample::gps(0.001, 0.0, 5.0, 10_000));
        assert_eq!(changed, Some(MovementState::Driving));
        assert!((controller.average_speed() - 11.1).abs() < 0.2);
    }

    #[test]
    fn test_sensor_speed_preferred_over_derivation() {
        let mut controller = MotionController::new(TrackingMode::Balanced);
        controller.record_sample(&PositionSample::gps(0.0, 0.0, 5.0, 0).with_speed(0.0));
        controller.record_sample(&PositionSample::gps(0.001, 0.0, 5.0, 10_000).with_speed(1.2));
        assert!((controller.average_speed() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_first_sample_without_speed_is_skipped() {
        let mut controller = MotionController::new(TrackingMode::Balanced);
        assert!(controller
            .record_sample(&PositionSample::gps(0.0, 0.0, 5.0, 0))
            .is_none());
        assert_eq!(controller.average_speed(), 0.0);
    }

    #[test]
    fn test_critical_battery_forces_saver() {
        let mut controller = MotionController::new(TrackingMode::HighAccuracy);
        let changed = controller.update_battery(BatteryStatus {
            level: 0.10,
            charging: false,
        });
        assert_eq!(changed, Some(TrackingMode::BatterySaver));
        assert_eq!(controller.tracking_mode(), TrackingMode::BatterySaver);
    }

    #[test]
    fn test_low_battery_downgrades_high_accuracy() {
        let mut controller = MotionController::new(TrackingMode::HighAccuracy);
        controller.update_battery(BatteryStatus {
            level: 0.25,
            charging: false,
        });
        assert_eq!(controller.tracking_mode(), TrackingMode::Balanced);

        let mut saver = MotionController::new(TrackingMode::BatterySaver);
        saver.update_battery(BatteryStatus {
            level: 0.25,
            charging: false,
        });
        assert_eq!(saver.tracking_mode(), TrackingMode::BatterySaver);
    }

    #[test]
    fn test_charging_forces_high_accuracy() {
        let mut controller = MotionController::new(TrackingMode::BatterySaver);
        controller.update_battery(BatteryStatus {
            level: 0.05,
            charging: true,
        });
        assert_eq!(controller.tracking_mode(), TrackingMode::HighAccuracy);
    }

    #[test]
    fn test_manual_mode_holds_when_adaptive_disabled() {
        let mut controller =
            MotionController::new(TrackingMode::Balanced).with_adaptive_battery(false);
        controller.set_tracking_mode(TrackingMode::HighAccuracy);
        let changed = controller.update_battery(BatteryStatus {
            level: 0.05,
            charging: false,
        });
        assert!(changed.is_none());
        assert_eq!(controller.tracking_mode(), TrackingMode::HighAccuracy);

        // re-enabling applies the last known battery state
        controller.set_adaptive_battery(true);
        assert_eq!(controller.tracking_mode(), TrackingMode::BatterySaver);
    }

    #[test]
    fn test_battery_impact_table() {
        assert_eq!(
            BatteryImpact::estimate(TrackingMode::HighAccuracy, MovementState::Stationary),
            BatteryImpact::Medium
        );
        assert_eq!(
            BatteryImpact::estimate(TrackingMode::Balanced, MovementState::Driving),
            BatteryImpact::Medium
        );
        assert_eq!(
            BatteryImpact::estimate(TrackingMode::Balanced, MovementState::Walking),
            BatteryImpact::Low
        );
        assert_eq!(
            BatteryImpact::estimate(TrackingMode::BatterySaver, MovementState::Driving),
            BatteryImpact::Low
        );
    }
}
