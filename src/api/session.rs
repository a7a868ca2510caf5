//! Tracking session
//!
//! A [`TrackingSession`] owns every piece of per-session state: the signal
//! sources, the processing pipeline, the peer map and the outbound throttle.
//! Sources push [`SensorEvent`]s into one bounded channel; the peer store
//! delivers [`PeerUpdate`]s through a second. [`TrackingSession::pump`] waits
//! on both and runs one synchronous fusion step per event.

use crate::algorithms::geometry::{ArrivalDetector, ArrivalEvent};
use crate::algorithms::trilateration::{BeaconEngine, BeaconObservation, BeaconRegistry, RegistryError};
use crate::api::peers::{PeerChange, PeerPosition, PeerStore, PeerTracker, PeerUpdate, StoreError};
use crate::core::{AccuracyHistoryPoint, Coordinate, FusedPosition, PositionSample, SignalQuality};
use crate::hardware::{
    BeaconScanResult, BeaconScanner, ConnectionInfoSource, OrientationSource, PositionSource,
    SensorError, SensorEvent, SensorKind, UnsupportedSource,
};
use crate::processing::environment::{EnvironmentDetector, EnvironmentEstimate, NetworkOverride};
use crate::processing::fusion::{FusionCore, FusionInputs};
use crate::processing::motion::{
    BatteryImpact, BatteryStatus, MotionController, MotionProfile, MovementState, TrackingMode,
};
use crate::utils::config::TrackingConfig;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Errors returned by session setup
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session scope must not be empty")]
    InvalidScope,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("beacon registry: {0}")]
    Registry(#[from] RegistryError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// The signal sources a session drives
///
/// Any source left unset falls back to [`UnsupportedSource`].
pub struct SensorSuite {
    pub position: Box<dyn PositionSource>,
    pub beacons: Box<dyn BeaconScanner>,
    pub orientation: Box<dyn OrientationSource>,
    pub connection: Box<dyn ConnectionInfoSource>,
}

impl Default for SensorSuite {
    fn default() -> Self {
        Self {
            position: Box::new(UnsupportedSource::new(SensorKind::Gps)),
            beacons: Box::new(UnsupportedSource::new(SensorKind::Bluetooth)),
            orientation: Box::new(UnsupportedSource::new(SensorKind::Orientation)),
            connection: Box::new(UnsupportedSource::new(SensorKind::Network)),
        }
    }
}

impl SensorSuite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_position(mut self, source: impl PositionSource + 'static) -> Self {
        self.position = Box::new(source);
        self
    }

    pub fn with_beacons(mut self, scanner: impl BeaconScanner + 'static) -> Self {
        self.beacons = Box::new(scanner);
        self
    }

    pub fn with_orientation(mut self, source: impl OrientationSource + 'static) -> Self {
        self.orientation = Box::new(source);
        self
    }

    pub fn with_connection(mut self, source: impl ConnectionInfoSource + 'static) -> Self {
        self.connection = Box::new(source);
        self
    }
}

/// Observable effect of one pipeline step
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    Position(FusedPosition),
    Heading(f64),
    /// A scan was matched against the registry; carries the live beacon count
    Beacons(usize),
    TrackingModeChanged(TrackingMode),
    Degraded(SensorError),
    Peer(PeerChange),
    Arrived(ArrivalEvent),
}

/// Read-only snapshot for diagnostic displays
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub environment: EnvironmentEstimate,
    pub network_override: Option<NetworkOverride>,
    pub beacons: Vec<BeaconObservation>,
    pub beacon_support: bool,
    pub accuracy_history: Vec<AccuracyHistoryPoint>,
    pub motion: MotionProfile,
    pub battery_impact: BatteryImpact,
    pub signal_quality: SignalQuality,
    /// The last indoor fix lost all of its beacons and nothing has replaced it yet
    pub position_stale: bool,
    pub adaptive_battery: bool,
    pub battery: Option<BatteryStatus>,
    pub permission_denied: bool,
    pub unsupported: Vec<SensorKind>,
}

enum Incoming {
    Sensor(SensorEvent),
    Peer(Option<PeerUpdate>),
}

/// Caller-owned location tracking session
pub struct TrackingSession {
    self_id: String,
    config: TrackingConfig,
    sensors: SensorSuite,
    store: Box<dyn PeerStore>,

    motion: MotionController,
    environment: EnvironmentDetector,
    beacons: BeaconEngine,
    fusion: FusionCore,
    peers: PeerTracker,
    arrival: Option<ArrivalDetector>,

    events_tx: mpsc::Sender<SensorEvent>,
    events_rx: mpsc::Receiver<SensorEvent>,
    peer_rx: Option<mpsc::Receiver<PeerUpdate>>,

    scope: Option<String>,
    /// Latest event timestamp seen, in source time
    clock_ms: u64,
    running: bool,
    permission_denied: bool,
    unsupported: Vec<SensorKind>,
}

impl TrackingSession {
    /// Build a session; loads the beacon registry from `config.beacon.registry_path` if set
    pub fn new(
        self_id: impl Into<String>,
        config: TrackingConfig,
        sensors: SensorSuite,
        store: Box<dyn PeerStore>,
    ) -> SessionResult<Self> {
        let validation = config.validate();
        if let Some(error) = validation.errors.first() {
            return Err(SessionError::InvalidConfig(error.to_string()));
        }
        for warning in &validation.warnings {
            warn!(%warning, "configuration warning");
        }

        let registry = match &config.beacon.registry_path {
            Some(path) => BeaconRegistry::from_file(path)?,
            None => BeaconRegistry::new(),
        };

        let self_id = self_id.into();
        let (events_tx, events_rx) = mpsc::channel(config.session.event_channel_capacity);

        Ok(Self {
            motion: MotionController::new(config.motion.initial_mode)
                .with_window(config.motion.speed_window)
                .with_adaptive_battery(config.motion.adaptive_battery),
            environment: EnvironmentDetector::new(config.environment.window),
            beacons: BeaconEngine::with_config(registry, &config.beacon),
            fusion: FusionCore::new(&config.smoothing),
            peers: PeerTracker::new(self_id.clone()),
            arrival: None,
            events_tx,
            events_rx,
            peer_rx: None,
            scope: None,
            clock_ms: 0,
            running: false,
            permission_denied: false,
            unsupported: Vec::new(),
            self_id,
            config,
            sensors,
            store,
        })
    }

    /// Replace the beacon registry
    pub fn with_registry(mut self, registry: BeaconRegistry) -> Self {
        self.beacons = BeaconEngine::with_config(registry, &self.config.beacon);
        self
    }

    /// Sender for pushing events that do not come from a managed source,
    /// such as battery readings
    pub fn event_sink(&self) -> mpsc::Sender<SensorEvent> {
        self.events_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Begin tracking within `scope`, tearing down any previous session first
    ///
    /// Also clears the permission-denied flag, so calling `start` again after
    /// the user re-grants access resumes GPS.
    pub async fn start(&mut self, scope: &str) -> SessionResult<()> {
        if scope.trim().is_empty() {
            return Err(SessionError::InvalidScope);
        }
        self.stop();
        while self.events_rx.try_recv().is_ok() {}

        self.scope = Some(scope.to_string());
        self.running = true;
        self.permission_denied = false;
        self.unsupported.clear();
        self.motion.reset();
        self.environment.reset();
        self.fusion.reset_session();
        info!(scope, self_id = %self.self_id, "tracking started");

        self.detect_capabilities();

        if self.sensors.position.is_supported() {
            self.acquire_initial_fix().await;
            if !self.permission_denied {
                self.start_position_watch();
            }
        }

        if self.beacons.is_supported() {
            if let Err(error) = self.sensors.beacons.start(self.events_tx.clone()) {
                self.disable_component(&error);
            }
        }

        if self.sensors.orientation.is_supported() {
            if let Err(error) = self.sensors.orientation.start(self.events_tx.clone()) {
                self.disable_component(&error);
            }
        }

        self.join_peers(scope);
        Ok(())
    }

    /// Leave the session; safe to call repeatedly
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.running = false;

        self.sensors.position.stop_watch();
        self.sensors.beacons.stop();
        self.sensors.orientation.stop();

        if let Some(scope) = self.scope.take() {
            let last = self
                .fusion
                .current()
                .map(FusedPosition::coordinate)
                .unwrap_or_else(|| Coordinate::new(0.0, 0.0));
            let farewell = PeerUpdate {
                peer_id: self.self_id.clone(),
                lat: last.lat,
                lng: last.lng,
                sharing: false,
                timestamp_ms: self.clock_ms,
            };
            if let Err(error) = self.store.upsert(&self.self_id, &scope, &farewell) {
                warn!(%error, scope = %scope, "failed to withdraw shared position");
            }
        }

        self.peers.clear();
        self.peer_rx = None;
        self.beacons.clear();
        info!(self_id = %self.self_id, "tracking stopped");
    }

    /// Wait for the next event from any source or peer and apply it
    ///
    /// Returns `None` once the session is stopped.
    pub async fn pump(&mut self) -> Option<Vec<SessionUpdate>> {
        loop {
            if !self.running {
                return None;
            }
            let incoming = tokio::select! {
                event = self.events_rx.recv() => match event {
                    Some(event) => Incoming::Sensor(event),
                    None => return None,
                },
                update = next_peer_update(&mut self.peer_rx) => Incoming::Peer(update),
            };

            match incoming {
                Incoming::Sensor(event) => return Some(self.handle_event(event)),
                Incoming::Peer(Some(update)) => {
                    return Some(vec![SessionUpdate::Peer(self.handle_peer_update(&update))])
                }
                Incoming::Peer(None) => {
                    let error = StoreError::SubscriptionClosed {
                        scope: self.scope.clone().unwrap_or_default(),
                    };
                    warn!(%error, strategy = ?error.recovery_strategy(), "peer updates stopped");
                    self.peer_rx = None;
                }
            }
        }
    }

    /// Apply everything already queued without waiting
    pub fn drain_pending(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        if !self.running {
            return updates;
        }
        while let Ok(event) = self.events_rx.try_recv() {
            updates.extend(self.handle_event(event));
        }
        let mut pending = Vec::new();
        if let Some(rx) = self.peer_rx.as_mut() {
            while let Ok(update) = rx.try_recv() {
                pending.push(update);
            }
        }
        for update in pending {
            updates.push(SessionUpdate::Peer(self.handle_peer_update(&update)));
        }
        updates
    }

    /// One synchronous pipeline step
    pub fn handle_event(&mut self, event: SensorEvent) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();
        match event {
            SensorEvent::Position(sample) => self.process_position(sample, &mut updates),
            SensorEvent::PositionError(error) => {
                self.handle_sensor_error(&error);
                updates.push(SessionUpdate::Degraded(error));
            }
            SensorEvent::BeaconScan(scan) => self.process_beacon_scan(&scan, &mut updates),
            SensorEvent::Orientation(reading) => {
                if let Some(heading) = self.fusion.ingest_heading(&reading) {
                    updates.push(SessionUpdate::Heading(heading));
                }
            }
            SensorEvent::Battery(status) => {
                if let Some(mode) = self.apply_battery(status) {
                    updates.push(SessionUpdate::TrackingModeChanged(mode));
                }
            }
        }
        updates
    }

    pub fn handle_peer_update(&mut self, update: &PeerUpdate) -> PeerChange {
        self.peers.apply(update)
    }

    pub fn current_position(&self) -> Option<&FusedPosition> {
        self.fusion.current()
    }

    pub fn movement_state(&self) -> MovementState {
        self.motion.movement_state()
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.motion.tracking_mode()
    }

    /// Select a mode manually; restarts the watch with the new acquisition options
    pub fn set_tracking_mode(&mut self, mode: TrackingMode) {
        if mode == self.motion.tracking_mode() {
            return;
        }
        self.motion.set_tracking_mode(mode);
        self.restart_position_watch();
    }

    pub fn set_adaptive_battery(&mut self, enabled: bool) {
        let before = self.motion.tracking_mode();
        self.motion.set_adaptive_battery(enabled);
        if self.motion.tracking_mode() != before {
            self.restart_position_watch();
        }
    }

    pub fn update_interval_ms(&self) -> u64 {
        self.motion.update_interval_ms()
    }

    pub fn signal_quality(&self) -> SignalQuality {
        if self.permission_denied {
            return SignalQuality::Poor;
        }
        self.fusion.signal_quality()
    }

    /// Peers nearest first
    pub fn peer_positions(&self) -> Vec<PeerPosition> {
        self.peers.positions()
    }

    pub fn heading(&self) -> Option<f64> {
        self.fusion.heading()
    }

    pub fn permission_denied(&self) -> bool {
        self.permission_denied
    }

    /// Watch for arrival at `destination`; `radius_m` defaults to the configured radius
    pub fn set_destination(&mut self, destination: Coordinate, radius_m: Option<f64>) {
        let radius_m = radius_m.unwrap_or(self.config.session.arrival_radius_m);
        self.arrival = Some(ArrivalDetector::new(destination, radius_m));
    }

    pub fn clear_destination(&mut self) {
        self.arrival = None;
    }

    pub fn distance_to_destination(&self) -> Option<f64> {
        let detector = self.arrival.as_ref()?;
        let position = self.fusion.current()?;
        Some(detector.distance_from(&position.coordinate()))
    }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            environment: *self.environment.estimate(),
            network_override: self.environment.network_override().copied(),
            beacons: self.beacons.observations(),
            beacon_support: self.beacons.is_supported(),
            accuracy_history: self.fusion.history().copied().collect(),
            motion: self.motion.profile(),
            battery_impact: self.motion.battery_impact(),
            signal_quality: self.signal_quality(),
            position_stale: self.fusion.is_stale(),
            adaptive_battery: self.motion.is_adaptive(),
            battery: self.motion.battery(),
            permission_denied: self.permission_denied,
            unsupported: self.unsupported.clone(),
        }
    }

    fn detect_capabilities(&mut self) {
        if !self.sensors.position.is_supported() {
            self.mark_unsupported(SensorKind::Gps);
        }
        if !self.sensors.beacons.is_supported() {
            self.mark_unsupported(SensorKind::Bluetooth);
        }
        if !self.sensors.orientation.is_supported() {
            self.mark_unsupported(SensorKind::Orientation);
        }
        if self.sensors.connection.connection_info().is_none() {
            self.mark_unsupported(SensorKind::Network);
        }
        self.beacons
            .set_supported(self.sensors.beacons.is_supported() && !self.beacons.registry().is_empty());
    }

    async fn acquire_initial_fix(&mut self) {
        let options = self.motion.acquisition_options();
        let timeout = Duration::from_millis(options.timeout_ms);
        let result = tokio::time::timeout(timeout, self.sensors.position.request_fix(&options)).await;

        let mut updates = Vec::new();
        match result {
            Ok(Ok(sample)) => self.process_position(sample, &mut updates),
            Ok(Err(error)) => self.handle_sensor_error(&error),
            Err(_) => self.handle_sensor_error(&SensorError::Timeout {
                sensor: SensorKind::Gps,
                timeout_ms: options.timeout_ms,
            }),
        }
    }

    fn start_position_watch(&mut self) {
        let options = self.motion.acquisition_options();
        if let Err(error) = self
            .sensors
            .position
            .start_watch(&options, self.events_tx.clone())
        {
            self.handle_sensor_error(&error);
        }
    }

    fn restart_position_watch(&mut self) {
        if !self.running || !self.sensors.position.is_active() {
            return;
        }
        self.sensors.position.stop_watch();
        self.start_position_watch();
    }

    fn apply_battery(&mut self, status: BatteryStatus) -> Option<TrackingMode> {
        let mode = self.motion.update_battery(status)?;
        self.restart_position_watch();
        Some(mode)
    }

    fn process_position(&mut self, sample: PositionSample, updates: &mut Vec<SessionUpdate>) {
        if !sample.coordinate().is_valid() || !sample.accuracy_m.is_finite() || sample.accuracy_m < 0.0 {
            warn!(lat = sample.lat, lng = sample.lng, "dropping invalid position sample");
            return;
        }

        self.clock_ms = self.clock_ms.max(sample.timestamp_ms);
        if let Some(state) = self.motion.record_sample(&sample) {
            debug!(?state, interval_ms = self.motion.update_interval_ms(), "movement changed");
        }

        let connection = self.sensors.connection.connection_info();
        let environment = self.environment.update(&sample, connection.as_ref());

        self.beacons.purge_stale(sample.timestamp_ms);
        let indoor = self.beacons.estimate();

        let inputs = FusionInputs {
            environment: &environment,
            network_override: self.environment.network_override(),
            indoor: indoor.as_ref(),
        };
        let fused = self.fusion.ingest_gps(&sample, &inputs);
        self.on_fused(fused, updates);
    }

    fn process_beacon_scan(&mut self, scan: &BeaconScanResult, updates: &mut Vec<SessionUpdate>) {
        self.clock_ms = self.clock_ms.max(scan.timestamp_ms);
        if self.beacons.record_scan(&scan.device_id, scan.rssi, scan.timestamp_ms) {
            updates.push(SessionUpdate::Beacons(self.beacons.observations().len()));
        }

        match self.beacons.estimate() {
            Some(indoor) => {
                if let Some(fused) = self.fusion.ingest_indoor(&indoor) {
                    self.on_fused(fused, updates);
                }
            }
            None => {
                self.fusion.expire_indoor();
            }
        }
    }

    fn on_fused(&mut self, fused: FusedPosition, updates: &mut Vec<SessionUpdate>) {
        let here = fused.coordinate();
        self.peers.set_origin(here);

        let arrived = self
            .arrival
            .as_mut()
            .and_then(|detector| detector.update(&here, fused.timestamp_ms));

        self.broadcast(fused.timestamp_ms);
        updates.push(SessionUpdate::Position(fused));
        if let Some(event) = arrived {
            info!(distance_m = event.distance_m, "arrived at destination");
            updates.push(SessionUpdate::Arrived(event));
        }
    }

    fn broadcast(&mut self, now_ms: u64) {
        if !self.running {
            return;
        }
        let Some(scope) = self.scope.as_deref() else {
            return;
        };
        let interval_ms = self.motion.update_interval_ms();
        let Some(position) = self.fusion.take_outbound(now_ms, interval_ms) else {
            return;
        };

        let update = PeerUpdate {
            peer_id: self.self_id.clone(),
            lat: position.lat,
            lng: position.lng,
            sharing: true,
            timestamp_ms: position.timestamp_ms,
        };
        match self.store.upsert(&self.self_id, scope, &update) {
            Ok(()) => debug!(scope, "shared position"),
            Err(error) => warn!(%error, scope, "failed to share position, retrying next window"),
        }
    }

    fn join_peers(&mut self, scope: &str) {
        match self.store.snapshot(scope) {
            Ok(records) => {
                for record in &records {
                    self.peers.apply(record);
                }
                debug!(scope, peers = self.peers.len(), "loaded peer snapshot");
            }
            Err(error) => warn!(%error, scope, "peer snapshot unavailable"),
        }

        match self.store.subscribe(scope) {
            Ok(rx) => self.peer_rx = Some(rx),
            Err(error) => warn!(%error, scope, "peer subscription unavailable"),
        }
    }

    fn handle_sensor_error(&mut self, error: &SensorError) {
        match error {
            SensorError::PermissionDenied {
                sensor: SensorKind::Gps,
            } => {
                self.permission_denied = true;
                self.sensors.position.stop_watch();
                self.fusion.note_sensor_error(error);
            }
            SensorError::Timeout {
                sensor: SensorKind::Gps,
                ..
            } => self.fusion.note_sensor_error(error),
            SensorError::Unavailable {
                sensor: SensorKind::Gps,
            } => {
                self.mark_unsupported(SensorKind::Gps);
                self.sensors.position.stop_watch();
                self.fusion.note_sensor_error(error);
            }
            _ => self.disable_component(error),
        }
    }

    fn disable_component(&mut self, error: &SensorError) {
        warn!(%error, strategy = ?error.recovery_strategy(), "disabling component");
        match error.sensor() {
            SensorKind::Bluetooth => {
                self.sensors.beacons.stop();
                self.beacons.set_supported(false);
            }
            SensorKind::Orientation => self.sensors.orientation.stop(),
            SensorKind::Gps => self.sensors.position.stop_watch(),
            SensorKind::Network => {}
        }
        self.mark_unsupported(error.sensor());
    }

    fn mark_unsupported(&mut self, sensor: SensorKind) {
        if !self.unsupported.contains(&sensor) {
            self.unsupported.push(sensor);
        }
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn next_peer_update(rx: &mut Option<mpsc::Receiver<PeerUpdate>>) -> Option<PeerUpdate> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::trilateration::BeaconRegistryEntry;
    use crate::api::peers::InMemoryPeerStore;
    use crate::core::PositionSource as Source;
    use crate::hardware::{
        ConnectionInfo, MockConnectionInfo, MockPositionSource, MockSourceHandle, MockStreamSource,
        OrientationReading,
    };

    struct Harness {
        session: TrackingSession,
        gps: MockSourceHandle,
        ble: MockSourceHandle,
        compass: MockSourceHandle,
        store: InMemoryPeerStore,
    }

    fn beacon(id: &str, lat: f64, lng: f64, zone: &str) -> BeaconRegistryEntry {
        BeaconRegistryEntry {
            beacon_id: id.to_string(),
            lat,
            lng,
            floor: 3,
            tx_power: -59,
            venue_id: "arena".to_string(),
            zone_name: zone.to_string(),
        }
    }

    fn registry() -> BeaconRegistry {
        BeaconRegistry::from_entries(vec![beacon("AA:BB:CC:DD:EE:01", 10.0, 20.0, "lobby")]).unwrap()
    }

    fn scan(device_id: &str, rssi: i32, t: u64) -> SensorEvent {
        SensorEvent::BeaconScan(BeaconScanResult {
            device_id: device_id.to_string(),
            rssi,
            advertised_name: None,
            timestamp_ms: t,
        })
    }

    fn harness(config: TrackingConfig, connection: Option<ConnectionInfo>) -> Harness {
        harness_with(config, connection, registry())
    }

    fn harness_with(
        config: TrackingConfig,
        connection: Option<ConnectionInfo>,
        registry: BeaconRegistry,
    ) -> Harness {
        let gps = MockPositionSource::new();
        let ble = MockStreamSource::new(SensorKind::Bluetooth);
        let compass = MockStreamSource::new(SensorKind::Orientation);
        let store = InMemoryPeerStore::default();
        let handles = (gps.handle(), ble.handle(), compass.handle());

        let sensors = SensorSuite::new()
            .with_position(gps)
            .with_beacons(ble)
            .with_orientation(compass)
            .with_connection(MockConnectionInfo::new(connection));
        let session = TrackingSession::new("me", config, sensors, Box::new(store.clone()))
            .unwrap()
            .with_registry(registry);

        Harness {
            session,
            gps: handles.0,
            ble: handles.1,
            compass: handles.2,
            store,
        }
    }

    fn fix(lat: f64, lng: f64, accuracy_m: f64, t: u64) -> SensorEvent {
        SensorEvent::Position(PositionSample::gps(lat, lng, accuracy_m, t))
    }

    fn remote(peer_id: &str, lat: f64, lng: f64, sharing: bool) -> PeerUpdate {
        PeerUpdate {
            peer_id: peer_id.to_string(),
            lat,
            lng,
            sharing,
            timestamp_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_start_rejects_empty_scope() {
        let mut h = harness(TrackingConfig::default(), None);
        assert!(matches!(h.session.start("  ").await, Err(SessionError::InvalidScope)));
        assert!(!h.session.is_running());
    }

    #[tokio::test]
    async fn test_initial_fix_is_fused_and_shared() {
        let mut h = harness(TrackingConfig::default(), None);
        h.gps.queue_fix(Ok(PositionSample::gps(1.0, 2.0, 6.0, 1_000)));
        h.session.start("party").await.unwrap();

        let position = h.session.current_position().unwrap();
        assert_eq!((position.lat, position.lng), (1.0, 2.0));
        assert_eq!(h.session.signal_quality(), SignalQuality::Good);
        assert!(h.gps.is_active());
        assert!(h.store.record("party", "me").unwrap().sharing);
        assert_eq!(h.store.subscriber_count("party"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_initial_fix_times_out() {
        let mut h = harness(TrackingConfig::default(), None);
        h.gps.hang_requests(true);
        h.session.start("party").await.unwrap();

        assert!(h.session.current_position().is_none());
        assert_eq!(h.session.signal_quality(), SignalQuality::Poor);
        // the session keeps going with the continuous watch
        assert!(h.gps.is_active());
        h.gps.emit(fix(1.0, 1.0, 5.0, 0));
        let updates = h.session.pump().await.unwrap();
        assert!(matches!(updates[0], SessionUpdate::Position(_)));
    }

    #[tokio::test]
    async fn test_permission_denied_keeps_last_fix() {
        let mut h = harness(TrackingConfig::default(), None);
        h.gps.queue_fix(Ok(PositionSample::gps(1.0, 2.0, 6.0, 0)));
        h.session.start("party").await.unwrap();

        h.gps.emit(SensorEvent::PositionError(SensorError::PermissionDenied {
            sensor: SensorKind::Gps,
        }));
        let updates = h.session.pump().await.unwrap();
        assert!(matches!(updates[0], SessionUpdate::Degraded(_)));

        assert!(h.session.permission_denied());
        assert_eq!(h.session.signal_quality(), SignalQuality::Poor);
        assert_eq!(h.session.current_position().unwrap().lat, 1.0);
        assert!(!h.gps.is_active());
        assert!(h.session.diagnostics().permission_denied);
    }

    #[tokio::test]
    async fn test_denied_initial_fix_skips_watch() {
        let mut h = harness(TrackingConfig::default(), None);
        h.gps.queue_fix(Err(SensorError::PermissionDenied {
            sensor: SensorKind::Gps,
        }));
        h.session.start("party").await.unwrap();
        assert!(h.session.permission_denied());
        assert_eq!(h.gps.start_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut h = harness(TrackingConfig::default(), None);
        h.gps.queue_fix(Ok(PositionSample::gps(1.0, 2.0, 6.0, 0)));
        h.session.start("party").await.unwrap();
        let writes = h.store.write_count();

        h.session.stop();
        h.session.stop();

        assert_eq!(h.store.write_count(), writes + 1);
        assert!(!h.store.record("party", "me").unwrap().sharing);
        assert!(!h.gps.is_active());
        assert!(!h.ble.is_active());
        assert!(!h.compass.is_active());
        assert_eq!(h.gps.stop_count(), 1);
        assert_eq!(h.store.subscriber_count("party"), 0);
        assert!(h.session.peer_positions().is_empty());
        assert!(h.session.pump().await.is_none());
    }

    #[tokio::test]
    async fn test_drop_withdraws_position() {
        let h = harness(TrackingConfig::default(), None);
        let Harness {
            mut session, store, ..
        } = h;
        session.start("party").await.unwrap();
        drop(session);
        assert!(!store.record("party", "me").unwrap().sharing);
    }

    #[tokio::test]
    async fn test_restart_replaces_previous_watch() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("one").await.unwrap();
        h.session.start("two").await.unwrap();

        assert_eq!(h.gps.start_count(), 2);
        assert_eq!(h.gps.stop_count(), 1);
        assert_eq!(h.session.scope(), Some("two"));
        assert!(!h.store.record("one", "me").unwrap().sharing);
        assert_eq!(h.store.subscriber_count("one"), 0);
    }

    #[tokio::test]
    async fn test_throttle_collapses_bursts() {
        let mut config = TrackingConfig::default();
        config.motion.initial_mode = TrackingMode::HighAccuracy;
        let mut h = harness(config, None);
        h.session.start("party").await.unwrap();
        assert_eq!(h.session.update_interval_ms(), 5_000);

        for t in [0, 1_000, 2_000, 3_000] {
            h.gps.emit(fix(1.0, 1.0, 5.0, t));
        }
        h.session.drain_pending();
        assert_eq!(h.store.write_count(), 1);

        h.gps.emit(fix(1.0, 1.0, 5.0, 5_000));
        h.session.drain_pending();
        assert_eq!(h.store.write_count(), 2);
        assert_eq!(h.store.record("party", "me").unwrap().timestamp_ms, 5_000);
    }

    #[tokio::test]
    async fn test_failed_write_retried_next_window() {
        let mut config = TrackingConfig::default();
        config.motion.initial_mode = TrackingMode::HighAccuracy;
        let mut h = harness(config, None);
        h.session.start("party").await.unwrap();

        h.store.fail_next_writes(1);
        h.gps.emit(fix(1.0, 1.0, 5.0, 0));
        h.gps.emit(fix(1.0, 1.0, 5.0, 1_000));
        h.session.drain_pending();
        assert!(h.store.record("party", "me").is_none());
        assert!(h.session.current_position().is_some());

        h.gps.emit(fix(1.0, 1.0, 5.0, 5_000));
        h.session.drain_pending();
        assert!(h.store.record("party", "me").is_some());
    }

    #[tokio::test]
    async fn test_peers_snapshot_then_live_updates() {
        let mut h = harness(TrackingConfig::default(), None);
        h.store.upsert("ana", "party", &remote("ana", 0.0, 1.0, true)).unwrap();
        h.session.start("party").await.unwrap();
        assert_eq!(h.session.peer_positions().len(), 1);
        assert!(h.session.peer_positions()[0].distance_m.is_none());

        h.gps.emit(fix(0.0, 0.0, 5.0, 0));
        h.session.pump().await.unwrap();
        let peers = h.session.peer_positions();
        assert!((peers[0].bearing_deg.unwrap() - 90.0).abs() < 1e-6);

        // own write echoes back through the subscription and is ignored
        let updates = h.session.pump().await.unwrap();
        assert_eq!(updates, vec![SessionUpdate::Peer(PeerChange::Ignored)]);

        h.store.upsert("bo", "party", &remote("bo", 1.0, 0.0, true)).unwrap();
        let updates = h.session.pump().await.unwrap();
        match &updates[0] {
            SessionUpdate::Peer(PeerChange::Upserted(peer)) => {
                assert_eq!(peer.peer_id, "bo");
                assert!(peer.distance_m.is_some());
            }
            other => panic!("unexpected update {:?}", other),
        }

        h.store.upsert("ana", "party", &remote("ana", 0.0, 1.0, false)).unwrap();
        h.session.pump().await.unwrap();
        let ids: Vec<String> = h.session.peer_positions().into_iter().map(|p| p.peer_id).collect();
        assert_eq!(ids, vec!["bo"]);
    }

    #[tokio::test]
    async fn test_single_beacon_overrides_poor_gps() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("venue").await.unwrap();

        h.gps.emit(fix(10.001, 20.001, 40.0, 1_000));
        h.ble.emit(SensorEvent::BeaconScan(BeaconScanResult {
            device_id: "aabbccddee01".to_string(),
            rssi: -65,
            advertised_name: None,
            timestamp_ms: 1_500,
        }));
        let updates = h.session.drain_pending();
        assert!(updates.contains(&SessionUpdate::Beacons(1)));

        let position = h.session.current_position().unwrap();
        assert_eq!(position.source, Source::Indoor);
        assert_eq!(position.floor, Some(3));
        assert_eq!(position.zone_name.as_deref(), Some("lobby"));
        assert!((position.accuracy_m - 11.7378).abs() < 1e-3);
        assert_eq!(h.session.diagnostics().beacons.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_beacon_ignored() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("venue").await.unwrap();
        h.ble.emit(SensorEvent::BeaconScan(BeaconScanResult {
            device_id: "ff:ff:ff:ff:ff:ff".to_string(),
            rssi: -50,
            advertised_name: None,
            timestamp_ms: 0,
        }));
        assert!(h.session.drain_pending().is_empty());
        assert!(h.session.current_position().is_none());
    }

    #[tokio::test]
    async fn test_newer_beacon_replaces_evicted_one() {
        let registry = BeaconRegistry::from_entries(vec![
            beacon("AA:BB:CC:DD:EE:01", 10.0, 20.0, "lobby"),
            beacon("AA:BB:CC:DD:EE:02", 10.001, 20.001, "stage"),
        ])
        .unwrap();
        let mut h = harness_with(TrackingConfig::default(), None, registry);
        h.session.start("venue").await.unwrap();

        h.ble.emit(scan("aabbccddee01", -55, 0));
        h.session.drain_pending();
        assert_eq!(h.session.current_position().unwrap().zone_name.as_deref(), Some("lobby"));

        // the far beacon alone is less accurate, but the near one is long gone
        h.ble.emit(scan("aabbccddee02", -70, 30_000));
        let updates = h.session.drain_pending();
        assert!(updates.contains(&SessionUpdate::Beacons(1)));

        let position = h.session.current_position().unwrap();
        assert_eq!((position.lat, position.lng), (10.001, 20.001));
        assert_eq!(position.zone_name.as_deref(), Some("stage"));
        assert_eq!(position.timestamp_ms, 30_000);

        let diagnostics = h.session.diagnostics();
        assert_eq!(diagnostics.beacons.len(), 1);
        assert_eq!(diagnostics.beacons[0].beacon_id, "AA:BB:CC:DD:EE:02");
        assert!(!diagnostics.position_stale);
    }

    #[tokio::test]
    async fn test_indoor_fix_goes_stale_without_beacons() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("venue").await.unwrap();

        h.ble.emit(scan("aabbccddee01", -65, 0));
        h.session.drain_pending();
        assert_eq!(h.session.signal_quality(), SignalQuality::Fair);

        h.ble.emit(scan("ff:ff:ff:ff:ff:ff", -50, 30_000));
        assert!(h.session.drain_pending().is_empty());

        let diagnostics = h.session.diagnostics();
        assert!(diagnostics.beacons.is_empty());
        assert!(diagnostics.position_stale);
        assert_eq!(diagnostics.signal_quality, SignalQuality::Poor);
        assert_eq!(h.session.current_position().unwrap().source, Source::Indoor);

        h.gps.emit(fix(10.0, 20.0, 8.0, 31_000));
        h.session.drain_pending();
        assert!(!h.session.diagnostics().position_stale);
        assert_eq!(h.session.signal_quality(), SignalQuality::Good);
    }

    #[tokio::test]
    async fn test_beacon_fix_recovers_from_gps_timeout() {
        let mut h = harness(TrackingConfig::default(), None);
        h.gps.queue_fix(Ok(PositionSample::gps(10.001, 20.001, 25.0, 0)));
        h.session.start("venue").await.unwrap();
        assert_eq!(h.session.signal_quality(), SignalQuality::Fair);

        h.gps.emit(SensorEvent::PositionError(SensorError::Timeout {
            sensor: SensorKind::Gps,
            timeout_ms: 10_000,
        }));
        h.session.drain_pending();
        assert_eq!(h.session.signal_quality(), SignalQuality::Poor);

        h.ble.emit(scan("aabbccddee01", -65, 1_000));
        h.session.drain_pending();
        let position = h.session.current_position().unwrap();
        assert_eq!(position.source, Source::Indoor);
        assert_eq!(h.session.signal_quality(), position.signal_quality());
        assert_eq!(h.session.signal_quality(), SignalQuality::Fair);
    }

    #[tokio::test]
    async fn test_farewell_uses_latest_sample_time() {
        let mut h = harness(TrackingConfig::default(), None);
        h.gps.queue_fix(Ok(PositionSample::gps(1.0, 2.0, 6.0, 1_000)));
        h.session.start("party").await.unwrap();

        h.gps.emit(fix(1.0, 2.0, 6.0, 42_000));
        h.ble.emit(scan("ff:ff:ff:ff:ff:ff", -50, 43_500));
        h.session.drain_pending();
        h.session.stop();

        let farewell = h.store.record("party", "me").unwrap();
        assert!(!farewell.sharing);
        assert_eq!(farewell.timestamp_ms, 43_500);
    }

    #[tokio::test]
    async fn test_scanner_start_failure_disables_beacons() {
        let mut h = harness(TrackingConfig::default(), None);
        h.ble.fail_start(Some(SensorError::PermissionDenied {
            sensor: SensorKind::Bluetooth,
        }));
        h.session.start("venue").await.unwrap();

        let diagnostics = h.session.diagnostics();
        assert!(!diagnostics.beacon_support);
        assert!(diagnostics.unsupported.contains(&SensorKind::Bluetooth));
        assert!(!h.ble.is_active());
        assert!(h.compass.is_active());
        assert!(h.gps.is_active());

        // a later scan that still reaches the session is ignored
        let updates = h.session.handle_event(scan("aabbccddee01", -65, 0));
        assert!(updates.is_empty());
        assert!(h.session.current_position().is_none());
    }

    #[tokio::test]
    async fn test_compass_start_failure_reported() {
        let mut h = harness(TrackingConfig::default(), None);
        h.compass.fail_start(Some(SensorError::Unavailable {
            sensor: SensorKind::Orientation,
        }));
        h.session.start("party").await.unwrap();

        let diagnostics = h.session.diagnostics();
        assert!(diagnostics.unsupported.contains(&SensorKind::Orientation));
        assert!(diagnostics.beacon_support);
        assert!(!h.compass.is_active());
        assert!(h.ble.is_active());
    }

    #[tokio::test]
    async fn test_offline_store_does_not_stop_tracking() {
        let mut config = TrackingConfig::default();
        config.motion.initial_mode = TrackingMode::HighAccuracy;
        let mut h = harness(config, None);
        h.store.upsert("ana", "party", &remote("ana", 0.0, 1.0, true)).unwrap();
        h.store.set_available(false);
        h.session.start("party").await.unwrap();

        assert!(h.session.is_running());
        assert!(h.session.peer_positions().is_empty());
        assert_eq!(h.store.subscriber_count("party"), 0);

        h.gps.emit(fix(1.0, 1.0, 5.0, 0));
        h.session.drain_pending();
        assert!(h.session.current_position().is_some());
        assert!(h.store.record("party", "me").is_none());

        h.store.set_available(true);
        h.gps.emit(fix(1.0, 1.0, 5.0, 5_000));
        h.session.drain_pending();
        assert!(h.store.record("party", "me").unwrap().sharing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_subscription_is_dropped() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("party").await.unwrap();
        assert!(h.session.peer_rx.is_some());

        h.store.disconnect("party");
        let waited = tokio::time::timeout(Duration::from_secs(1), h.session.pump()).await;
        assert!(waited.is_err());
        assert!(h.session.peer_rx.is_none());
        assert!(h.session.is_running());

        h.gps.emit(fix(1.0, 1.0, 5.0, 0));
        let updates = h.session.pump().await.unwrap();
        assert!(matches!(updates[0], SessionUpdate::Position(_)));
    }

    #[tokio::test]
    async fn test_diagnostics_report_battery_state() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("party").await.unwrap();
        let before = h.session.diagnostics();
        assert!(before.adaptive_battery);
        assert!(before.battery.is_none());

        let status = BatteryStatus {
            level: 0.1,
            charging: false,
        };
        h.session.event_sink().try_send(SensorEvent::Battery(status)).unwrap();
        h.session.pump().await.unwrap();
        assert_eq!(h.session.diagnostics().battery, Some(status));

        h.session.set_adaptive_battery(false);
        assert!(!h.session.diagnostics().adaptive_battery);
    }

    #[tokio::test]
    async fn test_restart_clears_session_state() {
        let connection = ConnectionInfo {
            effective_type: "wifi".to_string(),
            downlink_mbps: Some(50.0),
            rtt_ms: Some(40),
        };
        let mut h = harness(TrackingConfig::default(), Some(connection));
        h.session.start("one").await.unwrap();

        h.gps.emit(fix(0.0, 0.0, 8.0, 0));
        for (i, accuracy) in [40.0, 80.0, 45.0, 90.0].into_iter().enumerate() {
            h.gps.emit(fix(0.001, 0.001, accuracy, 1_000 * (i as u64 + 1)));
        }
        h.compass
            .emit(SensorEvent::Orientation(OrientationReading::CompassHeading(90.0)));
        h.session.drain_pending();
        assert!(h.session.diagnostics().environment.is_indoor);
        assert!(h.session.heading().is_some());

        h.session.start("two").await.unwrap();
        let diagnostics = h.session.diagnostics();
        assert!(!diagnostics.environment.is_indoor);
        assert!(diagnostics.network_override.is_none());
        assert!(h.session.heading().is_none());
        assert_eq!(h.session.movement_state(), MovementState::Stationary);
    }

    #[tokio::test]
    async fn test_indoor_network_blend() {
        let connection = ConnectionInfo {
            effective_type: "wifi".to_string(),
            downlink_mbps: Some(50.0),
            rtt_ms: Some(40),
        };
        let mut h = harness(TrackingConfig::default(), Some(connection));
        h.session.start("party").await.unwrap();

        h.gps.emit(fix(0.0, 0.0, 8.0, 0));
        for (i, accuracy) in [40.0, 80.0, 45.0, 90.0].into_iter().enumerate() {
            h.gps.emit(fix(0.001, 0.001, accuracy, 1_000 * (i as u64 + 1)));
        }
        h.session.drain_pending();

        let diagnostics = h.session.diagnostics();
        assert!(diagnostics.environment.is_indoor);
        let position = h.session.current_position().unwrap();
        assert_eq!(position.source, Source::Hybrid);
        assert_eq!(position.accuracy_m, 50.0);
    }

    #[tokio::test]
    async fn test_compass_heading_smoothed() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("party").await.unwrap();
        h.compass
            .emit(SensorEvent::Orientation(OrientationReading::CompassHeading(350.0)));
        h.compass
            .emit(SensorEvent::Orientation(OrientationReading::CompassHeading(10.0)));
        h.session.drain_pending();
        assert!((h.session.heading().unwrap() - 353.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_battery_restarts_watch() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("party").await.unwrap();
        let sink = h.session.event_sink();
        sink.try_send(SensorEvent::Battery(BatteryStatus {
            level: 0.1,
            charging: false,
        }))
        .unwrap();

        let updates = h.session.pump().await.unwrap();
        assert_eq!(
            updates,
            vec![SessionUpdate::TrackingModeChanged(TrackingMode::BatterySaver)]
        );
        assert_eq!(h.session.update_interval_ms(), 60_000);
        assert_eq!(h.gps.start_count(), 2);
        assert!(h.gps.is_active());
    }

    #[tokio::test]
    async fn test_arrival_fires_once() {
        let mut h = harness(TrackingConfig::default(), None);
        h.session.start("party").await.unwrap();
        h.session.set_destination(Coordinate::new(0.0, 0.0), Some(20.0));

        h.gps.emit(fix(0.001, 0.0, 5.0, 0));
        h.session.drain_pending();
        assert!(h.session.distance_to_destination().unwrap() > 100.0);

        // smoothing needs several samples to pull the fix inside the radius
        for i in 1..=10u64 {
            h.gps.emit(fix(0.0, 0.0, 5.0, i * 1_000));
        }
        let updates = h.session.drain_pending();
        let arrivals = updates
            .iter()
            .filter(|u| matches!(u, SessionUpdate::Arrived(_)))
            .count();
        assert_eq!(arrivals, 1);
    }

    #[tokio::test]
    async fn test_unsupported_sources_reported() {
        let sensors = SensorSuite::new().with_position(MockPositionSource::new());
        let store = InMemoryPeerStore::default();
        let mut session =
            TrackingSession::new("me", TrackingConfig::default(), sensors, Box::new(store)).unwrap();
        session.start("party").await.unwrap();

        let diagnostics = session.diagnostics();
        assert!(!diagnostics.beacon_support);
        assert!(diagnostics.unsupported.contains(&SensorKind::Bluetooth));
        assert!(diagnostics.unsupported.contains(&SensorKind::Orientation));
        assert!(diagnostics.unsupported.contains(&SensorKind::Network));
        assert!(!diagnostics.unsupported.contains(&SensorKind::Gps));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = TrackingConfig::default();
        config.smoothing.position_factor = 1.5;
        let result = TrackingSession::new(
            "me",
            config,
            SensorSuite::new(),
            Box::new(InMemoryPeerStore::default()),
        );
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }
}
