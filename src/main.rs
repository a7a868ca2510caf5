use geofuse::api::peers::{InMemoryPeerStore, PeerStore, PeerUpdate};
use geofuse::api::session::{SensorSuite, SessionUpdate, TrackingSession};
use geofuse::core::{Coordinate, PositionSample};
use geofuse::hardware::{
    BeaconScanResult, ConnectionInfo, MockConnectionInfo, MockPositionSource, MockStreamSource,
    OrientationReading, SensorEvent, SensorKind,
};
use geofuse::processing::motion::BatteryStatus;
use geofuse::utils::config::ConfigurationManager;
use geofuse::BeaconRegistry;
use tracing_subscriber::EnvFilter;

const DEMO_SCOPE: &str = "demo-event";

const DEMO_REGISTRY: &str = r#"[
    {"beacon_id": "F7826DA6-4FA2-4E98-8024-BC5B71E0893E", "lat": 47.49810, "lng": 19.04020,
     "floor": 1, "tx_power": -59, "venue_id": "riverside-hall", "zone_name": "entrance"},
    {"beacon_id": "F7826DA6-4FA2-4E98-8024-BC5B71E0893F", "lat": 47.49830, "lng": 19.04050,
     "floor": 1, "tx_power": -59, "venue_id": "riverside-hall", "zone_name": "main stage"},
    {"beacon_id": "F7826DA6-4FA2-4E98-8024-BC5B71E08940", "lat": 47.49800, "lng": 19.04060,
     "floor": 1, "tx_power": -59, "venue_id": "riverside-hall", "zone_name": "bar"}
]"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 2 || args.get(1).is_some_and(|arg| arg == "--help") {
        eprintln!(
            "Usage: {} [config.json]",
            args.first().map_or("geofuse", |s| s.as_str())
        );
        return Err("Invalid arguments".into());
    }

    let manager = match args.get(1) {
        Some(path) => ConfigurationManager::from_file(path)?,
        None => ConfigurationManager::new(),
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()?;
    runtime.block_on(run_demo(manager))
}

async fn run_demo(manager: ConfigurationManager) -> Result<(), Box<dyn std::error::Error>> {
    let gps = MockPositionSource::new();
    let ble = MockStreamSource::new(SensorKind::Bluetooth);
    let compass = MockStreamSource::new(SensorKind::Orientation);
    let network = MockConnectionInfo::new(Some(ConnectionInfo {
        effective_type: "4g".to_string(),
        downlink_mbps: Some(12.0),
        rtt_ms: Some(80),
    }));
    let (gps_handle, ble_handle, compass_handle) = (gps.handle(), ble.handle(), compass.handle());

    let store = InMemoryPeerStore::default();
    store.upsert(
        "friend",
        DEMO_SCOPE,
        &PeerUpdate {
            peer_id: "friend".to_string(),
            lat: 47.49825,
            lng: 19.04045,
            sharing: true,
            timestamp_ms: 0,
        },
    )?;

    let sensors = SensorSuite::new()
        .with_position(gps)
        .with_beacons(ble)
        .with_orientation(compass)
        .with_connection(network);
    let mut session = TrackingSession::new("me", manager.config().clone(), sensors, Box::new(store.clone()))?
        .with_registry(BeaconRegistry::from_json_str(DEMO_REGISTRY)?);

    gps_handle.queue_fix(Ok(PositionSample::gps(47.49700, 19.03900, 12.0, 0)));
    session.start(DEMO_SCOPE).await?;
    session.set_destination(Coordinate::new(47.49820, 19.04040), None);

    // Walk towards the hall at about 1.4 m/s, then lose the sky view inside
    let walk = [
        (47.49710, 19.03915, 10.0),
        (47.49722, 19.03930, 9.0),
        (47.49735, 19.03946, 11.0),
        (47.49748, 19.03962, 10.0),
        (47.49760, 19.03978, 14.0),
        (47.49772, 19.03993, 18.0),
        (47.49785, 19.04008, 42.0),
        (47.49796, 19.04020, 65.0),
        (47.49808, 19.04030, 48.0),
        (47.49815, 19.04038, 80.0),
    ];

    for (step, (lat, lng, accuracy)) in walk.into_iter().enumerate() {
        let t = (step as u64 + 1) * 10_000;
        gps_handle.emit(SensorEvent::Position(
            PositionSample::gps(lat, lng, accuracy, t).with_altitude(110.0 + (step % 3) as f64 * 4.0),
        ));
        compass_handle.emit(SensorEvent::Orientation(OrientationReading::CompassHeading(
            40.0 + step as f64,
        )));

        if step >= 6 {
            for (offset, (id, rssi)) in [
                ("f7826da6-4fa2-4e98-8024-bc5b71e0893e", -68),
                ("f7826da6-4fa2-4e98-8024-bc5b71e0893f", -63),
                ("f7826da6-4fa2-4e98-8024-bc5b71e08940", -75),
            ]
            .into_iter()
            .enumerate()
            {
                ble_handle.emit(SensorEvent::BeaconScan(BeaconScanResult {
                    device_id: id.to_string(),
                    rssi: rssi - (9 - step as i32),
                    advertised_name: None,
                    timestamp_ms: t + 200 * (offset as u64 + 1),
                }));
            }
        }

        if step == 5 {
            session.event_sink().try_send(SensorEvent::Battery(BatteryStatus {
                level: 0.12,
                charging: false,
            }))?;
        }

        for update in session.drain_pending() {
            report(&update);
        }
    }

    println!();
    if let Some(position) = session.current_position() {
        println!(
            "Final position: lat={:.6}, lng={:.6}, accuracy={:.1} m, source={:?}, zone={}",
            position.lat,
            position.lng,
            position.accuracy_m,
            position.source,
            position.zone_name.as_deref().unwrap_or("-")
        );
    }
    println!(
        "Mode: {:?}, movement: {:?}, interval: {} ms, signal: {:?}",
        session.tracking_mode(),
        session.movement_state(),
        session.update_interval_ms(),
        session.signal_quality()
    );
    if let Some(heading) = session.heading() {
        println!("Heading: {:.1}°", heading);
    }
    for peer in session.peer_positions() {
        println!(
            "Peer {}: {:.0} m at {:.0}°",
            peer.peer_id,
            peer.distance_m.unwrap_or(f64::NAN),
            peer.bearing_deg.unwrap_or(f64::NAN)
        );
    }
    println!("Diagnostics: {}", serde_json::to_string_pretty(&session.diagnostics())?);

    session.stop();
    Ok(())
}

fn report(update: &SessionUpdate) {
    match update {
        SessionUpdate::Position(position) => println!(
            "[{:>6} ms] {:?} lat={:.6} lng={:.6} ±{:.1} m",
            position.timestamp_ms, position.source, position.lat, position.lng, position.accuracy_m
        ),
        SessionUpdate::TrackingModeChanged(mode) => println!("tracking mode -> {:?}", mode),
        SessionUpdate::Arrived(event) => println!(
            "arrived at destination ({:.1} m from target)",
            event.distance_m
        ),
        SessionUpdate::Degraded(error) => println!("degraded: {}", error),
        SessionUpdate::Heading(_) | SessionUpdate::Beacons(_) | SessionUpdate::Peer(_) => {}
    }
}
