//! End-to-end behaviour of the telemetry engine against the simulated radio

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio_test::{assert_err, assert_ok};

use ride_telemetry::config::Config;
use ride_telemetry::connection::ConnectionState;
use ride_telemetry::discovery::DeviceDescriptor;
use ride_telemetry::engine::{EngineDeps, StaticPermissions, TelemetryEngine};
use ride_telemetry::error::EngineError;
use ride_telemetry::fallback::{LocationFix, MotionSample, ScriptedSensors, SensorProvider};
use ride_telemetry::oplog::LogEntry;
use ride_telemetry::protocol::command::TripCounter;
use ride_telemetry::protocol::constants::OPCODE_TRIP_RESET;
use ride_telemetry::radio::sim::{SimBehavior, SimHandle, SimPeripheral, SimulatedRadio};
use ride_telemetry::storage::MemoryStore;
use ride_telemetry::telemetry::Source;

/// speed 45, gear 3, 6000 rpm, fuel 60 %, Road, high beam + engine check, odometer 100
const REFERENCE_FRAME: [u8; 11] = [45, 3, 0x02, 0x58, 60, 0, 0x05, 0, 0, 0, 100];

struct Rig {
    engine: TelemetryEngine,
    radio: Arc<SimulatedRadio>,
    store: Arc<MemoryStore>,
}

fn quiet_config() -> Config {
    let mut config = Config::default();
    config.link.default_auth_key = "1234".to_string();
    config.fallback.auto_start = false;
    config
}

fn build_rig(
    config: Config,
    permissions: StaticPermissions,
    store: Arc<MemoryStore>,
    sensors: Option<Arc<dyn SensorProvider>>,
) -> Rig {
    let radio = Arc::new(SimulatedRadio::new());
    let engine = TelemetryEngine::new(
        config,
        EngineDeps {
            radio: radio.clone(),
            sensors,
            permissions: Arc::new(permissions),
            store: store.clone(),
        },
    );
    Rig { engine, radio, store }
}

fn rig_with(config: Config, permissions: StaticPermissions, store: Arc<MemoryStore>) -> Rig {
    build_rig(config, permissions, store, None)
}

/// Phone sensors with a minute of readings queued, riding north at ~36 km/h
fn moving_sensors() -> Arc<ScriptedSensors> {
    let sensors = Arc::new(ScriptedSensors::new());
    let start = Utc::now();
    for i in 0..60 {
        let at = start + TimeDelta::seconds(i);
        sensors.push_location(LocationFix {
            latitude: 48.0 + i as f64 * 0.00009,
            longitude: 11.0,
            timestamp: at,
        });
        sensors.push_motion(MotionSample {
            x: 0.3,
            y: 0.1,
            z: 1.0,
            timestamp: at,
        });
    }
    sensors
}

fn rig(config: Config) -> Rig {
    rig_with(config, StaticPermissions::granted(), Arc::new(MemoryStore::new()))
}

fn dash(rig: &Rig, behavior: SimBehavior) -> SimHandle {
    rig.radio
        .add_peripheral(SimPeripheral::uart("AA:01", Some("Moto Dash"), -50).with_behavior(behavior))
}

/// Scan until the first likely target shows up
async fn discover(engine: &TelemetryEngine) -> DeviceDescriptor {
    let (tx, mut rx) = mpsc::unbounded_channel();
    assert_ok!(
        engine
            .start_scanning(move |device| {
                let _ = tx.send(device);
            })
            .await
    );
    let device = rx.recv().await.unwrap();
    engine.stop_scanning().await;
    device
}

#[tokio::test]
async fn test_scan_connect_and_stream() {
    let rig = rig(quiet_config());
    let handle = dash(&rig, SimBehavior::default());
    assert_ok!(rig.engine.initialize().await);
    let mut stream = rig.engine.telemetry_stream();

    let device = discover(&rig.engine).await;
    assert_eq!(device.id, "AA:01");
    assert!(device.is_likely_target);

    assert_ok!(rig.engine.connect_to_device(&device).await);
    assert_eq!(rig.engine.connection_state(), ConnectionState::Monitoring);

    assert!(handle.notify(&REFERENCE_FRAME));
    let record = stream.recv().await.unwrap();
    assert_eq!(record.speed_kmh, Some(45));
    assert_eq!(record.gear, Some(3));
    assert_eq!(record.rpm, Some(6000));
    assert_eq!(record.fuel_percent, Some(60));
    assert!(record.flags.high_beam);
    assert!(record.flags.engine_check);
    assert!(!record.flags.hazard);
    assert_eq!(record.odometer, Some(100));
    assert_eq!(record.source, Source::Live);
    assert!(record.connected);
    assert_eq!(rig.engine.cached_telemetry(), Some(record));

    rig.engine.dispose().await;
}

#[tokio::test]
async fn test_auth_exhaustion_still_monitors() {
    let rig = rig(quiet_config());
    dash(&rig, SimBehavior::rejecting_auth());
    assert_ok!(rig.engine.initialize().await);

    let monitoring = Arc::new(AtomicUsize::new(0));
    let counter = monitoring.clone();
    let _states = rig.engine.set_connection_callback(move |state| {
        if state == ConnectionState::Monitoring {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let device = discover(&rig.engine).await;
    assert_ok!(rig.engine.connect_to_device(&device).await);

    assert_eq!(rig.engine.connection_state(), ConnectionState::Monitoring);
    assert_eq!(monitoring.load(Ordering::SeqCst), 1);
    let auth_errors = rig
        .engine
        .get_debug_logs()
        .iter()
        .filter(|e| e.message.starts_with("authentication error"))
        .count();
    assert_eq!(auth_errors, 3);

    rig.engine.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_nothing_emitted_after_disconnect() {
    let sensors = moving_sensors();
    let rig = build_rig(
        Config::default(),
        StaticPermissions::granted(),
        Arc::new(MemoryStore::new()),
        Some(sensors.clone()),
    );
    let handle = dash(&rig, SimBehavior::default());

    let records = Arc::new(AtomicUsize::new(0));
    let counter = records.clone();
    let _data = rig.engine.set_data_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let states = Arc::new(AtomicUsize::new(0));
    let counter = states.clone();
    let _state = rig.engine.set_connection_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // Fallback with live sensor timers until the dash connects
    assert_ok!(rig.engine.initialize().await);
    tokio::time::sleep(Duration::from_millis(3500)).await;
    assert!(records.load(Ordering::SeqCst) > 0);
    let (locations, motion) = sensors.pending();
    assert!(locations < 60 && motion < 60);

    let device = discover(&rig.engine).await;
    assert_ok!(rig.engine.connect_to_device(&device).await);
    handle.notify(&REFERENCE_FRAME);
    tokio::time::sleep(Duration::from_millis(50)).await;

    rig.engine.disconnect().await;
    let records_after = records.load(Ordering::SeqCst);
    let states_after = states.load(Ordering::SeqCst);
    let pending_after = sensors.pending();
    assert!(states_after > 0);
    assert_eq!(rig.engine.connection_state(), ConnectionState::Idle);

    assert!(!handle.notify(&REFERENCE_FRAME));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(records.load(Ordering::SeqCst), records_after);
    assert_eq!(states.load(Ordering::SeqCst), states_after);
    assert_eq!(sensors.pending(), pending_after);

    // A second disconnect changes nothing
    rig.engine.disconnect().await;
    assert_eq!(handle.disconnect_count(), 1);
    assert_eq!(states.load(Ordering::SeqCst), states_after);
}

#[tokio::test(start_paused = true)]
async fn test_start_fallback_after_disconnect() {
    let rig = rig(quiet_config());
    let handle = dash(&rig, SimBehavior::default());
    assert_ok!(rig.engine.initialize().await);

    let device = discover(&rig.engine).await;
    assert_ok!(rig.engine.connect_to_device(&device).await);
    handle.notify(&REFERENCE_FRAME);
    tokio::time::sleep(Duration::from_millis(50)).await;
    rig.engine.disconnect().await;

    let mut telemetry = rig.engine.telemetry_stream();
    let mut logs = rig.engine.log_stream();
    rig.engine.start_fallback();

    let record = tokio::time::timeout(Duration::from_secs(5), telemetry.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.source, Source::Cached);
    assert!(!record.connected);
    assert_eq!(record.speed_kmh, Some(45));

    let activated = |entry: &LogEntry| entry.message.contains("Fallback synthesizer active");
    let mut seen = Vec::new();
    while let Ok(entry) = logs.try_recv() {
        seen.push(entry);
    }
    assert_eq!(seen.iter().filter(|e| activated(e)).count(), 1);

    // Already running; a second call is a no-op
    rig.engine.start_fallback();
    while let Ok(entry) = logs.try_recv() {
        assert!(!activated(&entry));
    }

    rig.engine.dispose().await;
}

#[tokio::test]
async fn test_link_loss_serves_cached_record() {
    let rig = rig(quiet_config());
    let handle = dash(&rig, SimBehavior::default());
    assert_ok!(rig.engine.initialize().await);
    let mut stream = rig.engine.telemetry_stream();

    let device = discover(&rig.engine).await;
    assert_ok!(rig.engine.connect_to_device(&device).await);
    handle.notify(&REFERENCE_FRAME);
    let live = stream.recv().await.unwrap();

    handle.drop_link();
    let next = stream.recv().await.unwrap();
    assert_eq!(next.source, Source::Cached);
    assert!(!next.connected);
    assert_eq!(next.speed_kmh, live.speed_kmh);
    assert_eq!(next.timestamp, live.timestamp);
    assert_eq!(rig.engine.connection_state(), ConnectionState::Idle);

    rig.engine.dispose().await;
}

#[tokio::test]
async fn test_restart_replays_persisted_snapshot() {
    let store = Arc::new(MemoryStore::new());
    let first = rig_with(quiet_config(), StaticPermissions::granted(), store.clone());
    let handle = dash(&first, SimBehavior::default());
    assert_ok!(first.engine.initialize().await);
    let mut stream = first.engine.telemetry_stream();

    let device = discover(&first.engine).await;
    assert_ok!(first.engine.connect_to_device(&device).await);
    handle.notify(&REFERENCE_FRAME);
    stream.recv().await.unwrap();
    first.engine.dispose().await;

    let second = rig_with(Config::default(), StaticPermissions::granted(), first.store.clone());
    let mut stream = second.engine.telemetry_stream();
    assert_ok!(second.engine.initialize().await);

    let replayed = stream.recv().await.unwrap();
    assert_eq!(replayed.source, Source::Cached);
    assert_eq!(replayed.speed_kmh, Some(45));
    second.engine.dispose().await;
}

#[tokio::test(start_paused = true)]
async fn test_scan_auto_stops_after_timeout() {
    let rig = rig(quiet_config());
    assert_ok!(rig.engine.initialize().await);
    let mut states = rig.engine.connection_stream();

    assert_ok!(rig.engine.start_scanning(|_| {}).await);
    assert_eq!(states.recv().await.unwrap(), ConnectionState::Scanning);
    assert!(rig.radio.is_scanning());

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert_eq!(rig.engine.connection_state(), ConnectionState::Scanning);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(rig.engine.connection_state(), ConnectionState::Idle);
    assert!(!rig.radio.is_scanning());
    assert!(rig
        .engine
        .get_debug_logs()
        .iter()
        .any(|e| e.message.starts_with("Scan auto-stopped")));
}

#[tokio::test]
async fn test_radio_permission_denied() {
    let rig = rig_with(
        Config::default(),
        StaticPermissions {
            radio: false,
            location: true,
        },
        Arc::new(MemoryStore::new()),
    );
    dash(&rig, SimBehavior::default());
    let mut stream = rig.engine.telemetry_stream();

    match rig.engine.initialize().await {
        Err(EngineError::Permission(_)) => {}
        other => panic!("Expected Permission error, got: {:?}", other),
    }

    let record = stream.recv().await.unwrap();
    assert_eq!(record.source, Source::Synthetic);
    assert!(!record.connected);

    let device = DeviceDescriptor {
        id: "AA:01".to_string(),
        name: Some("Moto Dash".to_string()),
        rssi: -50,
        score: 3,
        is_likely_target: true,
    };
    assert_err!(rig.engine.connect_to_device(&device).await);
    assert_eq!(rig.radio.scan_start_count(), 0);

    rig.engine.dispose().await;
}

#[tokio::test]
async fn test_trip_reset_requires_monitoring() {
    let rig = rig(quiet_config());
    let handle = dash(&rig, SimBehavior::default());
    assert_ok!(rig.engine.initialize().await);

    match rig.engine.send_trip_reset(TripCounter::A).await {
        Err(EngineError::NotConnected) => {}
        other => panic!("Expected NotConnected, got: {:?}", other),
    }

    let device = discover(&rig.engine).await;
    assert_ok!(rig.engine.connect_to_device(&device).await);
    assert_ok!(rig.engine.send_trip_reset(TripCounter::B).await);

    let (_, frame) = handle.writes().last().cloned().unwrap();
    assert_eq!(frame[2], OPCODE_TRIP_RESET);

    rig.engine.dispose().await;
}

#[test]
fn test_operational_log_is_bounded() {
    let rig = rig(quiet_config());
    for _ in 0..600 {
        assert_ok!(rig.engine.update_custom_settings(Default::default()));
    }
    let logs = rig.engine.get_debug_logs();
    assert_eq!(logs.len(), 500);
    assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    rig.engine.clear_debug_logs();
    assert!(rig.engine.get_debug_logs().is_empty());
}
