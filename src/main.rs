//! # Ride Telemetry
//!
//! Demo host for the telemetry engine.
//!
//! Runs the engine against a simulated peripheral that streams dashboard
//! frames, prints every record as a JSON line and drops the link now and
//! then so the fallback tiers can be seen taking over.

use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::time::{interval, sleep, Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ride_telemetry::config::Config;
use ride_telemetry::discovery::DeviceDescriptor;
use ride_telemetry::engine::{EngineDeps, StaticPermissions, TelemetryEngine};
use ride_telemetry::radio::sim::{SimHandle, SimPeripheral, SimulatedRadio};
use ride_telemetry::storage::FileStore;

/// Default configuration file, overridable with the first CLI argument
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Frame rate of the simulated dashboard
const FRAME_RATE_HZ: u64 = 10;

/// Frames between simulated link drops
const FRAMES_PER_LINK: u64 = 150;

const DEMO_DEVICE_ID: &str = "SIM-0001";

/// Main entry point
///
/// # Control Flow
///
/// 1. Load configuration and set up logging
/// 2. Start the engine, scan and connect to the first likely dashboard
/// 3. Print records until Ctrl+C, then dispose the engine
///
/// # Errors
///
/// Returns error if the configuration is invalid or the storage directory
/// cannot be created.
#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        Config::load(&config_path).with_context(|| format!("loading {}", config_path))?
    } else {
        Config::default()
    };

    let _log_guard = init_logging(&config)?;
    info!("Ride Telemetry v{} starting...", env!("CARGO_PKG_VERSION"));

    let store = Arc::new(
        FileStore::open(&config.storage.dir)
            .with_context(|| format!("opening storage at {}", config.storage.dir))?,
    );
    let radio = Arc::new(SimulatedRadio::new());
    let dash = radio.add_peripheral(SimPeripheral::uart(DEMO_DEVICE_ID, Some("Moto TFT Dash"), -55));

    let engine = Arc::new(TelemetryEngine::new(
        config,
        EngineDeps {
            radio,
            sensors: None,
            permissions: Arc::new(StaticPermissions::granted()),
            store,
        },
    ));

    if let Err(e) = engine.initialize().await {
        warn!("Engine started degraded: {}", e);
    }

    let _records = engine.set_data_callback(|record| match serde_json::to_string(record) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to serialize record: {}", e),
    });
    let _states = engine.set_connection_callback(|state| info!("Connection state: {}", state));

    let (found_tx, mut found_rx) = tokio::sync::mpsc::unbounded_channel::<DeviceDescriptor>();
    engine
        .start_scanning(move |device| {
            if device.is_likely_target {
                let _ = found_tx.send(device);
            }
        })
        .await?;

    let target = tokio::select! {
        device = found_rx.recv() => device,
        _ = tokio::signal::ctrl_c() => None,
    };
    engine.stop_scanning().await;

    if let Some(device) = target {
        info!("Connecting to {} ({})", device.id, device.name.as_deref().unwrap_or("unnamed"));
        if let Err(e) = engine.connect_to_device(&device).await {
            warn!("Connection failed, fallback active: {}", e);
        }
        run_dashboard(&engine, &dash, &device).await;
    }

    info!("Received shutdown, disposing engine...");
    engine.dispose().await;
    Ok(())
}

/// Feed frames into the simulated peripheral until Ctrl+C
///
/// Every [`FRAMES_PER_LINK`] frames the link drops for a few seconds and the
/// engine reconnects.
async fn run_dashboard(engine: &TelemetryEngine, dash: &SimHandle, device: &DeviceDescriptor) {
    let mut ticker = interval(Duration::from_millis(1000 / FRAME_RATE_HZ));
    let mut frames: u64 = 0;
    let mut speed: i32 = 40;
    let mut fuel: u8 = 80;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !dash.is_connected() {
                    if let Err(e) = engine.connect_to_device(device).await {
                        warn!("Reconnect failed: {}", e);
                    }
                    continue;
                }

                let (step, drain) = {
                    let mut rng = rand::thread_rng();
                    (rng.gen_range(-2..=2), rng.gen_bool(0.01))
                };
                speed = (speed + step).clamp(0, 180);
                fuel = fuel.saturating_sub(u8::from(drain));
                dash.notify(&demo_frame(speed as u8, fuel));
                frames += 1;

                if frames % FRAMES_PER_LINK == 0 {
                    info!("Dropping simulated link after {} frames", frames);
                    dash.drop_link();
                    sleep(Duration::from_secs(5)).await;
                }
            }

            _ = tokio::signal::ctrl_c() => break,
        }
    }
}

/// Build a frame in the default dashboard layout
fn demo_frame(speed_kmh: u8, fuel_percent: u8) -> [u8; 11] {
    let gear = match speed_kmh {
        0..=14 => 1,
        15..=29 => 2,
        30..=49 => 3,
        50..=69 => 4,
        70..=99 => 5,
        _ => 6,
    };
    let rpm = 1000 + u16::from(speed_kmh) * 50;
    let rpm_units = (rpm / 10).to_be_bytes();
    [
        speed_kmh,
        gear,
        rpm_units[0],
        rpm_units[1],
        fuel_percent,
        0,
        0x05,
        0,
        0,
        0,
        100,
    ]
}

/// Console logging filtered by `logging.level`, plus an optional daily file
fn init_logging(config: &Config) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .context("invalid log filter")?;

    match &config.logging.file_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "ride-telemetry.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}
