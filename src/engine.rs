//! # Telemetry Engine
//!
//! Consumer-facing context that owns every engine component.
//!
//! This module handles:
//! - Permission requests and component start-up in `initialize()`
//! - Scanning, connecting, disconnecting and trip reset commands
//! - Custom link settings persistence
//! - Telemetry, connection state and log subscriptions
//! - Orderly shutdown in `dispose()`

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::Config;
use crate::connection::{ConnectionManager, ConnectionState, ManagerDeps};
use crate::discovery::DeviceDescriptor;
use crate::error::{EngineError, Result};
use crate::fallback::{FallbackSynthesizer, SensorProvider};
use crate::hub::{Subscription, SubscriptionHub};
use crate::oplog::{LogEntry, OperationalLog};
use crate::protocol::command::TripCounter;
use crate::radio::RadioAdapter;
use crate::settings::{read_preferences, CustomSettings};
use crate::storage::KeyValueStore;
use crate::telemetry::{TelemetryCache, TelemetryRecord};

/// Platform permissions the engine needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Scan for and connect to peripherals
    Radio,
    /// Location fixes for the sensor tier
    Location,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Radio => write!(f, "radio"),
            Permission::Location => write!(f, "location"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionStatus {
    Granted,
    Denied,
}

/// Platform permission prompt
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PermissionProvider: Send + Sync {
    async fn request(&self, permission: Permission) -> PermissionStatus;
}

/// Fixed answers, for hosts without a permission model
#[derive(Debug, Clone, Copy)]
pub struct StaticPermissions {
    pub radio: bool,
    pub location: bool,
}

impl StaticPermissions {
    pub fn granted() -> Self {
        Self {
            radio: true,
            location: true,
        }
    }
}

#[async_trait]
impl PermissionProvider for StaticPermissions {
    async fn request(&self, permission: Permission) -> PermissionStatus {
        let granted = match permission {
            Permission::Radio => self.radio,
            Permission::Location => self.location,
        };
        if granted {
            PermissionStatus::Granted
        } else {
            PermissionStatus::Denied
        }
    }
}

/// Platform services handed to the engine
#[derive(Clone)]
pub struct EngineDeps {
    pub radio: Arc<dyn RadioAdapter>,
    pub sensors: Option<Arc<dyn SensorProvider>>,
    pub permissions: Arc<dyn PermissionProvider>,
    pub store: Arc<dyn KeyValueStore>,
}

/// The telemetry acquisition and fallback engine
pub struct TelemetryEngine {
    config: Config,
    log: OperationalLog,
    store: Arc<dyn KeyValueStore>,
    cache: TelemetryCache,
    hub: SubscriptionHub,
    fallback: FallbackSynthesizer,
    manager: ConnectionManager,
    sensors: Option<Arc<dyn SensorProvider>>,
    permissions: Arc<dyn PermissionProvider>,
    radio_granted: AtomicBool,
    disposed: AtomicBool,
}

impl fmt::Debug for TelemetryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryEngine")
            .field("state", &self.manager.state())
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl TelemetryEngine {
    /// Wire up the components. Nothing runs until [`initialize`](Self::initialize).
    pub fn new(config: Config, deps: EngineDeps) -> Self {
        let log = OperationalLog::new();
        let cache = TelemetryCache::new(deps.store.clone(), log.clone());
        let hub = SubscriptionHub::new();
        let fallback = FallbackSynthesizer::new(
            config.fallback.clone(),
            &config.synthetic,
            cache.clone(),
            hub.clone(),
            log.clone(),
        );
        let manager = ConnectionManager::new(
            ManagerDeps {
                radio: deps.radio,
                cache: cache.clone(),
                hub: hub.clone(),
                fallback: fallback.clone(),
                log: log.clone(),
                store: deps.store.clone(),
            },
            config.clone(),
        );

        Self {
            config,
            log,
            store: deps.store,
            cache,
            hub,
            fallback,
            manager,
            sensors: deps.sensors,
            permissions: deps.permissions,
            radio_granted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// Request permissions, load persisted state and start the fallback
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Permission`] when radio access is denied. The
    /// engine stays usable in fallback-only mode.
    pub async fn initialize(&self) -> Result<()> {
        self.log.info(format!(
            "Telemetry engine v{} initializing",
            env!("CARGO_PKG_VERSION")
        ));

        let radio = self.permissions.request(Permission::Radio).await;
        let location = self.permissions.request(Permission::Location).await;

        self.cache.load();
        self.manager
            .set_settings(CustomSettings::load(self.store.as_ref(), &self.log));

        match (location, &self.sensors) {
            (PermissionStatus::Granted, Some(sensors)) => self.fallback.set_sensors(sensors.clone()),
            (PermissionStatus::Granted, None) => self.log.debug("No sensor provider; sensor tier unavailable"),
            (PermissionStatus::Denied, _) => {
                self.log
                    .warn("Location permission denied; sensor tier disabled");
                self.fallback.disable_sensors();
            }
        }

        self.radio_granted
            .store(radio == PermissionStatus::Granted, Ordering::SeqCst);

        if self.config.fallback.auto_start {
            self.fallback.activate();
        }

        if radio == PermissionStatus::Denied {
            self.log
                .error("Radio permission denied; running on fallback data only");
            return Err(EngineError::Permission(format!("{} permission denied", Permission::Radio)));
        }

        self.log.info("Telemetry engine ready");
        Ok(())
    }

    fn require_radio(&self) -> Result<()> {
        if self.radio_granted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Permission(format!("{} permission denied", Permission::Radio)))
        }
    }

    /// Scan for peripherals; `on_found` fires once per device
    pub async fn start_scanning<F>(&self, on_found: F) -> Result<()>
    where
        F: Fn(DeviceDescriptor) + Send + Sync + 'static,
    {
        self.require_radio()?;
        self.manager.start_scanning(on_found).await
    }

    pub async fn stop_scanning(&self) {
        self.manager.stop_scanning().await;
    }

    /// Connect and start monitoring
    pub async fn connect_to_device(&self, device: &DeviceDescriptor) -> Result<()> {
        self.require_radio()?;
        self.manager.connect(device).await
    }

    /// Disconnect and stop emitting. Idempotent.
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    pub async fn send_trip_reset(&self, trip: TripCounter) -> Result<()> {
        self.manager.send_trip_reset(trip).await
    }

    /// Persist link overrides; they apply on the next connection
    ///
    /// Storage failures are logged, the settings still apply in memory.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidSettings`] for an out-of-range frame
    /// layout. Rejected settings are neither applied nor persisted.
    pub fn update_custom_settings(&self, settings: CustomSettings) -> Result<()> {
        if let Err(e) = settings.validate() {
            self.log.warn(format!("Rejected custom link settings: {}", e));
            return Err(e);
        }
        if let Err(e) = settings.save(self.store.as_ref()) {
            self.log
                .warn(format!("Failed to persist custom settings: {}", e));
        }
        self.manager.set_settings(settings);
        self.log.info("Custom link settings updated");
        Ok(())
    }

    pub fn custom_settings(&self) -> CustomSettings {
        self.manager.settings()
    }

    /// Restart the fallback stream after a user disconnect
    pub fn start_fallback(&self) {
        if self.manager.state() != ConnectionState::Monitoring {
            self.fallback.activate();
        }
    }

    pub fn set_data_callback<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TelemetryRecord) + Send + Sync + 'static,
    {
        self.hub.on_telemetry(callback)
    }

    pub fn set_connection_callback<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.hub.on_state(callback)
    }

    pub fn telemetry_stream(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.hub.subscribe_telemetry()
    }

    pub fn connection_stream(&self) -> broadcast::Receiver<ConnectionState> {
        self.hub.subscribe_state()
    }

    pub fn log_stream(&self) -> broadcast::Receiver<LogEntry> {
        self.log.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    /// Cached record if still within its TTL
    pub fn cached_telemetry(&self) -> Option<TelemetryRecord> {
        self.cache.get()
    }

    /// Preference blob stored by the UI layer
    pub fn preferences(&self, key: &str) -> Option<serde_json::Value> {
        read_preferences(self.store.as_ref(), key)
    }

    pub fn get_debug_logs(&self) -> Vec<LogEntry> {
        self.log.get_all()
    }

    pub fn clear_debug_logs(&self) {
        self.log.clear();
    }

    /// Disconnect, stop every timer and drop all callbacks
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager.disconnect().await;
        self.fallback.shutdown();
        self.hub.clear();
        self.log.info("Telemetry engine disposed");
    }
}
