//! Connection manager
//!
//! Owns the connection state and the monitoring session. Every state change
//! goes through [`transition`] and is published to the hub; the hub's
//! producer gate is switched before the state is announced.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auth::{default_chain, run_chain, AuthContext, AuthStrategy};
use super::state::{transition, ConnectionEvent, ConnectionState};
use crate::config::Config;
use crate::discovery::{DeviceDescriptor, DeviceScanner};
use crate::error::{EngineError, Result};
use crate::fallback::FallbackSynthesizer;
use crate::hub::{Producer, SubscriptionHub};
use crate::oplog::OperationalLog;
use crate::protocol::command::{encode_trip_reset, TripCounter};
use crate::protocol::constants::{COMMAND_CANDIDATES, TELEMETRY_CANDIDATES};
use crate::protocol::{FrameDecoder, PlaceholderPolicy};
use crate::radio::{Characteristic, RadioAdapter, RadioLink};
use crate::settings::{CustomSettings, DiscoveredServices};
use crate::storage::KeyValueStore;
use crate::telemetry::TelemetryCache;

/// Characteristics chosen for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// Notify characteristic carrying telemetry frames
    pub telemetry: Uuid,
    /// Writable characteristic for commands and authentication
    pub command: Option<Uuid>,
}

/// Pick the telemetry and command characteristics
///
/// Telemetry: the custom characteristic if present and notifying, then the
/// known candidates, then the first notifying characteristic of the custom
/// service, then the first notifying characteristic anywhere.
///
/// Command: the known candidates, then the first writable characteristic in
/// the telemetry service, then the first writable one anywhere.
pub fn select_characteristics(
    characteristics: &[Characteristic],
    settings: &CustomSettings,
) -> Option<Selection> {
    let notifying = |c: &&Characteristic| c.properties.notify;
    let writable = |c: &&Characteristic| c.properties.write;

    let custom = settings.characteristic_id.and_then(|id| {
        characteristics
            .iter()
            .filter(notifying)
            .find(|c| c.uuid == id && settings.service_id.map_or(true, |s| s == c.service))
    });
    let known = || {
        TELEMETRY_CANDIDATES.iter().find_map(|candidate| {
            characteristics
                .iter()
                .filter(notifying)
                .find(|c| c.uuid == *candidate)
        })
    };
    let in_custom_service = || {
        settings.service_id.and_then(|service| {
            characteristics
                .iter()
                .filter(notifying)
                .find(|c| c.service == service)
        })
    };

    let telemetry = custom
        .or_else(known)
        .or_else(in_custom_service)
        .or_else(|| characteristics.iter().find(notifying))?;

    let command = COMMAND_CANDIDATES
        .iter()
        .find_map(|candidate| {
            characteristics
                .iter()
                .filter(writable)
                .find(|c| c.uuid == *candidate)
        })
        .or_else(|| {
            characteristics
                .iter()
                .filter(writable)
                .find(|c| c.service == telemetry.service)
        })
        .or_else(|| characteristics.iter().find(writable))
        .map(|c| c.uuid);

    Some(Selection {
        telemetry: telemetry.uuid,
        command,
    })
}

/// Shared components the manager works with
#[derive(Clone)]
pub struct ManagerDeps {
    pub radio: Arc<dyn RadioAdapter>,
    pub cache: TelemetryCache,
    pub hub: SubscriptionHub,
    pub fallback: FallbackSynthesizer,
    pub log: OperationalLog,
    pub store: Arc<dyn KeyValueStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndReason {
    User,
    LinkLost,
}

struct Session {
    id: u64,
    device_id: String,
    link: Box<dyn RadioLink>,
    command: Option<Uuid>,
    cancel: CancellationToken,
    monitor: Option<JoinHandle<()>>,
}

struct Established {
    selection: Selection,
    frames: mpsc::Receiver<Bytes>,
    authenticated: bool,
}

struct ManagerInner {
    deps: ManagerDeps,
    config: Config,
    scanner: DeviceScanner,
    auth_chain: Vec<Box<dyn AuthStrategy>>,
    settings: RwLock<CustomSettings>,
    state: Mutex<ConnectionState>,
    /// Serializes state changes with their announcement
    transitions: Mutex<()>,
    session: AsyncMutex<Option<Session>>,
    connecting: AsyncMutex<()>,
    pending: Mutex<Option<CancellationToken>>,
    next_session: AtomicU64,
}

/// Cloneable handle to the connection manager
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    pub fn new(deps: ManagerDeps, config: Config) -> Self {
        Self::with_auth_chain(deps, config, default_chain())
    }

    /// Manager with a custom authentication chain
    pub fn with_auth_chain(
        deps: ManagerDeps,
        config: Config,
        auth_chain: Vec<Box<dyn AuthStrategy>>,
    ) -> Self {
        let scanner = DeviceScanner::new(deps.radio.clone(), &config.scan, deps.log.clone());
        Self {
            inner: Arc::new(ManagerInner {
                deps,
                config,
                scanner,
                auth_chain,
                settings: RwLock::new(CustomSettings::default()),
                state: Mutex::new(ConnectionState::Idle),
                transitions: Mutex::new(()),
                session: AsyncMutex::new(None),
                connecting: AsyncMutex::new(()),
                pending: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    /// Settings used by the next connection
    pub fn set_settings(&self, settings: CustomSettings) {
        *self.inner.settings.write() = settings;
    }

    pub fn settings(&self) -> CustomSettings {
        self.inner.settings.read().clone()
    }

    fn log(&self) -> &OperationalLog {
        &self.inner.deps.log
    }

    /// Apply an event, announce the new state
    fn apply(&self, event: ConnectionEvent) -> Result<ConnectionState> {
        let _ordered = self.inner.transitions.lock();
        let (from, next) = {
            let mut state = self.inner.state.lock();
            let from = *state;
            match transition(from, &event) {
                Ok(next) => {
                    *state = next;
                    (from, next)
                }
                Err(e) => {
                    drop(state);
                    self.log().warn(format!("Ignoring {}", e));
                    return Err(e);
                }
            }
        };

        if from != next {
            self.log().info(format!("Connection {} -> {} on {}", from, next, event));
            self.inner.deps.hub.publish_state(next);
        }
        Ok(next)
    }

    /// Report a failure, then return to Idle
    fn fail(&self, reason: String) {
        let _ = self.apply(ConnectionEvent::Failure(reason));
        let _ = self.apply(ConnectionEvent::Reset);
    }

    /// Start scanning for peripherals
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Scan`] when the radio refuses to scan or a
    /// connection is in progress.
    pub async fn start_scanning<F>(&self, on_found: F) -> Result<()>
    where
        F: Fn(DeviceDescriptor) + Send + Sync + 'static,
    {
        let state = self.state();
        if !matches!(state, ConnectionState::Idle | ConnectionState::Scanning) {
            return Err(EngineError::Scan(format!("cannot scan while {}", state)));
        }

        // Enter Scanning first so a scan that ends at once still returns to Idle
        self.apply(ConnectionEvent::ScanStarted)?;

        let weak = Arc::downgrade(&self.inner);
        let started = self
            .inner
            .scanner
            .start(on_found, move || {
                if let Some(inner) = weak.upgrade() {
                    let manager = ConnectionManager { inner };
                    if manager.state() == ConnectionState::Scanning {
                        let _ = manager.apply(ConnectionEvent::ScanStopped);
                    }
                }
            })
            .await;

        if let Err(e) = started {
            if self.state() == ConnectionState::Scanning {
                let _ = self.apply(ConnectionEvent::ScanStopped);
            }
            return Err(e);
        }
        Ok(())
    }

    /// Stop scanning. Idempotent.
    pub async fn stop_scanning(&self) {
        self.inner.scanner.stop().await;
        if self.state() == ConnectionState::Scanning {
            let _ = self.apply(ConnectionEvent::ScanStopped);
        }
    }

    /// Connect to a discovered device and start monitoring
    ///
    /// Resolves once the manager is Monitoring. Authentication failures do
    /// not fail the connection.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Connection`] for radio failures, timeouts and
    /// cancellation, and [`EngineError::ServiceDiscovery`] when no usable
    /// characteristic is found. The fallback takes over in both cases.
    pub async fn connect(&self, device: &DeviceDescriptor) -> Result<()> {
        let _connecting = self.inner.connecting.lock().await;

        let state = self.state();
        if !matches!(state, ConnectionState::Idle | ConnectionState::Scanning) {
            return Err(EngineError::Connection(format!(
                "cannot connect to {} while {}",
                device.id, state
            )));
        }

        self.inner.scanner.stop().await;
        self.apply(ConnectionEvent::DeviceSelected)?;
        self.log().info(format!(
            "Connecting to {} ({})",
            device.id,
            device.name.as_deref().unwrap_or("unnamed")
        ));

        let cancel = CancellationToken::new();
        *self.inner.pending.lock() = Some(cancel.clone());

        let settings = self.settings();
        let mut slot: Option<Box<dyn RadioLink>> = None;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Connection("connection attempt cancelled".to_string())),
            result = self.establish(&device.id, &settings, &mut slot) => result,
        };
        self.inner.pending.lock().take();

        let established = match outcome {
            Ok(established) => established,
            Err(e) => {
                if let Some(mut link) = slot.take() {
                    let _ = link.disconnect().await;
                }
                let e = match e {
                    EngineError::Connection(_) | EngineError::ServiceDiscovery(_) => e,
                    other => EngineError::Connection(other.to_string()),
                };
                self.log().error(format!("Connection to {} failed: {}", device.id, e));
                self.fail(e.to_string());
                self.inner.deps.fallback.activate();
                return Err(e);
            }
        };

        let Some(link) = slot.take() else {
            return Err(EngineError::Connection("link vanished".to_string()));
        };
        self.start_session(device, link, established, &settings).await
    }

    async fn establish(
        &self,
        device_id: &str,
        settings: &CustomSettings,
        slot: &mut Option<Box<dyn RadioLink>>,
    ) -> Result<Established> {
        let link_config = &self.inner.config.link;

        let connect_timeout = Duration::from_millis(link_config.connect_timeout_ms);
        let link = match tokio::time::timeout(connect_timeout, self.inner.deps.radio.connect(device_id)).await {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(EngineError::Connection(format!(
                    "connect timed out after {} ms",
                    link_config.connect_timeout_ms
                )))
            }
        };
        let link = slot.insert(link);
        self.apply(ConnectionEvent::LinkEstablished)?;

        let characteristics = link.discover_services().await.map_err(|e| match e {
            EngineError::ServiceDiscovery(_) => e,
            other => EngineError::ServiceDiscovery(other.to_string()),
        })?;
        self.log().info(format!(
            "Discovered {} characteristics on {}",
            characteristics.len(),
            device_id
        ));
        self.persist_services(device_id, &characteristics);

        let selection = select_characteristics(&characteristics, settings).ok_or_else(|| {
            EngineError::ServiceDiscovery("no notifying characteristic".to_string())
        })?;
        if let Some(custom) = settings.characteristic_id {
            if custom != selection.telemetry {
                self.log().warn(format!(
                    "Custom characteristic {} not available, using {}",
                    custom, selection.telemetry
                ));
            }
        }
        self.apply(ConnectionEvent::ServicesDiscovered)?;

        let ctx = AuthContext {
            key: settings.auth_key_bytes(&link_config.default_auth_key),
            characteristic: selection.command,
        };
        let winner = run_chain(
            &self.inner.auth_chain,
            link.as_mut(),
            &ctx,
            Duration::from_millis(link_config.auth_timeout_ms),
            self.log(),
        )
        .await;

        let frames = link
            .subscribe(selection.telemetry)
            .await
            .map_err(|e| EngineError::Connection(format!("subscribe failed: {}", e)))?;
        self.log()
            .info(format!("Subscribed to {}", selection.telemetry));

        Ok(Established {
            selection,
            frames,
            authenticated: winner.is_some(),
        })
    }

    fn persist_services(&self, device_id: &str, characteristics: &[Characteristic]) {
        let mut services: Vec<Uuid> = Vec::new();
        for c in characteristics {
            if !services.contains(&c.service) {
                services.push(c.service);
            }
        }
        let record = DiscoveredServices {
            device_id: device_id.to_string(),
            services,
            discovered_at: Utc::now(),
        };
        if let Err(e) = record.save(self.inner.deps.store.as_ref()) {
            self.log()
                .warn(format!("Failed to persist discovered services: {}", e));
        }
    }

    async fn start_session(
        &self,
        device: &DeviceDescriptor,
        link: Box<dyn RadioLink>,
        established: Established,
        settings: &CustomSettings,
    ) -> Result<()> {
        let id = self.inner.next_session.fetch_add(1, Ordering::SeqCst);
        let producer = Producer::Live(id);

        let decoder_config = &self.inner.config.decoder;
        let policy = if decoder_config.placeholder_trip_fields {
            PlaceholderPolicy::Random {
                seed: decoder_config.placeholder_seed,
            }
        } else {
            PlaceholderPolicy::Disabled
        };
        let decoder = FrameDecoder::new(
            settings.frame_layout.clone().unwrap_or_default(),
            policy,
            self.log().clone(),
        );

        let mut session = self.inner.session.lock().await;
        self.inner.deps.hub.set_producer(producer);
        self.inner.deps.fallback.suspend();

        if let Err(e) = self.apply(ConnectionEvent::AuthenticationFinished {
            authenticated: established.authenticated,
        }) {
            let mut link = link;
            let _ = link.disconnect().await;
            self.inner.deps.hub.release(producer);
            self.fail(e.to_string());
            self.inner.deps.fallback.activate();
            return Err(EngineError::Connection(e.to_string()));
        }

        let cancel = CancellationToken::new();
        let monitor = tokio::spawn(self.clone().monitor(id, established.frames, decoder, cancel.clone()));

        *session = Some(Session {
            id,
            device_id: device.id.clone(),
            link,
            command: established.selection.command,
            cancel,
            monitor: Some(monitor),
        });
        self.log().info(format!(
            "Monitoring {} ({})",
            device.id,
            if established.authenticated { "authenticated" } else { "unauthenticated" }
        ));
        Ok(())
    }

    async fn monitor(
        self,
        id: u64,
        mut frames: mpsc::Receiver<Bytes>,
        decoder: FrameDecoder,
        cancel: CancellationToken,
    ) {
        let producer = Producer::Live(id);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                frame = frames.recv() => match frame {
                    Some(frame) => self.handle_frame(producer, &decoder, &frame),
                    None => break,
                },
            }
        }

        self.log().warn("Notification stream closed; link lost");
        // Teardown awaits this task, so it runs on its own
        let manager = self.clone();
        tokio::spawn(async move {
            manager.end_session(Some(id), EndReason::LinkLost).await;
        });
    }

    fn handle_frame(&self, producer: Producer, decoder: &FrameDecoder, frame: &[u8]) {
        let record = decoder.decode(frame);
        let record = if record.is_disconnected() {
            self.log().warn("Live frame unusable; substituting fallback record");
            self.inner.deps.fallback.substitute()
        } else {
            self.inner.deps.cache.put(record.clone());
            record
        };
        self.inner.deps.hub.publish(producer, &record);
    }

    /// Tear down the session `only` (or whichever is active)
    ///
    /// Returns false when there was nothing to tear down.
    async fn end_session(&self, only: Option<u64>, reason: EndReason) -> bool {
        let mut guard = self.inner.session.lock().await;
        let matches = match (guard.as_ref(), only) {
            (Some(session), Some(id)) => session.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if !matches {
            return false;
        }
        let Some(mut session) = guard.take() else {
            return false;
        };

        let event = match reason {
            EndReason::User => ConnectionEvent::DisconnectRequested,
            EndReason::LinkLost => ConnectionEvent::LinkLost,
        };
        self.inner.deps.hub.release(Producer::Live(session.id));
        let _ = self.apply(event);

        session.cancel.cancel();
        if let Some(monitor) = session.monitor.take() {
            monitor.abort();
            let _ = monitor.await;
        }
        if let Err(e) = session.link.disconnect().await {
            self.log()
                .warn(format!("Disconnect from {} failed: {}", session.device_id, e));
        }

        let _ = self.apply(ConnectionEvent::DisconnectComplete);
        self.log()
            .info(format!("Disconnected from {} ({:?})", session.device_id, reason));

        if reason == EndReason::LinkLost {
            self.inner.deps.fallback.activate();
        }
        true
    }

    /// Disconnect and release every per-connection resource
    ///
    /// Cancels a pending connect, stops scanning, ends the session and shuts
    /// the fallback down. Idempotent; nothing is published after it returns.
    pub async fn disconnect(&self) {
        if let Some(pending) = self.inner.pending.lock().take() {
            pending.cancel();
        }
        self.stop_scanning().await;

        let _connecting = self.inner.connecting.lock().await;
        self.inner.deps.hub.set_producer(Producer::None);
        self.end_session(None, EndReason::User).await;
        self.inner.deps.fallback.shutdown();
        self.inner.deps.hub.set_producer(Producer::None);
    }

    /// Ask the peripheral to reset a trip counter
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NotConnected`] unless monitoring, or
    /// [`EngineError::Connection`] when the write fails.
    pub async fn send_trip_reset(&self, trip: TripCounter) -> Result<()> {
        if self.state() != ConnectionState::Monitoring {
            return Err(EngineError::NotConnected);
        }

        let mut guard = self.inner.session.lock().await;
        let session = guard.as_mut().ok_or(EngineError::NotConnected)?;
        let characteristic = session.command.ok_or_else(|| {
            EngineError::Connection("peripheral has no writable characteristic".to_string())
        })?;

        let frame = encode_trip_reset(trip);
        session
            .link
            .write(characteristic, &frame)
            .await
            .map_err(|e| EngineError::Connection(format!("trip reset failed: {}", e)))?;
        self.log().info(format!("Sent trip {:?} reset", trip));
        Ok(())
    }

    /// Device id of the active session
    pub async fn connected_device(&self) -> Option<String> {
        self.inner
            .session
            .lock()
            .await
            .as_ref()
            .map(|session| session.device_id.clone())
    }
}
