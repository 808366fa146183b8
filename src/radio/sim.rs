//! In-memory peripheral for tests and the demo binary
//!
//! [`SimulatedRadio`] advertises a configurable set of peripherals. Each
//! peripheral is driven through its [`SimHandle`]: push notification frames,
//! drop the link, and inspect what the engine wrote.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Advertisement, CharProperties, Characteristic, RadioAdapter, RadioLink};
use crate::connection::auth::challenge_digest;
use crate::error::{EngineError, Result};
use crate::protocol::constants::*;

const SCAN_CHANNEL_CAPACITY: usize = 32;
const NOTIFY_CHANNEL_CAPACITY: usize = 64;

/// How a simulated peripheral reacts to the engine
#[derive(Debug, Clone)]
pub struct SimBehavior {
    pub connect_error: Option<String>,
    /// Delay before a connect attempt resolves
    pub connect_delay: Option<Duration>,
    pub discovery_error: Option<String>,
    pub subscribe_error: Option<String>,
    /// Accept the shared-key write
    pub accept_key_write: bool,
    /// Challenge served on reads; `None` means the peripheral has none
    pub challenge: Option<Vec<u8>>,
    /// Key expected inside challenge responses
    pub expected_key: Vec<u8>,
    pub accept_bonding: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            connect_error: None,
            connect_delay: None,
            discovery_error: None,
            subscribe_error: None,
            accept_key_write: true,
            challenge: None,
            expected_key: Vec::new(),
            accept_bonding: true,
        }
    }
}

impl SimBehavior {
    /// A peripheral that rejects every authentication strategy
    pub fn rejecting_auth() -> Self {
        Self {
            accept_key_write: false,
            challenge: Some(vec![0x5A; 8]),
            expected_key: b"never-matches".to_vec(),
            accept_bonding: false,
            ..Self::default()
        }
    }
}

/// Static description of a simulated peripheral
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    pub advertisement: Advertisement,
    pub characteristics: Vec<Characteristic>,
    pub behavior: SimBehavior,
}

impl SimPeripheral {
    /// Peripheral exposing the UART service with a notify and a write
    /// characteristic
    pub fn uart(id: &str, name: Option<&str>, rssi: i16) -> Self {
        Self {
            advertisement: Advertisement {
                id: id.to_string(),
                name: name.map(str::to_string),
                rssi,
            },
            characteristics: vec![
                Characteristic {
                    service: UART_SERVICE,
                    uuid: UART_TX_CHARACTERISTIC,
                    properties: CharProperties {
                        read: false,
                        write: false,
                        notify: true,
                    },
                },
                Characteristic {
                    service: UART_SERVICE,
                    uuid: UART_RX_CHARACTERISTIC,
                    properties: CharProperties {
                        read: true,
                        write: true,
                        notify: false,
                    },
                },
            ],
            behavior: SimBehavior::default(),
        }
    }

    pub fn with_behavior(mut self, behavior: SimBehavior) -> Self {
        self.behavior = behavior;
        self
    }
}

#[derive(Default)]
struct SimShared {
    notify_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    subscribed: Mutex<Option<Uuid>>,
    connected: AtomicBool,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    bonds: AtomicUsize,
}

/// Test-side control of one simulated peripheral
#[derive(Clone)]
pub struct SimHandle {
    shared: Arc<SimShared>,
}

impl SimHandle {
    /// Deliver a notification frame. Returns false when nobody is subscribed.
    pub fn notify(&self, frame: &[u8]) -> bool {
        let tx = self.shared.notify_tx.lock().clone();
        match tx {
            Some(tx) => tx.try_send(Bytes::copy_from_slice(frame)).is_ok(),
            None => false,
        }
    }

    /// Simulate the peripheral going out of range
    pub fn drop_link(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.notify_tx.lock().take();
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.shared.notify_tx.lock().is_some()
    }

    pub fn subscribed_characteristic(&self) -> Option<Uuid> {
        *self.shared.subscribed.lock()
    }

    /// Every write as (characteristic, bytes)
    pub fn writes(&self) -> Vec<(Uuid, Vec<u8>)> {
        self.shared.writes.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.shared.disconnects.load(Ordering::SeqCst)
    }

    pub fn bond_count(&self) -> usize {
        self.shared.bonds.load(Ordering::SeqCst)
    }
}

struct SimEntry {
    peripheral: SimPeripheral,
    shared: Arc<SimShared>,
}

/// Simulated platform radio
#[derive(Default)]
pub struct SimulatedRadio {
    peripherals: Mutex<Vec<SimEntry>>,
    scan_tx: Mutex<Option<mpsc::Sender<Advertisement>>>,
    scan_error: Mutex<Option<String>>,
    close_scans: AtomicBool,
    scan_starts: AtomicUsize,
    scan_stops: AtomicUsize,
}

impl SimulatedRadio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peripheral and get its control handle
    pub fn add_peripheral(&self, peripheral: SimPeripheral) -> SimHandle {
        let shared = Arc::new(SimShared::default());
        self.peripherals.lock().push(SimEntry {
            peripheral,
            shared: shared.clone(),
        });
        SimHandle { shared }
    }

    /// Make the next scans fail with `message`
    pub fn fail_scans(&self, message: &str) {
        *self.scan_error.lock() = Some(message.to_string());
    }

    /// End the next scans right after the registered advertisements
    pub fn close_scans(&self) {
        self.close_scans.store(true, Ordering::SeqCst);
    }

    /// Push an extra advertisement into the running scan
    pub fn advertise(&self, advertisement: Advertisement) -> bool {
        let tx = self.scan_tx.lock().clone();
        match tx {
            Some(tx) => tx.try_send(advertisement).is_ok(),
            None => false,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_tx.lock().is_some()
    }

    pub fn scan_start_count(&self) -> usize {
        self.scan_starts.load(Ordering::SeqCst)
    }

    pub fn scan_stop_count(&self) -> usize {
        self.scan_stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RadioAdapter for SimulatedRadio {
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>> {
        if let Some(message) = self.scan_error.lock().clone() {
            return Err(EngineError::Scan(message));
        }

        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        for entry in self.peripherals.lock().iter() {
            // Buffer is sized for the registered peripherals; overflow just drops
            let _ = tx.try_send(entry.peripheral.advertisement.clone());
        }
        if !self.close_scans.load(Ordering::SeqCst) {
            *self.scan_tx.lock() = Some(tx);
        }
        self.scan_starts.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        if self.scan_tx.lock().take().is_some() {
            self.scan_stops.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn RadioLink>> {
        let found = self
            .peripherals
            .lock()
            .iter()
            .find(|entry| entry.peripheral.advertisement.id == device_id)
            .map(|entry| (entry.peripheral.clone(), entry.shared.clone()));

        let Some((peripheral, shared)) = found else {
            return Err(EngineError::Connection(format!("unknown device {}", device_id)));
        };

        if let Some(delay) = peripheral.behavior.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &peripheral.behavior.connect_error {
            return Err(EngineError::Connection(message.clone()));
        }

        shared.connected.store(true, Ordering::SeqCst);
        shared.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SimLink {
            device_id: device_id.to_string(),
            peripheral,
            shared,
            challenge_passed: false,
        }))
    }
}

struct SimLink {
    device_id: String,
    peripheral: SimPeripheral,
    shared: Arc<SimShared>,
    challenge_passed: bool,
}

impl SimLink {
    fn ensure_connected(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Connection("link is down".to_string()))
        }
    }
}

#[async_trait]
impl RadioLink for SimLink {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn discover_services(&mut self) -> Result<Vec<Characteristic>> {
        self.ensure_connected()?;
        match &self.peripheral.behavior.discovery_error {
            Some(message) => Err(EngineError::ServiceDiscovery(message.clone())),
            None => Ok(self.peripheral.characteristics.clone()),
        }
    }

    async fn read(&mut self, _characteristic: Uuid) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        if self.challenge_passed {
            return Ok(vec![AUTH_STATUS_OK]);
        }
        match &self.peripheral.behavior.challenge {
            Some(challenge) => Ok(challenge.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        self.shared.writes.lock().push((characteristic, data.to_vec()));

        let behavior = &self.peripheral.behavior;
        match data.get(2).copied() {
            Some(OPCODE_AUTH_KEY) if !behavior.accept_key_write => {
                Err(EngineError::Authentication("key rejected".to_string()))
            }
            Some(OPCODE_AUTH_RESPONSE) => {
                if let Some(challenge) = &behavior.challenge {
                    let expected = challenge_digest(challenge, &behavior.expected_key);
                    let end = data.len().saturating_sub(1);
                    self.challenge_passed = data.get(3..end) == Some(&expected[..]);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn bond(&mut self) -> Result<()> {
        self.ensure_connected()?;
        self.shared.bonds.fetch_add(1, Ordering::SeqCst);
        if self.peripheral.behavior.accept_bonding {
            Ok(())
        } else {
            Err(EngineError::Authentication("bonding rejected".to_string()))
        }
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<mpsc::Receiver<Bytes>> {
        self.ensure_connected()?;
        if let Some(message) = &self.peripheral.behavior.subscribe_error {
            return Err(EngineError::Connection(message.clone()));
        }

        let (tx, rx) = mpsc::channel(NOTIFY_CHANNEL_CAPACITY);
        *self.shared.notify_tx.lock() = Some(tx);
        *self.shared.subscribed.lock() = Some(characteristic);
        Ok(rx)
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.shared.connected.store(false, Ordering::SeqCst);
        self.shared.notify_tx.lock().take();
        self.shared.disconnects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
