//! # Subscription Hub
//!
//! Fan-out of telemetry records and connection state to consumers.
//!
//! This module handles:
//! - The producer gate: exactly one source may publish telemetry at a time
//! - Typed callback subscriptions with explicit unsubscribe
//! - Bounded broadcast streams for async consumers
//!
//! Telemetry callbacks run while the gate is held, so once
//! [`SubscriptionHub::set_producer`] returns, the previous producer can no
//! longer reach any consumer. Callbacks must not call back into the hub.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use crate::connection::ConnectionState;
use crate::telemetry::TelemetryRecord;

const STREAM_CAPACITY: usize = 64;

/// Who is allowed to publish telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Producer {
    #[default]
    None,
    /// Live decode path of monitoring session `n`
    Live(u64),
    /// Fallback synthesizer activation `n`
    Fallback(u64),
}

pub type TelemetryCallback = Arc<dyn Fn(&TelemetryRecord) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Telemetry,
    State,
}

struct HubInner {
    gate: Mutex<Producer>,
    telemetry_callbacks: RwLock<Vec<(u64, TelemetryCallback)>>,
    state_callbacks: RwLock<Vec<(u64, StateCallback)>>,
    state_dispatch: Mutex<()>,
    next_id: AtomicU64,
    telemetry_tx: broadcast::Sender<TelemetryRecord>,
    state_tx: broadcast::Sender<ConnectionState>,
}

/// Cloneable handle to the hub
#[derive(Clone)]
pub struct SubscriptionHub {
    inner: Arc<HubInner>,
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHub {
    pub fn new() -> Self {
        let (telemetry_tx, _) = broadcast::channel(STREAM_CAPACITY);
        let (state_tx, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                gate: Mutex::new(Producer::None),
                telemetry_callbacks: RwLock::new(Vec::new()),
                state_callbacks: RwLock::new(Vec::new()),
                state_dispatch: Mutex::new(()),
                next_id: AtomicU64::new(1),
                telemetry_tx,
                state_tx,
            }),
        }
    }

    /// Hand the gate to `producer`. Waits for any in-flight dispatch.
    pub fn set_producer(&self, producer: Producer) {
        *self.inner.gate.lock() = producer;
    }

    /// Close the gate if `producer` still holds it
    pub fn release(&self, producer: Producer) {
        let mut gate = self.inner.gate.lock();
        if *gate == producer {
            *gate = Producer::None;
        }
    }

    pub fn producer(&self) -> Producer {
        *self.inner.gate.lock()
    }

    /// Publish a record on behalf of `producer`
    ///
    /// # Returns
    ///
    /// * `bool` - false when `producer` does not hold the gate and the record
    ///   was dropped
    pub fn publish(&self, producer: Producer, record: &TelemetryRecord) -> bool {
        let gate = self.inner.gate.lock();
        if *gate != producer || producer == Producer::None {
            return false;
        }

        let callbacks: Vec<TelemetryCallback> = self
            .inner
            .telemetry_callbacks
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(record);
        }

        // No receivers is fine
        let _ = self.inner.telemetry_tx.send(record.clone());
        drop(gate);
        true
    }

    /// Broadcast a connection state change
    pub fn publish_state(&self, state: ConnectionState) {
        let _dispatch = self.inner.state_dispatch.lock();
        let callbacks: Vec<StateCallback> = self
            .inner
            .state_callbacks
            .read()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(state);
        }
        let _ = self.inner.state_tx.send(state);
    }

    /// Register a telemetry callback
    pub fn on_telemetry<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&TelemetryRecord) + Send + Sync + 'static,
    {
        let id = self.next_id();
        // Serialize with dispatch so a record is never half-delivered
        let _gate = self.inner.gate.lock();
        self.inner
            .telemetry_callbacks
            .write()
            .push((id, Arc::new(callback)));
        self.subscription(Channel::Telemetry, id)
    }

    /// Register a connection state callback
    pub fn on_state<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.inner
            .state_callbacks
            .write()
            .push((id, Arc::new(callback)));
        self.subscription(Channel::State, id)
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<TelemetryRecord> {
        self.inner.telemetry_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Drop every callback. Broadcast receivers stay open.
    pub fn clear(&self) {
        let _gate = self.inner.gate.lock();
        self.inner.telemetry_callbacks.write().clear();
        let _dispatch = self.inner.state_dispatch.lock();
        self.inner.state_callbacks.write().clear();
    }

    pub fn callback_count(&self) -> usize {
        self.inner.telemetry_callbacks.read().len() + self.inner.state_callbacks.read().len()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn subscription(&self, channel: Channel, id: u64) -> Subscription {
        Subscription {
            hub: Arc::downgrade(&self.inner),
            channel,
            id,
        }
    }
}

/// Handle returned by callback registration
///
/// Dropping the handle keeps the callback registered; call
/// [`unsubscribe`](Self::unsubscribe) to remove it.
pub struct Subscription {
    hub: Weak<HubInner>,
    channel: Channel,
    id: u64,
}

impl Subscription {
    /// Remove the callback. No invocation starts after this returns.
    pub fn unsubscribe(self) {
        let Some(hub) = self.hub.upgrade() else {
            return;
        };
        match self.channel {
            Channel::Telemetry => {
                let _gate = hub.gate.lock();
                hub.telemetry_callbacks.write().retain(|(id, _)| *id != self.id);
            }
            Channel::State => {
                let _dispatch = hub.state_dispatch.lock();
                hub.state_callbacks.write().retain(|(id, _)| *id != self.id);
            }
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("id", &self.id)
            .finish()
    }
}
