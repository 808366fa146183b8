//! # Radio Link Module
//!
//! Trait abstraction over the platform's wireless stack.
//!
//! This module handles:
//! - Scanning for peripheral advertisements
//! - Opening a link to a selected peripheral
//! - Enumerating characteristics, reading, writing and bonding
//! - Subscribing to characteristic notifications
//!
//! Platform backends implement [`RadioAdapter`] and [`RadioLink`]. The
//! [`sim`] module provides an in-memory peripheral for tests and demos.

pub mod sim;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// One advertisement seen during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform device identifier (address or opaque id)
    pub id: String,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Received signal strength in dBm
    pub rssi: i16,
}

/// Capabilities of a characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CharProperties {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

/// A characteristic found during service discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
    pub properties: CharProperties,
}

/// Entry point into the platform radio
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Start scanning; advertisements arrive on the returned channel until
    /// [`stop_scan`](Self::stop_scan) is called.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>>;

    /// Stop an active scan. Must be safe to call when no scan is running.
    async fn stop_scan(&self) -> Result<()>;

    /// Open a link to `device_id`
    async fn connect(&self, device_id: &str) -> Result<Box<dyn RadioLink>>;
}

/// An open link to a peripheral
#[async_trait]
pub trait RadioLink: Send + Sync {
    fn device_id(&self) -> &str;

    /// Enumerate all characteristics of all services
    async fn discover_services(&mut self) -> Result<Vec<Characteristic>>;

    async fn read(&mut self, characteristic: Uuid) -> Result<Vec<u8>>;

    async fn write(&mut self, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Run the platform bonding (pairing) handshake
    async fn bond(&mut self) -> Result<()>;

    /// Subscribe to notifications. The channel closes when the link drops.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<mpsc::Receiver<Bytes>>;

    /// Close the link. Must be safe to call more than once.
    async fn disconnect(&mut self) -> Result<()>;
}
