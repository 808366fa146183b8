//! # Link Settings
//!
//! User overrides for the radio link and the records the engine persists
//! about the peripheral it talked to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::connection::auth::parse_auth_key;
use crate::error::Result;
use crate::oplog::OperationalLog;
use crate::protocol::FrameLayout;
use crate::storage::{keys, load_json, save_json, KeyValueStore};

/// Link overrides, applied on the next connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomSettings {
    /// Service to look for the telemetry characteristic in
    pub service_id: Option<Uuid>,
    /// Telemetry (notify) characteristic
    pub characteristic_id: Option<Uuid>,
    /// Shared key, hex or plain text
    pub auth_key: Option<String>,
    /// Full-tier byte layout override
    pub frame_layout: Option<FrameLayout>,
}

impl CustomSettings {
    /// Load persisted settings; unreadable settings fall back to defaults
    ///
    /// An invalid frame layout is dropped so the default layout applies; the
    /// remaining overrides are kept.
    pub fn load(store: &dyn KeyValueStore, log: &OperationalLog) -> Self {
        match load_json::<CustomSettings>(store, keys::CUSTOM_SETTINGS) {
            Ok(Some(mut settings)) => {
                if let Err(e) = settings.validate() {
                    log.warn(format!("Ignoring persisted frame layout: {}", e));
                    settings.frame_layout = None;
                }
                log.info("Loaded custom link settings");
                settings
            }
            Ok(None) => Self::default(),
            Err(e) => {
                log.warn(format!("Ignoring unreadable custom settings: {}", e));
                Self::default()
            }
        }
    }

    /// Reject overrides a decoder could not use safely
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidSettings`](crate::error::EngineError::InvalidSettings)
    /// for an out-of-range frame layout.
    pub fn validate(&self) -> Result<()> {
        match &self.frame_layout {
            Some(layout) => layout.validate(),
            None => Ok(()),
        }
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        save_json(store, keys::CUSTOM_SETTINGS, self)
    }

    /// Key bytes to authenticate with; `default_key` when no override is set
    pub fn auth_key_bytes(&self, default_key: &str) -> Vec<u8> {
        match self.auth_key.as_deref() {
            Some(key) if !key.trim().is_empty() => parse_auth_key(key),
            _ => parse_auth_key(default_key),
        }
    }
}

/// Services seen on the last successful service discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredServices {
    pub device_id: String,
    pub services: Vec<Uuid>,
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredServices {
    pub fn load(store: &dyn KeyValueStore) -> Result<Option<Self>> {
        load_json(store, keys::DISCOVERED_SERVICES)
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        save_json(store, keys::DISCOVERED_SERVICES, self)
    }
}

/// Read a preference blob owned by the UI layer. The engine never writes these.
pub fn read_preferences(store: &dyn KeyValueStore, key: &str) -> Option<serde_json::Value> {
    match key {
        keys::NAVIGATION_PREFERENCES | keys::USER_PREFERENCES => {
            load_json(store, key).ok().flatten()
        }
        _ => None,
    }
}
