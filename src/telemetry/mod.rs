//! # Telemetry Module
//!
//! The unified telemetry record and the single-slot telemetry cache.
//!
//! Unknown values are represented as `None`, never as a stale number. The
//! [`Source`] field records which producer built a record so consumers can
//! tell a live link from a fallback substitute.

pub mod cache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cache::{CacheEntry, TelemetryCache, CACHE_TTL};

/// Highest gear reported by the peripheral
pub const MAX_GEAR: u8 = 6;

/// Riding mode selected on the vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RidingMode {
    Road,
    Rain,
    OffRoad,
}

impl RidingMode {
    /// Map a raw mode byte onto the three known modes (`raw mod 3`)
    pub fn from_raw(raw: u8) -> Self {
        match raw % 3 {
            0 => RidingMode::Road,
            1 => RidingMode::Rain,
            _ => RidingMode::OffRoad,
        }
    }
}

/// Which producer built a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// Decoded from a live peripheral frame
    Live,
    /// Replayed from the telemetry cache
    Cached,
    /// Estimated from phone location and accelerometer
    Sensor,
    /// Produced by the bounded random-walk generator
    Synthetic,
    /// No source; the record is the disconnected sentinel
    #[default]
    None,
}

/// Dashboard warning lamps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WarningFlags {
    pub high_beam: bool,
    pub hazard: bool,
    pub engine_check: bool,
    pub battery_warning: bool,
}

impl WarningFlags {
    /// Decode the flag byte: bit0 high beam, bit1 hazard, bit2 engine check,
    /// bit3 battery warning. Upper bits are ignored.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            high_beam: bits & 0x01 != 0,
            hazard: bits & 0x02 != 0,
            engine_check: bits & 0x04 != 0,
            battery_warning: bits & 0x08 != 0,
        }
    }
}

/// One telemetry sample as seen by consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Speed in km/h
    pub speed_kmh: Option<u16>,
    /// Gear 1-6
    pub gear: Option<u8>,
    pub rpm: Option<u32>,
    /// Fuel level 0-100 %
    pub fuel_percent: Option<u8>,
    pub riding_mode: Option<RidingMode>,
    pub flags: WarningFlags,
    /// Odometer in km
    pub odometer: Option<u32>,
    /// Trip A distance in km
    pub trip_a: Option<f32>,
    /// Trip B distance in km
    pub trip_b: Option<f32>,
    /// Average fuel economy (km/l)
    pub afe: Option<f32>,
    /// Current fuel economy (km/l)
    pub bfe: Option<f32>,
    /// Trip and economy figures are placeholders, not peripheral data
    #[serde(default)]
    pub trip_estimated: bool,
    /// Coarse motion flag from the accelerometer
    #[serde(default)]
    pub in_motion: Option<bool>,
    /// A live peripheral link produced this record
    pub connected: bool,
    #[serde(default)]
    pub source: Source,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryRecord {
    /// The fully unknown record emitted when nothing can be decoded or
    /// substituted.
    pub fn disconnected() -> Self {
        Self {
            speed_kmh: None,
            gear: None,
            rpm: None,
            fuel_percent: None,
            riding_mode: None,
            flags: WarningFlags::default(),
            odometer: None,
            trip_a: None,
            trip_b: None,
            afe: None,
            bfe: None,
            trip_estimated: false,
            in_motion: None,
            connected: false,
            source: Source::None,
            timestamp: Utc::now(),
        }
    }

    /// True for the disconnected sentinel
    pub fn is_disconnected(&self) -> bool {
        !self.connected && self.source == Source::None
    }

    /// Relabel the record as coming from `source`.
    ///
    /// Only `Source::Live` records are marked connected.
    pub fn with_source(mut self, source: Source) -> Self {
        self.connected = source == Source::Live;
        self.source = source;
        self
    }

    /// True when at least one numeric reading is known
    pub fn has_readings(&self) -> bool {
        self.speed_kmh.is_some()
            || self.gear.is_some()
            || self.rpm.is_some()
            || self.fuel_percent.is_some()
            || self.odometer.is_some()
    }
}
