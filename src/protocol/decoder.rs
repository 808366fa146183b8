//! # Telemetry Frame Decoder
//!
//! Turns a raw notification buffer into a [`TelemetryRecord`].
//!
//! The wire format is not documented, so the decoder picks a strategy purely
//! by buffer length:
//!
//! | Length | Tier    | Fields                                                 |
//! |--------|---------|--------------------------------------------------------|
//! | ≥ 10   | Full    | speed, gear, rpm ×10, fuel, mode, flags, odometer      |
//! | 4..=9  | Minimal | bytes 0-3: speed, gear (≥ 1), rpm ×50, fuel 50 %, Road |
//! | 1..=3  | Basic   | speed, gear 1, everything else zero                    |
//! | 0      | -       | disconnected sentinel                                  |
//!
//! Only the full tier follows [`FrameLayout`] offsets; the minimal and basic
//! tiers always read the leading bytes. Any failure yields the disconnected
//! sentinel and a log entry; nothing propagates out of [`FrameDecoder::decode`].

use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::constants::{FULL_FRAME_MIN_LEN, MINIMAL_FRAME_MIN_LEN};
use crate::error::{EngineError, Result};
use crate::oplog::OperationalLog;
use crate::telemetry::{RidingMode, Source, TelemetryRecord, WarningFlags, MAX_GEAR};

/// Highest byte offset a layout may name
pub const MAX_LAYOUT_OFFSET: usize = 64;
/// Largest accepted rpm multiplier for either tier
pub const MAX_RPM_SCALE: u32 = 1000;

/// Byte layout of the full decode tier
///
/// Defaults match the layout observed on the reference peripheral. Every
/// field can be overridden through the custom link settings; overrides are
/// checked with [`FrameLayout::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameLayout {
    pub speed_offset: usize,
    pub gear_offset: usize,
    /// Start of the big-endian u16 rpm field
    pub rpm_offset: usize,
    pub rpm_scale: u32,
    /// rpm multiplier used by the minimal tier
    pub minimal_rpm_scale: u32,
    pub fuel_offset: usize,
    pub mode_offset: usize,
    pub flags_offset: usize,
    /// Start of the big-endian u32 odometer field
    pub odometer_offset: usize,
}

impl FrameLayout {
    /// Check offsets and multipliers before the layout reaches a decoder
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidSettings`] when an offset is past
    /// [`MAX_LAYOUT_OFFSET`] or a scale is outside `1..=MAX_RPM_SCALE`.
    pub fn validate(&self) -> Result<()> {
        let offsets = [
            ("speed_offset", self.speed_offset),
            ("gear_offset", self.gear_offset),
            ("rpm_offset", self.rpm_offset),
            ("fuel_offset", self.fuel_offset),
            ("mode_offset", self.mode_offset),
            ("flags_offset", self.flags_offset),
            ("odometer_offset", self.odometer_offset),
        ];
        if let Some((name, offset)) = offsets.iter().find(|(_, o)| *o > MAX_LAYOUT_OFFSET) {
            return Err(EngineError::InvalidSettings(format!(
                "{} {} exceeds {}",
                name, offset, MAX_LAYOUT_OFFSET
            )));
        }

        for (name, scale) in [
            ("rpm_scale", self.rpm_scale),
            ("minimal_rpm_scale", self.minimal_rpm_scale),
        ] {
            if scale == 0 || scale > MAX_RPM_SCALE {
                return Err(EngineError::InvalidSettings(format!(
                    "{} must be between 1 and {}",
                    name, MAX_RPM_SCALE
                )));
            }
        }
        Ok(())
    }
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            speed_offset: 0,
            gear_offset: 1,
            rpm_offset: 2,
            rpm_scale: 10,
            minimal_rpm_scale: 50,
            fuel_offset: 4,
            mode_offset: 5,
            flags_offset: 6,
            odometer_offset: 7,
        }
    }
}

/// What to do with the trip and fuel economy fields no tier can decode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderPolicy {
    /// Leave them unknown
    Disabled,
    /// Fill them with bounded random values labelled `trip_estimated`
    Random { seed: Option<u64> },
}

/// Placeholder ranges (km and km/l)
const TRIP_A_RANGE: (f32, f32) = (0.0, 500.0);
const TRIP_B_RANGE: (f32, f32) = (0.0, 5000.0);
const AFE_RANGE: (f32, f32) = (20.0, 45.0);
const BFE_RANGE: (f32, f32) = (15.0, 50.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Full,
    Minimal,
    Basic,
}

/// Length-tiered frame decoder
pub struct FrameDecoder {
    layout: FrameLayout,
    placeholder: Option<Mutex<StdRng>>,
    log: OperationalLog,
}

impl std::fmt::Debug for FrameDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameDecoder")
            .field("layout", &self.layout)
            .field("placeholders", &self.placeholder.is_some())
            .finish_non_exhaustive()
    }
}

impl FrameDecoder {
    pub fn new(layout: FrameLayout, policy: PlaceholderPolicy, log: OperationalLog) -> Self {
        let placeholder = match policy {
            PlaceholderPolicy::Disabled => None,
            PlaceholderPolicy::Random { seed: Some(seed) } => {
                Some(Mutex::new(StdRng::seed_from_u64(seed)))
            }
            PlaceholderPolicy::Random { seed: None } => Some(Mutex::new(StdRng::from_entropy())),
        };

        Self {
            layout,
            placeholder,
            log,
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Decode a frame, never failing
    ///
    /// Returns the disconnected sentinel when the buffer is empty or cannot be
    /// decoded with the configured layout.
    pub fn decode(&self, buffer: &[u8]) -> TelemetryRecord {
        match self.try_decode(buffer) {
            Ok(record) => record,
            Err(e) => {
                self.log
                    .warn(format!("Frame {:02X?} not decoded: {}", buffer, e));
                TelemetryRecord::disconnected()
            }
        }
    }

    /// Decode a frame, reporting failures as [`EngineError::Decode`]
    pub fn try_decode(&self, buffer: &[u8]) -> Result<TelemetryRecord> {
        let tier = match buffer.len() {
            0 => return Err(EngineError::Decode("empty frame".to_string())),
            n if n >= FULL_FRAME_MIN_LEN => Tier::Full,
            n if n >= MINIMAL_FRAME_MIN_LEN => Tier::Minimal,
            _ => Tier::Basic,
        };

        let mut record = match tier {
            Tier::Full => self.decode_full(buffer)?,
            Tier::Minimal => self.decode_minimal(buffer)?,
            Tier::Basic => self.decode_basic(buffer),
        };
        self.fill_placeholders(&mut record);

        self.log.info(format!(
            "Decoded {:?} frame {:02X?} -> {:?}",
            tier, buffer, record
        ));
        Ok(record)
    }

    fn decode_full(&self, buf: &[u8]) -> Result<TelemetryRecord> {
        let layout = &self.layout;

        let gear = byte_at(buf, layout.gear_offset)?;
        let fuel = byte_at(buf, layout.fuel_offset)?;

        let mut record = live_record();
        record.speed_kmh = Some(u16::from(byte_at(buf, layout.speed_offset)?));
        record.gear = (1..=MAX_GEAR).contains(&gear).then_some(gear);
        record.rpm = Some(scale_rpm(u16_be_at(buf, layout.rpm_offset)?, layout.rpm_scale)?);
        record.fuel_percent = Some(fuel.min(100));
        record.riding_mode = Some(RidingMode::from_raw(byte_at(buf, layout.mode_offset)?));
        record.flags = WarningFlags::from_bits(byte_at(buf, layout.flags_offset)?);
        // A 10-byte frame carries only three odometer bytes; report it as unknown
        record.odometer = u32_be_at(buf, layout.odometer_offset).ok();
        Ok(record)
    }

    fn decode_minimal(&self, buf: &[u8]) -> Result<TelemetryRecord> {
        let gear = byte_at(buf, 1)?.max(1);

        let mut record = live_record();
        record.speed_kmh = Some(u16::from(byte_at(buf, 0)?));
        record.gear = (gear <= MAX_GEAR).then_some(gear);
        record.rpm = Some(scale_rpm(u16_be_at(buf, 2)?, self.layout.minimal_rpm_scale)?);
        record.fuel_percent = Some(50);
        record.riding_mode = Some(RidingMode::Road);
        Ok(record)
    }

    fn decode_basic(&self, buf: &[u8]) -> TelemetryRecord {
        let mut record = live_record();
        record.speed_kmh = Some(buf.first().copied().map(u16::from).unwrap_or(0));
        record.gear = Some(1);
        record.rpm = Some(0);
        record.fuel_percent = Some(0);
        record.riding_mode = Some(RidingMode::Road);
        record
    }

    fn fill_placeholders(&self, record: &mut TelemetryRecord) {
        let Some(rng) = &self.placeholder else {
            return;
        };
        let mut rng = rng.lock();
        let mut filled = false;

        for (slot, (lo, hi)) in [
            (&mut record.trip_a, TRIP_A_RANGE),
            (&mut record.trip_b, TRIP_B_RANGE),
            (&mut record.afe, AFE_RANGE),
            (&mut record.bfe, BFE_RANGE),
        ] {
            if slot.is_none() {
                let value: f32 = rng.gen_range(lo..hi);
                *slot = Some((value * 10.0).round() / 10.0);
                filled = true;
            }
        }

        record.trip_estimated |= filled;
    }
}

fn live_record() -> TelemetryRecord {
    let mut record = TelemetryRecord::disconnected().with_source(Source::Live);
    record.timestamp = Utc::now();
    record
}

fn scale_rpm(raw: u16, scale: u32) -> Result<u32> {
    u32::from(raw)
        .checked_mul(scale)
        .ok_or_else(|| EngineError::Decode(format!("rpm {} x {} overflows", raw, scale)))
}

fn next_offset(offset: usize, by: usize) -> Result<usize> {
    offset
        .checked_add(by)
        .ok_or_else(|| EngineError::Decode(format!("offset {} overflows", offset)))
}

fn byte_at(buf: &[u8], offset: usize) -> Result<u8> {
    buf.get(offset).copied().ok_or_else(|| {
        EngineError::Decode(format!("offset {} beyond {}-byte frame", offset, buf.len()))
    })
}

fn u16_be_at(buf: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_be_bytes([byte_at(buf, offset)?, byte_at(buf, next_offset(offset, 1)?)?]))
}

fn u32_be_at(buf: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_be_bytes([
        byte_at(buf, offset)?,
        byte_at(buf, next_offset(offset, 1)?)?,
        byte_at(buf, next_offset(offset, 2)?)?,
        byte_at(buf, next_offset(offset, 3)?)?,
    ]))
}
