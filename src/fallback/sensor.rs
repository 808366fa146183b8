//! Phone-sensor tier
//!
//! Speed comes from the great-circle distance between consecutive location
//! fixes; the accelerometer only contributes a coarse "in motion" flag. Gear
//! and rpm are rough guesses from speed bands.

use std::collections::VecDeque;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::telemetry::{Source, TelemetryRecord};

/// Mean Earth radius in metres
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Plausible speed range in km/h; anything outside is a bad fix
pub const MAX_PLAUSIBLE_SPEED_KMH: f64 = 300.0;

/// Idle rpm used for the lowest speed band
const IDLE_RPM: f64 = 1200.0;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationFix {
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
}

/// Accelerometer reading in g
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: DateTime<Utc>,
}

impl MotionSample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }

    /// True when |a| exceeds 1 g plus `threshold_g`
    pub fn is_moving(&self, threshold_g: f64) -> bool {
        self.magnitude() > 1.0 + threshold_g
    }
}

/// Platform location and accelerometer access
#[async_trait]
pub trait SensorProvider: Send + Sync {
    /// Latest location fix, `None` when nothing new is available
    async fn read_location(&self) -> Result<Option<LocationFix>>;

    async fn read_motion(&self) -> Result<Option<MotionSample>>;
}

/// Great-circle distance in metres
pub fn haversine_distance_m(from: &LocationFix, to: &LocationFix) -> f64 {
    let lat1 = from.latitude.to_radians();
    let lat2 = to.latitude.to_radians();
    let dlat = (to.latitude - from.latitude).to_radians();
    let dlon = (to.longitude - from.longitude).to_radians();

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Keep a speed only if it lies within [0, 300] km/h
pub fn accept_speed(kmh: f64) -> Option<f64> {
    (kmh.is_finite() && (0.0..=MAX_PLAUSIBLE_SPEED_KMH).contains(&kmh)).then_some(kmh)
}

/// Signed speed between two fixes in km/h (negative when `next` is older)
pub fn raw_speed_kmh(prev: &LocationFix, next: &LocationFix) -> f64 {
    let dt_s = next
        .timestamp
        .signed_duration_since(prev.timestamp)
        .num_milliseconds() as f64
        / 1000.0;
    haversine_distance_m(prev, next) / dt_s * 3.6
}

/// Speed between two fixes, discarding implausible results
pub fn speed_between(prev: &LocationFix, next: &LocationFix) -> Option<f64> {
    accept_speed(raw_speed_kmh(prev, next))
}

/// Coarse gear from speed
pub fn gear_for_speed(kmh: f64) -> u8 {
    match kmh {
        x if x < 20.0 => 1,
        x if x < 40.0 => 2,
        x if x < 60.0 => 3,
        x if x < 85.0 => 4,
        x if x < 110.0 => 5,
        _ => 6,
    }
}

/// Coarse rpm from speed and gear
pub fn rpm_for_speed(kmh: f64, gear: u8) -> u32 {
    let ratio = match gear {
        1 => 260.0,
        2 => 160.0,
        3 => 115.0,
        4 => 90.0,
        5 => 75.0,
        _ => 65.0,
    };
    (IDLE_RPM + kmh * ratio * 0.5).min(12_000.0).round() as u32
}

/// Outcome of feeding a location fix
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpeedUpdate {
    /// First fix; no speed yet
    First,
    Accepted(f64),
    Discarded(f64),
}

#[derive(Debug, Clone, Copy)]
struct SpeedSample {
    kmh: f64,
    at: DateTime<Utc>,
}

/// Turns raw sensor readings into sensor-tier records
#[derive(Debug)]
pub struct SensorEstimator {
    threshold_g: f64,
    max_age: TimeDelta,
    last_fix: Option<LocationFix>,
    speed: Option<SpeedSample>,
    moving: Option<bool>,
}

impl SensorEstimator {
    pub fn new(threshold_g: f64, max_age: TimeDelta) -> Self {
        Self {
            threshold_g,
            max_age,
            last_fix: None,
            speed: None,
            moving: None,
        }
    }

    pub fn push_location(&mut self, fix: LocationFix) -> SpeedUpdate {
        let update = match &self.last_fix {
            None => SpeedUpdate::First,
            Some(prev) => {
                let raw = raw_speed_kmh(prev, &fix);
                match accept_speed(raw) {
                    Some(kmh) => {
                        self.speed = Some(SpeedSample {
                            kmh,
                            at: fix.timestamp,
                        });
                        SpeedUpdate::Accepted(kmh)
                    }
                    None => SpeedUpdate::Discarded(raw),
                }
            }
        };
        // A fix older than the previous one is not a new baseline
        if self
            .last_fix
            .map_or(true, |prev| fix.timestamp > prev.timestamp)
        {
            self.last_fix = Some(fix);
        }
        update
    }

    pub fn push_motion(&mut self, sample: MotionSample) -> bool {
        let moving = sample.is_moving(self.threshold_g);
        self.moving = Some(moving);
        moving
    }

    /// Sensor record at `now`, `None` without a recent accepted speed
    pub fn record_at(&self, now: DateTime<Utc>) -> Option<TelemetryRecord> {
        let sample = self.speed?;
        if now.signed_duration_since(sample.at) > self.max_age {
            return None;
        }

        let gear = gear_for_speed(sample.kmh);
        let mut record = TelemetryRecord::disconnected().with_source(Source::Sensor);
        record.speed_kmh = Some(sample.kmh.round() as u16);
        record.gear = Some(gear);
        record.rpm = Some(rpm_for_speed(sample.kmh, gear));
        record.in_motion = self.moving;
        record.timestamp = now;
        Some(record)
    }

    pub fn reset(&mut self) {
        self.last_fix = None;
        self.speed = None;
        self.moving = None;
    }
}

/// Replays queued readings; used by tests and the demo
#[derive(Debug, Default)]
pub struct ScriptedSensors {
    locations: Mutex<VecDeque<LocationFix>>,
    motion: Mutex<VecDeque<MotionSample>>,
}

impl ScriptedSensors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_location(&self, fix: LocationFix) {
        self.locations.lock().push_back(fix);
    }

    pub fn push_motion(&self, sample: MotionSample) {
        self.motion.lock().push_back(sample);
    }

    /// Queued `(locations, motion samples)` not yet read
    pub fn pending(&self) -> (usize, usize) {
        (self.locations.lock().len(), self.motion.lock().len())
    }
}

#[async_trait]
impl SensorProvider for ScriptedSensors {
    async fn read_location(&self) -> Result<Option<LocationFix>> {
        Ok(self.locations.lock().pop_front())
    }

    async fn read_motion(&self) -> Result<Option<MotionSample>> {
        Ok(self.motion.lock().pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fix(latitude: f64, longitude: f64, secs: i64) -> LocationFix {
        LocationFix {
            latitude,
            longitude,
            timestamp: DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
        }
    }

    /// Latitude delta covering `metres` along a meridian
    fn north(metres: f64) -> f64 {
        (metres / EARTH_RADIUS_M).to_degrees()
    }

    #[test]
    fn test_haversine_one_degree_of_latitude() {
        let d = haversine_distance_m(&fix(0.0, 0.0, 0), &fix(1.0, 0.0, 0));
        assert!((d - 111_195.0).abs() < 1.0, "got {}", d);
    }

    #[test]
    fn test_accept_speed_range() {
        assert_eq!(accept_speed(-5.0), None);
        assert_eq!(accept_speed(350.0), None);
        assert_eq!(accept_speed(60.0), Some(60.0));
        assert_eq!(accept_speed(0.0), Some(0.0));
        assert_eq!(accept_speed(300.0), Some(300.0));
        assert_eq!(accept_speed(f64::INFINITY), None);
        assert_eq!(accept_speed(f64::NAN), None);
    }

    #[test]
    fn test_speed_between_fixes() {
        // 1000 m in 60 s = 60 km/h
        let speed = speed_between(&fix(0.0, 0.0, 0), &fix(north(1000.0), 0.0, 60)).unwrap();
        assert!((speed - 60.0).abs() < 0.01, "got {}", speed);

        // 1000 m in 10 s = 360 km/h
        assert_eq!(speed_between(&fix(0.0, 0.0, 0), &fix(north(1000.0), 0.0, 10)), None);

        // Same instant
        assert_eq!(speed_between(&fix(0.0, 0.0, 5), &fix(north(10.0), 0.0, 5)), None);
    }

    #[test]
    fn test_backwards_fix_is_negative_and_discarded() {
        let prev = fix(0.0, 0.0, 60);
        let next = fix(north(5000.0 / 60.0), 0.0, 0); // ~5 km/h backwards in time
        let raw = raw_speed_kmh(&prev, &next);
        assert!((raw + 5.0).abs() < 0.01, "got {}", raw);
        assert_eq!(speed_between(&prev, &next), None);
    }

    #[test]
    fn test_estimator_emits_accepted_speed() {
        let mut est = SensorEstimator::new(0.15, TimeDelta::seconds(5));
        assert_eq!(est.push_location(fix(0.0, 0.0, 0)), SpeedUpdate::First);
        assert!(est.record_at(fix(0.0, 0.0, 0).timestamp).is_none());

        match est.push_location(fix(north(1000.0), 0.0, 60)) {
            SpeedUpdate::Accepted(kmh) => assert!((kmh - 60.0).abs() < 0.01),
            other => panic!("Expected Accepted, got: {:?}", other),
        }

        let record = est.record_at(fix(0.0, 0.0, 61).timestamp).unwrap();
        assert_eq!(record.speed_kmh, Some(60));
        assert_eq!(record.gear, Some(4));
        assert_eq!(record.source, Source::Sensor);
        assert!(!record.connected);
        assert!(record.fuel_percent.is_none());
    }

    #[test]
    fn test_estimator_discards_implausible_speed() {
        let mut est = SensorEstimator::new(0.15, TimeDelta::seconds(5));
        est.push_location(fix(0.0, 0.0, 0));
        // 10 km in 100 s = 360 km/h
        assert!(matches!(
            est.push_location(fix(north(10_000.0), 0.0, 100)),
            SpeedUpdate::Discarded(_)
        ));
        assert!(est.record_at(fix(0.0, 0.0, 100).timestamp).is_none());
    }

    #[test]
    fn test_estimator_speed_goes_stale() {
        let mut est = SensorEstimator::new(0.15, TimeDelta::seconds(5));
        est.push_location(fix(0.0, 0.0, 0));
        est.push_location(fix(north(500.0), 0.0, 60));
        assert!(est.record_at(fix(0.0, 0.0, 65).timestamp).is_some());
        assert!(est.record_at(fix(0.0, 0.0, 66).timestamp).is_none());
    }

    #[test]
    fn test_motion_flag() {
        let at = fix(0.0, 0.0, 0).timestamp;
        let still = MotionSample { x: 0.0, y: 0.0, z: 1.0, timestamp: at };
        let bump = MotionSample { x: 0.3, y: 0.2, z: 1.1, timestamp: at };
        assert!(!still.is_moving(0.15));
        assert!(bump.is_moving(0.15));

        let mut est = SensorEstimator::new(0.15, TimeDelta::seconds(5));
        est.push_motion(bump);
        est.push_location(fix(0.0, 0.0, 0));
        est.push_location(fix(north(100.0), 0.0, 10));
        assert_eq!(est.record_at(at + TimeDelta::seconds(10)).unwrap().in_motion, Some(true));
    }

    #[test]
    fn test_speed_bands() {
        assert_eq!(gear_for_speed(0.0), 1);
        assert_eq!(gear_for_speed(45.0), 3);
        assert_eq!(gear_for_speed(200.0), 6);
        assert_eq!(rpm_for_speed(0.0, 1), 1200);
        assert!(rpm_for_speed(300.0, 6) <= 12_000);
    }

    #[tokio::test]
    async fn test_scripted_sensors_drain_in_order() {
        let sensors = ScriptedSensors::new();
        sensors.push_location(fix(1.0, 1.0, 0));
        sensors.push_location(fix(2.0, 2.0, 1));

        assert_eq!(sensors.read_location().await.unwrap().unwrap().latitude, 1.0);
        assert_eq!(sensors.read_location().await.unwrap().unwrap().latitude, 2.0);
        assert!(sensors.read_location().await.unwrap().is_none());
        assert!(sensors.read_motion().await.unwrap().is_none());
    }
}
