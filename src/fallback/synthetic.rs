//! Bounded random-walk generator, the last fallback tier

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SyntheticConfig;
use crate::telemetry::{Source, TelemetryRecord, MAX_GEAR};

const MAX_SPEED_KMH: i32 = 300;
const SPEED_STEP_KMH: i32 = 3;
const MIN_RPM: i64 = 800;
const MAX_RPM: i64 = 12_000;
const RPM_STEP: i64 = 150;
/// Chance per tick that a non-empty tank drops one percent
const FUEL_DRAIN_PROBABILITY: f64 = 0.01;

/// Random walk seeded from the last known record
#[derive(Debug)]
pub struct SyntheticGenerator {
    rng: StdRng,
    min_shift_speed_kmh: u16,
    shift_probability: f64,
    last: Option<TelemetryRecord>,
}

impl SyntheticGenerator {
    pub fn new(config: &SyntheticConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng,
            min_shift_speed_kmh: config.min_shift_speed_kmh,
            shift_probability: config.shift_probability,
            last: None,
        }
    }

    /// A parked vehicle: everything zero, first gear
    pub fn parked() -> TelemetryRecord {
        let mut record = TelemetryRecord::disconnected();
        record.speed_kmh = Some(0);
        record.gear = Some(1);
        record.rpm = Some(0);
        record
    }

    /// Forget the walk so the next tick starts from a fresh baseline
    pub fn reset(&mut self) {
        self.last = None;
    }

    /// Next step of the walk
    ///
    /// Continues from the previous step, else from `baseline`, else from
    /// [`parked`](Self::parked). Zero and unknown fields are left alone.
    pub fn next_at(&mut self, baseline: Option<TelemetryRecord>, now: DateTime<Utc>) -> TelemetryRecord {
        let mut record = self
            .last
            .take()
            .or(baseline)
            .unwrap_or_else(Self::parked);

        if let Some(speed) = record.speed_kmh.filter(|s| *s > 0) {
            let step = self.rng.gen_range(-SPEED_STEP_KMH..=SPEED_STEP_KMH);
            record.speed_kmh = Some((speed as i32 + step).clamp(0, MAX_SPEED_KMH) as u16);
        }

        if let Some(rpm) = record.rpm.filter(|r| *r > 0) {
            let step = self.rng.gen_range(-RPM_STEP..=RPM_STEP);
            record.rpm = Some((rpm as i64 + step).clamp(MIN_RPM, MAX_RPM) as u32);
        }

        if let Some(fuel) = record.fuel_percent.filter(|f| *f > 0) {
            let drained = self.rng.gen_bool(FUEL_DRAIN_PROBABILITY);
            record.fuel_percent = Some(fuel.min(100) - u8::from(drained));
        }

        if let (Some(gear), Some(speed)) = (record.gear.filter(|g| *g > 0), record.speed_kmh) {
            if speed >= self.min_shift_speed_kmh
                && self.shift_probability > 0.0
                && self.rng.gen_bool(self.shift_probability)
            {
                let up = self.rng.gen_bool(0.5);
                let shifted = if up { gear.saturating_add(1) } else { gear.saturating_sub(1) };
                record.gear = Some(shifted.clamp(1, MAX_GEAR));
            }
        }

        let mut record = record.with_source(Source::Synthetic);
        record.timestamp = now;
        self.last = Some(record.clone());
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator(seed: u64, shift_probability: f64) -> SyntheticGenerator {
        SyntheticGenerator::new(&SyntheticConfig {
            seed: Some(seed),
            min_shift_speed_kmh: 15,
            shift_probability,
        })
    }

    fn cruising() -> TelemetryRecord {
        let mut record = TelemetryRecord::disconnected().with_source(Source::Live);
        record.speed_kmh = Some(80);
        record.gear = Some(4);
        record.rpm = Some(5000);
        record.fuel_percent = Some(60);
        record.odometer = Some(12_345);
        record
    }

    #[test]
    fn test_walk_stays_in_bounds() {
        let mut gen = generator(1, 0.2);
        let mut baseline = cruising();
        baseline.speed_kmh = Some(299);
        baseline.rpm = Some(11_950);

        let now = Utc::now();
        let mut record = gen.next_at(Some(baseline), now);
        for _ in 0..10_000 {
            record = gen.next_at(None, now);
            let speed = record.speed_kmh.unwrap();
            let gear = record.gear.unwrap();
            let rpm = record.rpm.unwrap();
            assert!(speed <= 300);
            assert!((1..=MAX_GEAR).contains(&gear));
            assert!((800..=12_000).contains(&rpm));
            assert!(record.fuel_percent.unwrap() <= 100);
        }
        assert_eq!(record.odometer, Some(12_345));
    }

    #[test]
    fn test_zero_and_unknown_fields_are_not_perturbed() {
        let mut gen = generator(2, 1.0);
        let now = Utc::now();
        for _ in 0..200 {
            let record = gen.next_at(None, now);
            assert_eq!(record.speed_kmh, Some(0));
            assert_eq!(record.rpm, Some(0));
            assert_eq!(record.gear, Some(1)); // below shift speed
            assert_eq!(record.fuel_percent, None);
        }
    }

    #[test]
    fn test_shifts_only_above_min_speed() {
        let mut gen = generator(3, 1.0);
        let mut slow = cruising();
        slow.speed_kmh = Some(5);
        slow.rpm = Some(0);

        let record = gen.next_at(Some(slow), Utc::now());
        // 5 ± 3 never reaches 15
        assert_eq!(record.gear, Some(4));

        let mut gen = generator(3, 1.0);
        let record = gen.next_at(Some(cruising()), Utc::now());
        assert!(record.gear == Some(3) || record.gear == Some(5));
    }

    #[test]
    fn test_records_are_labelled_synthetic() {
        let mut gen = generator(4, 0.05);
        let record = gen.next_at(Some(cruising()), Utc::now());
        assert_eq!(record.source, Source::Synthetic);
        assert!(!record.connected);
    }

    #[test]
    fn test_continues_from_previous_step() {
        let mut gen = generator(5, 0.0);
        let first = gen.next_at(Some(cruising()), Utc::now());

        let mut other = cruising();
        other.speed_kmh = Some(10);
        let second = gen.next_at(Some(other), Utc::now());

        let delta = (second.speed_kmh.unwrap() as i32 - first.speed_kmh.unwrap() as i32).abs();
        assert!(delta <= SPEED_STEP_KMH);

        gen.reset();
        let third = gen.next_at(Some(cruising()), Utc::now());
        assert!((77..=83).contains(&third.speed_kmh.unwrap()));
    }

    #[test]
    fn test_seeded_generators_agree() {
        let now = Utc::now();
        let mut a = generator(9, 0.1);
        let mut b = generator(9, 0.1);
        for _ in 0..20 {
            assert_eq!(a.next_at(Some(cruising()), now), b.next_at(Some(cruising()), now));
        }
    }
}
