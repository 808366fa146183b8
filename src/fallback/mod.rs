//! # Fallback Synthesizer
//!
//! Keeps the telemetry stream alive while no live link is monitoring.
//!
//! This module handles:
//! - Choosing one authoritative tier per tick: cached, sensor, synthetic
//! - Polling location and accelerometer on their own timers
//! - Substituting for live frames that decode to the disconnected sentinel
//! - Releasing every timer when suspended or shut down
//!
//! Each activation takes the hub gate as `Producer::Fallback(n)`; records from
//! an older activation are rejected by the hub.

pub mod sensor;
pub mod synthetic;
pub mod timers;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};

use crate::config::{FallbackConfig, SyntheticConfig};
use crate::hub::{Producer, SubscriptionHub};
use crate::oplog::OperationalLog;
use crate::telemetry::{Source, TelemetryCache, TelemetryRecord};

pub use sensor::{LocationFix, MotionSample, ScriptedSensors, SensorEstimator, SensorProvider, SpeedUpdate};
pub use synthetic::SyntheticGenerator;
pub use timers::TimerArena;

pub const EMIT_TIMER: &str = "emit";
pub const LOCATION_TIMER: &str = "location";
pub const MOTION_TIMER: &str = "motion";

struct FallbackInner {
    config: FallbackConfig,
    cache: TelemetryCache,
    hub: SubscriptionHub,
    log: OperationalLog,
    sensors: RwLock<Option<Arc<dyn SensorProvider>>>,
    estimator: Mutex<SensorEstimator>,
    synthetic: Mutex<SyntheticGenerator>,
    timers: Mutex<TimerArena>,
    active: Mutex<Option<Producer>>,
    generation: AtomicU64,
    last_tier: Mutex<Option<Source>>,
}

/// Cloneable handle to the synthesizer
#[derive(Clone)]
pub struct FallbackSynthesizer {
    inner: Arc<FallbackInner>,
}

impl std::fmt::Debug for FallbackSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let timers = self.inner.timers.lock().names();
        let active = *self.inner.active.lock();
        f.debug_struct("FallbackSynthesizer")
            .field("active", &active)
            .field("timers", &timers)
            .finish_non_exhaustive()
    }
}

impl FallbackSynthesizer {
    pub fn new(
        config: FallbackConfig,
        synthetic: &SyntheticConfig,
        cache: TelemetryCache,
        hub: SubscriptionHub,
        log: OperationalLog,
    ) -> Self {
        let max_age = TimeDelta::seconds(config.sensor_max_age_s as i64);
        let estimator = SensorEstimator::new(config.motion_threshold_g, max_age);

        Self {
            inner: Arc::new(FallbackInner {
                config,
                cache,
                hub,
                log,
                sensors: RwLock::new(None),
                estimator: Mutex::new(estimator),
                synthetic: Mutex::new(SyntheticGenerator::new(synthetic)),
                timers: Mutex::new(TimerArena::new()),
                active: Mutex::new(None),
                generation: AtomicU64::new(0),
                last_tier: Mutex::new(None),
            }),
        }
    }

    /// Install the phone sensor provider
    pub fn set_sensors(&self, sensors: Arc<dyn SensorProvider>) {
        *self.inner.sensors.write() = Some(sensors);
    }

    /// Remove the sensor provider (location permission denied)
    pub fn disable_sensors(&self) {
        self.inner.sensors.write().take();
        self.inner.estimator.lock().reset();
        self.inner.timers.lock().cancel(LOCATION_TIMER);
        self.inner.timers.lock().cancel(MOTION_TIMER);
    }

    fn sensors(&self) -> Option<Arc<dyn SensorProvider>> {
        if !self.inner.config.sensor_enabled {
            return None;
        }
        self.inner.sensors.read().clone()
    }

    /// Start emitting. No-op when already active.
    ///
    /// Must be called from within a tokio runtime.
    pub fn activate(&self) {
        let mut timers = self.inner.timers.lock();
        let mut active = self.inner.active.lock();
        if active.is_some() {
            return;
        }

        let producer = Producer::Fallback(self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1);
        self.inner.hub.set_producer(producer);
        *active = Some(producer);
        *self.inner.last_tier.lock() = None;
        self.inner.log.info("Fallback synthesizer active");

        let tick = Duration::from_millis(self.inner.config.tick_interval_ms);
        let weak = Arc::downgrade(&self.inner);
        timers.spawn_interval(EMIT_TIMER, tick, move || {
            let weak = weak.clone();
            async move {
                if let Some(this) = upgrade(&weak) {
                    this.emit(producer);
                }
            }
        });

        if let Some(sensors) = self.sensors() {
            let poll = Duration::from_millis(self.inner.config.sensor_poll_interval_ms);

            let weak = Arc::downgrade(&self.inner);
            let provider = sensors.clone();
            timers.spawn_interval(LOCATION_TIMER, poll, move || {
                let weak = weak.clone();
                let provider = provider.clone();
                async move {
                    let reading = provider.read_location().await;
                    if let Some(this) = upgrade(&weak) {
                        this.on_location(reading);
                    }
                }
            });

            let weak = Arc::downgrade(&self.inner);
            timers.spawn_interval(MOTION_TIMER, poll, move || {
                let weak = weak.clone();
                let provider = sensors.clone();
                async move {
                    let reading = provider.read_motion().await;
                    if let Some(this) = upgrade(&weak) {
                        this.on_motion(reading);
                    }
                }
            });
        }
    }

    /// Stop emitting and release the gate if still held
    pub fn suspend(&self) {
        let mut timers = self.inner.timers.lock();
        let producer = self.inner.active.lock().take();
        timers.cancel_all();

        if let Some(producer) = producer {
            self.inner.hub.release(producer);
            self.inner.log.info("Fallback synthesizer suspended");
        }
    }

    /// Stop everything for good; [`activate`](Self::activate) may still restart it
    pub fn shutdown(&self) {
        self.suspend();
        self.inner.estimator.lock().reset();
        self.inner.synthetic.lock().reset();
        self.inner.log.debug("Fallback timers released");
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.lock().is_some()
    }

    pub fn timer_names(&self) -> Vec<&'static str> {
        self.inner.timers.lock().names()
    }

    /// Replacement for a live frame that decoded to the sentinel
    pub fn substitute(&self) -> TelemetryRecord {
        self.next_record_at(Utc::now())
    }

    /// Record from the highest-priority tier that has data
    pub fn next_record_at(&self, now: DateTime<Utc>) -> TelemetryRecord {
        let config = &self.inner.config;

        if config.cached_enabled {
            if let Some(record) = self.inner.cache.get_live_at(now) {
                return self.tier(record.with_source(Source::Cached));
            }
        }

        if self.sensors().is_some() {
            if let Some(record) = self.inner.estimator.lock().record_at(now) {
                return self.tier(record);
            }
        }

        if config.synthetic_enabled {
            let baseline = self.inner.cache.latest();
            let record = self.inner.synthetic.lock().next_at(baseline, now);
            if config.persist_estimates {
                self.inner.cache.put_at(record.clone(), now);
            }
            return self.tier(record);
        }

        let mut sentinel = TelemetryRecord::disconnected();
        sentinel.timestamp = now;
        self.tier(sentinel)
    }

    fn tier(&self, record: TelemetryRecord) -> TelemetryRecord {
        let mut last = self.inner.last_tier.lock();
        if *last != Some(record.source) {
            self.inner
                .log
                .info(format!("Fallback tier now {:?}", record.source));
            *last = Some(record.source);
        }
        record
    }

    fn emit(&self, producer: Producer) {
        let record = self.next_record_at(Utc::now());
        self.inner.hub.publish(producer, &record);
    }

    fn on_location(&self, reading: crate::error::Result<Option<LocationFix>>) {
        match reading {
            Ok(Some(fix)) => {
                if let SpeedUpdate::Discarded(raw) = self.inner.estimator.lock().push_location(fix) {
                    self.inner
                        .log
                        .debug(format!("Discarded implausible location speed {:.1} km/h", raw));
                }
            }
            Ok(None) => {}
            Err(e) => self.inner.log.warn(format!("Location read failed: {}", e)),
        }
    }

    fn on_motion(&self, reading: crate::error::Result<Option<MotionSample>>) {
        match reading {
            Ok(Some(sample)) => {
                self.inner.estimator.lock().push_motion(sample);
            }
            Ok(None) => {}
            Err(e) => self.inner.log.warn(format!("Accelerometer read failed: {}", e)),
        }
    }
}

fn upgrade(weak: &Weak<FallbackInner>) -> Option<FallbackSynthesizer> {
    weak.upgrade().map(|inner| FallbackSynthesizer { inner })
}
