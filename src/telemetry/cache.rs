//! # Telemetry Cache
//!
//! Single-slot store for the latest accepted telemetry record.
//!
//! The slot is overwritten on every `put` and persisted immediately. A cached
//! record is valid for [`CACHE_TTL`] after its capture time. Storage failures
//! are logged and swallowed so they never interrupt the telemetry flow.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{Source, TelemetryRecord};
use crate::oplog::OperationalLog;
use crate::storage::{keys, load_json, save_json, KeyValueStore};

/// Time-to-live of a cache entry
pub const CACHE_TTL: TimeDelta = TimeDelta::hours(1);

/// A cached record and the time it was captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub record: TelemetryRecord,
    pub captured_at: DateTime<Utc>,
}

impl CacheEntry {
    /// True while `now - captured_at < CACHE_TTL`
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.captured_at) < CACHE_TTL
    }
}

struct CacheInner {
    slot: Mutex<Option<CacheEntry>>,
    store: Arc<dyn KeyValueStore>,
    log: OperationalLog,
}

/// Shared handle to the telemetry cache
#[derive(Clone)]
pub struct TelemetryCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for TelemetryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryCache")
            .field("slot", &*self.inner.slot.lock())
            .finish_non_exhaustive()
    }
}

impl TelemetryCache {
    /// Create an empty cache backed by `store`
    pub fn new(store: Arc<dyn KeyValueStore>, log: OperationalLog) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                slot: Mutex::new(None),
                store,
                log,
            }),
        }
    }

    /// Load the persisted snapshot into the slot
    ///
    /// Called once at engine initialization. A missing or unreadable snapshot
    /// leaves the slot empty.
    pub fn load(&self) {
        match load_json::<CacheEntry>(self.inner.store.as_ref(), keys::TELEMETRY_SNAPSHOT) {
            Ok(Some(entry)) => {
                self.inner.log.info(format!(
                    "Loaded cached telemetry captured at {}",
                    entry.captured_at
                ));
                *self.inner.slot.lock() = Some(entry);
            }
            Ok(None) => self.inner.log.debug("No cached telemetry snapshot"),
            Err(e) => self
                .inner
                .log
                .warn(format!("Ignoring unreadable telemetry snapshot: {}", e)),
        }
    }

    /// Overwrite the slot, capturing at the current time
    pub fn put(&self, record: TelemetryRecord) {
        self.put_at(record, Utc::now());
    }

    /// Overwrite the slot with an explicit capture time
    pub fn put_at(&self, record: TelemetryRecord, captured_at: DateTime<Utc>) {
        let entry = CacheEntry {
            record,
            captured_at,
        };

        if let Err(e) = save_json(self.inner.store.as_ref(), keys::TELEMETRY_SNAPSHOT, &entry) {
            self.inner
                .log
                .warn(format!("Failed to persist telemetry snapshot: {}", e));
        }

        *self.inner.slot.lock() = Some(entry);
    }

    /// The cached record if it is still within its TTL
    pub fn get(&self) -> Option<TelemetryRecord> {
        self.get_at(Utc::now())
    }

    /// [`get`](Self::get) evaluated at `now`
    pub fn get_at(&self, now: DateTime<Utc>) -> Option<TelemetryRecord> {
        self.inner
            .slot
            .lock()
            .as_ref()
            .filter(|entry| entry.is_fresh_at(now))
            .map(|entry| entry.record.clone())
    }

    /// Fresh cached record that came from a live link
    ///
    /// Estimated records persisted by the synthesizer are never replayed as
    /// cached telemetry.
    pub fn get_live_at(&self, now: DateTime<Utc>) -> Option<TelemetryRecord> {
        self.get_at(now)
            .filter(|record| record.source == Source::Live)
    }

    /// The slot's record regardless of age
    pub fn latest(&self) -> Option<TelemetryRecord> {
        self.inner
            .slot
            .lock()
            .as_ref()
            .map(|entry| entry.record.clone())
    }

    pub fn entry(&self) -> Option<CacheEntry> {
        self.inner.slot.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, Result};
    use crate::storage::MemoryStore;

    struct BrokenStore;

    impl KeyValueStore for BrokenStore {
        fn get(&self, _key: &str) -> Result<Option<String>> {
            Err(EngineError::Storage("disk on fire".to_string()))
        }

        fn put(&self, _key: &str, _value: &str) -> Result<()> {
            Err(EngineError::Storage("disk on fire".to_string()))
        }

        fn remove(&self, _key: &str) -> Result<()> {
            Ok(())
        }
    }

    fn live_record(speed: u16) -> TelemetryRecord {
        let mut record = TelemetryRecord::disconnected();
        record.speed_kmh = Some(speed);
        record.gear = Some(3);
        record.with_source(Source::Live)
    }

    fn new_cache() -> (TelemetryCache, Arc<MemoryStore>, OperationalLog) {
        let store = Arc::new(MemoryStore::new());
        let log = OperationalLog::new();
        (TelemetryCache::new(store.clone(), log.clone()), store, log)
    }

    #[test]
    fn test_empty_cache_returns_nothing() {
        let (cache, _, _) = new_cache();
        assert!(cache.get().is_none());
        assert!(cache.latest().is_none());
    }

    #[test]
    fn test_ttl_boundary() {
        let (cache, _, _) = new_cache();
        let t = Utc::now();
        let record = live_record(45);
        cache.put_at(record.clone(), t);

        assert_eq!(cache.get_at(t + TimeDelta::minutes(59)), Some(record));
        assert_eq!(cache.get_at(t + TimeDelta::minutes(61)), None);
        assert!(cache.latest().is_some());
    }

    #[test]
    fn test_put_overwrites_single_slot() {
        let (cache, _, _) = new_cache();
        cache.put(live_record(10));
        cache.put(live_record(20));
        assert_eq!(cache.get().unwrap().speed_kmh, Some(20));
    }

    #[test]
    fn test_put_persists_and_load_restores() {
        let (cache, store, log) = new_cache();
        let t = Utc::now();
        cache.put_at(live_record(77), t);

        let restored = TelemetryCache::new(store, log);
        assert!(restored.get().is_none());
        restored.load();

        let entry = restored.entry().unwrap();
        assert_eq!(entry.captured_at, t);
        assert_eq!(entry.record.speed_kmh, Some(77));
    }

    #[test]
    fn test_get_live_skips_estimates() {
        let (cache, _, _) = new_cache();
        let estimate = live_record(30).with_source(Source::Synthetic);
        cache.put(estimate);

        assert!(cache.get().is_some());
        assert!(cache.get_live_at(Utc::now()).is_none());
    }

    #[test]
    fn test_storage_failures_are_swallowed() {
        let log = OperationalLog::new();
        let cache = TelemetryCache::new(Arc::new(BrokenStore), log.clone());

        cache.load();
        cache.put(live_record(50));

        assert_eq!(cache.get().unwrap().speed_kmh, Some(50));
        let messages: Vec<String> = log.get_all().into_iter().map(|e| e.message).collect();
        assert!(messages.iter().any(|m| m.contains("unreadable telemetry snapshot")));
        assert!(messages.iter().any(|m| m.contains("Failed to persist")));
    }
}
