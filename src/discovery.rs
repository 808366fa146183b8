//! # Device Discovery Module
//!
//! Scans for nearby peripherals and flags likely telemetry sources.
//!
//! This module handles:
//! - Starting and stopping the platform scan
//! - Deduplicating advertisements by device id
//! - Advisory scoring of candidates (nothing is filtered out)
//! - Auto-stopping the scan after the configured timeout

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::ScanConfig;
use crate::error::Result;
use crate::oplog::OperationalLog;
use crate::radio::{Advertisement, RadioAdapter};

/// A discovered peripheral as presented to consumers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: Option<String>,
    pub rssi: i16,
    /// Advisory score; higher is more likely the vehicle
    pub score: u8,
    pub is_likely_target: bool,
}

/// Scores advertisements against configured name tokens and signal strength
#[derive(Debug, Clone)]
pub struct TargetClassifier {
    tokens: Vec<String>,
    strong_rssi_dbm: i16,
}

impl TargetClassifier {
    pub fn new(tokens: &[String], strong_rssi_dbm: i16) -> Self {
        Self {
            tokens: tokens.iter().map(|t| t.to_lowercase()).collect(),
            strong_rssi_dbm,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(&config.match_tokens, config.strong_rssi_dbm)
    }

    /// +2 for a token in the name or id, +1 for a strong named signal
    pub fn score(&self, advertisement: &Advertisement) -> u8 {
        let name = advertisement
            .name
            .as_deref()
            .unwrap_or_default()
            .to_lowercase();
        let id = advertisement.id.to_lowercase();

        let mut score = 0;
        if self
            .tokens
            .iter()
            .any(|token| name.contains(token.as_str()) || id.contains(token.as_str()))
        {
            score += 2;
        }
        if advertisement.rssi > self.strong_rssi_dbm && !name.trim().is_empty() {
            score += 1;
        }
        score
    }

    pub fn classify(&self, advertisement: Advertisement) -> DeviceDescriptor {
        let score = self.score(&advertisement);
        DeviceDescriptor {
            id: advertisement.id,
            name: advertisement.name,
            rssi: advertisement.rssi,
            score,
            is_likely_target: score > 0,
        }
    }
}

struct ScanTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the running scan, if any
pub struct DeviceScanner {
    radio: Arc<dyn RadioAdapter>,
    classifier: TargetClassifier,
    timeout: Duration,
    log: OperationalLog,
    active: Mutex<Option<ScanTask>>,
}

impl std::fmt::Debug for DeviceScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceScanner")
            .field("classifier", &self.classifier)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DeviceScanner {
    pub fn new(radio: Arc<dyn RadioAdapter>, config: &ScanConfig, log: OperationalLog) -> Self {
        Self {
            radio,
            classifier: TargetClassifier::from_config(config),
            timeout: Duration::from_secs(config.timeout_s),
            log,
            active: Mutex::new(None),
        }
    }

    /// Start scanning
    ///
    /// `on_found` fires at most once per distinct device id. `on_timeout`
    /// fires if the scan ends on its own (timeout or the radio closing the
    /// scan), never after [`stop`](Self::stop).
    ///
    /// A scan that is already running is stopped first.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Scan`](crate::error::EngineError::Scan) when the
    /// platform refuses to scan.
    pub async fn start<F, T>(&self, on_found: F, on_timeout: T) -> Result<()>
    where
        F: Fn(DeviceDescriptor) + Send + Sync + 'static,
        T: FnOnce() + Send + 'static,
    {
        let mut active = self.active.lock().await;
        if let Some(task) = active.take() {
            self.finish(task).await;
        }

        let mut advertisements = match self.radio.start_scan().await {
            Ok(rx) => rx,
            Err(e) => {
                self.log.error(format!("Scan failed to start: {}", e));
                return Err(e);
            }
        };
        self.log
            .info(format!("Scan started ({} s timeout)", self.timeout.as_secs()));

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let radio = self.radio.clone();
        let classifier = self.classifier.clone();
        let log = self.log.clone();
        let timeout = self.timeout;

        let handle = tokio::spawn(async move {
            let mut seen = HashSet::new();
            let deadline = tokio::time::sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    _ = &mut deadline => {
                        log.info(format!("Scan auto-stopped after {} s", timeout.as_secs()));
                        break;
                    }
                    advertisement = advertisements.recv() => {
                        let Some(advertisement) = advertisement else {
                            log.warn("Scan ended by the radio");
                            break;
                        };
                        if !seen.insert(advertisement.id.clone()) {
                            continue;
                        }
                        let descriptor = classifier.classify(advertisement);
                        log.info(format!(
                            "Discovered {} ({}) rssi {} dBm score {}{}",
                            descriptor.id,
                            descriptor.name.as_deref().unwrap_or("unnamed"),
                            descriptor.rssi,
                            descriptor.score,
                            if descriptor.is_likely_target { " [likely target]" } else { "" }
                        ));
                        on_found(descriptor);
                    }
                }
            }

            if let Err(e) = radio.stop_scan().await {
                log.warn(format!("Failed to stop scan: {}", e));
            }
            on_timeout();
        });

        *active = Some(ScanTask { cancel, handle });
        Ok(())
    }

    /// Stop the scan. Safe to call when no scan is running.
    ///
    /// No `on_found` callback fires after this returns.
    pub async fn stop(&self) {
        let task = self.active.lock().await.take();
        if let Some(task) = task {
            self.finish(task).await;
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|task| !task.handle.is_finished())
            .unwrap_or(false)
    }

    async fn finish(&self, task: ScanTask) {
        let was_running = !task.handle.is_finished();
        task.cancel.cancel();
        // Cancellation is observed at the next select; a panic in a
        // callback only ends the scan
        let _ = task.handle.await;

        if was_running {
            if let Err(e) = self.radio.stop_scan().await {
                self.log.warn(format!("Failed to stop scan: {}", e));
            }
            self.log.info("Scan stopped");
        }
    }
}
