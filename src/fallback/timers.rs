//! Named interval timers that are cancelled together

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Owns the synthesizer's periodic tasks
///
/// Each timer has a name; spawning a timer under an existing name replaces it.
#[derive(Debug, Default)]
pub struct TimerArena {
    timers: HashMap<&'static str, JoinHandle<()>>,
    cancel: CancellationToken,
}

impl TimerArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period`, first call immediately
    ///
    /// # Arguments
    ///
    /// * `name` - Timer name; a running timer with the same name is replaced
    /// * `period` - Interval between calls
    /// * `tick` - Future factory, awaited once per period
    pub fn spawn_interval<F, Fut>(&mut self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(name);

        let token = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            biased;
                            _ = token.cancelled() => break,
                            _ = tick() => {}
                        }
                    }
                }
            }
        });
        self.timers.insert(name, handle);
    }

    /// Stop one timer
    ///
    /// # Returns
    ///
    /// * `bool` - true if a timer named `name` was running
    pub fn cancel(&mut self, name: &str) -> bool {
        match self.timers.remove(name) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Stop every timer
    pub fn cancel_all(&mut self) {
        self.cancel.cancel();
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.cancel = CancellationToken::new();
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.timers
            .get(name)
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.timers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

impl Drop for TimerArena {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<()> + Send + 'static {
        let counter = counter.clone();
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_ticks_immediately_then_periodically() {
        let mut arena = TimerArena::new();
        let count = Arc::new(AtomicUsize::new(0));
        arena.spawn_interval("emit", Duration::from_secs(1), counting(&count));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3); // t = 0, 1, 2
        assert!(arena.is_running("emit"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_stops_everything() {
        let mut arena = TimerArena::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        arena.spawn_interval("location", Duration::from_secs(1), counting(&a));
        arena.spawn_interval("motion", Duration::from_secs(1), counting(&b));
        assert_eq!(arena.names(), vec!["location", "motion"]);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        arena.cancel_all();
        let (a_seen, b_seen) = (a.load(Ordering::SeqCst), b.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(a.load(Ordering::SeqCst), a_seen);
        assert_eq!(b.load(Ordering::SeqCst), b_seen);
        assert!(arena.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_one_by_name() {
        let mut arena = TimerArena::new();
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        arena.spawn_interval("location", Duration::from_secs(1), counting(&a));
        arena.spawn_interval("motion", Duration::from_secs(1), counting(&b));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(arena.cancel("location"));
        assert!(!arena.cancel("location"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert!(b.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_respawn_replaces_timer() {
        let mut arena = TimerArena::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        arena.spawn_interval("emit", Duration::from_secs(1), counting(&first));
        tokio::time::sleep(Duration::from_millis(100)).await;
        arena.spawn_interval("emit", Duration::from_secs(1), counting(&second));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(arena.names(), vec!["emit"]);
    }
}
