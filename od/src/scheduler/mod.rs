//! LlmGate - process-wide cap on concurrent LLM invocations
//!
//! Every supervisor acquires a permit before invoking the sidecar. A
//! semaphore bounds concurrency; a sliding window bounds invocation rate.
//! Excess invocations queue on the semaphore in arrival order.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
// tokio Instant so the sliding window follows the test clock when paused
use tokio::time::Instant;
use tracing::debug;

use crate::config::ConcurrencyConfig;

/// Gate statistics
#[derive(Debug, Clone, Default)]
pub struct GateStats {
    pub total_acquired: u64,
    pub total_rate_delayed: u64,
    pub peak_in_flight: usize,
}

struct GateInner {
    request_times: VecDeque<Instant>,
    stats: GateStats,
}

/// Concurrency and rate gate for the sidecar pool
pub struct LlmGate {
    semaphore: Arc<Semaphore>,
    inner: Mutex<GateInner>,
    in_flight: Arc<AtomicUsize>,
    max_per_window: usize,
    window: Duration,
}

impl LlmGate {
    pub fn new(config: &ConcurrencyConfig) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(config.max_llm_calls)),
            inner: Mutex::new(GateInner {
                request_times: VecDeque::new(),
                stats: GateStats::default(),
            }),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_per_window: config.max_calls_per_window as usize,
            window: config.rate_window(),
        }
    }

    /// Acquire a slot, waiting for both a concurrency permit and rate room
    pub async fn acquire(&self) -> GatePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("gate semaphore closed");

        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                while inner
                    .request_times
                    .front()
                    .map(|t| now.duration_since(*t) > self.window)
                    .unwrap_or(false)
                {
                    inner.request_times.pop_front();
                }

                if inner.request_times.len() < self.max_per_window {
                    inner.request_times.push_back(now);
                    let live = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    inner.stats.total_acquired += 1;
                    inner.stats.peak_in_flight = inner.stats.peak_in_flight.max(live);
                    None
                } else {
                    inner.stats.total_rate_delayed += 1;
                    let oldest = *inner.request_times.front().unwrap();
                    Some(self.window.saturating_sub(now.duration_since(oldest)))
                }
            };

            match wait {
                None => break,
                Some(delay) => {
                    debug!(?delay, "LLM gate rate-delayed");
                    tokio::time::sleep(delay).await;
                }
            }
        }

        GatePermit {
            _permit: permit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// Invocations currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub async fn stats(&self) -> GateStats {
        self.inner.lock().await.stats.clone()
    }
}

/// Held for the duration of one sidecar invocation
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_calls: usize, per_window: u32) -> ConcurrencyConfig {
        ConcurrencyConfig {
            max_workers: 4,
            max_llm_calls: max_calls,
            max_calls_per_window: per_window,
            rate_window_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let gate = Arc::new(LlmGate::new(&config(2, 100)));

        let p1 = gate.acquire().await;
        let _p2 = gate.acquire().await;
        assert_eq!(gate.in_flight(), 2);

        // Third acquire must queue until a permit frees
        let gate2 = Arc::clone(&gate);
        let waiter = tokio::spawn(async move {
            let _p3 = gate2.acquire().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(p1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stats_track_acquires() {
        let gate = LlmGate::new(&config(4, 100));
        {
            let _a = gate.acquire().await;
            let _b = gate.acquire().await;
            let stats = gate.stats().await;
            assert_eq!(stats.total_acquired, 2);
            assert_eq!(stats.peak_in_flight, 2);
        }
        assert_eq!(gate.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_window_delays() {
        let gate = Arc::new(LlmGate::new(&config(10, 2)));

        let _a = gate.acquire().await;
        let _b = gate.acquire().await;

        let gate2 = Arc::clone(&gate);
        let start = Instant::now();
        let waiter = tokio::spawn(async move {
            let _c = gate2.acquire().await;
        });

        // Paused clock: the waiter can only finish after the window expires
        tokio::time::timeout(Duration::from_secs(120), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(gate.stats().await.total_rate_delayed > 0);
    }
}
