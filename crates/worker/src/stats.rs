//! Enqueue-to-delivery latency over a sliding window of recent deliveries.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

const DEFAULT_WINDOW: usize = 4096;

#[derive(Debug)]
pub struct DeliveryStats {
    samples: Mutex<VecDeque<u64>>,
    window: usize,
}

impl DeliveryStats {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            samples: Mutex::new(VecDeque::with_capacity(window)),
            window,
        }
    }

    pub fn record(&self, latency: Duration) {
        let ms = latency.as_millis() as u64;
        metrics::histogram!("dispatch.delivery_latency_ms").record(ms as f64);
        let mut samples = self.samples.lock();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    /// Nearest-rank percentile in milliseconds; `None` before the first sample.
    pub fn percentile(&self, pct: f64) -> Option<u64> {
        let mut sorted: Vec<u64> = self.samples.lock().iter().copied().collect();
        if sorted.is_empty() {
            return None;
        }
        sorted.sort_unstable();
        let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.clamp(1, sorted.len()) - 1;
        Some(sorted[idx])
    }

    pub fn p50(&self) -> Option<u64> {
        self.percentile(50.0)
    }

    pub fn p99(&self) -> Option<u64> {
        self.percentile(99.0)
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DeliveryStats {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
