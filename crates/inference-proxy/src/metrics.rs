use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

/// Percentile summary served at `/metrics/ttft`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TtftSummary {
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub count: usize,
}

/// Append-only store of time-to-first-token samples, in milliseconds.
///
/// Samples are kept for the life of the process.
#[derive(Debug, Default)]
pub struct TtftMetrics {
    samples: Mutex<Vec<f64>>,
}

impl TtftMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, ttft: Duration) {
        let ms = ttft.as_nanos() as f64 / 1_000_000.0;
        self.samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ms);
    }

    pub fn summary(&self) -> TtftSummary {
        let mut sorted = self
            .samples
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        sorted.sort_by(f64::total_cmp);

        TtftSummary {
            p50_ms: percentile(&sorted, 50.0),
            p90_ms: percentile(&sorted, 90.0),
            count: sorted.len(),
        }
    }
}

/// Linear-interpolation percentile over already sorted samples.
/// `rank = p / 100 * (n - 1)`; an empty slice yields zero.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p / 100.0).clamp(0.0, 1.0) * (n - 1) as f64;
            let lower = rank.floor() as usize;
            let upper = rank.ceil() as usize;
            let weight = rank - lower as f64;
            sorted[lower] + (sorted[upper] - sorted[lower]) * weight
        }
    }
}
