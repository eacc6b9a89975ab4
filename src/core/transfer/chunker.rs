//! Throughput-adaptive chunk sizing.

use crate::core::config::MeshConfig;
use std::collections::VecDeque;
use std::time::Duration;

/// Shortest elapsed time credited to a sample, so an instant send does not
/// divide by zero.
const MIN_SAMPLE_SECS: f64 = 1e-4;

/// Keeps the last N per-chunk speeds. Above the fast threshold the chunk
/// grows by 3/2, below the slow threshold it shrinks by 2/3, always clamped
/// to `[min, max]`.
#[derive(Debug, Clone)]
pub struct AdaptiveChunker {
    size: usize,
    min: usize,
    max: usize,
    samples: VecDeque<f64>,
    window: usize,
    fast_bps: f64,
    slow_bps: f64,
}

impl AdaptiveChunker {
    pub fn new(cfg: &MeshConfig) -> Self {
        let min = cfg.chunk_size_min.max(1);
        let max = cfg.chunk_size_max.max(min);
        Self {
            size: cfg.chunk_size_default.clamp(min, max),
            min,
            max,
            samples: VecDeque::with_capacity(cfg.chunk_speed_window),
            window: cfg.chunk_speed_window.max(1),
            fast_bps: cfg.chunk_fast_bps,
            slow_bps: cfg.chunk_slow_bps,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.size
    }

    /// Average of the current window in bytes/sec.
    fn average_bps(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Feed one measured chunk and return the size for the next one.
    pub fn record(&mut self, bytes: usize, elapsed: Duration) -> usize {
        let secs = elapsed.as_secs_f64().max(MIN_SAMPLE_SECS);
        self.samples.push_back(bytes as f64 / secs);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }

        let Some(avg) = self.average_bps() else {
            return self.size;
        };
        if avg > self.fast_bps {
            self.size = (self.size.saturating_mul(3) / 2).min(self.max);
        } else if avg < self.slow_bps {
            self.size = (self.size.saturating_mul(2) / 3).max(self.min);
        }
        self.size
    }
}
