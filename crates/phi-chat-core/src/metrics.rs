//! Per-generation throughput bookkeeping.

use std::time::{Duration, Instant};

/// Snapshot of one generation's throughput. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GenerationMetrics {
    pub num_tokens: usize,
    /// `None` until at least two tokens were observed with measurable time
    /// between them.
    pub tokens_per_second: Option<f64>,
    /// Time between the first and the latest token.
    pub elapsed: Duration,
}

/// Counts streamed tokens and derives tokens-per-second.
///
/// The first token only starts the clock: it never produces a rate, so the
/// prompt-processing latency before it does not skew the figure.
#[derive(Debug, Clone, Default)]
pub struct ThroughputTracker {
    started: Option<Instant>,
    num_tokens: usize,
    tokens_per_second: Option<f64>,
    elapsed: Duration,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    pub fn record_at(&mut self, now: Instant) {
        let started = *self.started.get_or_insert(now);
        let first = self.num_tokens == 0;
        self.num_tokens += 1;
        if first {
            return;
        }

        self.elapsed = now.saturating_duration_since(started);
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.tokens_per_second = Some(self.num_tokens as f64 / secs);
        }
    }

    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        self.tokens_per_second
    }

    pub fn snapshot(&self) -> GenerationMetrics {
        GenerationMetrics {
            num_tokens: self.num_tokens,
            tokens_per_second: self.tokens_per_second,
            elapsed: self.elapsed,
        }
    }
}
