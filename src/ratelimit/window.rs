//! Per-client sliding window of admitted request timestamps.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Admitted request timestamps for one client, oldest first.
///
/// Timestamps are kept in ascending order so that pruning only ever has to
/// look at the front of the queue.
#[derive(Debug, Default, Clone)]
pub struct ClientWindow {
    timestamps: VecDeque<Instant>,
}

impl ClientWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every timestamp that is `window` or more older than `now`.
    ///
    /// Timestamps later than `now` count as zero age and are kept.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.timestamps.front() {
            if now.saturating_duration_since(oldest) < window {
                break;
            }
            self.timestamps.pop_front();
        }
    }

    /// Record an admission at `now`.
    pub fn record(&mut self, now: Instant) {
        match self.timestamps.back() {
            Some(&newest) if now < newest => {
                // Explicit instants may arrive out of order; keep the queue sorted.
                let pos = self.timestamps.partition_point(|&t| t <= now);
                self.timestamps.insert(pos, now);
            }
            _ => self.timestamps.push_back(now),
        }
    }

    /// Number of timestamps still within `window` of `now`, without pruning.
    pub fn live_count(&self, now: Instant, window: Duration) -> usize {
        self.timestamps
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < window)
            .count()
    }

    /// Number of stored timestamps.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether no timestamps are stored.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Time until the oldest stored timestamp leaves the window.
    pub fn duration_until_free(&self, now: Instant, window: Duration) -> Duration {
        match self.timestamps.front() {
            Some(&oldest) => window.saturating_sub(now.saturating_duration_since(oldest)),
            None => Duration::ZERO,
        }
    }
}
