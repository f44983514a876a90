//! Core sliding-window rate limiter.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use super::window::ClientWindow;
use crate::config::RateLimitingConfig;
use crate::error::{GatehouseError, Result};

/// Per-client sliding-window admission controller.
///
/// Each client may be admitted at most `quota` times within any span of
/// `window`. The history map is sharded; the shard lock taken for a client's
/// entry covers the whole prune/check/append sequence, so concurrent calls
/// for the same client are serialized while other clients proceed.
pub struct RateLimiter {
    /// Maximum admissions per client within the window
    quota: usize,
    /// Length of the sliding window
    window: Duration,
    /// Admitted timestamps indexed by client identifier
    history: DashMap<String, ClientWindow>,
}

impl RateLimiter {
    /// Create a new rate limiter.
    ///
    /// Fails with [`GatehouseError::InvalidConfiguration`] when either the
    /// quota or the window is zero.
    pub fn new(quota: usize, window: Duration) -> Result<Self> {
        if quota == 0 {
            return Err(GatehouseError::InvalidConfiguration(
                "rate limit quota must be greater than zero".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(GatehouseError::InvalidConfiguration(
                "rate limit window must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            quota,
            window,
            history: DashMap::new(),
        })
    }

    /// Create a rate limiter from the `rate_limiting` configuration section.
    pub fn from_config(config: &RateLimitingConfig) -> Result<Self> {
        Self::new(config.quota, Duration::from_secs(config.window_secs))
    }

    /// Decide whether `client_id` may make a request now.
    pub fn is_allowed(&self, client_id: &str) -> bool {
        if let Some(mut window) = self.history.get_mut(client_id) {
            // Read the clock under the entry lock so stored timestamps stay ordered.
            let now = Instant::now();
            return self.admit(client_id, &mut window, now);
        }

        let mut window = self.history.entry(client_id.to_string()).or_default();
        let now = Instant::now();
        self.admit(client_id, &mut window, now)
    }

    /// Decide whether `client_id` may make a request at `now`.
    ///
    /// Admitted calls are recorded; rejected calls leave the history as it
    /// was apart from dropping expired entries.
    pub fn is_allowed_at(&self, client_id: &str, now: Instant) -> bool {
        if let Some(mut window) = self.history.get_mut(client_id) {
            return self.admit(client_id, &mut window, now);
        }

        let mut window = self.history.entry(client_id.to_string()).or_default();
        self.admit(client_id, &mut window, now)
    }

    fn admit(&self, client_id: &str, window: &mut ClientWindow, now: Instant) -> bool {
        window.prune(now, self.window);

        if window.len() >= self.quota {
            debug!(
                client = %client_id,
                quota = self.quota,
                window_secs = self.window.as_secs(),
                "Rate limit exceeded"
            );
            return false;
        }

        window.record(now);
        trace!(
            client = %client_id,
            used = window.len(),
            quota = self.quota,
            "Request admitted"
        );
        true
    }

    /// Remaining admissions for `client_id` at `now`. Does not modify state.
    pub fn remaining(&self, client_id: &str, now: Instant) -> usize {
        let used = self
            .history
            .get(client_id)
            .map_or(0, |w| w.live_count(now, self.window));
        self.quota.saturating_sub(used)
    }

    /// How long `client_id` must wait before its next request can be admitted.
    ///
    /// Returns zero when the client currently has capacity.
    pub fn retry_after(&self, client_id: &str, now: Instant) -> Duration {
        match self.history.get(client_id) {
            Some(w) if w.live_count(now, self.window) >= self.quota => {
                w.duration_until_free(now, self.window)
            }
            _ => Duration::ZERO,
        }
    }

    /// Remove every client whose history has fully expired at `now`.
    ///
    /// Returns the number of clients removed. A removed client is
    /// indistinguishable from one never seen, so decisions are unaffected.
    pub fn sweep(&self, now: Instant) -> usize {
        let mut removed = 0;
        self.history.retain(|_, w| {
            w.prune(now, self.window);
            if w.is_empty() {
                removed += 1;
                false
            } else {
                true
            }
        });
        removed
    }

    /// Maximum admissions per client within the window.
    pub fn quota(&self) -> usize {
        self.quota
    }

    /// Length of the sliding window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Number of clients currently tracked.
    pub fn client_count(&self) -> usize {
        self.history.len()
    }
}
