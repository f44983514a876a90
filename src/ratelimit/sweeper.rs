//! Background eviction of dormant clients.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::limiter::RateLimiter;

/// Spawn a task that periodically removes clients with no live history.
///
/// The task exits once `shutdown` observes `true` or its sender is dropped.
/// Returns `None` when `every` is zero, which disables sweeping.
pub fn spawn_sweeper(
    limiter: Arc<RateLimiter>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        info!("Rate limiter sweeper disabled");
        return None;
    }

    let handle = tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; nothing can have expired yet.
        ticker.tick().await;

        info!(interval_secs = every.as_secs(), "Rate limiter sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = limiter.sweep(Instant::now());
                    debug!(
                        removed = removed,
                        remaining = limiter.client_count(),
                        "Swept dormant rate limit clients"
                    );
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Rate limiter sweeper stopped");
    });

    Some(handle)
}
