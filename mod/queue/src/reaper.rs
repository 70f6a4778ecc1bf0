use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::TaskQueue;

/// Configuration for the background reaper.
///
/// Invariant (not enforced automatically): `stale_timeout` must be
/// strictly greater than the workers' heartbeat interval, with headroom
/// for scheduling jitter — otherwise healthy claims get reclaimed. The
/// defaults here (120s timeout vs. the worker default 10s interval) leave
/// an order of magnitude of slack.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// How often to sweep for stale claims.
    pub sweep_interval: Duration,
    /// A claimed task with no heartbeat for this long is considered
    /// abandoned.
    pub stale_timeout: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(120),
        }
    }
}

/// Start the background reaper loop.
///
/// Periodically reclaims tasks whose workers stopped heartbeating, through
/// the same retry-policy-guarded transition as an explicit `fail` — so a
/// task abandoned over and over exhausts its attempts and dead-letters
/// just like one that fails explicitly. Safe to run with zero or many
/// workers live; each reclaim is a short conditional statement that never
/// blocks claims or heartbeats for long.
///
/// Returns a CancellationToken that stops the loop when cancelled.
pub fn start(queue: Arc<TaskQueue>, config: ReaperConfig) -> CancellationToken {
    let cancel = CancellationToken::new();

    {
        let queue = Arc::clone(&queue);
        let cancel = cancel.clone();
        let interval = config.sweep_interval;
        let stale_secs = config.stale_timeout.as_secs() as i64;

        tokio::spawn(async move {
            info!(
                "reaper started (interval={interval:?}, stale_timeout={stale_secs}s)"
            );
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("reaper stopped");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        debug!("reaper sweep");
                        match queue.reap_stale(stale_secs) {
                            Ok(0) => {}
                            Ok(n) => info!("reaper: reclaimed {n} stale tasks"),
                            Err(e) => error!("reaper sweep error: {e}"),
                        }
                    }
                }
            }
        });
    }

    cancel
}
