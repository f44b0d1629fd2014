//! Background expiry sweep
//!
//! Spawns a periodic task that reclaims overdue leases and expired keys. The
//! task runs independently of the request path and holds nothing but a handle
//! to the pool and a shutdown channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::pool::KeyPool;

/// Handle to a running sweeper task.
///
/// Dropping the handle closes the shutdown channel, which also stops the task.
pub struct Sweeper {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Stop the sweeper and wait for the in-progress pass, if any, to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.handle.await {
            warn!(error = %e, "sweeper task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawn a background task that sweeps the pool every `interval`.
///
/// The first pass runs immediately. Passes that fall behind are delayed
/// rather than bunched together.
pub fn spawn_sweeper(pool: Arc<KeyPool>, interval: Duration) -> Sweeper {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(interval_secs = interval.as_secs_f64(), "sweeper started");
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = ticker.tick() => sweep_cycle(&pool).await,
            }
        }
        info!("sweeper stopped");
    });

    Sweeper {
        shutdown_tx,
        handle,
    }
}

/// Run one sweep pass and log what it reclaimed.
async fn sweep_cycle(pool: &KeyPool) {
    let report = pool.sweep().await;
    if report.is_empty() {
        debug!("sweep pass reclaimed nothing");
        return;
    }
    info!(
        released = report.released.len(),
        removed = report.removed.len(),
        "sweep pass reclaimed keys"
    );
}
