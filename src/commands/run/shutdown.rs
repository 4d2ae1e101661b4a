use bigbro::worker_pool::WorkerPool;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancel `cancel` on Ctrl+C. Everything that holds a child token stops, and
/// the HTTP server stops accepting connections.
pub(crate) fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => {
                    info!("Received shutdown signal (Ctrl+C), initiating graceful shutdown...");
                    cancel.cancel();
                }
                Err(err) => {
                    error!("Unable to listen for shutdown signal: {}", err);
                }
            }
        }
    });
}

/// Close the worker pool and wait for queued letters to finish, logging the
/// backlog once per second.
pub(crate) async fn drain_worker_pool(pool: &WorkerPool, timeout: Duration) {
    info!(
        "Waiting for worker pool to drain: {} queued, {} in flight",
        pool.pending_count(),
        pool.in_flight()
    );

    let drain = pool.shutdown(timeout);
    tokio::pin!(drain);

    let mut progress = tokio::time::interval(Duration::from_secs(1));
    progress.tick().await;

    let mut elapsed = 0u64;
    loop {
        tokio::select! {
            drained = &mut drain => {
                if drained {
                    info!("Worker pool drained, shutting down now");
                } else {
                    warn!(
                        "Worker pool did not drain within {}s: {} queued, {} in flight",
                        timeout.as_secs(),
                        pool.pending_count(),
                        pool.in_flight()
                    );
                }
                break;
            }
            _ = progress.tick() => {
                elapsed += 1;
                info!(
                    "Waiting for queues to drain ({}/{}s): {} queued, {} in flight",
                    elapsed,
                    timeout.as_secs(),
                    pool.pending_count(),
                    pool.in_flight()
                );
            }
        }
    }

    info!("Graceful shutdown complete");
}
