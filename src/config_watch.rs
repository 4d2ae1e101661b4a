//! Config file hot reload.
//!
//! Every successful reload replaces the quota with the file's
//! `initial_quota`, which is how an operator replenishes an exhausted quota.
//! All other settings are fixed at startup; changes to them are reported and
//! ignored until the next restart.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::AdmissionConfig;
use crate::quota::QuotaGate;

/// What a reload changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub previous_quota: u64,
    pub quota: u64,
    /// Settings that differ from the running config but need a restart
    pub restart_required: Vec<&'static str>,
}

/// Apply a freshly loaded config to the running service.
pub fn apply_reload(
    running: &AdmissionConfig,
    reloaded: &AdmissionConfig,
    quota: &QuotaGate,
) -> ReloadOutcome {
    let previous_quota = quota.reset(reloaded.initial_quota);

    let mut restart_required = Vec::new();
    if running.probe_period_ms != reloaded.probe_period_ms {
        restart_required.push("probe_period_ms");
    }
    if running.pool_capacity != reloaded.pool_capacity {
        restart_required.push("pool_capacity");
    }
    if running.queue_capacity != reloaded.queue_capacity {
        restart_required.push("queue_capacity");
    }
    if running.mode != reloaded.mode {
        restart_required.push("mode");
    }
    if running.upstream_url != reloaded.upstream_url {
        restart_required.push("upstream_url");
    }
    if running.sink_url != reloaded.sink_url {
        restart_required.push("sink_url");
    }
    if running.listen_port != reloaded.listen_port {
        restart_required.push("listen_port");
    }
    if running.metrics_port != reloaded.metrics_port {
        restart_required.push("metrics_port");
    }
    if running.streaming != reloaded.streaming {
        restart_required.push("streaming");
    }

    ReloadOutcome {
        previous_quota,
        quota: reloaded.initial_quota,
        restart_required,
    }
}

/// Spawn a file watcher that reloads the config and resets the quota on
/// modification.
pub fn spawn_config_watcher(
    path: PathBuf,
    running: AdmissionConfig,
    quota: Arc<QuotaGate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        use notify::{Event, EventKind, RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);

        // The file may be replaced atomically, so watch its directory
        let watch_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(|name| name.to_os_string());

        let mut watcher = match notify::recommended_watcher(move |res: Result<Event, _>| {
            if let Ok(event) = res
                && matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                && event
                    .paths
                    .iter()
                    .any(|p| file_name.as_deref().is_some_and(|name| p.ends_with(name)))
            {
                let _ = tx.try_send(());
            }
        }) {
            Ok(w) => w,
            Err(e) => {
                error!(error = %e, "Failed to create config file watcher");
                return;
            }
        };

        if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
            error!(error = %e, path = ?watch_dir, "Failed to watch config directory");
            return;
        }

        info!(path = ?path, "Config file watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    if event.is_none() {
                        break;
                    }
                }
            }

            // Debounce: drain any additional events within 500ms
            tokio::time::sleep(Duration::from_millis(500)).await;
            while rx.try_recv().is_ok() {}

            reload(&path, &running, &quota);
        }

        info!(path = ?path, "Config file watcher stopped");
    })
}

fn reload(path: &Path, running: &AdmissionConfig, quota: &QuotaGate) {
    info!(path = ?path, "Config file changed, reloading...");
    match AdmissionConfig::load(path) {
        Ok(reloaded) => {
            let outcome = apply_reload(running, &reloaded, quota);
            info!(
                previous = outcome.previous_quota,
                quota = outcome.quota,
                "Config reloaded"
            );
            if !outcome.restart_required.is_empty() {
                warn!(
                    settings = ?outcome.restart_required,
                    "Changed settings take effect after a restart"
                );
            }
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Failed to reload config file, keeping current quota");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestMode;

    #[test]
    fn test_reload_replaces_exhausted_quota() {
        let running = AdmissionConfig {
            initial_quota: 1,
            ..AdmissionConfig::default()
        };
        let quota = QuotaGate::new(1);
        assert!(quota.try_consume());

        let outcome = apply_reload(&running, &running.clone(), &quota);

        assert_eq!(outcome.previous_quota, 0);
        assert_eq!(quota.remaining(), 1);
        assert!(outcome.restart_required.is_empty());
    }

    #[test]
    fn test_reload_reports_restart_only_settings() {
        let running = AdmissionConfig::default();
        let reloaded = AdmissionConfig {
            initial_quota: 50,
            pool_capacity: 16,
            mode: IngestMode::Streaming,
            ..AdmissionConfig::default()
        };
        let quota = QuotaGate::new(running.initial_quota);

        let outcome = apply_reload(&running, &reloaded, &quota);

        assert_eq!(quota.remaining(), 50);
        assert_eq!(outcome.restart_required, vec!["pool_capacity", "mode"]);
    }

    #[test]
    fn test_failed_reload_keeps_quota() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bigbro.toml");
        std::fs::write(&path, "pool_capacity = \"many\"").unwrap();

        let quota = QuotaGate::new(3);
        reload(&path, &AdmissionConfig::default(), &quota);
        assert_eq!(quota.remaining(), 3);
    }

    #[tokio::test]
    async fn test_watcher_resets_quota_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bigbro.toml");
        let running = AdmissionConfig {
            initial_quota: 1,
            ..AdmissionConfig::default()
        };
        running.save(&path).unwrap();

        let quota = Arc::new(QuotaGate::new(0));
        let cancel = CancellationToken::new();
        let handle = spawn_config_watcher(path.clone(), running.clone(), quota.clone(), cancel.clone());

        // Give the watcher time to register
        tokio::time::sleep(Duration::from_millis(200)).await;
        AdmissionConfig {
            initial_quota: 9,
            ..running
        }
        .save(&path)
        .unwrap();

        let mut reset = false;
        for _ in 0..50 {
            if quota.remaining() == 9 {
                reset = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        cancel.cancel();
        handle.await.unwrap();
        assert!(reset, "quota was not reset after config change");
    }
}
