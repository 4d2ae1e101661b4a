mod shutdown;

use anyhow::{Context, Result};
use bigbro::admission::{AdmissionLoop, AdmissionPolicy};
use bigbro::config::{self, AdmissionConfig, IngestMode};
use bigbro::config_watch::spawn_config_watcher;
use bigbro::ingest::{PooledIngest, StreamDepth, StreamingIngest};
use bigbro::letter::{Decoder, HexDecoder};
use bigbro::puller::{HttpPuller, Puller};
use bigbro::quota::QuotaGate;
use bigbro::sink::{HttpSink, LogSink, Sink};
use bigbro::web::{self, AppState, Ingest};
use bigbro::worker_pool::WorkerPool;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Command-line settings that take precedence over the config file.
#[derive(Debug, Default, Clone)]
pub struct RunOverrides {
    pub mode: Option<IngestMode>,
    pub quota: Option<u64>,
    pub capacity: Option<usize>,
    pub port: Option<u16>,
}

impl RunOverrides {
    fn apply(&self, config: &mut AdmissionConfig) {
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(quota) = self.quota {
            config.initial_quota = quota;
        }
        if let Some(capacity) = self.capacity {
            config.pool_capacity = capacity;
        }
        if let Some(port) = self.port {
            config.listen_port = port;
        }
    }
}

/// Load the config file and apply the command-line overrides.
///
/// Returns the file settings next to the effective ones. Reloads are
/// compared against the file settings, so overrides never show up as
/// changed settings, and a reload resets the quota to the file's value.
fn resolve_config(
    path: &Path,
    overrides: &RunOverrides,
) -> Result<(AdmissionConfig, AdmissionConfig)> {
    let from_file = AdmissionConfig::load_or_default(path)?;
    let mut config = from_file.clone();
    overrides.apply(&mut config);
    config.validate().context("Invalid run settings")?;
    Ok((from_file, config))
}

pub async fn handle_run(config_path: Option<PathBuf>, overrides: RunOverrides) -> Result<()> {
    let config_path = config_path.unwrap_or_else(config::config_path);
    let (from_file, config) = resolve_config(&config_path, &overrides)?;
    if overrides.quota.is_some() {
        warn!(
            "Quota override {} lasts until the config file changes; reloads reset it to {}",
            config.initial_quota, from_file.initial_quota
        );
    }

    info!("Starting run command with:");
    info!("  mode: {}", config.mode);
    info!("  pool capacity: {}", config.pool_capacity);
    info!("  initial quota: {}", config.initial_quota);
    info!("  probe period: {}ms", config.probe_period_ms);
    info!("  upstream: {}", config.upstream_url);

    // Install the recorder before zeroing metrics so the zeroes are recorded
    let metrics_handle = bigbro::metrics::init_metrics()?;
    bigbro::metrics::initialize_admission_metrics(config.initial_quota);

    if let Some(port) = config.metrics_port {
        let handle = metrics_handle.clone();
        tokio::spawn(async move {
            if let Err(e) = bigbro::metrics::start_metrics_server(port, handle).await {
                error!(error = %format!("{:#}", e), "Metrics server stopped");
            }
        });
    }

    let quota = Arc::new(QuotaGate::new(config.initial_quota));
    let puller: Arc<dyn Puller> = Arc::new(HttpPuller::new(&config.upstream_url)?);
    let sink: Arc<dyn Sink> = match &config.sink_url {
        Some(url) => {
            info!("  sink: {}", url);
            Arc::new(HttpSink::new(url)?)
        }
        None => {
            info!("  sink: log");
            Arc::new(LogSink)
        }
    };
    let decoder: Arc<dyn Decoder> = Arc::new(HexDecoder);

    // The policy reads depth from whatever actually holds the backlog: the
    // worker pool when pooled, the stream tracker when streaming.
    let (policy, ingest, pool) = match config.mode {
        IngestMode::Pooled => {
            let pool = Arc::new(WorkerPool::new(
                "letters",
                config.pool_capacity,
                config.queue_capacity,
            ));
            let policy = AdmissionPolicy::new(quota.clone(), pool.clone(), puller);
            let ingest = PooledIngest::new(pool.clone(), policy.clone(), decoder, sink);
            (policy, Ingest::Pooled(Arc::new(ingest)), Some(pool))
        }
        IngestMode::Streaming => {
            let depth = Arc::new(StreamDepth::new(config.pool_capacity));
            let policy = AdmissionPolicy::new(quota.clone(), depth.clone(), puller);
            let ingest =
                StreamingIngest::new(policy.clone(), depth, decoder, sink, config.streaming);
            (policy, Ingest::Streaming(Arc::new(ingest)), None)
        }
    };

    let cancel = CancellationToken::new();

    let admission_handle =
        AdmissionLoop::new(policy.clone(), config.probe_period()).spawn(cancel.child_token());
    let watcher_handle = spawn_config_watcher(
        config_path.clone(),
        from_file,
        quota.clone(),
        cancel.child_token(),
    );

    let app = web::router(AppState { policy, ingest });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind letter intake to {}", addr))?;

    shutdown::spawn_signal_handler(cancel.clone());

    let served = web::serve(listener, app, cancel.clone()).await;

    // Stop background tasks even when the server exited on its own
    cancel.cancel();
    if let Err(e) = admission_handle.await {
        error!(error = %e, "Admission loop task failed");
    }
    if let Err(e) = watcher_handle.await {
        error!(error = %e, "Config watcher task failed");
    }

    // Streaming batches finish inside their requests, which the server has
    // already waited for
    if let Some(pool) = pool {
        shutdown::drain_worker_pool(&pool, config.shutdown_timeout()).await;
    }

    served
}
