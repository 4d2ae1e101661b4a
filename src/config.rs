use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::StreamingOptions;

/// How letters enter the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IngestMode {
    /// One worker-pool task per letter
    #[default]
    Pooled,
    /// Bounded-concurrency decoding of letter batches
    Streaming,
}

impl std::fmt::Display for IngestMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestMode::Pooled => write!(f, "pooled"),
            IngestMode::Streaming => write!(f, "streaming"),
        }
    }
}

/// Service configuration, read once at startup.
///
/// Only `initial_quota` is picked up again on reload; see
/// [`crate::config_watch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Admission probe period in milliseconds
    #[serde(default = "default_probe_period_ms")]
    pub probe_period_ms: u64,
    /// Total number of eager pull requests the ingest path may issue
    #[serde(default = "default_initial_quota")]
    pub initial_quota: u64,
    /// Worker pool size, also the size of every pull request
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,
    /// Worker queue bound; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub mode: IngestMode,
    /// Base URL of the letter producer
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Guard service receiving decoded letters; letters are logged when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sink_url: Option<String>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics_port: Option<u16>,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub streaming: StreamingOptions,
}

fn default_probe_period_ms() -> u64 {
    100
}

fn default_initial_quota() -> u64 {
    100
}

fn default_pool_capacity() -> usize {
    4
}

fn default_upstream_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_shutdown_timeout_secs() -> u64 {
    30
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            probe_period_ms: default_probe_period_ms(),
            initial_quota: default_initial_quota(),
            pool_capacity: default_pool_capacity(),
            queue_capacity: None,
            mode: IngestMode::default(),
            upstream_url: default_upstream_url(),
            sink_url: None,
            listen_port: default_listen_port(),
            metrics_port: None,
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            streaming: StreamingOptions::default(),
        }
    }
}

impl AdmissionConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
        let config: AdmissionConfig =
            toml::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {:?}", path))?;
        Ok(config)
    }

    /// Load config from `path`, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::info!("No config file at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save config to a TOML file (atomic: write to .tmp then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents =
            toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, &contents)
            .with_context(|| format!("Failed to write {:?}", tmp_path))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", tmp_path, path))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_capacity == 0 {
            anyhow::bail!("pool_capacity must be at least 1");
        }
        if self.probe_period_ms == 0 {
            anyhow::bail!("probe_period_ms must be at least 1");
        }
        if self.queue_capacity == Some(0) {
            anyhow::bail!("queue_capacity must be at least 1 when set");
        }
        if self.upstream_url.trim().is_empty() {
            anyhow::bail!("upstream_url must not be empty");
        }
        Ok(())
    }

    pub fn probe_period(&self) -> Duration {
        Duration::from_millis(self.probe_period_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Resolve the config file path.
///
/// Priority:
/// 1. `BIGBRO_CONFIG` env var
/// 2. `./bigbro.toml`
pub fn config_path() -> PathBuf {
    match std::env::var("BIGBRO_CONFIG") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from("./bigbro.toml"),
    }
}
