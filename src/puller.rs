//! One-way "send me more letters" requests to the upstream producer.
//!
//! Nothing here waits for an answer. A request that fails is logged and
//! forgotten; the next probe tick or the next letter will ask again.

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Asks the upstream producer to emit up to `count` more letters.
pub trait Puller: Send + Sync {
    fn request_more(&self, count: usize);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub count: usize,
}

/// Puller that hands requests to an in-process channel.
#[derive(Clone)]
pub struct ChannelPuller {
    tx: flume::Sender<PullRequest>,
}

impl ChannelPuller {
    pub fn new(tx: flume::Sender<PullRequest>) -> Self {
        Self { tx }
    }

    /// Create a puller together with the receiving end of its channel.
    pub fn channel(capacity: usize) -> (Self, flume::Receiver<PullRequest>) {
        let (tx, rx) = flume::bounded(capacity);
        (Self::new(tx), rx)
    }
}

impl Puller for ChannelPuller {
    fn request_more(&self, count: usize) {
        match self.tx.try_send(PullRequest { count }) {
            Ok(()) => {}
            Err(flume::TrySendError::Full(_)) => {
                warn!(count, "Pull request channel full, dropping request");
                metrics::counter!("puller.dropped_total").increment(1);
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                warn!(count, "Pull request channel closed, dropping request");
                metrics::counter!("puller.dropped_total").increment(1);
            }
        }
    }
}

/// Puller that calls `POST {base_url}/request/{count}` on the producer.
#[derive(Clone)]
pub struct HttpPuller {
    client: Client,
    base_url: String,
}

impl HttpPuller {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build upstream HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn request_url(&self, count: usize) -> String {
        format!("{}/request/{}", self.base_url, count)
    }
}

impl Puller for HttpPuller {
    fn request_more(&self, count: usize) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(count, "No tokio runtime available, dropping pull request");
            return;
        };

        let client = self.client.clone();
        let url = self.request_url(count);
        runtime.spawn(async move {
            match client.post(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(count, "Requested more letters from upstream");
                }
                Ok(response) => {
                    warn!(count, status = %response.status(), "Upstream rejected pull request");
                    metrics::counter!("puller.http_error_total").increment(1);
                }
                Err(e) => {
                    warn!(count, error = %e, "Failed to send pull request upstream");
                    metrics::counter!("puller.http_error_total").increment(1);
                }
            }
        });
    }
}
