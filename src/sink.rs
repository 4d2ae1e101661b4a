//! Downstream destinations for decoded letters.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

use crate::letter::DecodedLetter;

/// Receives decoded letters. Delivery failures stay inside the sink.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, letter: DecodedLetter);
}

/// Logs every decoded letter.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn send(&self, letter: DecodedLetter) {
        info!(
            author = %letter.author,
            location = %letter.location,
            "decoded letter: {}",
            letter.content
        );
    }
}

/// Posts decoded letters as JSON to a guard service.
#[derive(Clone)]
pub struct HttpSink {
    client: Client,
    url: String,
}

impl HttpSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build sink HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn send(&self, letter: DecodedLetter) {
        match self.client.post(&self.url).json(&letter).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), author = %letter.author, "Sink rejected letter");
                metrics::counter!("sink.http_error_total").increment(1);
            }
            Err(e) => {
                warn!(error = %e, author = %letter.author, "Failed to deliver letter to sink");
                metrics::counter!("sink.http_error_total").increment(1);
            }
        }
    }
}
