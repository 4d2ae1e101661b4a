//! Letter ingestion: decode, maybe pull more, forward to the sink.
//!
//! [`PooledIngest`] runs one worker-pool task per letter. [`StreamingIngest`]
//! decodes a whole stream with at most `capacity` decodes in flight and
//! reports its backlog through [`StreamDepth`]. Both use the same
//! [`AdmissionPolicy`], so they only differ in how letters are dispatched.

use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, error, warn};

use crate::admission::{AdmissionPolicy, QueueDepth};
use crate::letter::{Decoder, Letter};
use crate::sink::Sink;
use crate::worker_pool::{SubmitError, WorkerPool};

/// Optional steps of the streaming path. Both are off by default, which
/// leaves the admission loop as the only source of pull requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingOptions {
    /// Forward decoded letters to the sink.
    pub forward_to_sink: bool,
    /// Run the per-letter eager pull, consuming quota like the pooled path.
    pub eager_pull: bool,
}

/// Outcome of one streamed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub received: usize,
    pub decoded: usize,
    pub failed: usize,
    pub forwarded: usize,
}

/// One task per letter on the worker pool.
#[derive(Clone)]
pub struct PooledIngest {
    pool: Arc<WorkerPool>,
    policy: AdmissionPolicy,
    decoder: Arc<dyn Decoder>,
    sink: Arc<dyn Sink>,
}

impl PooledIngest {
    pub fn new(
        pool: Arc<WorkerPool>,
        policy: AdmissionPolicy,
        decoder: Arc<dyn Decoder>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            pool,
            policy,
            decoder,
            sink,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Queue a letter for processing. Returns once the task is queued.
    pub async fn ingest(&self, letter: Letter) -> Result<(), SubmitError> {
        let policy = self.policy.clone();
        let decoder = self.decoder.clone();
        let sink = self.sink.clone();
        self.pool
            .submit(Box::pin(async move {
                process_letter(letter, decoder.as_ref(), &policy, sink.as_ref()).await;
            }))
            .await?;

        metrics::counter!("letter.rps").increment(1);
        Ok(())
    }
}

/// Decode, pull if the queue has drained, then forward.
///
/// This runs after the task was dequeued, so a pending count of zero means no
/// other letter is waiting.
async fn process_letter(
    letter: Letter,
    decoder: &dyn Decoder,
    policy: &AdmissionPolicy,
    sink: &dyn Sink,
) {
    let decoded = match decoder.decode(&letter) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!(writer = %letter.writer, error = %e, "Failed to decode letter, dropping");
            metrics::counter!("letters.decode_failed_total").increment(1);
            return;
        }
    };
    metrics::counter!("letters.decoded_total").increment(1);
    debug!(author = %decoded.author, "Decoded letter");

    policy.admit();

    sink.send(decoded).await;
    metrics::counter!("letters.forwarded_total").increment(1);
}

/// Backlog of the streaming path: letters taken off an inbound stream whose
/// decode has not finished yet. Never exceeds `capacity` per stream.
#[derive(Debug)]
pub struct StreamDepth {
    outstanding: AtomicUsize,
    capacity: usize,
}

impl StreamDepth {
    pub fn new(capacity: usize) -> Self {
        Self {
            outstanding: AtomicUsize::new(0),
            capacity: capacity.max(1),
        }
    }

    fn track(self: &Arc<Self>) -> Outstanding {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        Outstanding(self.clone())
    }
}

impl QueueDepth for StreamDepth {
    fn pending_count(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Counts one letter as outstanding until dropped, so a cancelled stream
/// does not leave the depth stuck above zero.
struct Outstanding(Arc<StreamDepth>);

impl Drop for Outstanding {
    fn drop(&mut self) {
        self.0.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded-concurrency decoding of a letter stream.
#[derive(Clone)]
pub struct StreamingIngest {
    policy: AdmissionPolicy,
    depth: Arc<StreamDepth>,
    decoder: Arc<dyn Decoder>,
    sink: Arc<dyn Sink>,
    options: StreamingOptions,
}

impl StreamingIngest {
    /// `depth` should be the same tracker the policy reads, so the idle
    /// probe sees decodes in flight.
    pub fn new(
        policy: AdmissionPolicy,
        depth: Arc<StreamDepth>,
        decoder: Arc<dyn Decoder>,
        sink: Arc<dyn Sink>,
        options: StreamingOptions,
    ) -> Self {
        Self {
            policy,
            depth,
            decoder,
            sink,
            options,
        }
    }

    pub fn options(&self) -> StreamingOptions {
        self.options
    }

    pub fn depth(&self) -> &StreamDepth {
        &self.depth
    }

    /// Maximum number of decodes in flight.
    pub fn concurrency(&self) -> usize {
        self.depth.capacity()
    }

    /// Decode every letter of `letters` on the blocking pool, never running
    /// more than [`concurrency`](Self::concurrency) decodes at once. Letters
    /// beyond that wait in the source stream.
    pub async fn ingest_stream<S>(&self, letters: S) -> IngestReport
    where
        S: Stream<Item = Letter> + Send,
    {
        let decoder = self.decoder.clone();
        let depth = self.depth.clone();
        let decoded = letters
            .map(move |letter| {
                metrics::counter!("letter.rps").increment(1);
                let outstanding = depth.track();
                let decoder = decoder.clone();
                let writer = letter.writer.clone();
                async move {
                    let result = tokio::task::spawn_blocking(move || decoder.decode(&letter)).await;
                    drop(outstanding);
                    (writer, result)
                }
            })
            .buffer_unordered(self.concurrency());
        let mut decoded = std::pin::pin!(decoded);

        let mut report = IngestReport::default();
        while let Some((writer, result)) = decoded.next().await {
            report.received += 1;
            let letter = match result {
                Ok(Ok(letter)) => letter,
                Ok(Err(e)) => {
                    warn!(writer = %writer, error = %e, "Failed to decode letter, dropping");
                    metrics::counter!("letters.decode_failed_total").increment(1);
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    error!(writer = %writer, error = %e, "Decode task failed");
                    metrics::counter!("letters.decode_failed_total").increment(1);
                    report.failed += 1;
                    continue;
                }
            };
            report.decoded += 1;
            metrics::counter!("letters.decoded_total").increment(1);

            if self.options.eager_pull {
                self.policy.admit();
            }
            if self.options.forward_to_sink {
                self.sink.send(letter).await;
                metrics::counter!("letters.forwarded_total").increment(1);
                report.forwarded += 1;
            }
        }

        debug!(
            received = report.received,
            decoded = report.decoded,
            failed = report.failed,
            "Letter stream finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::QueueDepth;
    use crate::letter::{DecodedLetter, HexDecoder};
    use crate::puller::ChannelPuller;
    use crate::quota::QuotaGate;
    use async_trait::async_trait;
    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

    struct IdleDepth(usize);

    impl QueueDepth for IdleDepth {
        fn pending_count(&self) -> usize {
            0
        }

        fn capacity(&self) -> usize {
            self.0
        }
    }

    struct ChannelSink(flume::Sender<DecodedLetter>);

    #[async_trait]
    impl Sink for ChannelSink {
        async fn send(&self, letter: DecodedLetter) {
            let _ = self.0.send(letter);
        }
    }

    fn streaming(
        quota: u64,
        options: StreamingOptions,
    ) -> (
        StreamingIngest,
        flume::Receiver<crate::puller::PullRequest>,
        flume::Receiver<DecodedLetter>,
    ) {
        let (puller, pulls) = ChannelPuller::channel(64);
        let (sink_tx, sink_rx) = flume::unbounded();
        let policy = AdmissionPolicy::new(
            Arc::new(QuotaGate::new(quota)),
            Arc::new(IdleDepth(4)),
            Arc::new(puller),
        );
        let ingest = StreamingIngest::new(
            policy,
            Arc::new(StreamDepth::new(4)),
            Arc::new(HexDecoder),
            Arc::new(ChannelSink(sink_tx)),
            options,
        );
        (ingest, pulls, sink_rx)
    }

    fn letters(count: usize) -> Vec<Letter> {
        (0..count)
            .map(|i| Letter::encode(format!("writer-{}", i), "Airstrip One", "ok"))
            .collect()
    }

    #[tokio::test]
    async fn test_stream_defaults_decode_only() {
        let (ingest, pulls, sink_rx) = streaming(5, StreamingOptions::default());

        let report = ingest
            .ingest_stream(futures_util::stream::iter(letters(6)))
            .await;

        assert_eq!(report.received, 6);
        assert_eq!(report.decoded, 6);
        assert_eq!(report.forwarded, 0);
        assert!(pulls.is_empty());
        assert!(sink_rx.is_empty());
    }

    #[tokio::test]
    async fn test_stream_toggles_enable_pull_and_forward() {
        let options = StreamingOptions {
            forward_to_sink: true,
            eager_pull: true,
        };
        let (ingest, pulls, sink_rx) = streaming(2, options);

        let report = ingest
            .ingest_stream(futures_util::stream::iter(letters(3)))
            .await;

        assert_eq!(report.forwarded, 3);
        assert_eq!(sink_rx.len(), 3);
        // Quota of two caps the eager pulls
        assert_eq!(pulls.len(), 2);
    }

    #[tokio::test]
    async fn test_stream_counts_decode_failures() {
        let (ingest, _pulls, _sink_rx) = streaming(1, StreamingOptions::default());
        let mut batch = letters(2);
        batch.push(Letter {
            writer: "Goldstein".to_string(),
            location: String::new(),
            body: "zz".to_string(),
        });

        let report = ingest.ingest_stream(futures_util::stream::iter(batch)).await;

        assert_eq!(report.received, 3);
        assert_eq!(report.decoded, 2);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn test_stream_depth_returns_to_zero() {
        let (ingest, _pulls, _sink_rx) = streaming(1, StreamingOptions::default());
        assert_eq!(ingest.depth().pending_count(), 0);
        assert_eq!(ingest.concurrency(), 4);

        let report = ingest
            .ingest_stream(futures_util::stream::iter(letters(9)))
            .await;

        assert_eq!(report.decoded, 9);
        assert_eq!(ingest.depth().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_depth() {
        let (ingest, _pulls, _sink_rx) = streaming(1, StreamingOptions::default());

        // A stream that never ends, abandoned mid-flight like a dropped request
        let endless = futures_util::stream::repeat(Letter::encode("Syme", "", "words"));
        let _ = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            ingest.ingest_stream(endless),
        )
        .await;

        assert_eq!(ingest.depth().pending_count(), 0);
    }

    fn rendered_value(handle: &PrometheusHandle, name: &str) -> Option<f64> {
        handle
            .render()
            .lines()
            .find(|line| line.starts_with(&format!("{} ", name)))
            .and_then(|line| line.rsplit(' ').next())
            .and_then(|value| value.parse().ok())
    }

    #[tokio::test]
    async fn test_rejected_letter_is_not_counted() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        let pool = Arc::new(WorkerPool::new("rps-test", 1, None));
        let (puller, _pulls) = ChannelPuller::channel(4);
        let policy = AdmissionPolicy::new(
            Arc::new(QuotaGate::new(0)),
            pool.clone(),
            Arc::new(puller),
        );
        let (sink_tx, _sink_rx) = flume::unbounded();
        let ingest = PooledIngest::new(
            pool.clone(),
            policy,
            Arc::new(HexDecoder),
            Arc::new(ChannelSink(sink_tx)),
        );

        ingest.ingest(Letter::encode("Winston", "", "in")).await.unwrap();
        assert!(pool.shutdown(std::time::Duration::from_secs(5)).await);
        let rejected = ingest.ingest(Letter::encode("Julia", "", "out")).await;

        assert_eq!(rejected, Err(SubmitError::Closed("rps-test".to_string())));
        assert_eq!(rendered_value(&handle, "letter_rps"), Some(1.0));
    }

    #[test]
    fn test_streaming_options_from_partial_toml() {
        let options: StreamingOptions = toml::from_str("forward_to_sink = true").unwrap();
        assert!(options.forward_to_sink);
        assert!(!options.eager_pull);
    }
}
