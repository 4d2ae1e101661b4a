//! Admission control: when to ask the upstream producer for more letters.
//!
//! Two callers share one [`AdmissionPolicy`]:
//! - the [`AdmissionLoop`], a periodic probe that re-requests work whenever the
//!   worker queue has drained and quota is left, without consuming quota;
//! - the ingest paths, which pull eagerly per letter and consume one unit of
//!   quota for every pull they issue.
//!
//! The queue-depth reading is racy against concurrent submissions. Both call
//! sites treat "queue drained" as a hint, and an extra pull request is
//! harmless.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::puller::Puller;
use crate::quota::QuotaGate;
use crate::worker_pool::WorkerPool;

/// Read-only view of the local work queue.
pub trait QueueDepth: Send + Sync {
    /// Items waiting for a worker. Zero means idle or fully draining.
    fn pending_count(&self) -> usize;
    /// Fixed maximum concurrency, used as the pull request size.
    fn capacity(&self) -> usize;
}

impl QueueDepth for WorkerPool {
    fn pending_count(&self) -> usize {
        WorkerPool::pending_count(self)
    }

    fn capacity(&self) -> usize {
        WorkerPool::capacity(self)
    }
}

/// Who triggered a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullSource {
    Probe,
    Ingest,
}

impl PullSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PullSource::Probe => "probe",
            PullSource::Ingest => "ingest",
        }
    }
}

#[derive(Clone)]
pub struct AdmissionPolicy {
    quota: Arc<QuotaGate>,
    depth: Arc<dyn QueueDepth>,
    puller: Arc<dyn Puller>,
}

impl AdmissionPolicy {
    pub fn new(quota: Arc<QuotaGate>, depth: Arc<dyn QueueDepth>, puller: Arc<dyn Puller>) -> Self {
        Self {
            quota,
            depth,
            puller,
        }
    }

    pub fn quota(&self) -> &QuotaGate {
        &self.quota
    }

    pub fn depth(&self) -> &dyn QueueDepth {
        self.depth.as_ref()
    }

    /// Idle probe: pull when the queue is empty and quota is left.
    ///
    /// Reads the quota without consuming it. Returns whether a pull was issued.
    pub fn probe(&self) -> bool {
        if self.depth.pending_count() == 0 && self.quota.remaining() > 0 {
            self.pull(PullSource::Probe);
            true
        } else {
            false
        }
    }

    /// Eager per-letter pull: when the queue is empty, consume one unit of
    /// quota and pull. Quota is untouched while the queue is busy.
    pub fn admit(&self) -> bool {
        if self.depth.pending_count() == 0 && self.quota.try_consume() {
            self.pull(PullSource::Ingest);
            true
        } else {
            false
        }
    }

    fn pull(&self, source: PullSource) {
        let count = self.depth.capacity();
        metrics::counter!("admission.pull_requests_total", "source" => source.as_str())
            .increment(1);
        debug!(
            source = source.as_str(),
            count,
            remaining = self.quota.remaining(),
            "Requesting more letters"
        );
        self.puller.request_more(count);
    }
}

/// Periodic safety net that keeps the pipe full when no letter arrives to
/// trigger an eager pull.
pub struct AdmissionLoop {
    policy: AdmissionPolicy,
    period: Duration,
}

impl AdmissionLoop {
    pub fn new(policy: AdmissionPolicy, period: Duration) -> Self {
        Self { policy, period }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Probe once per period until `cancel` fires. The first probe happens
    /// immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            period_ms = self.period.as_millis() as u64,
            "Admission loop started"
        );

        let mut ticks = 0u64;
        let mut pulls = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            ticks += 1;

            match std::panic::catch_unwind(AssertUnwindSafe(|| self.policy.probe())) {
                Ok(true) => pulls += 1,
                Ok(false) => {}
                Err(_) => {
                    error!(tick = ticks, "Admission probe panicked, continuing");
                    metrics::counter!("admission.probe_panics_total").increment(1);
                }
            }
            self.policy.quota().publish();
        }

        info!(ticks, pulls, "Admission loop stopped");
    }
}
