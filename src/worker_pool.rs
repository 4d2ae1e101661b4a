//! Fixed-capacity worker pool with an observable backlog.
//!
//! `capacity` worker tasks drain a shared flume channel of boxed futures, the
//! same way the intake workers pull raw messages off their queues. The
//! channel length is the pending-queue depth the admission policy looks at.
//!
//! With a bounded queue `submit` waits for free space, which pushes back on
//! whoever is feeding letters in. With an unbounded queue nothing is ever
//! rejected and throttling upstream pulls is the only backpressure.

use futures_util::FutureExt;
use futures_util::future::join_all;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Unit of work executed by a pool worker.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker pool '{0}' is shut down")]
    Closed(String),
    #[error("worker pool '{0}' queue is full")]
    Full(String),
}

pub struct WorkerPool {
    name: String,
    capacity: usize,
    sender: Mutex<Option<flume::Sender<Task>>>,
    receiver: flume::Receiver<Task>,
    active: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `capacity` workers on the current tokio runtime.
    ///
    /// `queue_capacity` bounds the backlog; `None` leaves it unbounded.
    pub fn new(name: impl Into<String>, capacity: usize, queue_capacity: Option<usize>) -> Self {
        let name = name.into();
        let capacity = capacity.max(1);
        let (sender, receiver) = match queue_capacity {
            Some(size) => flume::bounded::<Task>(size),
            None => flume::unbounded::<Task>(),
        };
        let active = Arc::new(AtomicUsize::new(0));

        let workers = (0..capacity)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    name.clone(),
                    receiver.clone(),
                    active.clone(),
                ))
            })
            .collect();

        info!(
            pool = %name,
            capacity,
            queue_capacity = ?queue_capacity,
            "Spawned worker pool"
        );

        Self {
            name,
            capacity,
            sender: Mutex::new(Some(sender)),
            receiver,
            active,
            workers: Mutex::new(workers),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of tasks running at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Tasks queued but not yet picked up by a worker.
    pub fn pending_count(&self) -> usize {
        self.receiver.len()
    }

    /// Tasks currently executing.
    pub fn in_flight(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Queue a task, waiting for room when the queue is bounded and full.
    pub async fn submit(&self, task: Task) -> Result<(), SubmitError> {
        let sender = self.sender()?;
        sender
            .send_async(task)
            .await
            .map_err(|_| SubmitError::Closed(self.name.clone()))?;
        self.report_depth();
        Ok(())
    }

    /// Queue a task without waiting.
    pub fn try_submit(&self, task: Task) -> Result<(), SubmitError> {
        let sender = self.sender()?;
        sender.try_send(task).map_err(|e| match e {
            flume::TrySendError::Full(_) => SubmitError::Full(self.name.clone()),
            flume::TrySendError::Disconnected(_) => SubmitError::Closed(self.name.clone()),
        })?;
        self.report_depth();
        Ok(())
    }

    /// Stop accepting tasks and wait for the workers to drain the queue.
    ///
    /// Returns `false` if the workers were still busy when `timeout` elapsed.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);

        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        if workers.is_empty() {
            return true;
        }

        tokio::time::timeout(timeout, join_all(workers)).await.is_ok()
    }

    fn sender(&self) -> Result<flume::Sender<Task>, SubmitError> {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(|| SubmitError::Closed(self.name.clone()))
    }

    fn report_depth(&self) {
        metrics::gauge!("worker_pool.queue.depth", "pool" => self.name.clone())
            .set(self.receiver.len() as f64);
    }
}

async fn run_worker(
    worker_id: usize,
    pool: String,
    receiver: flume::Receiver<Task>,
    active: Arc<AtomicUsize>,
) {
    while let Ok(task) = receiver.recv_async().await {
        active.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("worker_pool.active", "pool" => pool.clone()).increment(1.0);

        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!(pool = %pool, worker_id, "Worker task panicked");
            metrics::counter!("worker_pool.task_panics_total", "pool" => pool.clone())
                .increment(1);
        }

        active.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!("worker_pool.active", "pool" => pool.clone()).decrement(1.0);
        metrics::gauge!("worker_pool.queue.depth", "pool" => pool.clone())
            .set(receiver.len() as f64);
    }
    debug!(pool = %pool, worker_id, "Worker stopped");
}
