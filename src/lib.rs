//! bigbro - letter intake with quota-limited admission control
//!
//! Letters arrive over HTTP, are decoded on a bounded worker pool (or a
//! bounded-concurrency stream) and forwarded to a sink. An admission policy
//! decides when to ask the upstream producer for more letters, and a quota
//! caps how many eager requests the service may make.

pub mod admission;
pub mod config;
pub mod config_watch;
pub mod ingest;
pub mod letter;
pub mod log_format;
pub mod metrics;
pub mod puller;
pub mod quota;
pub mod sink;
pub mod web;
pub mod worker_pool;

pub use admission::{AdmissionLoop, AdmissionPolicy, QueueDepth};
pub use config::{AdmissionConfig, IngestMode};
pub use ingest::{IngestReport, PooledIngest, StreamDepth, StreamingIngest, StreamingOptions};
pub use letter::{DecodedLetter, Decoder, HexDecoder, Letter};
pub use puller::Puller;
pub use quota::QuotaGate;
pub use sink::Sink;
pub use worker_pool::WorkerPool;
