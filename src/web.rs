use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::AdmissionPolicy;
use crate::ingest::{IngestReport, PooledIngest, StreamingIngest};
use crate::letter::Letter;

/// Ingest path behind the HTTP routes
#[derive(Clone)]
pub enum Ingest {
    Pooled(Arc<PooledIngest>),
    Streaming(Arc<StreamingIngest>),
}

#[derive(Clone)]
pub struct AppState {
    pub policy: AdmissionPolicy,
    pub ingest: Ingest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub mode: String,
    pub quota_remaining: u64,
    pub pending: usize,
    pub capacity: usize,
}

async fn health(State(state): State<AppState>) -> Json<HealthStatus> {
    let mode = match state.ingest {
        Ingest::Pooled(_) => "pooled",
        Ingest::Streaming(_) => "streaming",
    };
    Json(HealthStatus {
        mode: mode.to_string(),
        quota_remaining: state.policy.quota().remaining(),
        pending: state.policy.depth().pending_count(),
        capacity: state.policy.depth().capacity(),
    })
}

async fn analyse_letter(
    State(ingest): State<Arc<PooledIngest>>,
    Json(letter): Json<Letter>,
) -> Response {
    match ingest.ingest(letter).await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            warn!(error = %e, "Rejected letter");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

/// Longest accepted NDJSON line
const MAX_LETTER_LINE: usize = 64 * 1024;

/// Streams an NDJSON body (one letter per line) into the streaming ingest.
///
/// The body is read as letters are admitted, so a slow decode stage stalls
/// the request body instead of buffering it. Lines that are not a valid
/// letter count as failed.
async fn analyse_letters(
    State(ingest): State<Arc<StreamingIngest>>,
    body: Body,
) -> Json<IngestReport> {
    let chunks = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let reader = StreamReader::new(chunks);
    let malformed = Arc::new(AtomicUsize::new(0));

    let letters = {
        let malformed = malformed.clone();
        FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LETTER_LINE)).filter_map(
            move |line| {
                let letter = match line {
                    Ok(line) if line.trim().is_empty() => None,
                    Ok(line) => match serde_json::from_str::<Letter>(&line) {
                        Ok(letter) => Some(letter),
                        Err(e) => {
                            warn!(error = %e, "Skipping malformed letter line");
                            malformed.fetch_add(1, Ordering::Relaxed);
                            None
                        }
                    },
                    Err(e) => {
                        warn!(error = %e, "Failed to read letter line");
                        malformed.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                };
                std::future::ready(letter)
            },
        )
    };

    let mut report = ingest.ingest_stream(letters).await;
    let malformed = malformed.load(Ordering::Relaxed);
    report.received += malformed;
    report.failed += malformed;
    debug!(received = report.received, malformed, "Letter batch finished");
    Json(report)
}

// Middleware for request logging with correlation ID
async fn request_logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = Uuid::new_v4().simple().to_string()[..8].to_string();
    let start_time = Instant::now();

    debug!("Started {} {} [{}]", method, path, request_id);

    let response = next.run(request).await;

    debug!(
        "Completed {} {} [{}] {} in {:.2}ms",
        method,
        path,
        request_id,
        response.status().as_u16(),
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    response
}

/// Build the router. The letter route matches the configured ingest mode;
/// `/health` is always served.
pub fn router(state: AppState) -> Router {
    let letters = match &state.ingest {
        Ingest::Pooled(pooled) => Router::new()
            .route("/analyse/letter", post(analyse_letter))
            .with_state(pooled.clone()),
        Ingest::Streaming(streaming) => Router::new()
            .route("/analyse/letters", post(analyse_letters))
            .with_state(streaming.clone()),
    };

    Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(letters)
        .layer(middleware::from_fn(request_logging_middleware))
}

/// Serve until `cancel` fires, then finish in-flight requests.
pub async fn serve(listener: TcpListener, app: Router, cancel: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!("Listening for letters on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("HTTP server failed")
}
