//! Admin endpoint for inspecting and nudging the router configurer.
//!
//! - `GET /healthz` answers `ok` while the process is up.
//! - `GET /routes` returns the published routing snapshot as JSON.
//! - `POST /sync` requests a full resync; requests coalesce with pending ones.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::syncer::SyncRequest;
use crate::updater::UpdaterHandle;

/// What the admin handlers can reach.
pub struct AdminState {
    updater: UpdaterHandle,
    sync_requests: mpsc::Sender<SyncRequest>,
}

impl AdminState {
    /// Shared state for the admin handlers.
    pub fn new(updater: UpdaterHandle, sync_requests: mpsc::Sender<SyncRequest>) -> Arc<Self> {
        Arc::new(Self {
            updater,
            sync_requests,
        })
    }
}

/// Serves admin requests on `listener` until shutdown.
pub async fn start_admin_server(
    listener: TcpListener,
    state: Arc<AdminState>,
    shutdown: CancellationToken,
) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(address = %addr, "admin endpoint listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to accept admin connection");
                    continue;
                }
            },
        };

        let io = TokioIo::new(stream);
        let state = state.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(peer = %peer, error = %err, "error serving admin connection");
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<AdminState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    tracing::debug!(method = %req.method(), uri = %req.uri(), "admin request");

    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => text(StatusCode::OK, "ok"),
        (&Method::GET, "/routes") => {
            let snapshot = state.updater.snapshot();
            match serde_json::to_vec(&*snapshot) {
                Ok(body) => respond(StatusCode::OK, "application/json", body.into()),
                Err(err) => {
                    tracing::error!(error = %err, "failed to encode routing snapshot");
                    text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                }
            }
        }
        (&Method::POST, "/sync") => match state.sync_requests.try_send(SyncRequest) {
            Ok(()) | Err(TrySendError::Full(_)) => text(StatusCode::ACCEPTED, "sync requested"),
            Err(TrySendError::Closed(_)) => {
                text(StatusCode::SERVICE_UNAVAILABLE, "sync is not running")
            }
        },
        (_, "/healthz" | "/routes" | "/sync") => {
            text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    respond(status, "text/plain; charset=utf-8", Bytes::from_static(body.as_bytes()))
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
