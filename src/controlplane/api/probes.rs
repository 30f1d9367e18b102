//! Metrics and Health Probes
//!
//! Plain hyper server exposing `/metrics` in the Prometheus text format and
//! the `/healthz` and `/readyz` probes.

use crate::error::{Error, Result};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{Encoder, Registry, TextEncoder};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// State shared by probe requests
#[derive(Clone)]
pub struct ProbeState {
    pub registry: Registry,
    /// Set once every component is running
    pub ready: Arc<AtomicBool>,
}

impl ProbeState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

/// Serve probes on `addr` until `shutdown` fires
pub async fn run_probe_server(
    addr: SocketAddr,
    state: ProbeState,
    shutdown: CancellationToken,
) -> Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(respond(req.uri().path(), &state)) }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Failed to bind metrics server: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}

fn respond(path: &str, state: &ProbeState) -> Response<Body> {
    match path {
        "/metrics" => {
            let encoder = TextEncoder::new();
            let mut buffer = Vec::new();
            match encoder.encode(&state.registry.gather(), &mut buffer) {
                Ok(()) => {
                    let mut response = Response::new(Body::from(buffer));
                    if let Ok(value) = encoder.format_type().parse() {
                        response
                            .headers_mut()
                            .insert(hyper::header::CONTENT_TYPE, value);
                    }
                    response
                }
                Err(e) => {
                    error!("Failed to encode metrics: {}", e);
                    text(StatusCode::INTERNAL_SERVER_ERROR, "encoding failed")
                }
            }
        }
        "/healthz" | "/livez" => text(StatusCode::OK, "ok"),
        "/readyz" => {
            if state.ready.load(Ordering::SeqCst) {
                text(StatusCode::OK, "ok")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "starting")
            }
        }
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
