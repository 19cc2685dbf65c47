//! The DLX request path.
//!
//! ```text
//! request ──► resolve headers ──► registry lookup ──► Activator::admit
//!                                  (deadline starts)   (slot lock, bounded)
//!                                                       │
//!                      Serving ◄────────────────────────┤
//!                         │                             ▼
//!                         │                  Hold (gate permit or 503)
//!                         │                             │
//!                         │             wait_for_readiness (504 on timeout)
//!                         ▼                             │
//!                      forward ◄────────────────────────┘
//! ```

use std::future::IntoFuture;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Uri, Version, header};
use axum::response::{IntoResponse, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use zeroscale_autoscale::{Activator, Admission};
use zeroscale_state::{
    DlxOptions, MetricsError, MetricsSource, Registry, Sample, TimeRange, duration_millis,
    wait_for_readiness,
};

use crate::counter::RequestCounter;
use crate::error::DlxError;
use crate::gate::HoldGate;

type HttpClient = Client<HttpConnector, Body>;

#[derive(Clone)]
pub struct Dlx {
    registry: Registry,
    activator: Activator,
    counter: RequestCounter,
    gate: HoldGate,
    client: HttpClient,
    options: Arc<DlxOptions>,
}

impl Dlx {
    pub fn new(
        registry: Registry,
        activator: Activator,
        counter: RequestCounter,
        options: DlxOptions,
    ) -> Self {
        let client = Client::<(), ()>::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self {
            registry,
            activator,
            counter,
            gate: HoldGate::new(options.max_held_requests),
            client,
            options: Arc::new(options),
        }
    }

    pub fn counter(&self) -> &RequestCounter {
        &self.counter
    }

    pub fn gate(&self) -> &HoldGate {
        &self.gate
    }

    /// Every path and method is proxied.
    pub fn router(&self) -> Router {
        Router::new().fallback(proxy).with_state(self.clone())
    }

    /// Route one request, holding it while its resource scales from zero.
    pub async fn handle(&self, req: Request) -> Result<Response, DlxError> {
        let resource = required_header(req.headers(), &self.options.target_name_header)?;
        let path = required_header(req.headers(), &self.options.target_path_header)?;
        if !path.starts_with('/') {
            return Err(DlxError::InvalidHeader {
                header: self.options.target_path_header.clone(),
                reason: "path must start with '/'".into(),
            });
        }

        // One deadline covers waiting for the slot and for readiness.
        let timeout = self.options.readiness_timeout;
        let deadline = Instant::now() + timeout;
        let not_ready = || DlxError::ReadinessTimeout {
            resource: resource.clone(),
            timeout,
        };

        let slot = self
            .registry
            .get(&resource)
            .await
            .ok_or_else(|| DlxError::UnknownResource(resource.clone()))?;

        let admission = {
            let mut record = tokio::time::timeout_at(deadline, slot.lock())
                .await
                .map_err(|_| not_ready())?;
            if !self.registry.holds(&resource, &slot).await {
                return Err(DlxError::UnknownResource(resource.clone()));
            }
            self.counter.increment(&resource).await;
            self.activator.admit(&mut record)?
        };

        if let Admission::Hold { episode, readiness } = admission {
            let permit = self
                .gate
                .try_hold(&resource)
                .await
                .ok_or_else(|| DlxError::Backpressure(resource.clone()))?;
            debug!(%resource, episode, "holding request until ready");
            let remaining = deadline.saturating_duration_since(Instant::now());
            wait_for_readiness(readiness, &resource, episode, remaining)
                .await
                .map_err(|e| match DlxError::from(e) {
                    DlxError::ReadinessTimeout { .. } => not_ready(),
                    other => other,
                })?;
            drop(permit);
        }

        self.forward(&resource, &path, req).await
    }

    async fn forward(&self, resource: &str, path: &str, req: Request) -> Result<Response, DlxError> {
        let authority = self.options.target_authority(resource);
        let invalid = |reason: String| DlxError::InvalidHeader {
            header: self.options.target_path_header.clone(),
            reason,
        };
        let uri: Uri = format!("http://{authority}{path}")
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| invalid(e.to_string()))?;
        let host = HeaderValue::from_str(&authority).map_err(|e| invalid(e.to_string()))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;
        parts.headers.insert(header::HOST, host);

        let response = self
            .client
            .request(Request::from_parts(parts, body))
            .await
            .map_err(|e| DlxError::Upstream {
                authority: authority.clone(),
                reason: e.to_string(),
            })?;
        debug!(%resource, %authority, status = %response.status(), "forwarded");
        Ok(response.map(Body::new))
    }

    /// Serve until shutdown, then let held requests drain for at most
    /// `drain_timeout`.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        let drain_timeout = self.options.drain_timeout;
        info!(addr = %listener.local_addr()?, "dlx listening");

        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_requested(shutdown.clone()))
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            result = &mut server => result,
            _ = async {
                shutdown_requested(shutdown).await;
                info!("dlx draining held requests");
                tokio::time::sleep(drain_timeout).await;
            } => {
                warn!(drain_timeout_ms = duration_millis(drain_timeout), "drain timeout elapsed, dropping open requests");
                Ok(())
            }
        }
    }
}

/// The DLX serves the request metric from its counter. Forgetting a
/// removed resource also drops its hold gate.
#[async_trait]
impl MetricsSource for Dlx {
    async fn query(
        &self,
        resource: &str,
        metric: &str,
        range: TimeRange,
    ) -> Result<Vec<Sample>, MetricsError> {
        self.counter.query(resource, metric, range).await
    }

    async fn forget(&self, resource: &str) {
        self.counter.forget(resource).await;
        self.gate.forget(resource).await;
    }
}

async fn proxy(State(dlx): State<Dlx>, req: Request) -> Response {
    match dlx.handle(req).await {
        Ok(response) => response,
        Err(e) => {
            match &e {
                DlxError::Upstream { .. } | DlxError::Scale(_) | DlxError::ActivationFailed { .. } => {
                    warn!(error = %e, "request failed")
                }
                _ => debug!(error = %e, "request rejected"),
            }
            e.into_response()
        }
    }
}

fn required_header(headers: &HeaderMap, name: &str) -> Result<String, DlxError> {
    let value = headers
        .get(name)
        .ok_or_else(|| DlxError::MissingHeader(name.to_string()))?;
    let value = value.to_str().map_err(|e| DlxError::InvalidHeader {
        header: name.to_string(),
        reason: e.to_string(),
    })?;
    if value.is_empty() {
        return Err(DlxError::MissingHeader(name.to_string()));
    }
    Ok(value.to_string())
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
