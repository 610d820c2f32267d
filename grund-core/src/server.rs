//! Operational HTTP surface.
//!
//! Serves the health endpoints load balancers and orchestrators poll,
//! plus the textual metrics export. One task per connection, stopped
//! through the same cooperative signal as the other background loops.

use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connections::ConnectionManager;
use crate::errors::ServiceError;
use crate::health::HealthRegistry;
use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone)]
pub struct OpsServerConfig {
    pub listen_addr: SocketAddr,
}

impl OpsServerConfig {
    pub fn from_config(config: &Config) -> Result<Self, ServiceError> {
        let listen_addr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .map_err(|_| {
                ServiceError::configuration(format!(
                    "invalid server address {}:{}",
                    config.server.host, config.server.port
                ))
            })?;
        Ok(Self { listen_addr })
    }
}

impl Default for OpsServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8099)),
        }
    }
}

/// Health and metrics endpoints for one service process.
pub struct OpsServer {
    config: OpsServerConfig,
    service: String,
    metrics: Arc<MetricsRegistry>,
    health: Arc<HealthRegistry>,
    connections: Arc<ConnectionManager>,
}

impl OpsServer {
    pub fn new(
        config: OpsServerConfig,
        service: &str,
        metrics: Arc<MetricsRegistry>,
        health: Arc<HealthRegistry>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            service: service.to_string(),
            metrics,
            health,
            connections,
        }
    }

    /// Bind the configured address. Split from [`OpsServer::run`] so
    /// callers can learn the bound port when configured with port 0.
    pub async fn bind(&self) -> Result<TcpListener, ServiceError> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "operational http server listening");
        }
        Ok(listener)
    }

    pub async fn serve(self: Arc<Self>, stop: watch::Receiver<bool>) -> Result<(), ServiceError> {
        let listener = self.bind().await?;
        self.run(listener, stop).await;
        Ok(())
    }

    /// Accept loop. Exits when the stop signal flips; in-flight
    /// connections finish on their own tasks.
    pub async fn run(self: Arc<Self>, listener: TcpListener, mut stop: watch::Receiver<bool>) {
        loop {
            let (stream, remote_addr) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!(error = %err, "failed to accept connection");
                        continue;
                    }
                },
                _ = stop.changed() => {
                    debug!("operational http server stopping");
                    break;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req: Request<Incoming>| {
                    let server = Arc::clone(&server);
                    async move { Ok::<_, hyper::Error>(server.handle(req).await) }
                });
                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    debug!(remote = %remote_addr, error = %err, "connection error");
                }
            });
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let path = req.uri().path();
        debug!(method = %req.method(), path = %path, "http request");

        if req.method() != Method::GET {
            return text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed\n");
        }

        match path {
            "/" => self.index(),
            "/health" => self.health_summary(true).await,
            "/health/detailed" => self.health_summary(false).await,
            "/health/ready" => self.readiness(),
            "/health/live" => json_response(StatusCode::OK, &json!({ "status": "alive" })),
            "/metrics" => text_response(StatusCode::OK, &self.metrics.export_text()),
            other => {
                warn!(path = %other, "unknown endpoint requested");
                text_response(StatusCode::NOT_FOUND, "not found\n")
            }
        }
    }

    fn index(&self) -> Response<Full<Bytes>> {
        let body = format!(
            "{} operational endpoints\n\n\
             /health          - cached health summary\n\
             /health/detailed - fresh health check\n\
             /health/ready    - readiness (required backends)\n\
             /health/live     - liveness\n\
             /metrics         - metrics export\n",
            self.service
        );
        text_response(StatusCode::OK, &body)
    }

    /// Overall summary. Serving while the worst component is anything
    /// short of unhealthy.
    async fn health_summary(&self, use_cache: bool) -> Response<Full<Bytes>> {
        let snapshot = self.health.check_all(use_cache).await;
        let status = if snapshot.overall_status.is_serving() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        match serde_json::to_value(&snapshot) {
            Ok(body) => json_response(status, &body),
            Err(err) => {
                error!(error = %err, "failed to serialize health snapshot");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error\n")
            }
        }
    }

    fn readiness(&self) -> Response<Full<Bytes>> {
        let ready = self.connections.ready();
        let status = if ready {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        let body = json!({
            "ready": ready,
            "backends": self.connections.all_health(),
        });
        json_response(status, &body)
    }
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
