//! ---
//! ha_section: "05-networking-external-interfaces"
//! ha_subsection: "module"
//! ha_type: "source"
//! ha_scope: "code"
//! ha_description: "REST health projection over the arbiter state."
//! ha_version: "v0.1.0"
//! ha_owner: "tbd"
//! ---
//! Small read-only HTTP surface for load balancers and operators.
//! `/health` collapses the connectivity snapshot into a single verdict;
//! `/status` dumps the full arbiter state.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use ha_core::{Arbiter, HealthSnapshot, StatusSnapshot};

/// Read-only view the REST layer projects. Implemented by the arbiter;
/// tests substitute a fixture.
pub trait HealthProvider: Send + Sync + 'static {
    /// Connectivity verdict for the health endpoint.
    fn health(&self) -> HealthSnapshot;
    /// Full state for the status endpoint.
    fn status(&self) -> StatusSnapshot;
}

impl HealthProvider for Arbiter {
    fn health(&self) -> HealthSnapshot {
        Arbiter::health(self)
    }

    fn status(&self) -> StatusSnapshot {
        Arbiter::status(self)
    }
}

/// Builder for the REST listener.
pub struct RestApiBuilder {
    listen: SocketAddr,
    provider: Arc<dyn HealthProvider>,
}

impl RestApiBuilder {
    pub fn new(listen: SocketAddr, provider: Arc<dyn HealthProvider>) -> Self {
        Self { listen, provider }
    }

    /// Bind and serve until the handle signals shutdown.
    pub async fn spawn(self) -> Result<RestApiHandle> {
        let listener = TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("binding rest listener on {}", self.listen))?;
        let address = listener.local_addr()?;

        let router = Router::new()
            .route("/health", get(health).post(health))
            .route("/status", get(status))
            .layer(CorsLayer::permissive())
            .with_state(self.provider);

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        info!(address = %address, "rest api listening");
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = serve.await {
                warn!(error = %err, "rest api exited with error");
            } else {
                debug!("rest api stopped");
            }
        });

        Ok(RestApiHandle {
            address,
            shutdown,
            task,
        })
    }
}

/// Running REST server.
pub struct RestApiHandle {
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RestApiHandle {
    /// Actual bound address, useful with port 0.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Request shutdown and wait for in-flight requests to drain.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn health(State(provider): State<Arc<dyn HealthProvider>>) -> Response {
    let snapshot = provider.health();
    if snapshot.is_ok() {
        (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "not ok",
                "ecs": snapshot.ecs,
                "fleet": snapshot.fleet,
            })),
        )
            .into_response()
    }
}

async fn status(State(provider): State<Arc<dyn HealthProvider>>) -> Response {
    Json(provider.status()).into_response()
}
