use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::stats::Collector;

/// Serves `/metrics` and `/healthz` for the relay process.
pub struct HealthServer {
    addr: String,
    collector: Collector,
}

impl HealthServer {
    pub fn new(addr: &str, collector: Collector) -> Self {
        Self {
            addr: addr.to_string(),
            collector,
        }
    }

    /// Binds the listener and spawns the serving task.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(self.collector.clone());

        let listener = TcpListener::bind(&self.addr)
            .await
            .with_context(|| format!("binding health server on {}", self.addr))?;

        info!(addr = %self.addr, "health server listening");

        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(cancel.cancelled_owned())
                .await
            {
                warn!(error = %e, "health server terminated");
            }
        });

        Ok(())
    }
}

async fn metrics_handler(State(collector): State<Collector>) -> impl IntoResponse {
    match collector.prometheus_output() {
        Ok(buffer) => (StatusCode::OK, buffer).into_response(),
        Err(e) => {
            warn!(error = %e, "metrics encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding error").into_response()
        }
    }
}

async fn healthz_handler() -> &'static str {
    "OK"
}
