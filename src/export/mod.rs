pub mod health;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::iptables::Scanner;
use crate::metrics::{Accountant, Round};

/// Serves `/metrics`, `/healthz` and `/readyz`.
pub struct MetricsServer {
    addr: String,
    router: Router,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

/// Shared state for axum handlers.
struct AppState<S> {
    accountant: Arc<Accountant<S>>,
    /// Cancelled when a scrape hits an error the process must not survive.
    fatal: CancellationToken,
}

/// Routes for the exposition endpoints.
pub fn router<S: Scanner + 'static>(
    accountant: Arc<Accountant<S>>,
    fatal: CancellationToken,
) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler::<S>))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler::<S>))
        .with_state(Arc::new(AppState { accountant, fatal }))
}

impl MetricsServer {
    pub fn new<S: Scanner + 'static>(
        addr: &str,
        accountant: Arc<Accountant<S>>,
        fatal: CancellationToken,
    ) -> Self {
        Self {
            addr: addr.to_string(),
            router: router(accountant, fatal),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Routes served by this server.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Binds the listener and serves in the background. Returns the bound
    /// address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let bind_addr = bind_address(&self.addr);
        let app = self.router();

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expand the ":port" shorthand to all interfaces.
fn bind_address(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Run one scrape round and render it together with the diagnostics.
///
/// A failed or suppressed round still serves the diagnostic metrics.
pub async fn gather<S: Scanner>(
    accountant: &Accountant<S>,
    fatal: &CancellationToken,
) -> Vec<MetricFamily> {
    let mut families = match accountant.scrape().await {
        Ok(Round::Published(families)) => families,
        Ok(Round::Suppressed { .. }) => Vec::new(),
        Err(e) if e.is_fatal() => {
            tracing::error!(error = %e, "counter dump does not match the expected chain grammar");
            fatal.cancel();
            Vec::new()
        }
        Err(e) => {
            tracing::error!(error = %e, "error scanning for metrics");
            Vec::new()
        }
    };

    families.extend(accountant.health().registry().gather());
    families
}

/// Encode families in the Prometheus text format.
pub fn encode(families: &[MetricFamily]) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(families, &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler<S: Scanner + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    let families = gather(&state.accountant, &state.fatal).await;

    match encode(&families) {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            text,
        ),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /readyz - 200 once the resource cache has completed its first sync.
async fn readyz_handler<S: Scanner + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    if state.accountant.cache().is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "resource cache not synced")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_address_shorthand() {
        assert_eq!(bind_address(":9009"), "0.0.0.0:9009");
        assert_eq!(bind_address("127.0.0.1:9100"), "127.0.0.1:9100");
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(&[]).unwrap(), "");
    }
}
