//! HTTP server.

use axum::extract::State;
use axum::middleware;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::{json, Value};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};

use crate::error::{FloodgateError, Result};
use crate::filter::{
    admission_middleware, log_requests, recover_panics, AdmissionFilter, StatsSnapshot,
};

/// Build the application router with the admission filter in front of every route.
///
/// Outermost first: request logging, panic recovery, admission.
pub fn router(filter: Arc<AdmissionFilter>) -> Router {
    Router::new()
        .route("/resource", get(resource))
        .route("/stats", get(stats))
        .layer(middleware::from_fn_with_state(
            filter.clone(),
            admission_middleware,
        ))
        .layer(middleware::from_fn(recover_panics))
        .layer(middleware::from_fn(log_requests))
        .with_state(filter)
}

async fn resource() -> Json<Value> {
    Json(json!({ "msg": "Success" }))
}

async fn stats(State(filter): State<Arc<AdmissionFilter>>) -> Json<StatsSnapshot> {
    Json(filter.stats())
}

/// HTTP server hosting the filtered routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    filter: Arc<AdmissionFilter>,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, filter: Arc<AdmissionFilter>) -> Self {
        Self { addr, filter }
    }

    /// Serve until the process is killed.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            FloodgateError::Io(e)
        })?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(listener, router(self.filter))
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                FloodgateError::Io(e)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::filter::FailurePolicy;
    use crate::ratelimit::{Engine, LogTrim, RuleRegistry};
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn filter() -> Arc<AdmissionFilter> {
        let store = Arc::new(MemoryStore::new());
        let engine = Engine::new(store.clone(), Arc::new(SystemClock::new()), LogTrim::Full);
        Arc::new(AdmissionFilter::new(
            RuleRegistry::new(store),
            engine,
            FailurePolicy::FailOpen,
        ))
    }

    #[test]
    fn test_server_creation() {
        let addr: SocketAddr = "127.0.0.1:9005".parse().unwrap();
        let _server = HttpServer::new(addr, filter());
    }

    #[tokio::test]
    async fn test_resource_route() {
        let response = router(filter())
            .oneshot(Request::get("/resource").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, json!({ "msg": "Success" }));
    }

    #[tokio::test]
    async fn test_stats_route_counts_unmatched() {
        let filter = filter();
        let app = router(filter.clone());

        app.clone()
            .oneshot(Request::get("/resource").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let response = app
            .oneshot(Request::get("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: StatsSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats.unmatched, 2);
    }
}
