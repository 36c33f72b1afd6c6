//! Axum middleware wiring the admission filter into the request pipeline.

use axum::extract::{Query, Request, State};
use axum::http::{StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::FutureExt;
use serde_json::json;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument};

use super::{AdmissionFilter, Decision};

/// Body message of a request whose handling panicked.
pub const INTERNAL_ERROR_MSG: &str = "Internal Server Error";

/// Decoded query pairs of a URI, in order. An unparsable query yields none.
pub fn query_pairs(uri: &Uri) -> Vec<(String, String)> {
    Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map(|Query(pairs)| pairs)
        .unwrap_or_default()
}

/// Run the admission filter before the handler.
///
/// Admitted requests continue down the stack; rejected ones are answered
/// here with the rejection status and a `{"msg": ...}` body.
#[instrument(
    skip_all,
    fields(method = %request.method(), path = %request.uri().path())
)]
pub async fn admission_middleware(
    State(filter): State<Arc<AdmissionFilter>>,
    request: Request,
    next: Next,
) -> Response {
    let query = query_pairs(request.uri());
    let decision = filter.evaluate(request.uri().path(), &query).await;

    match decision {
        Decision::Admit => next.run(request).await,
        Decision::Reject(rejection) => {
            (rejection.status, Json(json!({ "msg": rejection.message }))).into_response()
        }
    }
}

/// Answer 500 instead of dropping the connection when anything further
/// down the stack panics.
pub async fn recover_panics(request: Request, next: Next) -> Response {
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!(panic = %panic_message(&*panic), "Request handler panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "msg": INTERNAL_ERROR_MSG })),
            )
                .into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Log each request's status and latency.
pub async fn log_requests(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    info!(
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}
