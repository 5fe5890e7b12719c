//! Request metrics middleware
//!
//! Records per-route request counts, status codes and latency for the
//! `/metrics` endpoint.
//!
//! Author: hephaex@gmail.com

use crate::state::AppState;
use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use std::time::Instant;

/// Label for requests that matched no route, so probing clients cannot grow
/// the metrics table without bound
const UNMATCHED: &str = "unmatched";

pub async fn metrics_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let endpoint = endpoint_label(request.extensions().get::<MatchedPath>());

    let response = next.run(request).await;

    let latency_us = start.elapsed().as_micros() as u64;
    let status = response.status().as_u16();
    state.record_request(endpoint, status, latency_us).await;

    response
}

fn endpoint_label(matched: Option<&MatchedPath>) -> String {
    matched
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| UNMATCHED.to_string())
}
