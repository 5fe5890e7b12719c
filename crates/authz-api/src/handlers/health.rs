//! Health check handlers
//!
//! Author: hephaex@gmail.com

use crate::state::AppState;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::fmt::Write;
use std::sync::Arc;
use utoipa::ToSchema;

/// Health check response
#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Service is alive", body = HealthResponse)
    )
)]
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: state.registry().service().to_string(),
    })
}

/// Readiness response
#[derive(Serialize, ToSchema)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub storage: bool,
}

/// Readiness probe; also makes one round-trip to the credential store
#[utoipa::path(
    get,
    path = "/ready",
    tag = "health",
    responses(
        (status = 200, description = "Service is ready", body = ReadinessResponse),
        (status = 503, description = "Service not ready", body = ReadinessResponse)
    )
)]
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let storage = state.service.list_permissions().await.is_ok();
    let ready = state.is_ready() && storage;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, storage }))
}

/// Prometheus text exposition of request statistics
pub async fn prometheus_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut output = String::new();
    let _ = render_metrics(&state, &mut output).await;

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        output,
    )
}

async fn render_metrics(state: &AppState, out: &mut String) -> std::fmt::Result {
    writeln!(out, "# HELP authz_uptime_seconds Time since server start")?;
    writeln!(out, "# TYPE authz_uptime_seconds gauge")?;
    writeln!(out, "authz_uptime_seconds {}\n", state.uptime_secs())?;

    writeln!(out, "# HELP authz_requests_total Total number of HTTP requests")?;
    writeln!(out, "# TYPE authz_requests_total counter")?;
    writeln!(out, "authz_requests_total {}\n", state.get_request_count())?;

    writeln!(out, "# HELP authz_build_info Build information")?;
    writeln!(out, "# TYPE authz_build_info gauge")?;
    writeln!(
        out,
        "authz_build_info{{version=\"{}\",service=\"{}\"}} 1\n",
        env!("CARGO_PKG_VERSION"),
        state.registry().service()
    )?;

    let metrics = state.metrics.read().await;

    writeln!(out, "# HELP authz_http_requests_total HTTP requests by endpoint and status")?;
    writeln!(out, "# TYPE authz_http_requests_total counter")?;
    for (endpoint, m) in metrics.iter() {
        for (status, count) in &m.status_counts {
            writeln!(
                out,
                "authz_http_requests_total{{endpoint=\"{endpoint}\",status=\"{status}\"}} {count}"
            )?;
        }
    }
    writeln!(out)?;

    writeln!(out, "# HELP authz_http_request_duration_seconds HTTP request latency")?;
    writeln!(out, "# TYPE authz_http_request_duration_seconds histogram")?;
    for (endpoint, m) in metrics.iter().filter(|(_, m)| m.latency_count > 0) {
        let b = &m.latency_buckets;
        let mut cumulative = 0u64;
        for (le, count) in [
            ("0.01", b.under_10ms),
            ("0.05", b.ms_10_50),
            ("0.1", b.ms_50_100),
            ("0.5", b.ms_100_500),
            ("1.0", b.ms_500_1000),
            ("+Inf", b.over_1s),
        ] {
            cumulative += count;
            writeln!(
                out,
                "authz_http_request_duration_seconds_bucket{{endpoint=\"{endpoint}\",le=\"{le}\"}} {cumulative}"
            )?;
        }
        writeln!(
            out,
            "authz_http_request_duration_seconds_sum{{endpoint=\"{endpoint}\"}} {:.6}",
            m.total_latency_us as f64 / 1_000_000.0
        )?;
        writeln!(
            out,
            "authz_http_request_duration_seconds_count{{endpoint=\"{endpoint}\"}} {}",
            m.latency_count
        )?;
    }

    Ok(())
}
