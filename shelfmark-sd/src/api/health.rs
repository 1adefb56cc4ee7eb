//! Health check endpoint

use axum::{extract::State, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;

use crate::models::ProviderKind;
use crate::AppState;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Service status (e.g., "ok")
    pub status: String,
    /// Module name ("shelfmark-sd")
    pub module: String,
    /// Crate version from Cargo.toml
    pub version: String,
    /// Seconds since service started
    pub uptime_seconds: u64,
    /// Per-provider circuit breaker state
    pub providers: HashMap<String, ProviderHealth>,
}

#[derive(Debug, Serialize)]
pub struct ProviderHealth {
    pub breaker_state: String,
    pub trip_count: u64,
}

/// GET /health
///
/// Returns uptime and per-provider breaker state for monitoring.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime = Utc::now().signed_duration_since(state.startup_time);
    let uptime_seconds = uptime.num_seconds().max(0) as u64;

    let mut providers = HashMap::new();
    for kind in ProviderKind::ALL {
        if let Some(breaker) = state.gateway.breaker(kind) {
            let snapshot = breaker.snapshot();
            providers.insert(
                kind.as_str().to_string(),
                ProviderHealth {
                    breaker_state: snapshot.state.as_str().to_string(),
                    trip_count: snapshot.trip_count,
                },
            );
        }
    }

    Json(HealthResponse {
        status: "ok".to_string(),
        module: "shelfmark-sd".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds,
        providers,
    })
}

/// Build health check routes
pub fn health_routes() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
