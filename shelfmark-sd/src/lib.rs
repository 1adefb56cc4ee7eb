//! shelfmark-sd library interface
//!
//! Exposes the reconciliation core and HTTP surface for integration
//! testing and for the service binary.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;

pub use crate::error::{ApiError, ApiResult};

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::config::ServiceConfig;
use crate::models::ProviderKind;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::providers::{
    GoogleBooksClient, IsfdbClient, OpenLibraryClient, ProviderGateway,
};

/// Application state shared across handlers and the background scheduler
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Provider clients wrapped in breaker/quota/retry
    pub gateway: Arc<ProviderGateway>,
    /// Service startup timestamp for uptime tracking
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(db: SqlitePool, gateway: Arc<ProviderGateway>) -> Self {
        Self {
            db,
            gateway,
            startup_time: Utc::now(),
        }
    }
}

/// Construct the provider gateway from configuration: one client and one
/// breaker per provider, quota ceiling on the metered one.
pub fn build_gateway(
    db: SqlitePool,
    config: &ServiceConfig,
) -> shelfmark_common::Result<ProviderGateway> {
    let breaker_config = config.breaker.to_breaker_config();
    let mut gateway = ProviderGateway::new(db, config.retry.to_policy());

    gateway.register(
        Arc::new(OpenLibraryClient::new()?),
        Arc::new(CircuitBreaker::new(
            ProviderKind::OpenLibrary.as_str(),
            breaker_config.clone(),
        )),
        None,
    );
    gateway.register(
        Arc::new(GoogleBooksClient::new(config.googlebooks_api_key.clone())?),
        Arc::new(CircuitBreaker::new(
            ProviderKind::GoogleBooks.as_str(),
            breaker_config.clone(),
        )),
        Some(config.quotas.googlebooks_daily),
    );
    gateway.register(
        Arc::new(IsfdbClient::new()?),
        Arc::new(CircuitBreaker::new(
            ProviderKind::Isfdb.as_str(),
            breaker_config,
        )),
        None,
    );

    Ok(gateway)
}

/// Build application router
pub fn build_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .merge(api::series_routes())
        .merge(api::health_routes())
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
