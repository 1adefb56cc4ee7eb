//! shelfmark-sd - Series Data Service
//!
//! Backing data layer for the reading catalog: aggregates book-series
//! metadata from external bibliographic providers, reconciles conflicting
//! accounts, repairs flattened hierarchies, and serves the result over a
//! small read API while an autonomous scheduler fills in missing
//! descriptions in the background.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use shelfmark_sd::config::ServiceConfig;
use shelfmark_sd::services::description_classifier::DescriptionClassifier;
use shelfmark_sd::services::enrichment::EnrichmentScheduler;
use shelfmark_sd::services::hierarchy::{HierarchyReconciler, ReconcileOptions};
use shelfmark_sd::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting shelfmark-sd (Series Data) service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Step 1: Resolve and create the data folder
    let data_folder = shelfmark_common::config::resolve_data_folder("SHELFMARK_DATA_DIR");
    shelfmark_common::config::ensure_data_folder(&data_folder)
        .map_err(|e| anyhow::anyhow!("Failed to initialize data folder: {}", e))?;

    // Step 2: Open or create the database
    let db_path = data_folder.join("shelfmark.db");
    info!("Database: {}", db_path.display());
    let db_pool = shelfmark_sd::db::init_database_pool(&db_path).await?;
    info!("Database connection established");

    // Step 3: Load configuration and build the provider gateway
    let config = ServiceConfig::load();
    let gateway = Arc::new(shelfmark_sd::build_gateway(db_pool.clone(), &config)?);
    info!(port = config.port, "Provider gateway initialized");

    // Step 4: Spawn the autonomous enrichment / maintenance loop
    let scheduler = EnrichmentScheduler::new(
        db_pool.clone(),
        Arc::clone(&gateway),
        DescriptionClassifier::new(config.classifier.clone()),
        config.scheduler.clone(),
    );
    let reconciler = HierarchyReconciler::new(db_pool.clone(), Arc::clone(&gateway));
    let interval = Duration::from_secs(config.enrichment_interval_secs);

    tokio::spawn(async move {
        loop {
            match scheduler.run().await {
                Ok(summary) => info!(
                    series_enriched = summary.series_enriched,
                    books_enriched = summary.books_enriched,
                    "Enrichment cycle finished"
                ),
                Err(e) => tracing::error!(error = %e, "Enrichment cycle failed"),
            }

            run_hierarchy_maintenance(&reconciler).await;

            tokio::time::sleep(interval).await;
        }
    });

    // Step 5: Serve the read API
    let state = AppState::new(db_pool, gateway);
    let app = shelfmark_sd::build_router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    info!("Listening on http://127.0.0.1:{}", config.port);
    info!("Health check: http://127.0.0.1:{}/health", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

/// One hierarchy maintenance pass: link orphans, flag flattened series,
/// reconcile what was flagged, then clear parent/child duplicates.
async fn run_hierarchy_maintenance(reconciler: &HierarchyReconciler) {
    if let Err(e) = reconciler.link_sub_series(500).await {
        tracing::error!(error = %e, "Sub-series linking pass failed");
    }

    match reconciler.find_misflattened_series(100).await {
        Ok(flagged) => {
            for item in flagged {
                let Some(parent_ext_id) = item.parent.external_id.clone() else {
                    continue;
                };
                if let Err(e) = reconciler
                    .reconcile(&parent_ext_id, &ReconcileOptions::default())
                    .await
                {
                    tracing::error!(series = %item.name, error = %e, "Hierarchy reconcile failed");
                }
            }
        }
        Err(e) => tracing::error!(error = %e, "Misflattened-series scan failed"),
    }

    if let Err(e) = reconciler.dedup_parents().await {
        tracing::error!(error = %e, "Parent dedup pass failed");
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to install shutdown signal handler");
    }
    info!("Shutdown signal received, finishing in-flight requests");
}
