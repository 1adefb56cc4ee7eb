//! Autonomous enrichment scheduler
//!
//! Fills missing series- and book-level descriptions across the provider
//! waterfall: Open Library (quota-free) first, then Google Books (only
//! while quota remains), then ISFDB. All progress state is derived from
//! persisted missing-description counts plus breaker and quota state, so
//! the loop may be killed and restarted at any point; at worst a partial
//! batch is re-fetched.

use chrono::{DateTime, Utc};
use shelfmark_common::Result;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;

use crate::db::{books, quota, series, source_payloads};
use crate::models::ProviderKind;
use crate::services::circuit_breaker::CircuitState;
use crate::services::description_classifier::DescriptionClassifier;
use crate::services::providers::{ProviderCallError, ProviderGateway, SeriesQuery};
use crate::services::similarity::title_similarity;

/// Provider order for the description waterfall
const WATERFALL: [ProviderKind; 3] = [
    ProviderKind::OpenLibrary,
    ProviderKind::GoogleBooks,
    ProviderKind::Isfdb,
];

/// Scheduler tuning
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Series processed per batch
    pub series_batch_size: i64,
    /// Books processed per batch
    pub book_batch_size: i64,
    /// Consecutive zero-progress batches before a phase gives up on the
    /// unenrichable remainder
    pub max_empty_batches: u32,
    /// Fuzzy threshold when matching returned books to a stored book
    pub title_match_threshold: f64,
    /// Quota ledger rows older than this are pruned each run
    pub quota_retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            series_batch_size: 200,
            book_batch_size: 500,
            max_empty_batches: 3,
            title_match_threshold: 0.85,
            quota_retention_days: 7,
        }
    }
}

/// Outcome of one full enrichment run
#[derive(Debug, Default)]
pub struct EnrichmentSummary {
    pub series_enriched: usize,
    pub books_enriched: usize,
    pub series_failures: usize,
    pub book_failures: usize,
    /// Unenrichable remainder after the series phase
    pub series_remaining: i64,
    /// Unenrichable remainder after the book phase
    pub books_remaining: i64,
}

/// Self-resuming enrichment loop
pub struct EnrichmentScheduler {
    db: SqlitePool,
    gateway: Arc<ProviderGateway>,
    classifier: DescriptionClassifier,
    config: SchedulerConfig,
}

impl EnrichmentScheduler {
    pub fn new(
        db: SqlitePool,
        gateway: Arc<ProviderGateway>,
        classifier: DescriptionClassifier,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            gateway,
            classifier,
            config,
        }
    }

    /// One full enrichment pass: series descriptions, then book blurbs.
    /// Returns when both phases have either drained their queue or hit
    /// the unenrichable remainder.
    pub async fn run(&self) -> Result<EnrichmentSummary> {
        quota::prune_old(&self.db, self.config.quota_retention_days).await?;

        let mut summary = EnrichmentSummary::default();

        self.run_series_phase(&mut summary).await?;
        self.run_book_phase(&mut summary).await?;

        tracing::info!(
            series_enriched = summary.series_enriched,
            books_enriched = summary.books_enriched,
            series_remaining = summary.series_remaining,
            books_remaining = summary.books_remaining,
            "Enrichment run complete"
        );

        Ok(summary)
    }

    async fn run_series_phase(&self, summary: &mut EnrichmentSummary) -> Result<()> {
        let mut empty_batches = 0u32;

        loop {
            let remaining = series::count_missing_description(&self.db).await?;
            summary.series_remaining = remaining;
            if remaining == 0 {
                return Ok(());
            }

            self.wait_for_providers().await?;

            let batch = series::missing_description(&self.db, self.config.series_batch_size).await?;
            let mut enriched_this_batch = 0;

            for item in &batch {
                match self.fetch_series_description(item).await {
                    Ok(Some(description)) => {
                        series::set_description(&self.db, item.id, &description).await?;
                        enriched_this_batch += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // One bad item never aborts the run
                        tracing::warn!(series = %item.name, error = %e, "Series enrichment failed");
                        summary.series_failures += 1;
                    }
                }
            }

            summary.series_enriched += enriched_this_batch;
            tracing::info!(
                batch = batch.len(),
                enriched = enriched_this_batch,
                remaining,
                "Series description batch done"
            );

            if enriched_this_batch == 0 {
                empty_batches += 1;
                if empty_batches >= self.config.max_empty_batches {
                    summary.series_remaining =
                        series::count_missing_description(&self.db).await?;
                    tracing::info!(
                        remaining = summary.series_remaining,
                        "Declaring unenrichable remainder for series phase"
                    );
                    return Ok(());
                }
            } else {
                empty_batches = 0;
            }
        }
    }

    async fn run_book_phase(&self, summary: &mut EnrichmentSummary) -> Result<()> {
        let mut empty_batches = 0u32;

        loop {
            let remaining = books::count_missing_description(&self.db).await?;
            summary.books_remaining = remaining;
            if remaining == 0 {
                return Ok(());
            }

            self.wait_for_providers().await?;

            let batch = books::missing_description(&self.db, self.config.book_batch_size).await?;
            let mut enriched_this_batch = 0;

            for item in &batch {
                match self.fetch_book_description(item).await {
                    Ok(Some(description)) => {
                        books::set_description(&self.db, item.id, &description).await?;
                        enriched_this_batch += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(book = %item.title, error = %e, "Book enrichment failed");
                        summary.book_failures += 1;
                    }
                }
            }

            summary.books_enriched += enriched_this_batch;
            tracing::info!(
                batch = batch.len(),
                enriched = enriched_this_batch,
                remaining,
                "Book description batch done"
            );

            if enriched_this_batch == 0 {
                empty_batches += 1;
                if empty_batches >= self.config.max_empty_batches {
                    summary.books_remaining = books::count_missing_description(&self.db).await?;
                    tracing::info!(
                        remaining = summary.books_remaining,
                        "Declaring unenrichable remainder for book phase"
                    );
                    return Ok(());
                }
            } else {
                empty_batches = 0;
            }
        }
    }

    /// Pre-batch gate. Never start a batch against a doomed primary: while
    /// its breaker is OPEN, sleep exactly the remaining cooldown and check
    /// again. If on top of that the quota-capped fallback is exhausted,
    /// sleep through to the next UTC midnight instead.
    async fn wait_for_providers(&self) -> Result<()> {
        loop {
            let Some(primary) = self.gateway.breaker(ProviderKind::OpenLibrary) else {
                return Ok(());
            };

            if primary.state() != CircuitState::Open {
                return Ok(());
            }

            if self.gateway.quota_exhausted(ProviderKind::GoogleBooks).await? {
                let sleep_for = duration_until_next_utc_midnight(Utc::now());
                tracing::warn!(
                    sleep_secs = sleep_for.as_secs(),
                    "Primary breaker open and fallback quota exhausted, sleeping to quota reset"
                );
                tokio::time::sleep(sleep_for).await;
            } else {
                let sleep_for = primary
                    .remaining_cooldown()
                    .unwrap_or(Duration::from_secs(1));
                tracing::info!(
                    sleep_secs = sleep_for.as_secs(),
                    "Primary breaker open, sleeping out the cooldown"
                );
                tokio::time::sleep(sleep_for).await;
            }
        }
    }

    /// Waterfall one series through the providers and return the first
    /// usable series-level description.
    async fn fetch_series_description(
        &self,
        item: &series::Series,
    ) -> Result<Option<String>> {
        for provider in WATERFALL {
            let query = match item.provider_id(provider) {
                Some(id) => SeriesQuery::ByExternalId(id.to_string()),
                None => SeriesQuery::ByName {
                    name: item.name.clone(),
                    author: item.author.clone(),
                },
            };

            let fetch = match self.gateway.fetch(provider, &query).await {
                Ok(fetch) => fetch,
                // Refusals and failures both fall through to the next
                // provider; only storage trouble aborts the item.
                Err(ProviderCallError::Storage(e)) => return Err(e),
                Err(e) => {
                    tracing::debug!(provider = %provider, series = %item.name, reason = %e, "Waterfall step skipped");
                    continue;
                }
            };

            let Some(source) = fetch.series else { continue };

            if let Some(raw) = &fetch.raw {
                source_payloads::save_payload(
                    &self.db,
                    item.id,
                    provider,
                    raw,
                    source.books.len() as i64,
                )
                .await?;
            }

            let Some(description) = &source.description else { continue };

            if self
                .classifier
                .is_series_description(description, Some(&item.name))
            {
                tracing::debug!(provider = %provider, series = %item.name, "Series description found");
                return Ok(Some(description.clone()));
            }

            tracing::debug!(
                provider = %provider,
                series = %item.name,
                "Rejected single-volume synopsis, trying next provider"
            );
        }

        Ok(None)
    }

    /// Waterfall one book: the description of the best title match in the
    /// provider's returned book list.
    async fn fetch_book_description(&self, item: &books::SeriesBook) -> Result<Option<String>> {
        for provider in WATERFALL {
            let query = SeriesQuery::ByName {
                name: item.title.clone(),
                author: item.author.clone(),
            };

            let fetch = match self.gateway.fetch(provider, &query).await {
                Ok(fetch) => fetch,
                Err(ProviderCallError::Storage(e)) => return Err(e),
                Err(e) => {
                    tracing::debug!(provider = %provider, book = %item.title, reason = %e, "Waterfall step skipped");
                    continue;
                }
            };

            let Some(source) = fetch.series else { continue };

            let best = source
                .books
                .iter()
                .filter(|b| b.description.is_some())
                .map(|b| (b, title_similarity(&item.title, &b.title)))
                .filter(|(_, score)| *score >= self.config.title_match_threshold)
                .max_by(|(_, x), (_, y)| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

            if let Some((matched, _)) = best {
                tracing::debug!(provider = %provider, book = %item.title, "Book description found");
                return Ok(matched.description.clone());
            }
        }

        Ok(None)
    }
}

/// Time from `now` to the next 00:00 UTC (the implicit quota reset)
fn duration_until_next_utc_midnight(now: DateTime<Utc>) -> Duration {
    let tomorrow = (now + chrono::Duration::days(1))
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is a valid time")
        .and_utc();
    (tomorrow - now).to_std().unwrap_or(Duration::ZERO)
}
