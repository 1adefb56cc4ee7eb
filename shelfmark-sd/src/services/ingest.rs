//! Provider ingestion
//!
//! Turns a provider-normalized [`SourceSeries`] into persisted catalog
//! rows through the upsert-merge contract, and reconciles two providers'
//! accounts of the same series into one record via the matcher.

use shelfmark_common::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::db::{books, series, source_payloads};
use crate::models::{ComparisonResult, ProviderKind, SourceFetch, SourceSeries};
use crate::services::matcher::SeriesMatcher;
use crate::services::similarity::normalize_name;

/// Persist one provider's account of a series.
///
/// Looks up by provider id, then normalized name, before creating; the
/// storage layer does not enforce name uniqueness. Existing fields win,
/// confidence ratchets, format flags only ever turn on.
pub async fn ingest(
    pool: &SqlitePool,
    source: &SourceSeries,
    raw: Option<&str>,
) -> Result<Uuid> {
    let provider = source.provider;

    let existing = match source.external_id.as_deref() {
        Some(ext_id) => series::find_by_provider_id(pool, provider, ext_id).await?,
        None => None,
    };
    let existing = match existing {
        Some(found) => Some(found),
        None => series::find_by_normalized_name(pool, &source.name).await?,
    };

    let mut record = match existing {
        Some(found) => found,
        None => series::Series::new(source.name.clone()),
    };

    if record.author.is_none() {
        record.author = source.author.clone();
        record.author_normalized = source.author.as_deref().map(normalize_name);
    }
    if record.description.is_none() {
        record.description = source.description.clone();
    }
    if record.genre.is_none() {
        record.genre = source.tags.first().cloned();
    }
    match provider {
        ProviderKind::Isfdb => {
            record.isfdb_id = record.isfdb_id.or_else(|| source.external_id.clone())
        }
        ProviderKind::OpenLibrary => {
            record.openlibrary_id = record.openlibrary_id.or_else(|| source.external_id.clone())
        }
        ProviderKind::GoogleBooks => {
            record.googlebooks_id = record.googlebooks_id.or_else(|| source.external_id.clone())
        }
    }

    let years: Vec<i64> = source.books.iter().filter_map(|b| b.year).collect();
    record.year_start = record.year_start.or_else(|| years.iter().min().copied());
    record.year_end = record.year_end.or_else(|| years.iter().max().copied());
    record.confidence = record.confidence.max(provider.default_confidence());
    if record.total_books == 0 {
        record.total_books = source.books.len() as i64;
    }

    series::upsert_series(pool, &record).await?;

    for source_book in &source.books {
        let mut book = match books::find_in_series_by_title(pool, record.id, &source_book.title)
            .await?
        {
            Some(found) => found,
            None => books::SeriesBook::new(record.id, source_book.title.clone()),
        };

        book.position = book.position.or(source_book.position);
        if book.author.is_none() {
            book.author = source_book.author.clone();
        }
        book.year_published = book.year_published.or(source_book.year);
        if book.isbn.is_none() {
            book.isbn = source_book.isbn.clone();
        }
        if book.description.is_none() {
            book.description = source_book.description.clone();
        }
        book.ebook_available |= source_book.ebook_available;
        book.audiobook_available |= source_book.audiobook_available;
        book.confidence = book.confidence.max(provider.default_confidence());
        match provider {
            ProviderKind::Isfdb => {
                book.isfdb_id = book.isfdb_id.or_else(|| source_book.external_id.clone())
            }
            ProviderKind::OpenLibrary => {
                book.openlibrary_id = book
                    .openlibrary_id
                    .or_else(|| source_book.external_id.clone())
            }
            ProviderKind::GoogleBooks => {
                book.googlebooks_id = book
                    .googlebooks_id
                    .or_else(|| source_book.external_id.clone())
            }
        }

        books::upsert_book(pool, &book).await?;
    }

    series::update_total_books(pool, record.id).await?;

    if let Some(raw) = raw {
        source_payloads::save_payload(pool, record.id, provider, raw, source.books.len() as i64)
            .await?;
    }

    tracing::info!(
        series = %record.name,
        provider = %provider,
        books = source.books.len(),
        "Ingested provider account"
    );

    Ok(record.id)
}

/// Reconcile two providers' accounts and persist the merged result.
///
/// The merged record's confidence is the comparison score, applied
/// through the ratchet. Returns the stored id and the comparison.
pub async fn merge_and_ingest(
    pool: &SqlitePool,
    matcher: &SeriesMatcher,
    preferred: &SourceSeries,
    other: &SourceSeries,
) -> Result<(Uuid, Option<ComparisonResult>)> {
    let comparison = matcher.compare(
        &SourceFetch::found(preferred.clone(), ""),
        &SourceFetch::found(other.clone(), ""),
    );

    let merged = matcher.merge(preferred, other);
    let id = ingest(pool, &merged, None).await?;

    if let Some(comparison) = &comparison {
        // Ratchet the stored confidence toward the comparison score
        let mut record = series::find_by_id(pool, id)
            .await?
            .ok_or_else(|| shelfmark_common::Error::NotFound(format!("Series {}", id)))?;
        record.confidence = record.confidence.max(comparison.confidence);
        series::upsert_series(pool, &record).await?;

        if matcher.needs_verification(comparison) {
            tracing::info!(
                series = %merged.name,
                confidence = comparison.confidence,
                discrepancies = comparison.discrepancies.len(),
                "Merged account needs verification"
            );
        }
    }

    Ok((id, comparison))
}
