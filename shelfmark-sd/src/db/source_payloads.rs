//! Raw provider payload store
//!
//! One typed envelope per (series, provider): the provider tag, the
//! serialized response body, a book count, and the fetch timestamp. Kept
//! for audit and later shape validation; re-fetching a series from the
//! same provider replaces the previous envelope.

use chrono::{DateTime, Utc};
use shelfmark_common::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::series::parse_uuid;
use crate::models::ProviderKind;

/// Stored raw payload envelope
#[derive(Debug, Clone)]
pub struct SourceEnvelope {
    pub id: Uuid,
    pub series_id: Uuid,
    pub source: String,
    pub raw_data: String,
    pub book_count: i64,
    pub fetched_at: DateTime<Utc>,
}

/// Save (or replace) the raw payload for a series/provider pair
pub async fn save_payload(
    pool: &SqlitePool,
    series_id: Uuid,
    provider: ProviderKind,
    raw_data: &str,
    book_count: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO source_data (id, series_id, source, raw_data, book_count, fetched_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(series_id, source) DO UPDATE SET
            raw_data = excluded.raw_data,
            book_count = excluded.book_count,
            fetched_at = excluded.fetched_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(series_id.to_string())
    .bind(provider.as_str())
    .bind(raw_data)
    .bind(book_count)
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load the stored envelope for a series/provider pair
pub async fn load_payload(
    pool: &SqlitePool,
    series_id: Uuid,
    provider: ProviderKind,
) -> Result<Option<SourceEnvelope>> {
    let row = sqlx::query(
        "SELECT id, series_id, source, raw_data, book_count, fetched_at \
         FROM source_data WHERE series_id = ? AND source = ?",
    )
    .bind(series_id.to_string())
    .bind(provider.as_str())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let id: String = row.get("id");
            let series_id: String = row.get("series_id");
            let fetched_at: String = row.get("fetched_at");

            Ok(Some(SourceEnvelope {
                id: parse_uuid(&id)?,
                series_id: parse_uuid(&series_id)?,
                source: row.get("source"),
                raw_data: row.get("raw_data"),
                book_count: row.get("book_count"),
                fetched_at: DateTime::parse_from_rfc3339(&fetched_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            }))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::series::{upsert_series, Series};
    use crate::db::test_pool;

    #[tokio::test]
    async fn test_save_and_load_envelope() {
        let pool = test_pool().await;
        let series = Series::new("Cradle");
        upsert_series(&pool, &series).await.unwrap();

        save_payload(&pool, series.id, ProviderKind::Isfdb, r#"{"books":[]}"#, 0)
            .await
            .unwrap();

        let envelope = load_payload(&pool, series.id, ProviderKind::Isfdb)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.source, "isfdb");
        assert_eq!(envelope.raw_data, r#"{"books":[]}"#);
    }

    #[tokio::test]
    async fn test_refetch_replaces_envelope() {
        let pool = test_pool().await;
        let series = Series::new("Cradle");
        upsert_series(&pool, &series).await.unwrap();

        save_payload(&pool, series.id, ProviderKind::Isfdb, "v1", 3)
            .await
            .unwrap();
        save_payload(&pool, series.id, ProviderKind::Isfdb, "v2", 4)
            .await
            .unwrap();

        let envelope = load_payload(&pool, series.id, ProviderKind::Isfdb)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(envelope.raw_data, "v2");
        assert_eq!(envelope.book_count, 4);

        // A different provider gets its own envelope
        assert!(load_payload(&pool, series.id, ProviderKind::OpenLibrary)
            .await
            .unwrap()
            .is_none());
    }
}
