//! Series book database operations
//!
//! Same upsert-merge contract as `db::series`, plus two monotonic flags:
//! once a book is known to exist as an ebook or audiobook, that knowledge
//! is never un-learned (logical OR on merge).

use shelfmark_common::Result;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use super::series::parse_uuid;
use crate::services::similarity::normalize_title;

/// A book within a series
#[derive(Debug, Clone)]
pub struct SeriesBook {
    pub id: Uuid,
    pub series_id: Uuid,
    /// May be fractional (1.5 for side stories); None sorts after all set positions
    pub position: Option<f64>,
    pub title: String,
    pub title_normalized: String,
    pub author: Option<String>,
    pub year_published: Option<i64>,
    pub isbn: Option<String>,
    pub description: Option<String>,
    pub isfdb_id: Option<String>,
    pub openlibrary_id: Option<String>,
    pub googlebooks_id: Option<String>,
    pub ebook_available: bool,
    pub audiobook_available: bool,
    pub confidence: f64,
}

impl SeriesBook {
    /// Create a new book record for a series
    pub fn new(series_id: Uuid, title: impl Into<String>) -> Self {
        let title = title.into();
        let title_normalized = normalize_title(&title);
        Self {
            id: Uuid::new_v4(),
            series_id,
            position: None,
            title,
            title_normalized,
            author: None,
            year_published: None,
            isbn: None,
            description: None,
            isfdb_id: None,
            openlibrary_id: None,
            googlebooks_id: None,
            ebook_available: false,
            audiobook_available: false,
            confidence: 0.0,
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let id: String = row.get("id");
        let series_id: String = row.get("series_id");

        Ok(Self {
            id: parse_uuid(&id)?,
            series_id: parse_uuid(&series_id)?,
            position: row.get("position"),
            title: row.get("title"),
            title_normalized: row.get("title_normalized"),
            author: row.get("author"),
            year_published: row.get("year_published"),
            isbn: row.get("isbn"),
            description: row.get("description"),
            isfdb_id: row.get("isfdb_id"),
            openlibrary_id: row.get("openlibrary_id"),
            googlebooks_id: row.get("googlebooks_id"),
            ebook_available: row.get::<i64, _>("ebook_available") != 0,
            audiobook_available: row.get::<i64, _>("audiobook_available") != 0,
            confidence: row.get("confidence"),
        })
    }
}

const BOOK_COLUMNS: &str = "id, series_id, position, title, title_normalized, author, \
     year_published, isbn, description, isfdb_id, openlibrary_id, googlebooks_id, \
     ebook_available, audiobook_available, confidence";

/// Insert or merge a book record.
///
/// Fill-if-missing on scalars, MAX on confidence, OR on the format flags.
pub async fn upsert_book(pool: &SqlitePool, book: &SeriesBook) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO series_book (
            id, series_id, position, title, title_normalized, author,
            year_published, isbn, description, isfdb_id, openlibrary_id, googlebooks_id,
            ebook_available, audiobook_available, confidence, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
        ON CONFLICT(id) DO UPDATE SET
            position = COALESCE(series_book.position, excluded.position),
            author = COALESCE(series_book.author, excluded.author),
            year_published = COALESCE(series_book.year_published, excluded.year_published),
            isbn = COALESCE(series_book.isbn, excluded.isbn),
            description = COALESCE(series_book.description, excluded.description),
            isfdb_id = COALESCE(series_book.isfdb_id, excluded.isfdb_id),
            openlibrary_id = COALESCE(series_book.openlibrary_id, excluded.openlibrary_id),
            googlebooks_id = COALESCE(series_book.googlebooks_id, excluded.googlebooks_id),
            ebook_available = MAX(series_book.ebook_available, excluded.ebook_available),
            audiobook_available = MAX(series_book.audiobook_available, excluded.audiobook_available),
            confidence = MAX(series_book.confidence, excluded.confidence),
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(book.id.to_string())
    .bind(book.series_id.to_string())
    .bind(book.position)
    .bind(&book.title)
    .bind(&book.title_normalized)
    .bind(&book.author)
    .bind(book.year_published)
    .bind(&book.isbn)
    .bind(&book.description)
    .bind(&book.isfdb_id)
    .bind(&book.openlibrary_id)
    .bind(&book.googlebooks_id)
    .bind(book.ebook_available as i64)
    .bind(book.audiobook_available as i64)
    .bind(book.confidence)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a book by id
pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<SeriesBook>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM series_book WHERE id = ?",
        BOOK_COLUMNS
    ))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(SeriesBook::from_row).transpose()
}

/// All books of a series, ascending by position; unset positions sort last
pub async fn list_for_series(pool: &SqlitePool, series_id: Uuid) -> Result<Vec<SeriesBook>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM series_book WHERE series_id = ? \
         ORDER BY position IS NULL, position, title_normalized",
        BOOK_COLUMNS
    ))
    .bind(series_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(SeriesBook::from_row).collect()
}

/// Find a book within one series by normalized title
pub async fn find_in_series_by_title(
    pool: &SqlitePool,
    series_id: Uuid,
    title: &str,
) -> Result<Option<SeriesBook>> {
    let normalized = normalize_title(title);

    let row = sqlx::query(&format!(
        "SELECT {} FROM series_book WHERE series_id = ? AND title_normalized = ? LIMIT 1",
        BOOK_COLUMNS
    ))
    .bind(series_id.to_string())
    .bind(&normalized)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(SeriesBook::from_row).transpose()
}

/// Re-home a book under a different series (hierarchy repair)
pub async fn move_to_series(pool: &SqlitePool, book_id: Uuid, new_series_id: Uuid) -> Result<()> {
    sqlx::query(
        "UPDATE series_book SET series_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(new_series_id.to_string())
    .bind(book_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Hard-delete a book (dedup pass)
pub async fn delete_book(pool: &SqlitePool, book_id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM series_book WHERE id = ?")
        .bind(book_id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Store a description on a book (enrichment write path)
pub async fn set_description(pool: &SqlitePool, book_id: Uuid, description: &str) -> Result<()> {
    sqlx::query(
        "UPDATE series_book SET description = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(description)
    .bind(book_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Books still missing a description, oldest first (scheduler work queue)
pub async fn missing_description(pool: &SqlitePool, limit: i64) -> Result<Vec<SeriesBook>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM series_book WHERE description IS NULL ORDER BY created_at LIMIT ?",
        BOOK_COLUMNS
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(SeriesBook::from_row).collect()
}

/// Remaining-work count for the scheduler's book phase
pub async fn count_missing_description(pool: &SqlitePool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM series_book WHERE description IS NULL")
            .fetch_one(pool)
            .await?;

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::series::{upsert_series, Series};
    use crate::db::test_pool;

    async fn seeded_series(pool: &SqlitePool) -> Series {
        let series = Series::new("Cradle");
        upsert_series(pool, &series).await.unwrap();
        series
    }

    #[tokio::test]
    async fn test_ordering_unset_position_sorts_last() {
        let pool = test_pool().await;
        let series = seeded_series(&pool).await;

        let mut side_story = SeriesBook::new(series.id, "Side Story");
        side_story.position = None;
        let mut first = SeriesBook::new(series.id, "Unsouled");
        first.position = Some(1.0);
        let mut interlude = SeriesBook::new(series.id, "Interlude");
        interlude.position = Some(1.5);

        upsert_book(&pool, &side_story).await.unwrap();
        upsert_book(&pool, &interlude).await.unwrap();
        upsert_book(&pool, &first).await.unwrap();

        let books = list_for_series(&pool, series.id).await.unwrap();
        let titles: Vec<&str> = books.iter().map(|b| b.title.as_str()).collect();
        assert_eq!(titles, vec!["Unsouled", "Interlude", "Side Story"]);
    }

    #[tokio::test]
    async fn test_format_flags_are_monotonic() {
        let pool = test_pool().await;
        let series = seeded_series(&pool).await;

        let mut book = SeriesBook::new(series.id, "Unsouled");
        book.ebook_available = true;
        upsert_book(&pool, &book).await.unwrap();

        // Later ingestion that doesn't know about the ebook
        book.ebook_available = false;
        book.audiobook_available = true;
        upsert_book(&pool, &book).await.unwrap();

        let stored = find_by_id(&pool, book.id).await.unwrap().unwrap();
        assert!(stored.ebook_available, "ebook flag must not revert");
        assert!(stored.audiobook_available);
    }

    #[tokio::test]
    async fn test_upsert_fills_missing_fields() {
        let pool = test_pool().await;
        let series = seeded_series(&pool).await;

        let mut book = SeriesBook::new(series.id, "Soulsmith");
        book.confidence = 0.9;
        upsert_book(&pool, &book).await.unwrap();

        book.isbn = Some("9780989671767".to_string());
        book.year_published = Some(2016);
        book.confidence = 0.4;
        upsert_book(&pool, &book).await.unwrap();

        let stored = find_by_id(&pool, book.id).await.unwrap().unwrap();
        assert_eq!(stored.isbn.as_deref(), Some("9780989671767"));
        assert_eq!(stored.year_published, Some(2016));
        assert_eq!(stored.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_move_to_series() {
        let pool = test_pool().await;
        let flat = seeded_series(&pool).await;
        let sub = Series::new("Cradle: Side Stories");
        upsert_series(&pool, &sub).await.unwrap();

        let book = SeriesBook::new(flat.id, "The Three Sisters");
        upsert_book(&pool, &book).await.unwrap();

        move_to_series(&pool, book.id, sub.id).await.unwrap();

        assert!(list_for_series(&pool, flat.id).await.unwrap().is_empty());
        let moved = list_for_series(&pool, sub.id).await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, book.id);
    }
}
