//! Series database operations
//!
//! Upsert-merge contract: re-ingesting a series fills fields the stored
//! row is missing and keeps everything it already has, except confidence
//! (ratchet, takes the max) and the verified flag (monotonic). Callers
//! must look up by normalized name or provider id before creating; the
//! storage layer does not enforce normalized-name uniqueness.

use shelfmark_common::{Error, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::models::ProviderKind;
use crate::services::similarity::normalize_name;

/// Reconciled series record
#[derive(Debug, Clone)]
pub struct Series {
    pub id: Uuid,
    pub name: String,
    pub name_normalized: String,
    pub author: Option<String>,
    pub author_normalized: Option<String>,
    pub genre: Option<String>,
    pub total_books: i64,
    pub year_start: Option<i64>,
    pub year_end: Option<i64>,
    pub description: Option<String>,
    pub confidence: f64,
    pub verified: bool,
    pub parent_series_id: Option<Uuid>,
    pub isfdb_id: Option<String>,
    pub openlibrary_id: Option<String>,
    pub googlebooks_id: Option<String>,
}

impl Series {
    /// Create a new series record with a fresh id and normalized name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let name_normalized = normalize_name(&name);
        Self {
            id: Uuid::new_v4(),
            name,
            name_normalized,
            author: None,
            author_normalized: None,
            genre: None,
            total_books: 0,
            year_start: None,
            year_end: None,
            description: None,
            confidence: 0.0,
            verified: false,
            parent_series_id: None,
            isfdb_id: None,
            openlibrary_id: None,
            googlebooks_id: None,
        }
    }

    /// Set author together with its normalized form
    pub fn with_author(mut self, author: Option<&str>) -> Self {
        self.author = author.map(|a| a.to_string());
        self.author_normalized = author.map(normalize_name);
        self
    }

    /// External id column for the given provider, if stored
    pub fn provider_id(&self, provider: ProviderKind) -> Option<&str> {
        match provider {
            ProviderKind::Isfdb => self.isfdb_id.as_deref(),
            ProviderKind::OpenLibrary => self.openlibrary_id.as_deref(),
            ProviderKind::GoogleBooks => self.googlebooks_id.as_deref(),
        }
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let id: String = row.get("id");
        let parent: Option<String> = row.get("parent_series_id");

        Ok(Self {
            id: parse_uuid(&id)?,
            name: row.get("name"),
            name_normalized: row.get("name_normalized"),
            author: row.get("author"),
            author_normalized: row.get("author_normalized"),
            genre: row.get("genre"),
            total_books: row.get("total_books"),
            year_start: row.get("year_start"),
            year_end: row.get("year_end"),
            description: row.get("description"),
            confidence: row.get("confidence"),
            verified: row.get::<i64, _>("verified") != 0,
            parent_series_id: parent.as_deref().map(parse_uuid).transpose()?,
            isfdb_id: row.get("isfdb_id"),
            openlibrary_id: row.get("openlibrary_id"),
            googlebooks_id: row.get("googlebooks_id"),
        })
    }
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| Error::Internal(format!("Invalid UUID in database: {}", e)))
}

const SERIES_COLUMNS: &str = "id, name, name_normalized, author, author_normalized, genre, \
     total_books, year_start, year_end, description, confidence, verified, \
     parent_series_id, isfdb_id, openlibrary_id, googlebooks_id";

/// Insert or merge a series record.
///
/// Fields fill only when the stored row has NULL; confidence ratchets up;
/// verified never reverts to false. `total_books` treats 0 as unset.
pub async fn upsert_series(pool: &SqlitePool, series: &Series) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO series (
            id, name, name_normalized, author, author_normalized, genre,
            total_books, year_start, year_end, description, confidence, verified,
            parent_series_id, isfdb_id, openlibrary_id, googlebooks_id,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP, CURRENT_TIMESTAMP)
        ON CONFLICT(id) DO UPDATE SET
            author = COALESCE(series.author, excluded.author),
            author_normalized = COALESCE(series.author_normalized, excluded.author_normalized),
            genre = COALESCE(series.genre, excluded.genre),
            total_books = CASE WHEN series.total_books = 0
                THEN excluded.total_books ELSE series.total_books END,
            year_start = COALESCE(series.year_start, excluded.year_start),
            year_end = COALESCE(series.year_end, excluded.year_end),
            description = COALESCE(series.description, excluded.description),
            confidence = MAX(series.confidence, excluded.confidence),
            verified = MAX(series.verified, excluded.verified),
            parent_series_id = COALESCE(series.parent_series_id, excluded.parent_series_id),
            isfdb_id = COALESCE(series.isfdb_id, excluded.isfdb_id),
            openlibrary_id = COALESCE(series.openlibrary_id, excluded.openlibrary_id),
            googlebooks_id = COALESCE(series.googlebooks_id, excluded.googlebooks_id),
            updated_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(series.id.to_string())
    .bind(&series.name)
    .bind(&series.name_normalized)
    .bind(&series.author)
    .bind(&series.author_normalized)
    .bind(&series.genre)
    .bind(series.total_books)
    .bind(series.year_start)
    .bind(series.year_end)
    .bind(&series.description)
    .bind(series.confidence)
    .bind(series.verified as i64)
    .bind(series.parent_series_id.map(|id| id.to_string()))
    .bind(&series.isfdb_id)
    .bind(&series.openlibrary_id)
    .bind(&series.googlebooks_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Load series by id
pub async fn find_by_id(pool: &SqlitePool, id: Uuid) -> Result<Option<Series>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM series WHERE id = ?",
        SERIES_COLUMNS
    ))
    .bind(id.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(Series::from_row).transpose()
}

/// Look up series by its normalized name (the dedup key)
pub async fn find_by_normalized_name(pool: &SqlitePool, name: &str) -> Result<Option<Series>> {
    let normalized = normalize_name(name);

    let row = sqlx::query(&format!(
        "SELECT {} FROM series WHERE name_normalized = ? LIMIT 1",
        SERIES_COLUMNS
    ))
    .bind(&normalized)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(Series::from_row).transpose()
}

/// Look up series by one provider's external id
pub async fn find_by_provider_id(
    pool: &SqlitePool,
    provider: ProviderKind,
    external_id: &str,
) -> Result<Option<Series>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM series WHERE {} = ? LIMIT 1",
        SERIES_COLUMNS,
        provider.id_column()
    ))
    .bind(external_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(Series::from_row).transpose()
}

/// Substring search over normalized names
pub async fn search(pool: &SqlitePool, query: &str, limit: i64) -> Result<Vec<Series>> {
    let pattern = format!("%{}%", normalize_name(query));

    let rows = sqlx::query(&format!(
        "SELECT {} FROM series WHERE name_normalized LIKE ? ORDER BY name_normalized LIMIT ?",
        SERIES_COLUMNS
    ))
    .bind(&pattern)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(Series::from_row).collect()
}

/// List series filtered by genre
pub async fn list_by_genre(pool: &SqlitePool, genre: &str, limit: i64) -> Result<Vec<Series>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM series WHERE genre = ? ORDER BY name_normalized LIMIT ?",
        SERIES_COLUMNS
    ))
    .bind(genre)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(Series::from_row).collect()
}

/// All series whose parent is the given series
pub async fn children_of(pool: &SqlitePool, parent_id: Uuid) -> Result<Vec<Series>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM series WHERE parent_series_id = ? ORDER BY name_normalized",
        SERIES_COLUMNS
    ))
    .bind(parent_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.iter().map(Series::from_row).collect()
}

/// Series carrying an external id for the given provider (scan input for
/// the misflattening detector and the linking pass)
pub async fn list_with_provider_id(
    pool: &SqlitePool,
    provider: ProviderKind,
    limit: i64,
) -> Result<Vec<Series>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM series WHERE {} IS NOT NULL ORDER BY updated_at LIMIT ?",
        SERIES_COLUMNS,
        provider.id_column()
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(Series::from_row).collect()
}

/// Distinct ids of series that currently have children
pub async fn parent_ids(pool: &SqlitePool) -> Result<Vec<Uuid>> {
    let rows: Vec<String> = sqlx::query_scalar(
        "SELECT DISTINCT parent_series_id FROM series WHERE parent_series_id IS NOT NULL",
    )
    .fetch_all(pool)
    .await?;

    rows.iter().map(|s| parse_uuid(s)).collect()
}

/// Set a series' parent reference.
///
/// Refuses to create a cycle: the proposed parent's ancestor chain must
/// not already contain the child.
pub async fn set_parent(pool: &SqlitePool, child_id: Uuid, parent_id: Uuid) -> Result<()> {
    if child_id == parent_id {
        return Err(Error::InvalidInput(
            "A series cannot be its own parent".to_string(),
        ));
    }

    // Walk the proposed parent's ancestors looking for the child
    let mut cursor = Some(parent_id);
    let mut depth = 0;
    while let Some(current) = cursor {
        depth += 1;
        if depth > 64 {
            return Err(Error::InvalidInput(
                "Parent chain too deep, refusing to link".to_string(),
            ));
        }

        let next: Option<Option<String>> =
            sqlx::query_scalar("SELECT parent_series_id FROM series WHERE id = ?")
                .bind(current.to_string())
                .fetch_optional(pool)
                .await?;

        cursor = match next.flatten() {
            Some(ancestor_id) => {
                let ancestor = parse_uuid(&ancestor_id)?;
                if ancestor == child_id {
                    return Err(Error::InvalidInput(format!(
                        "Linking {} under {} would create a parent cycle",
                        child_id, parent_id
                    )));
                }
                Some(ancestor)
            }
            None => None,
        };
    }

    sqlx::query(
        "UPDATE series SET parent_series_id = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(parent_id.to_string())
    .bind(child_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Store a description on a series (enrichment write path)
pub async fn set_description(pool: &SqlitePool, id: Uuid, description: &str) -> Result<()> {
    sqlx::query("UPDATE series SET description = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(description)
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Stamp a genre on a series (hierarchy-repair write path)
pub async fn set_genre(pool: &SqlitePool, id: Uuid, genre: &str) -> Result<()> {
    sqlx::query("UPDATE series SET genre = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(genre)
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Recompute a series' stored book count from its direct books
pub async fn update_total_books(pool: &SqlitePool, series_id: Uuid) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM series_book WHERE series_id = ?")
        .bind(series_id.to_string())
        .fetch_one(pool)
        .await?;

    sqlx::query("UPDATE series SET total_books = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(count)
        .bind(series_id.to_string())
        .execute(pool)
        .await?;

    Ok(count)
}

/// Hard-delete a series and its books. Reserved for explicit cleanup passes.
pub async fn delete_series(pool: &SqlitePool, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM series_book WHERE series_id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    sqlx::query("DELETE FROM series WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    Ok(())
}

/// Series still missing a description, oldest first (scheduler work queue)
pub async fn missing_description(pool: &SqlitePool, limit: i64) -> Result<Vec<Series>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM series WHERE description IS NULL ORDER BY created_at LIMIT ?",
        SERIES_COLUMNS
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;

    rows.iter().map(Series::from_row).collect()
}

/// Remaining-work count for the scheduler's series phase
pub async fn count_missing_description(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM series WHERE description IS NULL")
        .fetch_one(pool)
        .await?;

    Ok(count)
}
