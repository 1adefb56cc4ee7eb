//! Database access for shelfmark-sd
//!
//! Shared SQLite database holding the reconciled catalog.

pub mod books;
pub mod quota;
pub mod series;
pub mod source_payloads;

use anyhow::Result;
use sqlx::SqlitePool;
use std::path::Path;

/// Initialize database connection pool
///
/// Connects to shelfmark.db in the data folder, creating it if needed.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Initialize shelfmark-sd tables
///
/// Creates the catalog tables if they don't exist. `name_normalized` is
/// indexed but deliberately not UNIQUE: callers look up before creating,
/// and the hierarchy reconciler must be able to hold two accounts of a
/// series side by side while it untangles them.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS series (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_normalized TEXT NOT NULL,
            author TEXT,
            author_normalized TEXT,
            genre TEXT,
            total_books INTEGER NOT NULL DEFAULT 0,
            year_start INTEGER,
            year_end INTEGER,
            description TEXT,
            confidence REAL NOT NULL DEFAULT 0.0,
            verified INTEGER NOT NULL DEFAULT 0,
            parent_series_id TEXT,
            isfdb_id TEXT,
            openlibrary_id TEXT,
            googlebooks_id TEXT,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_series_name_normalized ON series(name_normalized)",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_series_parent ON series(parent_series_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS series_book (
            id TEXT PRIMARY KEY,
            series_id TEXT NOT NULL,
            position REAL,
            title TEXT NOT NULL,
            title_normalized TEXT NOT NULL,
            author TEXT,
            year_published INTEGER,
            isbn TEXT,
            description TEXT,
            isfdb_id TEXT,
            openlibrary_id TEXT,
            googlebooks_id TEXT,
            ebook_available INTEGER NOT NULL DEFAULT 0,
            audiobook_available INTEGER NOT NULL DEFAULT 0,
            confidence REAL NOT NULL DEFAULT 0.0,
            created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_series_book_series ON series_book(series_id)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_series_book_title ON series_book(title_normalized)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_data (
            id TEXT PRIMARY KEY,
            series_id TEXT NOT NULL,
            source TEXT NOT NULL,
            raw_data TEXT NOT NULL,
            book_count INTEGER NOT NULL DEFAULT 0,
            fetched_at TEXT NOT NULL,
            UNIQUE (series_id, source)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS provider_quota (
            provider TEXT NOT NULL,
            date TEXT NOT NULL,
            used INTEGER NOT NULL DEFAULT 0,
            ceiling INTEGER NOT NULL,
            PRIMARY KEY (provider, date)
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (series, series_book, source_data, provider_quota)");

    Ok(())
}

#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePool::connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    init_tables(&pool).await.expect("Failed to init tables");
    pool
}
