//! Series read API
//!
//! Lookup, search and genre-filtered listing over the reconciled catalog.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{books, series};
use crate::error::{ApiError, ApiResult};
use crate::AppState;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// Series as served by the read API
#[derive(Debug, Serialize)]
pub struct SeriesResponse {
    pub id: Uuid,
    pub name: String,
    pub author: Option<String>,
    pub genre: Option<String>,
    pub total_books: i64,
    pub year_start: Option<i64>,
    pub year_end: Option<i64>,
    pub description: Option<String>,
    pub confidence: f64,
    pub verified: bool,
    pub parent_series_id: Option<Uuid>,
}

impl From<series::Series> for SeriesResponse {
    fn from(s: series::Series) -> Self {
        Self {
            id: s.id,
            name: s.name,
            author: s.author,
            genre: s.genre,
            total_books: s.total_books,
            year_start: s.year_start,
            year_end: s.year_end,
            description: s.description,
            confidence: s.confidence,
            verified: s.verified,
            parent_series_id: s.parent_series_id,
        }
    }
}

/// Book as served by the read API
#[derive(Debug, Serialize)]
pub struct BookResponse {
    pub id: Uuid,
    pub position: Option<f64>,
    pub title: String,
    pub author: Option<String>,
    pub year_published: Option<i64>,
    pub isbn: Option<String>,
    pub description: Option<String>,
    pub ebook_available: bool,
    pub audiobook_available: bool,
    pub confidence: f64,
}

impl From<books::SeriesBook> for BookResponse {
    fn from(b: books::SeriesBook) -> Self {
        Self {
            id: b.id,
            position: b.position,
            title: b.title,
            author: b.author,
            year_published: b.year_published,
            isbn: b.isbn,
            description: b.description,
            ebook_available: b.ebook_available,
            audiobook_available: b.audiobook_available,
            confidence: b.confidence,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    q: String,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    genre: Option<String>,
    limit: Option<i64>,
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// GET /series/:id
pub async fn get_series(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<SeriesResponse>> {
    let found = series::find_by_id(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Series {}", id)))?;

    Ok(Json(found.into()))
}

/// GET /series/:id/books
pub async fn get_series_books(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<BookResponse>>> {
    if series::find_by_id(&state.db, id).await?.is_none() {
        return Err(ApiError::NotFound(format!("Series {}", id)));
    }

    let books = books::list_for_series(&state.db, id).await?;
    Ok(Json(books.into_iter().map(Into::into).collect()))
}

/// GET /series/by-name/:name
pub async fn get_series_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<SeriesResponse>> {
    let found = series::find_by_normalized_name(&state.db, &name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Series '{}'", name)))?;

    Ok(Json(found.into()))
}

/// GET /search?q=...&limit=...
pub async fn search_series(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<Vec<SeriesResponse>>> {
    if params.q.trim().is_empty() {
        return Err(ApiError::BadRequest("Query must not be empty".to_string()));
    }

    let found = series::search(&state.db, &params.q, clamp_limit(params.limit)).await?;
    Ok(Json(found.into_iter().map(Into::into).collect()))
}

/// GET /series?genre=...&limit=...
pub async fn list_series(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<SeriesResponse>>> {
    let genre = params
        .genre
        .as_deref()
        .filter(|g| !g.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("genre parameter required".to_string()))?;

    let found = series::list_by_genre(&state.db, genre, clamp_limit(params.limit)).await?;
    Ok(Json(found.into_iter().map(Into::into).collect()))
}

/// Build series routes
pub fn series_routes() -> Router<AppState> {
    Router::new()
        .route("/series", get(list_series))
        .route("/series/by-name/:name", get(get_series_by_name))
        .route("/series/:id", get(get_series))
        .route("/series/:id/books", get(get_series_books))
        .route("/search", get(search_series))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), DEFAULT_LIMIT);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIMIT);
    }
}
