//! ISFDB API client
//!
//! Speculative-fiction database. Treated as the canonical authority for
//! series hierarchy: its records carry explicit parent and sub-series
//! references, which drive the hierarchy reconciler. Third stop of the
//! enrichment waterfall.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::models::{ProviderKind, SeriesRef, SourceBook, SourceFetch, SourceSeries};
use crate::services::providers::{openlibrary_client::urlencode, SeriesProvider, SeriesQuery};

const ISFDB_BASE_URL: &str = "https://api.isfdb.org";
const REQUESTS_PER_SECOND: u32 = 1;

#[derive(Debug, Deserialize)]
struct IsfdbSeries {
    series_id: i64,
    series_title: String,
    series_parent: Option<IsfdbSeriesRef>,
    #[serde(default)]
    sub_series: Vec<IsfdbSeriesRef>,
    #[serde(default)]
    titles: Vec<IsfdbTitle>,
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IsfdbSeriesRef {
    series_id: i64,
    series_title: String,
    series_parent_position: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct IsfdbTitle {
    title_id: i64,
    title: String,
    seriesnum: Option<f64>,
    year: Option<i64>,
    author: Option<String>,
    isbn: Option<String>,
}

/// ISFDB API client
pub struct IsfdbClient {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl IsfdbClient {
    pub fn new() -> shelfmark_common::Result<Self> {
        Self::with_base_url(ISFDB_BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> shelfmark_common::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(shelfmark_common::config::user_agent())
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| shelfmark_common::Error::Internal(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            rate_limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(REQUESTS_PER_SECOND).expect("rate is non-zero"),
            )),
        })
    }
}

fn series_ref(r: IsfdbSeriesRef) -> SeriesRef {
    SeriesRef {
        external_id: Some(r.series_id.to_string()),
        name: r.series_title,
        position: r.series_parent_position,
    }
}

/// Map an ISFDB series record into the provider-normalized shape. The
/// primary author is the one credited on the most titles, matching how
/// the import tooling has always picked it.
fn parse_series_response(body: &str) -> Result<Option<SourceSeries>, String> {
    let record: IsfdbSeries =
        serde_json::from_str(body).map_err(|e| format!("parse error: {}", e))?;

    let mut author_counts: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for title in &record.titles {
        if let Some(author) = &title.author {
            *author_counts.entry(author.as_str()).or_default() += 1;
        }
    }
    let primary_author = author_counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(author, _)| author.to_string());

    let books: Vec<SourceBook> = record
        .titles
        .into_iter()
        .map(|t| SourceBook {
            external_id: Some(t.title_id.to_string()),
            title: t.title,
            position: t.seriesnum,
            author: t.author,
            year: t.year,
            isbn: t.isbn,
            description: None,
            ebook_available: false,
            audiobook_available: false,
        })
        .collect();

    Ok(Some(SourceSeries {
        provider: ProviderKind::Isfdb,
        external_id: Some(record.series_id.to_string()),
        name: record.series_title,
        author: primary_author,
        description: record.note,
        books,
        sub_series: record.sub_series.into_iter().map(series_ref).collect(),
        parent: record.series_parent.map(series_ref),
        tags: Vec::new(),
    }))
}

#[async_trait]
impl SeriesProvider for IsfdbClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Isfdb
    }

    async fn fetch_series(&self, query: &SeriesQuery) -> SourceFetch {
        self.rate_limiter.until_ready().await;

        let url = match query {
            SeriesQuery::ByExternalId(id) => format!("{}/api/series/{}", self.base_url, id),
            SeriesQuery::ByName { name, .. } => {
                format!("{}/api/series?name={}", self.base_url, urlencode(name))
            }
        };

        tracing::debug!(query = %query, "Querying ISFDB");

        let response = match self.http_client.get(&url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return SourceFetch::failed(format!("timeout: {}", e)),
            Err(e) => return SourceFetch::failed(format!("connection error: {}", e)),
        };

        let status = response.status();
        if status.as_u16() == 404 {
            return SourceFetch::miss(None);
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return SourceFetch::failed(format!("HTTP {}", status.as_u16()));
        }
        if !status.is_success() {
            return SourceFetch::failed(format!("HTTP {}", status.as_u16()));
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return SourceFetch::failed(format!("body read error: {}", e)),
        };

        match parse_series_response(&body) {
            Ok(Some(series)) => SourceFetch::found(series, body),
            Ok(None) => SourceFetch::miss(Some(body)),
            Err(message) => SourceFetch::failed(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_series_with_hierarchy() {
        let body = r#"{
            "series_id": 45231,
            "series_title": "Cradle Universe",
            "series_parent": null,
            "sub_series": [
                {"series_id": 45232, "series_title": "Cradle", "series_parent_position": 1},
                {"series_id": 45233, "series_title": "Cradle: Side Stories", "series_parent_position": 2}
            ],
            "titles": [],
            "note": "Progression fantasy universe."
        }"#;

        let series = parse_series_response(body).unwrap().unwrap();
        assert_eq!(series.external_id.as_deref(), Some("45231"));
        assert_eq!(series.sub_series.len(), 2);
        assert_eq!(series.sub_series[0].external_id.as_deref(), Some("45232"));
        assert_eq!(series.sub_series[0].position, Some(1.0));
        assert!(series.parent.is_none());
        assert_eq!(series.description.as_deref(), Some("Progression fantasy universe."));
    }

    #[test]
    fn test_parse_series_with_fractional_positions() {
        let body = r#"{
            "series_id": 45232,
            "series_title": "Cradle",
            "series_parent": {"series_id": 45231, "series_title": "Cradle Universe",
                              "series_parent_position": null},
            "titles": [
                {"title_id": 1, "title": "Unsouled", "seriesnum": 1,
                 "year": 2016, "author": "Will Wight", "isbn": "9780989671767"},
                {"title_id": 2, "title": "The Three Sisters", "seriesnum": 1.5,
                 "year": 2017, "author": "Will Wight", "isbn": null}
            ]
        }"#;

        let series = parse_series_response(body).unwrap().unwrap();
        assert_eq!(series.parent.as_ref().unwrap().external_id.as_deref(), Some("45231"));
        assert_eq!(series.books.len(), 2);
        assert_eq!(series.books[0].position, Some(1.0));
        assert_eq!(series.books[1].position, Some(1.5));
        assert_eq!(series.author.as_deref(), Some("Will Wight"));
    }

    #[test]
    fn test_parse_error_is_failure() {
        assert!(parse_series_response("<html>down</html>").is_err());
    }
}
