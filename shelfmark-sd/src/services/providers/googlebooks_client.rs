//! Google Books API client
//!
//! Commercial books API with a hard daily request ceiling; the gateway
//! meters every call through the quota ledger. Second stop of the
//! enrichment waterfall.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::models::{ProviderKind, SourceBook, SourceFetch, SourceSeries};
use crate::services::providers::{SeriesProvider, SeriesQuery};

const GOOGLEBOOKS_BASE_URL: &str = "https://www.googleapis.com/books/v1";
const REQUESTS_PER_SECOND: u32 = 2;

#[derive(Debug, Deserialize)]
struct GBVolumesResponse {
    #[serde(default)]
    items: Vec<GBVolume>,
}

#[derive(Debug, Deserialize)]
struct GBVolume {
    id: Option<String>,
    #[serde(rename = "volumeInfo")]
    volume_info: GBVolumeInfo,
}

#[derive(Debug, Deserialize)]
struct GBVolumeInfo {
    title: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(rename = "publishedDate")]
    published_date: Option<String>,
    description: Option<String>,
    #[serde(rename = "industryIdentifiers", default)]
    industry_identifiers: Vec<GBIdentifier>,
    #[serde(default)]
    categories: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct GBIdentifier {
    #[serde(rename = "type")]
    id_type: String,
    identifier: String,
}

/// Google Books API client
pub struct GoogleBooksClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl GoogleBooksClient {
    pub fn new(api_key: Option<String>) -> shelfmark_common::Result<Self> {
        Self::with_base_url(GOOGLEBOOKS_BASE_URL.to_string(), api_key)
    }

    pub fn with_base_url(
        base_url: String,
        api_key: Option<String>,
    ) -> shelfmark_common::Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(shelfmark_common::config::user_agent())
            .timeout(Duration::from_secs(15))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| shelfmark_common::Error::Internal(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url,
            api_key,
            rate_limiter: RateLimiter::direct(Quota::per_second(
                NonZeroU32::new(REQUESTS_PER_SECOND).expect("rate is non-zero"),
            )),
        })
    }

    fn url_with_key(&self, mut url: String) -> String {
        if let Some(key) = &self.api_key {
            url.push_str(if url.contains('?') { "&key=" } else { "?key=" });
            url.push_str(key);
        }
        url
    }
}

fn extract_year(published_date: Option<&str>) -> Option<i64> {
    published_date
        .and_then(|d| d.get(0..4))
        .and_then(|y| y.parse::<i64>().ok())
        .filter(|y| *y > 0)
}

fn volume_to_book(volume: GBVolume) -> Option<SourceBook> {
    let title = volume.volume_info.title?;
    let isbn = volume
        .volume_info
        .industry_identifiers
        .iter()
        .find(|id| id.id_type == "ISBN_13")
        .or_else(|| {
            volume
                .volume_info
                .industry_identifiers
                .iter()
                .find(|id| id.id_type == "ISBN_10")
        })
        .map(|id| id.identifier.clone());

    Some(SourceBook {
        external_id: volume.id,
        title,
        position: None,
        author: volume.volume_info.authors.into_iter().next(),
        year: extract_year(volume.volume_info.published_date.as_deref()),
        isbn,
        description: volume.volume_info.description,
        ebook_available: false,
        audiobook_available: false,
    })
}

/// Build a series from a volume search. The description of the first
/// volume carrying one rides along as the series description candidate;
/// the classifier downstream decides whether it is usable.
fn parse_volumes_response(body: &str, series_name: &str) -> Result<Option<SourceSeries>, String> {
    let response: GBVolumesResponse =
        serde_json::from_str(body).map_err(|e| format!("parse error: {}", e))?;

    if response.items.is_empty() {
        return Ok(None);
    }

    let author = response
        .items
        .iter()
        .find_map(|v| v.volume_info.authors.first().cloned());
    let tags = response
        .items
        .iter()
        .flat_map(|v| v.volume_info.categories.iter().cloned())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let mut description = None;
    let books: Vec<SourceBook> = response
        .items
        .into_iter()
        .filter_map(|volume| {
            let book = volume_to_book(volume)?;
            if description.is_none() {
                description = book.description.clone();
            }
            Some(book)
        })
        .collect();

    Ok(Some(SourceSeries {
        provider: ProviderKind::GoogleBooks,
        external_id: None,
        name: series_name.to_string(),
        author,
        description,
        books,
        sub_series: Vec::new(),
        parent: None,
        tags,
    }))
}

fn parse_volume_response(body: &str) -> Result<Option<SourceSeries>, String> {
    let volume: GBVolume = serde_json::from_str(body).map_err(|e| format!("parse error: {}", e))?;

    let Some(book) = volume_to_book(volume) else {
        return Ok(None);
    };

    Ok(Some(SourceSeries {
        provider: ProviderKind::GoogleBooks,
        external_id: book.external_id.clone(),
        name: book.title.clone(),
        author: book.author.clone(),
        description: book.description.clone(),
        books: vec![book],
        sub_series: Vec::new(),
        parent: None,
        tags: Vec::new(),
    }))
}

#[async_trait]
impl SeriesProvider for GoogleBooksClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleBooks
    }

    async fn fetch_series(&self, query: &SeriesQuery) -> SourceFetch {
        self.rate_limiter.until_ready().await;

        let (url, by_name) = match query {
            SeriesQuery::ByName { name, author } => {
                let mut q = format!("intitle:\"{}\"", name);
                if let Some(author) = author {
                    q.push_str(&format!(" inauthor:\"{}\"", author));
                }
                (
                    self.url_with_key(format!(
                        "{}/volumes?q={}&maxResults=40",
                        self.base_url,
                        super::openlibrary_client::urlencode(&q)
                    )),
                    Some(name.clone()),
                )
            }
            SeriesQuery::ByExternalId(id) => (
                self.url_with_key(format!("{}/volumes/{}", self.base_url, id)),
                None,
            ),
        };

        tracing::debug!(query = %query, "Querying Google Books");

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

        let parsed = match &by_name {
            Some(name) => parse_volumes_response(&body, name),
            None => parse_volume_response(&body),
        };

        match parsed {
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
    fn test_parse_volumes_response() {
        let body = r#"{
            "items": [
                {"id": "abc123", "volumeInfo": {
                    "title": "Unsouled",
                    "authors": ["Will Wight"],
                    "publishedDate": "2016-06-21",
                    "description": "Book 1 of the Cradle series.",
                    "industryIdentifiers": [
                        {"type": "ISBN_13", "identifier": "9780989671767"},
                        {"type": "ISBN_10", "identifier": "0989671763"}
                    ],
                    "categories": ["Fiction / Fantasy"]
                }},
                {"id": "def456", "volumeInfo": {
                    "title": "Soulsmith",
                    "authors": ["Will Wight"],
                    "publishedDate": "2016"
                }}
            ]
        }"#;

        let series = parse_volumes_response(body, "Cradle").unwrap().unwrap();
        assert_eq!(series.books.len(), 2);
        assert_eq!(series.books[0].isbn.as_deref(), Some("9780989671767"));
        assert_eq!(series.books[0].year, Some(2016));
        assert_eq!(series.books[1].year, Some(2016));
        assert_eq!(series.author.as_deref(), Some("Will Wight"));
        assert_eq!(
            series.description.as_deref(),
            Some("Book 1 of the Cradle series.")
        );
        assert_eq!(series.tags, vec!["Fiction / Fantasy".to_string()]);
    }

    #[test]
    fn test_parse_empty_items_is_miss() {
        assert!(parse_volumes_response(r#"{"items": []}"#, "X")
            .unwrap()
            .is_none());
        assert!(parse_volumes_response(r#"{"totalItems": 0}"#, "X")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_extract_year() {
        assert_eq!(extract_year(Some("2016-06-21")), Some(2016));
        assert_eq!(extract_year(Some("2016")), Some(2016));
        assert_eq!(extract_year(Some("bad")), None);
        assert_eq!(extract_year(None), None);
    }

    #[test]
    fn test_url_with_key() {
        let client =
            GoogleBooksClient::with_base_url("http://x".to_string(), Some("KEY".to_string()))
                .unwrap();
        assert_eq!(
            client.url_with_key("http://x/volumes?q=a".to_string()),
            "http://x/volumes?q=a&key=KEY"
        );
        assert_eq!(
            client.url_with_key("http://x/volumes/1".to_string()),
            "http://x/volumes/1?key=KEY"
        );
    }
}
