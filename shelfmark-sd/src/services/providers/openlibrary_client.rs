//! Open Library API client
//!
//! General book catalog, no API key and no daily quota. Used as the first
//! stop of the enrichment waterfall. Rate limited to stay a polite guest.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::models::{ProviderKind, SourceBook, SourceFetch, SourceSeries};
use crate::services::providers::{SeriesProvider, SeriesQuery};

const OPENLIBRARY_BASE_URL: &str = "https://openlibrary.org";
const REQUESTS_PER_SECOND: u32 = 1;

/// Open Library search response
#[derive(Debug, Deserialize)]
struct OLSearchResponse {
    #[serde(default)]
    docs: Vec<OLDoc>,
}

#[derive(Debug, Deserialize)]
struct OLDoc {
    key: Option<String>,
    title: Option<String>,
    #[serde(default)]
    author_name: Vec<String>,
    first_publish_year: Option<i64>,
    #[serde(default)]
    isbn: Vec<String>,
    ebook_access: Option<String>,
}

/// Open Library work record
#[derive(Debug, Deserialize)]
struct OLWork {
    key: Option<String>,
    title: Option<String>,
    description: Option<serde_json::Value>,
    #[serde(default)]
    subjects: Vec<String>,
}

/// Open Library API client
pub struct OpenLibraryClient {
    http_client: reqwest::Client,
    base_url: String,
    rate_limiter: RateLimiter<
        governor::state::direct::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
}

impl OpenLibraryClient {
    pub fn new() -> shelfmark_common::Result<Self> {
        Self::with_base_url(OPENLIBRARY_BASE_URL.to_string())
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

    async fn get(&self, url: &str) -> SourceFetchStep {
        self.rate_limiter.until_ready().await;

        tracing::debug!(url = %url, "Querying Open Library");

        let response = match self.http_client.get(url).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return SourceFetchStep::Failed(format!("timeout: {}", e)),
            Err(e) => return SourceFetchStep::Failed(format!("connection error: {}", e)),
        };

        let status = response.status();
        if status.as_u16() == 404 {
            return SourceFetchStep::Miss;
        }
        if status.as_u16() == 429 || status.is_server_error() {
            return SourceFetchStep::Failed(format!("HTTP {}", status.as_u16()));
        }
        if !status.is_success() {
            return SourceFetchStep::Failed(format!("HTTP {}", status.as_u16()));
        }

        match response.text().await {
            Ok(body) => SourceFetchStep::Body(body),
            Err(e) => SourceFetchStep::Failed(format!("body read error: {}", e)),
        }
    }
}

/// Intermediate outcome of one HTTP exchange
enum SourceFetchStep {
    Body(String),
    Miss,
    Failed(String),
}

/// Build a series from a title search: the docs become the book list and
/// the most frequent author becomes the series author.
fn parse_search_response(body: &str, series_name: &str) -> Result<Option<SourceSeries>, String> {
    let response: OLSearchResponse =
        serde_json::from_str(body).map_err(|e| format!("parse error: {}", e))?;

    if response.docs.is_empty() {
        return Ok(None);
    }

    let mut author_counts: HashMap<&str, usize> = HashMap::new();
    for doc in &response.docs {
        if let Some(author) = doc.author_name.first() {
            *author_counts.entry(author.as_str()).or_default() += 1;
        }
    }
    let primary_author = author_counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(author, _)| author.to_string());

    let books: Vec<SourceBook> = response
        .docs
        .into_iter()
        .filter_map(|doc| {
            let title = doc.title?;
            Some(SourceBook {
                external_id: doc.key,
                title,
                position: None,
                author: doc.author_name.into_iter().next(),
                year: doc.first_publish_year,
                isbn: doc.isbn.into_iter().next(),
                description: None,
                ebook_available: doc
                    .ebook_access
                    .map(|a| a == "public" || a == "borrowable")
                    .unwrap_or(false),
                audiobook_available: false,
            })
        })
        .collect();

    Ok(Some(SourceSeries {
        provider: ProviderKind::OpenLibrary,
        external_id: None,
        name: series_name.to_string(),
        author: primary_author,
        description: None,
        books,
        sub_series: Vec::new(),
        parent: None,
        tags: Vec::new(),
    }))
}

/// Build a series shell from one work record. Open Library descriptions
/// are either a bare string or a `{"type", "value"}` object.
fn parse_work_response(body: &str) -> Result<Option<SourceSeries>, String> {
    let work: OLWork = serde_json::from_str(body).map_err(|e| format!("parse error: {}", e))?;

    let Some(title) = work.title else {
        return Ok(None);
    };

    let description = work.description.and_then(|d| match d {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Object(map) => map
            .get("value")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    });

    Ok(Some(SourceSeries {
        provider: ProviderKind::OpenLibrary,
        external_id: work.key.map(|k| k.trim_start_matches("/works/").to_string()),
        name: title,
        author: None,
        description,
        books: Vec::new(),
        sub_series: Vec::new(),
        parent: None,
        tags: work.subjects,
    }))
}

#[async_trait]
impl SeriesProvider for OpenLibraryClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenLibrary
    }

    async fn fetch_series(&self, query: &SeriesQuery) -> SourceFetch {
        let (url, by_name) = match query {
            SeriesQuery::ByName { name, author } => {
                let mut url = format!(
                    "{}/search.json?title={}&limit=50",
                    self.base_url,
                    urlencode(name)
                );
                if let Some(author) = author {
                    url.push_str(&format!("&author={}", urlencode(author)));
                }
                (url, Some(name.clone()))
            }
            SeriesQuery::ByExternalId(id) => {
                (format!("{}/works/{}.json", self.base_url, id), None)
            }
        };

        let body = match self.get(&url).await {
            SourceFetchStep::Body(body) => body,
            SourceFetchStep::Miss => return SourceFetch::miss(None),
            SourceFetchStep::Failed(message) => return SourceFetch::failed(message),
        };

        let parsed = match &by_name {
            Some(name) => parse_search_response(&body, name),
            None => parse_work_response(&body),
        };

        match parsed {
            Ok(Some(series)) => SourceFetch::found(series, body),
            Ok(None) => SourceFetch::miss(Some(body)),
            Err(message) => SourceFetch::failed(message),
        }
    }
}

pub(crate) fn urlencode(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_string()
            } else if c == ' ' {
                "+".to_string()
            } else {
                let mut encoded = String::new();
                let mut buf = [0u8; 4];
                for byte in c.encode_utf8(&mut buf).bytes() {
                    encoded.push_str(&format!("%{:02X}", byte));
                }
                encoded
            }
        })
        .collect()
}
