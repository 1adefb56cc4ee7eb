//! Provider-normalized series shapes
//!
//! Every provider client maps its own response format into these records.
//! They are ephemeral: the matcher and hierarchy reconciler consume them
//! directly, and only the serialized raw form is persisted (one envelope
//! per series and provider) for audit.

use serde::{Deserialize, Serialize};

use super::ProviderKind;

/// A series as one provider describes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSeries {
    /// Which provider produced this record
    pub provider: ProviderKind,
    /// Provider's own id for the series
    pub external_id: Option<String>,
    pub name: String,
    pub author: Option<String>,
    pub description: Option<String>,
    /// Books in the provider's declared order
    pub books: Vec<SourceBook>,
    /// Declared sub-series, if the provider models hierarchy
    #[serde(default)]
    pub sub_series: Vec<SeriesRef>,
    /// Declared parent series, if any
    #[serde(default)]
    pub parent: Option<SeriesRef>,
    /// Free-form subject/genre tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Lightweight reference to a related series (parent or sub-series)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesRef {
    pub external_id: Option<String>,
    pub name: String,
    /// Position of the sub-series within its parent, when declared
    pub position: Option<f64>,
}

/// A book as one provider describes it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceBook {
    pub external_id: Option<String>,
    pub title: String,
    /// May be fractional (1.5 for side stories); None when unnumbered
    pub position: Option<f64>,
    pub author: Option<String>,
    pub year: Option<i64>,
    pub isbn: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub ebook_available: bool,
    #[serde(default)]
    pub audiobook_available: bool,
}

/// Uniform result of one provider fetch.
///
/// `series: None` with `error: None` is a data miss ("provider is up,
/// nothing found") and must be recorded as a breaker success. A populated
/// `error` is an operational failure the breaker should count.
#[derive(Debug, Clone)]
pub struct SourceFetch {
    pub series: Option<SourceSeries>,
    /// Raw response body, kept for the audit envelope
    pub raw: Option<String>,
    pub error: Option<String>,
}

impl SourceFetch {
    pub fn found(series: SourceSeries, raw: impl Into<String>) -> Self {
        Self {
            series: Some(series),
            raw: Some(raw.into()),
            error: None,
        }
    }

    pub fn miss(raw: Option<String>) -> Self {
        Self {
            series: None,
            raw,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            series: None,
            raw: None,
            error: Some(error.into()),
        }
    }

    /// Operational failure (counts toward the breaker)
    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Data miss: the provider answered, but had nothing for this query
    pub fn is_miss(&self) -> bool {
        self.series.is_none() && self.error.is_none()
    }
}
