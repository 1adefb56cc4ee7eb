//! Data models for shelfmark-sd

pub mod comparison;
pub mod source;

pub use comparison::{ComparisonResult, Discrepancy, DiscrepancyField};
pub use source::{SeriesRef, SourceBook, SourceFetch, SourceSeries};

use serde::{Deserialize, Serialize};

/// External bibliographic data sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Speculative-fiction database; canonical authority for series hierarchy
    Isfdb,
    /// General book catalog; no daily quota
    OpenLibrary,
    /// Commercial books API; quota-capped
    GoogleBooks,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [
        ProviderKind::Isfdb,
        ProviderKind::OpenLibrary,
        ProviderKind::GoogleBooks,
    ];

    /// Stable tag used for quota rows, payload envelopes and logging
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Isfdb => "isfdb",
            ProviderKind::OpenLibrary => "openlibrary",
            ProviderKind::GoogleBooks => "googlebooks",
        }
    }

    /// Baseline confidence for records ingested from this provider
    pub fn default_confidence(&self) -> f64 {
        match self {
            ProviderKind::Isfdb => 0.9,
            ProviderKind::OpenLibrary => 0.7,
            ProviderKind::GoogleBooks => 0.75,
        }
    }

    /// Column on `series` / `series_book` holding this provider's id
    pub fn id_column(&self) -> &'static str {
        match self {
            ProviderKind::Isfdb => "isfdb_id",
            ProviderKind::OpenLibrary => "openlibrary_id",
            ProviderKind::GoogleBooks => "googlebooks_id",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
