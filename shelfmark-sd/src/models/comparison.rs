//! Comparison output types for the reconciliation matcher

use serde::Serialize;

/// Field a discrepancy was observed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyField {
    BookCount,
    Title,
    Order,
    Author,
}

/// One disagreement between two providers' accounts of a series
#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub field: DiscrepancyField,
    /// Provider tag for side A
    pub source_a: String,
    pub value_a: String,
    /// Provider tag for side B
    pub source_b: String,
    pub value_b: String,
}

/// Result of comparing two providers' accounts of the same series
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonResult {
    pub book_count_match: bool,
    pub book_count_a: usize,
    pub book_count_b: usize,
    /// Number of A-side titles with a fuzzy match on the B side
    pub title_matches: usize,
    /// title_matches / max(book_count_a, book_count_b)
    pub title_match_ratio: f64,
    /// Relative ordering of matched titles preserved in both lists
    pub order_match: bool,
    pub discrepancies: Vec<Discrepancy>,
    /// Combined confidence in [0, 1]
    pub confidence: f64,
}
