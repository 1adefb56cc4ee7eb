//! Reconciliation matcher
//!
//! Compares two providers' accounts of the same series, scores how well
//! they agree, flags discrepancies, and merges them into one record. The
//! score weights were chosen empirically and live in configuration rather
//! than at the call sites.

use serde::Deserialize;

use crate::models::{
    ComparisonResult, Discrepancy, DiscrepancyField, SourceBook, SourceFetch, SourceSeries,
};
use crate::services::similarity::{fuzzy_similarity, title_similarity};

/// Confidence formula weights
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherWeights {
    /// Credit when both providers report the same book count
    pub count_match: f64,
    /// Partial credit when the counts differ
    pub count_partial: f64,
    /// Weight of the title-match ratio
    pub title_ratio: f64,
    /// Credit when matched titles appear in the same relative order
    pub order_match: f64,
    /// Unconditional base credit
    pub base: f64,
    /// Deduction per recorded discrepancy
    pub discrepancy_penalty: f64,
}

impl Default for MatcherWeights {
    fn default() -> Self {
        Self {
            count_match: 0.25,
            count_partial: 0.10,
            title_ratio: 0.50,
            order_match: 0.15,
            base: 0.10,
            discrepancy_penalty: 0.05,
        }
    }
}

/// Matcher thresholds and weights
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Minimum fuzzy similarity for two titles to count as the same book
    pub title_match_threshold: f64,
    /// Minimum fuzzy similarity before authors are flagged as conflicting
    pub author_match_threshold: f64,
    /// At or above: accept automatically, discrepancies or not
    pub auto_accept_threshold: f64,
    /// Below: manual review, no automatic escalation
    pub manual_review_threshold: f64,
    pub weights: MatcherWeights,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            title_match_threshold: 0.85,
            author_match_threshold: 0.80,
            auto_accept_threshold: 0.90,
            manual_review_threshold: 0.50,
            weights: MatcherWeights::default(),
        }
    }
}

/// Series matcher
pub struct SeriesMatcher {
    config: MatcherConfig,
}

impl SeriesMatcher {
    pub fn new(config: MatcherConfig) -> Self {
        Self { config }
    }

    /// Compare two provider fetches of (presumably) the same series.
    ///
    /// Returns `None` unless both fetches carry a series.
    pub fn compare(&self, a: &SourceFetch, b: &SourceFetch) -> Option<ComparisonResult> {
        let series_a = a.series.as_ref()?;
        let series_b = b.series.as_ref()?;

        let source_a = series_a.provider.as_str().to_string();
        let source_b = series_b.provider.as_str().to_string();

        let count_a = series_a.books.len();
        let count_b = series_b.books.len();
        let book_count_match = count_a == count_b;

        let mut discrepancies = Vec::new();

        if !book_count_match {
            discrepancies.push(Discrepancy {
                field: DiscrepancyField::BookCount,
                source_a: source_a.clone(),
                value_a: count_a.to_string(),
                source_b: source_b.clone(),
                value_b: count_b.to_string(),
            });
        }

        // Title matching: for each A book, the best B book at or above the
        // fuzzy threshold. Matched index pairs feed the order check below.
        let mut matched_pairs: Vec<(usize, usize)> = Vec::new();
        for (idx_a, book_a) in series_a.books.iter().enumerate() {
            let best = series_b
                .books
                .iter()
                .enumerate()
                .map(|(idx_b, book_b)| (idx_b, title_similarity(&book_a.title, &book_b.title)))
                .filter(|(_, score)| *score >= self.config.title_match_threshold)
                .max_by(|(_, x), (_, y)| x.partial_cmp(y).unwrap_or(std::cmp::Ordering::Equal));

            match best {
                Some((idx_b, _)) => matched_pairs.push((idx_a, idx_b)),
                None => discrepancies.push(Discrepancy {
                    field: DiscrepancyField::Title,
                    source_a: source_a.clone(),
                    value_a: book_a.title.clone(),
                    source_b: source_b.clone(),
                    value_b: "(no matching title)".to_string(),
                }),
            }
        }

        let title_matches = matched_pairs.len();
        let title_match_ratio = if count_a.max(count_b) > 0 {
            title_matches as f64 / count_a.max(count_b) as f64
        } else {
            // Two empty lists agree about nothing in particular
            1.0
        };

        // Order check over matched pairs only: walking A in order, the B
        // positions must never step backwards. Vacuously true under two
        // matched pairs.
        let order_match = matched_pairs.windows(2).all(|w| w[0].1 <= w[1].1);
        if !order_match && title_matches > 2 {
            discrepancies.push(Discrepancy {
                field: DiscrepancyField::Order,
                source_a: source_a.clone(),
                value_a: format!("{:?}", matched_pairs.iter().map(|p| p.0).collect::<Vec<_>>()),
                source_b: source_b.clone(),
                value_b: format!("{:?}", matched_pairs.iter().map(|p| p.1).collect::<Vec<_>>()),
            });
        }

        if let (Some(author_a), Some(author_b)) = (&series_a.author, &series_b.author) {
            if fuzzy_similarity(author_a, author_b) < self.config.author_match_threshold {
                discrepancies.push(Discrepancy {
                    field: DiscrepancyField::Author,
                    source_a: source_a.clone(),
                    value_a: author_a.clone(),
                    source_b: source_b.clone(),
                    value_b: author_b.clone(),
                });
            }
        }

        let w = &self.config.weights;
        let mut confidence = if book_count_match {
            w.count_match
        } else {
            w.count_partial
        };
        confidence += w.title_ratio * title_match_ratio;
        if order_match {
            confidence += w.order_match;
        }
        confidence += w.base;
        confidence -= w.discrepancy_penalty * discrepancies.len() as f64;
        let confidence = confidence.clamp(0.0, 1.0);

        tracing::debug!(
            source_a = %source_a,
            source_b = %source_b,
            title_matches,
            discrepancies = discrepancies.len(),
            confidence,
            "Compared series accounts"
        );

        Some(ComparisonResult {
            book_count_match,
            book_count_a: count_a,
            book_count_b: count_b,
            title_matches,
            title_match_ratio,
            order_match,
            discrepancies,
            confidence,
        })
    }

    /// Whether an ambiguous pair should be escalated to a tertiary
    /// verification path.
    ///
    /// True iff confidence sits in [manual_review, auto_accept) and at
    /// least one discrepancy exists. Below the band is a manual-review
    /// case; at or above auto_accept the pair is accepted regardless.
    pub fn needs_verification(&self, result: &ComparisonResult) -> bool {
        result.confidence >= self.config.manual_review_threshold
            && result.confidence < self.config.auto_accept_threshold
            && !result.discrepancies.is_empty()
    }

    /// Merge two accounts into one, preferring the first.
    ///
    /// Scalars come from `preferred`, falling back to the other side's
    /// non-empty value. The preferred book list is kept whole; books from
    /// the other side are appended only when no fuzzy-matched title is
    /// already present. The result is re-sorted by position, unset last.
    pub fn merge(&self, preferred: &SourceSeries, other: &SourceSeries) -> SourceSeries {
        let mut books: Vec<SourceBook> = preferred.books.clone();

        for candidate in &other.books {
            let already_present = books.iter().any(|existing| {
                title_similarity(&existing.title, &candidate.title)
                    >= self.config.title_match_threshold
            });
            if !already_present {
                books.push(candidate.clone());
            }
        }

        books.sort_by(|a, b| {
            match (a.position, b.position) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => std::cmp::Ordering::Equal,
            }
        });

        SourceSeries {
            provider: preferred.provider,
            external_id: preferred
                .external_id
                .clone()
                .or_else(|| other.external_id.clone()),
            name: if preferred.name.is_empty() {
                other.name.clone()
            } else {
                preferred.name.clone()
            },
            author: preferred.author.clone().or_else(|| other.author.clone()),
            description: preferred
                .description
                .clone()
                .or_else(|| other.description.clone()),
            books,
            sub_series: if preferred.sub_series.is_empty() {
                other.sub_series.clone()
            } else {
                preferred.sub_series.clone()
            },
            parent: preferred.parent.clone().or_else(|| other.parent.clone()),
            tags: if preferred.tags.is_empty() {
                other.tags.clone()
            } else {
                preferred.tags.clone()
            },
        }
    }
}

impl Default for SeriesMatcher {
    fn default() -> Self {
        Self::new(MatcherConfig::default())
    }
}
