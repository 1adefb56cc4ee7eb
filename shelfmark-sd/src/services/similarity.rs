//! String normalization and fuzzy similarity primitives
//!
//! Every matching decision in the service goes through these helpers so
//! that provider records, stored rows, and incoming queries all agree on
//! what "the same title" means.

/// Normalize a series or author name for lookup and deduplication.
///
/// Lowercases, strips punctuation, collapses whitespace, trims. Must stay
/// in sync with the `name_normalized` / `title_normalized` columns.
pub fn normalize_name(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped: String = lowered
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();

    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize a book title for fuzzy comparison.
///
/// Same as [`normalize_name`] plus dropping a leading English article,
/// so "The Final Empire" and "Final Empire" compare equal.
pub fn normalize_title(title: &str) -> String {
    let normalized = normalize_name(title);

    for article in ["the ", "a ", "an "] {
        if let Some(rest) = normalized.strip_prefix(article) {
            return rest.to_string();
        }
    }

    normalized
}

/// Fuzzy string similarity using Jaro-Winkler over normalized inputs.
///
/// Returns a score in [0.0, 1.0]. Callers compare against the configured
/// thresholds (0.85 for titles, 0.80 for authors by default).
pub fn fuzzy_similarity(a: &str, b: &str) -> f64 {
    let a_normalized = normalize_name(a);
    let b_normalized = normalize_name(b);

    if a_normalized.is_empty() && b_normalized.is_empty() {
        return 1.0;
    }

    strsim::jaro_winkler(&a_normalized, &b_normalized)
}

/// Fuzzy similarity between two book titles (article-insensitive).
pub fn title_similarity(a: &str, b: &str) -> f64 {
    let a_normalized = normalize_title(a);
    let b_normalized = normalize_title(b);

    if a_normalized.is_empty() && b_normalized.is_empty() {
        return 1.0;
    }

    strsim::jaro_winkler(&a_normalized, &b_normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name_strips_punctuation_and_case() {
        assert_eq!(normalize_name("The Wheel of Time!"), "the wheel of time");
        assert_eq!(normalize_name("  Mistborn:   Era Two  "), "mistborn era two");
        assert_eq!(normalize_name("Hitchhiker's Guide"), "hitchhiker s guide");
    }

    #[test]
    fn test_normalize_name_empty() {
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_name("!!!"), "");
    }

    #[test]
    fn test_normalize_title_strips_leading_article() {
        assert_eq!(normalize_title("The Final Empire"), "final empire");
        assert_eq!(normalize_title("A Memory of Light"), "memory of light");
        assert_eq!(normalize_title("An Echo of Things to Come"), "echo of things to come");
        // Article only stripped at the front
        assert_eq!(normalize_title("Catch A Falling Star"), "catch a falling star");
    }

    #[test]
    fn test_identical_titles_score_one() {
        assert_eq!(title_similarity("The Final Empire", "Final Empire"), 1.0);
        assert_eq!(fuzzy_similarity("Brandon Sanderson", "brandon sanderson"), 1.0);
    }

    #[test]
    fn test_similar_titles_above_threshold() {
        let score = title_similarity("The Eye of the World", "Eye of the World");
        assert!(score >= 0.85, "score was {}", score);
    }

    #[test]
    fn test_unrelated_titles_below_threshold() {
        let score = title_similarity("The Eye of the World", "Dungeon Crawler Carl");
        assert!(score < 0.85, "score was {}", score);
    }
}
