//! Series-level vs single-volume description classifier
//!
//! Providers frequently hand back the blurb of one book where a series
//! overview was requested. The enrichment scheduler rejects those and
//! falls through to the next provider. The phrase lists are configuration,
//! not literals scattered through call sites, so they can be tuned without
//! touching the classifier.

use serde::Deserialize;

/// Tunable feature lists for the classifier
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Phrases indicating a single-volume synopsis
    pub volume_phrases: Vec<String>,
    /// Words indicating series-level language
    pub series_keywords: Vec<String>,
    /// Section headers that settle the question outright
    pub series_sections: Vec<String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            volume_phrases: vec![
                "grab your copy".to_string(),
                "the latest installment".to_string(),
                "the first book in".to_string(),
                "now available".to_string(),
            ],
            series_keywords: vec![
                "series".to_string(),
                "saga".to_string(),
                "trilogy".to_string(),
                "chronicles".to_string(),
            ],
            series_sections: vec!["about the series".to_string()],
        }
    }
}

/// Pure classifier deciding whether a text reads as a series-level
/// overview (as opposed to the synopsis of one volume).
pub struct DescriptionClassifier {
    config: ClassifierConfig,
}

impl DescriptionClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify `text`. `series_name`, when known, lets "<name> series"
    /// count as series-level language.
    ///
    /// Scoring: explicit section headers weigh heaviest, then keyword and
    /// phrase hits on each side. With no single-volume markers at all the
    /// text is accepted; otherwise series language must outweigh them.
    pub fn is_series_description(&self, text: &str, series_name: Option<&str>) -> bool {
        let lower = text.to_lowercase();

        let mut series_score = 0usize;
        let mut volume_score = 0usize;

        for section in &self.config.series_sections {
            if lower.contains(section.as_str()) {
                series_score += 3;
            }
        }
        for keyword in &self.config.series_keywords {
            if lower.contains(keyword.as_str()) {
                series_score += 1;
            }
        }
        if let Some(name) = series_name {
            let name_phrase = format!("{} series", name.to_lowercase());
            if lower.contains(&name_phrase) {
                series_score += 1;
            }
        }

        for phrase in &self.config.volume_phrases {
            if lower.contains(phrase.as_str()) {
                volume_score += 1;
            }
        }
        if contains_book_number_of(&lower) {
            volume_score += 1;
        }

        if volume_score == 0 {
            true
        } else {
            series_score > volume_score
        }
    }
}

impl Default for DescriptionClassifier {
    fn default() -> Self {
        Self::new(ClassifierConfig::default())
    }
}

/// Detect "book <number> of" phrasing ("Book 3 of the Wandering Inn")
fn contains_book_number_of(lower: &str) -> bool {
    let mut rest = lower;
    while let Some(idx) = rest.find("book ") {
        let tail = &rest[idx + 5..];
        let mut words = tail.split_whitespace();
        if let (Some(number), Some(next)) = (words.next(), words.next()) {
            if number.chars().all(|c| c.is_ascii_digit()) && next == "of" {
                return true;
            }
        }
        rest = &rest[idx + 5..];
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_series_overview_accepted() {
        let classifier = DescriptionClassifier::default();
        assert!(classifier.is_series_description(
            "An epic fantasy saga spanning twelve volumes and three continents.",
            None
        ));
    }

    #[test]
    fn test_single_volume_synopsis_rejected() {
        let classifier = DescriptionClassifier::default();
        assert!(!classifier.is_series_description(
            "Book 3 of the Wandering Inn. Erin faces her greatest challenge yet. \
             Grab your copy today!",
            None
        ));
    }

    #[test]
    fn test_explicit_section_header_wins() {
        let classifier = DescriptionClassifier::default();
        assert!(classifier.is_series_description(
            "ABOUT THE SERIES: A sprawling space opera. \
             The latest installment is now available.",
            None
        ));
    }

    #[test]
    fn test_volume_marker_beats_bare_keyword() {
        let classifier = DescriptionClassifier::default();
        // "series" appears, but so do two single-volume markers
        assert!(!classifier.is_series_description(
            "The first book in the Cradle series. Grab your copy now.",
            None
        ));
    }

    #[test]
    fn test_series_name_counts_as_series_language() {
        let classifier = DescriptionClassifier::default();
        assert!(classifier.is_series_description(
            "The Cradle series follows Lindon from Unsouled onward. \
             Now available in paperback.",
            Some("Cradle")
        ));
    }

    #[test]
    fn test_neutral_text_accepted() {
        let classifier = DescriptionClassifier::default();
        assert!(classifier.is_series_description(
            "Sacred artists follow a thousand Paths to power.",
            None
        ));
    }

    #[test]
    fn test_book_number_detection() {
        assert!(contains_book_number_of("book 12 of the saga"));
        assert!(!contains_book_number_of("a book of hours"));
        assert!(!contains_book_number_of("bring the book over"));
    }
}
