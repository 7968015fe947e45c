//! Genre allow-list used to classify the genre section of a catalog page

use std::collections::HashSet;
use std::path::Path;

use tracing::debug;

use super::error::CrawlError;

const DEFAULT_GENRES: &str = include_str!("genres.txt");

/// Immutable, ordered set of recognised genre labels
///
/// Matching is a literal substring scan over every label. That is permissive on
/// purpose: a label contained in another label ("Fiction" in "Science Fiction")
/// matches whenever the longer one does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenreVocabulary {
    labels: Vec<String>,
}

impl Default for GenreVocabulary {
    fn default() -> Self {
        Self::parse(DEFAULT_GENRES)
    }
}

impl GenreVocabulary {
    /// Build a vocabulary from labels, dropping blanks and duplicates while keeping order
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let labels = labels
            .into_iter()
            .map(|label| label.as_ref().trim().to_string())
            .filter(|label| !label.is_empty())
            .filter(|label| seen.insert(label.clone()))
            .collect();
        Self { labels }
    }

    /// Parse a label list, one per line; `#` starts a comment line
    pub fn parse(text: &str) -> Self {
        Self::new(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.starts_with('#')),
        )
    }

    /// Load a label list from a file
    pub async fn load(path: &Path) -> Result<Self, CrawlError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            CrawlError::Vocabulary(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let vocabulary = Self::parse(&text);
        if vocabulary.is_empty() {
            return Err(CrawlError::Vocabulary(format!(
                "{} contains no genre labels",
                path.display()
            )));
        }
        debug!("Loaded {} genre labels from {}", vocabulary.len(), path.display());
        Ok(vocabulary)
    }

    /// Labels occurring as literal substrings of `haystack`, in vocabulary order
    pub fn contains_as_substring(&self, haystack: &str) -> Vec<String> {
        self.labels
            .iter()
            .filter(|label| haystack.contains(label.as_str()))
            .cloned()
            .collect()
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// Whether the vocabulary has no labels
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterate over the labels
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}
