//! Field extraction for catalog pages
//!
//! Every extractor degrades to `None` when the section it looks for is missing;
//! nothing in here fails on a page that parsed.

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};

use crate::crawler::vocabulary::GenreVocabulary;
use crate::crawler::{BookId, BookRecord};

const TITLE: (&str, &str, &str) = ("h1", "data-testid", "bookTitle");
const GENRES: (&str, &str, &str) = ("div", "data-testid", "genresList");
const DESCRIPTION: (&str, &str, &str) = ("div", "data-testid", "description");

/// A parsed catalog page
pub struct Document {
    html: Html,
}

impl Document {
    /// Parse an HTML document
    pub fn parse(html: &str) -> Self {
        Self {
            html: Html::parse_document(html),
        }
    }

    /// First element `tag` whose attribute `attr` equals `value`
    pub fn find_first(&self, tag: &str, attr: &str, value: &str) -> Option<ElementRef<'_>> {
        let query = format!("{}[{}=\"{}\"]", tag, attr, value.replace('"', "\\\""));
        match Selector::parse(&query) {
            Ok(selector) => self.html.select(&selector).next(),
            Err(e) => {
                warn!("Failed to parse selector '{}': {:?}", query, e);
                None
            }
        }
    }

    /// Raw text content of the first matching element
    pub fn find_text(&self, tag: &str, attr: &str, value: &str) -> Option<String> {
        self.find_first(tag, attr, value)
            .map(|element| element.text().collect::<String>())
    }
}

/// Collapse runs of whitespace into single spaces and trim the ends
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract the book title
///
/// `None` means the page is not a valid catalog entry.
pub fn extract_title(doc: &Document) -> Option<String> {
    let (tag, attr, value) = TITLE;
    doc.find_text(tag, attr, value)
        .map(|text| normalize_whitespace(&text))
        .filter(|title| !title.is_empty())
}

/// Extract the recognised genre labels
///
/// `None` when the genre section is missing, an empty list when it is present
/// but contains no known label.
pub fn extract_genres(doc: &Document, vocabulary: &GenreVocabulary) -> Option<Vec<String>> {
    let (tag, attr, value) = GENRES;
    doc.find_text(tag, attr, value)
        .map(|section| vocabulary.contains_as_substring(&section))
}

/// Extract the whitespace-normalized description
pub fn extract_description(doc: &Document) -> Option<String> {
    let (tag, attr, value) = DESCRIPTION;
    doc.find_text(tag, attr, value)
        .map(|text| normalize_whitespace(&text))
}

/// Extract a full record, or `None` when the page has no title
pub fn extract_record(
    book_id: BookId,
    doc: &Document,
    vocabulary: &GenreVocabulary,
) -> Option<BookRecord> {
    let Some(book_title) = extract_title(doc) else {
        debug!(%book_id, "No title found");
        return None;
    };

    Some(BookRecord {
        book_id,
        book_title,
        genres: extract_genres(doc, vocabulary),
        description: extract_description(doc),
    })
}
