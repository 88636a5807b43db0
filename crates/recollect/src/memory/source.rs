//! Provenance of a memory
//!
//! A [`Source`] keeps the verbatim citation next to a normalised key. The
//! key (`source`) is what the store links and deduplicates on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Kind of provenance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Web,
    Book,
    Article,
    #[default]
    Other,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Web => "web",
            SourceType::Book => "book",
            SourceType::Article => "article",
            SourceType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "web" => SourceType::Web,
            "book" => SourceType::Book,
            "article" => SourceType::Article,
            _ => SourceType::Other,
        }
    }
}

/// Where a memory came from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Source {
    pub source_type: SourceType,
    /// Citation as given
    pub full_source: Option<String>,
    /// Normalised key used for linking
    pub source: Option<String>,
    /// Normalised, sorted, unique author names
    pub authors: Vec<String>,
    pub publisher: Option<String>,
}

impl Source {
    /// Build a source, normalising every field
    pub fn new(
        source_type: SourceType,
        full_source: Option<String>,
        source: Option<String>,
        authors: &[String],
        publisher: Option<String>,
    ) -> Self {
        Self {
            source_type,
            full_source,
            source: source.as_deref().and_then(normalize_source),
            authors: normalize_authors(authors),
            publisher: publisher.as_deref().and_then(normalize_source),
        }
    }

    /// A source with nothing known about it
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.source.is_none() && self.full_source.is_none()
    }

    /// Web page. Protocol, `www.`, query and fragment are dropped; the
    /// publisher defaults to the domain.
    pub fn from_web(url: &str, authors: &[String], publisher: Option<&str>) -> Self {
        let url = url.rsplit("://").next().unwrap_or(url);
        let url = url.replace("www.", "");
        let url = url.split('?').next().unwrap_or_default();
        let url = url.split('#').next().unwrap_or_default();
        let url = url.trim().to_lowercase();

        let publisher = match publisher {
            Some(p) if !p.trim().is_empty() => p.to_string(),
            _ => url.split('/').next().unwrap_or_default().to_string(),
        };

        Self::new(
            SourceType::Web,
            Some(url.clone()),
            Some(url),
            authors,
            Some(publisher),
        )
    }

    /// Book citation, rendered as `title by a, b (year)`
    pub fn from_book(
        title: &str,
        authors: &[String],
        year: Option<i32>,
        publisher: Option<&str>,
    ) -> Self {
        let authors = normalize_authors(authors);
        let mut key = title.to_string();
        if !authors.is_empty() {
            key.push_str(&format!(" by {}", authors.join(", ")));
        }
        let mut full = key.clone();
        if let Some(year) = year {
            full.push_str(&format!(" ({year})"));
        }

        Self::new(
            SourceType::Book,
            Some(full),
            Some(key),
            &authors,
            publisher.map(str::to_string),
        )
    }

    /// Article citation; the journal doubles as publisher
    pub fn from_article(
        title: &str,
        authors: &[String],
        journal: Option<&str>,
        year: Option<i32>,
    ) -> Self {
        let authors = normalize_authors(authors);
        let mut key = title.to_string();
        if !authors.is_empty() {
            key.push_str(&format!(" by {}", authors.join(", ")));
        }
        let mut full = key.clone();
        if let Some(journal) = journal {
            full.push_str(&format!(", published in {journal}"));
        }
        if let Some(year) = year {
            full.push_str(&format!(" ({year})"));
        }

        Self::new(
            SourceType::Article,
            Some(full),
            Some(key),
            &authors,
            journal.map(str::to_string),
        )
    }

    /// Any other free-form provenance
    pub fn from_other(source: &str, authors: &[String], publisher: Option<&str>) -> Self {
        Self::new(
            SourceType::Other,
            Some(source.to_string()),
            Some(source.to_string()),
            authors,
            publisher.map(str::to_string),
        )
    }

    /// Guess the kind of a bare source string. URLs and dotted domain names
    /// are treated as web sources.
    pub fn parse(s: &str) -> Self {
        if looks_like_web(s) {
            Self::from_web(s, &[], None)
        } else {
            Self::from_other(s, &[], None)
        }
    }
}

impl PartialEq for Source {
    fn eq(&self, other: &Self) -> bool {
        match (&self.source, &other.source) {
            (Some(a), Some(b)) => a == b,
            (None, None) => {
                self.source_type == other.source_type
                    && self.full_source == other.full_source
                    && self.authors == other.authors
                    && self.publisher == other.publisher
            }
            _ => false,
        }
    }
}

impl Eq for Source {}

impl Hash for Source {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.source {
            Some(key) => key.hash(state),
            None => {
                self.source_type.hash(state);
                self.full_source.hash(state);
                self.authors.hash(state);
                self.publisher.hash(state);
            }
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.full_source, &self.source) {
            (Some(full), _) => f.write_str(full),
            (None, Some(key)) => f.write_str(key),
            (None, None) => f.write_str("unknown"),
        }
    }
}

/// Trim and lower-case a source key; empty keys become `None`
pub fn normalize_source(s: &str) -> Option<String> {
    let s = s.trim().to_lowercase();
    (!s.is_empty()).then_some(s)
}

/// Lower-case, hyphenate, sort and deduplicate author names
pub fn normalize_authors(authors: &[String]) -> Vec<String> {
    let mut cleaned: Vec<String> = authors
        .iter()
        .map(|a| a.to_lowercase().split_whitespace().collect::<Vec<_>>().join("-"))
        .filter(|a| !a.is_empty())
        .collect();
    cleaned.sort();
    cleaned.dedup();
    cleaned
}

fn looks_like_web(s: &str) -> bool {
    if s.starts_with("http://") || s.starts_with("https://") || s.starts_with("www.") {
        return true;
    }
    let chars: Vec<char> = s.chars().collect();
    match chars.iter().position(|&c| c == '.') {
        Some(dot) if dot > 1 && dot + 1 < chars.len() => {
            chars[dot - 1].is_alphanumeric() && chars[dot + 1].is_alphanumeric()
        }
        _ => false,
    }
}
