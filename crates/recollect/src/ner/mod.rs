//! Named entity extraction
//!
//! Entities link memories together in the graph, so every extractor output
//! goes through [`extract_entity_names`], which filters by confidence and
//! normalises names the same way the store keys them.

mod bert;

pub use bert::{BertEntityExtractor, DEFAULT_NER_MODEL};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::memory::types::normalize_entity;

/// Coarse entity class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityLabel {
    Person,
    Organization,
    Location,
    Misc,
}

impl EntityLabel {
    /// Map a BIO tag such as `B-PER` to a label
    pub fn from_tag(tag: &str) -> Option<Self> {
        let normalized = tag.to_uppercase();
        if normalized.contains("PER") {
            Some(EntityLabel::Person)
        } else if normalized.contains("ORG") {
            Some(EntityLabel::Organization)
        } else if normalized.contains("LOC") {
            Some(EntityLabel::Location)
        } else if normalized.contains("MISC") {
            Some(EntityLabel::Misc)
        } else {
            None
        }
    }
}

/// An entity mention found in text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    pub label: EntityLabel,
    pub confidence: f32,
}

/// Finds named entities in text
pub trait EntityExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Result<Vec<Entity>>;
}

/// Run `extractor` and return unique normalised names above `min_confidence`,
/// in order of first appearance
pub fn extract_entity_names(
    extractor: &dyn EntityExtractor,
    text: &str,
    min_confidence: f32,
) -> Result<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    for entity in extractor.extract(text)? {
        if entity.confidence < min_confidence {
            continue;
        }
        let name = normalize_entity(&entity.text);
        if !name.is_empty() && !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

/// Words that start sentences often enough to be mistaken for names
const SENTENCE_STARTERS: &[&str] = &[
    "A", "An", "And", "But", "He", "Her", "His", "How", "I", "If", "In", "It", "My", "No", "On",
    "Our", "She", "So", "The", "Their", "Then", "There", "They", "This", "We", "What", "When",
    "Where", "Which", "Who", "Why", "Yes", "You",
];

/// Dependency-free extractor that treats runs of capitalised words as
/// entities. Used when no model is available and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicExtractor;

impl EntityExtractor for HeuristicExtractor {
    fn extract(&self, text: &str) -> Result<Vec<Entity>> {
        let mut entities = Vec::new();
        let mut current: Vec<&str> = Vec::new();

        let flush = |current: &mut Vec<&str>, entities: &mut Vec<Entity>| {
            if !current.is_empty() {
                entities.push(Entity {
                    text: current.join(" "),
                    label: EntityLabel::Misc,
                    confidence: 1.0,
                });
                current.clear();
            }
        };

        for raw in text.split_whitespace() {
            let ends_clause = raw.ends_with(['.', ',', ';', ':', '!', '?']);
            let word = raw.trim_matches(|c: char| !c.is_alphanumeric() && c != '-');
            let capitalised = word.chars().next().is_some_and(char::is_uppercase);

            if capitalised && !(current.is_empty() && SENTENCE_STARTERS.contains(&word)) {
                current.push(word);
            } else {
                flush(&mut current, &mut entities);
            }
            if ends_clause {
                flush(&mut current, &mut entities);
            }
        }
        flush(&mut current, &mut entities);

        Ok(entities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedExtractor(Vec<Entity>);

    impl EntityExtractor for FixedExtractor {
        fn extract(&self, _text: &str) -> Result<Vec<Entity>> {
            Ok(self.0.clone())
        }
    }

    fn entity(text: &str, confidence: f32) -> Entity {
        Entity {
            text: text.to_string(),
            label: EntityLabel::Person,
            confidence,
        }
    }

    #[test]
    fn test_entity_label_from_tag() {
        assert_eq!(EntityLabel::from_tag("B-PER"), Some(EntityLabel::Person));
        assert_eq!(EntityLabel::from_tag("I-ORG"), Some(EntityLabel::Organization));
        assert_eq!(EntityLabel::from_tag("B-LOC"), Some(EntityLabel::Location));
        assert_eq!(EntityLabel::from_tag("B-MISC"), Some(EntityLabel::Misc));
        assert_eq!(EntityLabel::from_tag("O"), None);
    }

    #[test]
    fn test_names_filtered_and_normalised() {
        let extractor = FixedExtractor(vec![
            entity("Ada Lovelace", 0.9),
            entity("ada   lovelace", 0.95),
            entity("Maybe", 0.2),
        ]);
        let names = extract_entity_names(&extractor, "", 0.5).unwrap();
        assert_eq!(names, vec!["ada-lovelace"]);
    }

    #[test]
    fn test_heuristic_finds_capitalised_runs() {
        let names = extract_entity_names(
            &HeuristicExtractor,
            "The team at Mozilla Research released Rust in Berlin. They liked it.",
            0.5,
        )
        .unwrap();
        assert_eq!(names, vec!["mozilla-research", "rust", "berlin"]);
    }

    #[test]
    fn test_heuristic_empty_text() {
        assert!(HeuristicExtractor.extract("").unwrap().is_empty());
    }
}
