//! Persisted graph schema
//!
//! Node labels and relationship types are part of the on-disk format and
//! must not be renamed: the Lance backend names its tables and property
//! columns after them. Both store backends share the small helpers here.

/// Node labels
pub const MEMORY_LABEL: &str = "Memory";
pub const ENTITY_LABEL: &str = "Entity";
pub const AUTHOR_LABEL: &str = "Author";
pub const SOURCE_LABEL: &str = "Source";
pub const STORAGE_LABEL: &str = "Storage";

/// Relationship types and their properties
pub const MENTIONS: &str = "MENTIONS";
pub const MENTIONS_COUNT: &str = "count";
pub const MENTIONED_WITH: &str = "MENTIONED_WITH";
pub const CO_MENTION_COUNT: &str = "coMentionCount";
pub const AUTHORED_BY: &str = "AUTHORED_BY";
pub const SOURCED_FROM: &str = "SOURCED_FROM";
pub const NEXT_IN_SERIES: &str = "NEXT_IN_SERIES";
pub const RELATED_TO: &str = "RELATED_TO";
pub const CONNECTION_STRENGTH: &str = "connection_strength";

/// A node of the memory graph, as seen by traversals. The blacklist of a
/// traversal names memories, so it only ever matches `Memory` nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRef {
    Memory(String),
    Entity(String),
    Author(String),
    Source(String),
}

/// Score of a memory found `depth` hops away from a traversal origin
pub fn traversal_score(depth: usize) -> f32 {
    1.0 / (depth as f32).max(0.5)
}

/// Canonical order for an undirected edge
pub fn ordered_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b { (a, b) } else { (b, a) }
}

/// Every unordered pair of distinct items, each once
pub fn unordered_pairs<T: AsRef<str>>(items: &[T]) -> Vec<(String, String)> {
    let mut keys: Vec<&str> = items.iter().map(AsRef::as_ref).collect();
    keys.sort_unstable();
    keys.dedup();

    let mut pairs = Vec::new();
    for (i, a) in keys.iter().enumerate() {
        for b in &keys[i + 1..] {
            pairs.push((a.to_string(), b.to_string()));
        }
    }
    pairs
}

/// Escape a value for use inside a single-quoted SQL literal
pub fn sql_escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// `column IN ('a', 'b')`, or a clause matching nothing for an empty list
pub fn sql_in_list<S: AsRef<str>>(column: &str, values: &[S]) -> String {
    if values.is_empty() {
        return "1 = 0".to_string();
    }
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", sql_escape(v.as_ref())))
        .collect();
    format!("{column} IN ({})", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traversal_score() {
        assert_eq!(traversal_score(0), 2.0);
        assert_eq!(traversal_score(1), 1.0);
        assert_eq!(traversal_score(2), 0.5);
        assert!((traversal_score(3) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_unordered_pairs() {
        let pairs = unordered_pairs(&["c", "a", "b", "a"]);
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "b".to_string()),
                ("a".to_string(), "c".to_string()),
                ("b".to_string(), "c".to_string()),
            ]
        );
        assert!(unordered_pairs::<&str>(&[]).is_empty());
    }

    #[test]
    fn test_ordered_pair() {
        assert_eq!(ordered_pair("b", "a"), ("a", "b"));
        assert_eq!(ordered_pair("a", "b"), ("a", "b"));
    }

    #[test]
    fn test_sql_helpers() {
        assert_eq!(sql_escape("o'neil"), "o''neil");
        assert_eq!(sql_in_list("id", &["a", "b'c"]), "id IN ('a', 'b''c')");
        assert_eq!(sql_in_list::<&str>("id", &[]), "1 = 0");
    }
}
