//! Ranking and purging of retrieval results

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::retrieval::query::{MemoryResult, RetrievalStep};

fn by_score_desc(a: &MemoryResult, b: &MemoryResult) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Keep one result per memory id, the best scoring one, ordered best first
pub fn dedup_by_memory<I>(results: I) -> Vec<MemoryResult>
where
    I: IntoIterator<Item = MemoryResult>,
{
    let mut best: HashMap<String, MemoryResult> = HashMap::new();
    for result in results {
        if best
            .get(&result.memory.id)
            .is_none_or(|existing| result.score > existing.score)
        {
            best.insert(result.memory.id.clone(), result);
        }
    }

    let mut merged: Vec<MemoryResult> = best.into_values().collect();
    merged.sort_by(by_score_desc);
    merged
}

/// Best `k` results across all queries.
///
/// Each query keeps up to `min_query_results` of its best results even if
/// that exceeds `k`; remaining slots are filled by score. `min_score` is
/// applied last and always wins.
pub fn top_k(
    results: &[MemoryResult],
    k: Option<usize>,
    min_score: Option<f32>,
    min_query_results: usize,
) -> Vec<MemoryResult> {
    let mut sorted = results.to_vec();
    sorted.sort_by(by_score_desc);

    let mut selected = match k {
        None => sorted,
        Some(k) if min_query_results == 0 => {
            sorted.truncate(k);
            sorted
        }
        Some(k) => {
            let mut per_query: HashMap<&str, usize> = HashMap::new();
            let mut selected = Vec::new();
            let mut remaining = Vec::new();

            for result in &sorted {
                let taken = per_query.entry(result.query_id.as_str()).or_insert(0);
                if *taken < min_query_results {
                    *taken += 1;
                    selected.push(result.clone());
                } else {
                    remaining.push(result.clone());
                }
            }

            let free = k.saturating_sub(selected.len());
            selected.extend(remaining.into_iter().take(free));
            selected.sort_by(by_score_desc);
            selected
        }
    };

    if let Some(min_score) = min_score {
        selected.retain(|r| r.score >= min_score);
    }
    selected
}

/// Replace the step's results with [`top_k`] of them
pub fn purge(
    step: &mut RetrievalStep,
    min_score: f32,
    max_results: Option<usize>,
    min_query_results: usize,
) {
    step.results = top_k(&step.results, max_results, Some(min_score), min_query_results);
}
