//! Accuracy, latency and memory measurements

use std::collections::HashSet;

use crate::retrieval::SearchResult;

use super::LabeledQuery;

/// Value at fraction `p` of the sorted samples (nearest rank)
pub fn percentile(samples: &[f64], p: f64) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);

    let rank = (sorted.len() as f64 * p).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    sorted[index]
}

pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        0.0
    } else {
        samples.iter().sum::<f64>() / samples.len() as f64
    }
}

/// Fraction of expected items found in the top-`k` results.
///
/// Expected chunk ids take precedence, then document ids, then terms that
/// must appear (case-insensitively) in some result text. A query with no
/// expectations scores 0.
pub fn recall_at_k(query: &LabeledQuery, results: &[SearchResult], k: usize) -> f64 {
    let top = &results[..k.min(results.len())];

    if !query.expected_chunk_ids.is_empty() {
        let found: HashSet<&str> = top.iter().map(|r| r.chunk_id.as_str()).collect();
        return fraction(&query.expected_chunk_ids, |id| found.contains(id));
    }
    if !query.expected_document_ids.is_empty() {
        let found: HashSet<&str> = top.iter().map(|r| r.document_id.as_str()).collect();
        return fraction(&query.expected_document_ids, |id| found.contains(id));
    }
    if !query.expected_terms.is_empty() {
        let texts: Vec<String> = top.iter().map(|r| r.text.to_lowercase()).collect();
        return fraction(&query.expected_terms, |term| {
            let term = term.to_lowercase();
            texts.iter().any(|text| text.contains(&term))
        });
    }
    0.0
}

fn fraction(expected: &[String], hit: impl Fn(&str) -> bool) -> f64 {
    let unique: HashSet<&str> = expected.iter().map(String::as_str).collect();
    let hits = unique.iter().filter(|item| hit(item)).count();
    hits as f64 / unique.len() as f64
}

/// Resident set size in MiB from `/proc/self/statm`; 0 where unavailable
pub fn resident_memory_mb() -> f64 {
    const PAGE_SIZE: f64 = 4096.0;

    std::fs::read_to_string("/proc/self/statm")
        .ok()
        .and_then(|statm| {
            statm
                .split_whitespace()
                .nth(1)
                .and_then(|pages| pages.parse::<u64>().ok())
        })
        .map(|pages| pages as f64 * PAGE_SIZE / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}
