//! Score fusion
//!
//! Pure functions: the fused ranking depends only on the two input lists and
//! `alpha`.
//!
//! Each list is first deduplicated by content id (first occurrence wins) and
//! min-max normalised on its own. The fused score is
//! `alpha * vector + (1 - alpha) * keyword`, with 0 for a missing component.
//! When one list is absent (its backend failed) the surviving normalised score
//! is used as the fused score directly.
//!
//! Ordering: fused score descending, then vector rank, then keyword rank, then
//! first appearance in the union (vector list first).

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use super::{BackendHit, RetrievedItem};

/// Drop repeated content ids, keeping the first (best-ranked) occurrence
pub fn dedup_hits(hits: &[BackendHit]) -> Vec<BackendHit> {
    let mut seen = HashSet::new();
    hits.iter()
        .filter(|hit| seen.insert(hit.content_id.as_str()))
        .cloned()
        .collect()
}

/// Min-max normalise scores into [0, 1]
///
/// A list whose scores are all equal (including a single score) maps every
/// entry to 1.0. Non-finite scores are treated as 0.
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    let clean: Vec<f64> = scores
        .iter()
        .map(|s| if s.is_finite() { *s } else { 0.0 })
        .collect();

    let min = clean.iter().copied().fold(f64::INFINITY, f64::min);
    let max = clean.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let range = max - min;

    clean
        .iter()
        .map(|s| {
            if range > 0.0 {
                ((s - min) / range).clamp(0.0, 1.0)
            } else {
                1.0
            }
        })
        .collect()
}

struct Entry {
    hit: BackendHit,
    vector: Option<(usize, f64)>,
    keyword: Option<(usize, f64)>,
    appearance: usize,
}

/// Fuse two ranked lists into one ordered list (not truncated)
///
/// `None` for a list means that backend failed; `Some(&[])` means it answered
/// with no hits.
pub fn fuse(
    vector: Option<&[BackendHit]>,
    keyword: Option<&[BackendHit]>,
    alpha: f64,
) -> Vec<RetrievedItem> {
    let alpha = alpha.clamp(0.0, 1.0);
    let (vector_weight, keyword_weight) = match (vector.is_some(), keyword.is_some()) {
        (true, true) => (alpha, 1.0 - alpha),
        (true, false) => (1.0, 0.0),
        (false, true) => (0.0, 1.0),
        (false, false) => return Vec::new(),
    };

    let mut entries: Vec<Entry> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for (list, is_vector) in [(vector, true), (keyword, false)] {
        let Some(list) = list else { continue };
        let hits = dedup_hits(list);
        let scores: Vec<f64> = hits.iter().map(|h| h.score).collect();

        for (rank, (hit, norm)) in hits.into_iter().zip(normalize(&scores)).enumerate() {
            let slot = match index.get(&hit.content_id) {
                Some(&slot) => slot,
                None => {
                    let slot = entries.len();
                    index.insert(hit.content_id.clone(), slot);
                    entries.push(Entry {
                        hit: hit.clone(),
                        vector: None,
                        keyword: None,
                        appearance: slot,
                    });
                    slot
                }
            };

            let entry = &mut entries[slot];
            if entry.hit.snippet.is_empty() {
                entry.hit.snippet = hit.snippet;
            }
            if entry.hit.origin.is_empty() {
                entry.hit.origin = hit.origin;
            }
            if is_vector {
                entry.vector = Some((rank, norm));
            } else {
                entry.keyword = Some((rank, norm));
            }
        }
    }

    let mut ranked: Vec<(RetrievedItem, usize)> = entries
        .into_iter()
        .map(|entry| {
            let nv = entry.vector.map(|(_, s)| s);
            let nk = entry.keyword.map(|(_, s)| s);
            let fused = vector_weight * nv.unwrap_or(0.0) + keyword_weight * nk.unwrap_or(0.0);
            let item = RetrievedItem {
                content_id: entry.hit.content_id,
                snippet: entry.hit.snippet,
                origin: entry.hit.origin,
                vector_score: nv,
                keyword_score: nk,
                fused_score: fused.clamp(0.0, 1.0),
                vector_rank: entry.vector.map(|(r, _)| r),
                keyword_rank: entry.keyword.map(|(r, _)| r),
            };
            (item, entry.appearance)
        })
        .collect();

    ranked.sort_by(|(a, a_seen), (b, b_seen)| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(Ordering::Equal)
            .then(rank_key(a.vector_rank).cmp(&rank_key(b.vector_rank)))
            .then(rank_key(a.keyword_rank).cmp(&rank_key(b.keyword_rank)))
            .then(a_seen.cmp(b_seen))
    });

    ranked.into_iter().map(|(item, _)| item).collect()
}

fn rank_key(rank: Option<usize>) -> usize {
    rank.unwrap_or(usize::MAX)
}
