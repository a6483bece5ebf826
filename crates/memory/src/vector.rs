//! Vector similarity utilities shared by the bundled stores.

use kestrel_core::vector::{PayloadFilter, ScoredRecord, VectorRecord};

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or empty.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}

/// Brute-force nearest-neighbour ranking over a set of records.
///
/// Keeps records matching `filter` with similarity `>= min_score`, sorted by
/// descending similarity and truncated to `limit`.
pub fn rank_records<'a>(
    records: impl IntoIterator<Item = &'a VectorRecord>,
    query: &[f32],
    limit: usize,
    min_score: f32,
    filter: Option<&PayloadFilter>,
) -> Vec<ScoredRecord> {
    let mut scored: Vec<ScoredRecord> = records
        .into_iter()
        .filter(|r| filter.is_none_or(|f| f.matches(&r.payload)))
        .filter_map(|r| {
            let score = cosine_similarity(&r.vector, query);
            (score >= min_score).then(|| ScoredRecord {
                id: r.id.clone(),
                score,
                payload: r.payload.clone(),
            })
        })
        .collect();

    scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, vector: Vec<f32>, success: bool) -> VectorRecord {
        let mut payload = serde_json::Map::new();
        payload.insert("success".into(), success.into());
        VectorRecord {
            id: id.into(),
            vector,
            payload,
        }
    }

    #[test]
    fn cosine_identical_vectors() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_orthogonal_vectors() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!(sim.abs() < 1e-6);
    }

    #[test]
    fn cosine_mismatched_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0, 2.0, 3.0]), 0.0);
    }

    #[test]
    fn cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 2.0]), 0.0);
    }

    #[test]
    fn cosine_known_value() {
        // 1 / sqrt(2)
        let sim = cosine_similarity(&[1.0, 1.0], &[1.0, 0.0]);
        assert!((sim - 0.7071).abs() < 0.001);
    }

    #[test]
    fn rank_orders_by_similarity() {
        let records = vec![
            record("a", vec![0.0, 1.0, 0.0], true),
            record("b", vec![1.0, 0.0, 0.0], true),
            record("c", vec![0.5, 0.5, 0.0], true),
        ];
        let hits = rank_records(&records, &[1.0, 0.0, 0.0], 10, 0.0, None);
        let ids: Vec<_> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, ["b", "c", "a"]);
    }

    #[test]
    fn rank_applies_threshold_filter_and_limit() {
        let records = vec![
            record("a", vec![1.0, 0.0], false),
            record("b", vec![1.0, 0.1], true),
            record("c", vec![0.0, 1.0], false),
            record("d", vec![1.0, 0.2], false),
        ];
        let filter = PayloadFilter::new().eq("success", false);
        let hits = rank_records(&records, &[1.0, 0.0], 1, 0.5, Some(&filter));
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a");
    }
}
