use std::cmp::Ordering;

use ndarray::ArrayView1;

use super::index::VectorMatch;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let a = ArrayView1::from(a);
    let b = ArrayView1::from(b);
    let dot = a.dot(&b);
    let denom = a.dot(&a).sqrt() * b.dot(&b).sqrt();

    if denom <= f32::EPSILON {
        0.0
    } else {
        (dot / denom).clamp(-1.0, 1.0)
    }
}

/// Score every candidate against `query` and keep the best `k`.
///
/// Candidates are `(id, vector, insertion_seq)`; equal scores favour the
/// larger (more recent) sequence number.
pub(crate) fn top_k<'a, I>(query: &[f32], candidates: I, k: usize) -> Vec<VectorMatch>
where
    I: IntoIterator<Item = (&'a str, &'a [f32], i64)>,
{
    if k == 0 {
        return Vec::new();
    }

    let mut scored: Vec<(VectorMatch, i64)> = candidates
        .into_iter()
        .map(|(id, vector, seq)| {
            (
                VectorMatch {
                    id: id.to_string(),
                    score: cosine_similarity(query, vector),
                },
                seq,
            )
        })
        .collect();

    scored.sort_by(|(a, a_seq), (b, b_seq)| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b_seq.cmp(a_seq))
    });
    scored.truncate(k);
    scored.into_iter().map(|(hit, _)| hit).collect()
}

pub(crate) fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub(crate) fn deserialize_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(left: f32, right: f32) -> bool {
        (left - right).abs() < 1e-5
    }

    #[test]
    fn cosine_is_one_for_identical_vectors() {
        let vec = vec![1.0, 2.0, 3.0, 4.0];
        assert!(approx_eq(cosine_similarity(&vec, &vec), 1.0));
    }

    #[test]
    fn cosine_is_zero_for_orthogonal_or_degenerate_vectors() {
        assert!(approx_eq(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0));
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn top_k_orders_by_score_then_recency() {
        let a = [1.0_f32, 0.0];
        let b = [0.8_f32, 0.2];
        let c = [0.0_f32, 1.0];
        let candidates = vec![("old", &a[..], 1), ("mid", &b[..], 2), ("new", &a[..], 3), ("far", &c[..], 4)];

        let hits = top_k(&[1.0, 0.0], candidates, 3);
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old", "mid"]);
    }

    #[test]
    fn top_k_zero_is_empty() {
        let a = [1.0_f32];
        assert!(top_k(&[1.0], vec![("a", &a[..], 1)], 0).is_empty());
    }

    #[test]
    fn embedding_bytes_preserve_values() {
        let original = vec![0.25_f32, -1.5, 3.0];
        let bytes = serialize_embedding(&original);
        assert_eq!(bytes.len(), 12);
        assert_eq!(deserialize_embedding(&bytes), original);
    }
}
