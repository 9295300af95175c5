//! In-memory HNSW (Hierarchical Navigable Small World) index over chunk
//! embeddings, built from the rows persisted in `chunk_vectors` (C2).
//!
//! The store keeps a brute-force cosine-similarity fallback for small
//! datasets and tests; this index is the ANN path used once a run's chunk
//! count makes a full scan too slow. Grounded in the `content-index` crate's
//! ANN usage in the `ucfp` example.

use hnsw_rs::hnsw::Hnsw;
use hnsw_rs::dist::DistCosine;

const MAX_NB_CONNECTION: usize = 24;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 64;

pub struct VectorIndex {
    hnsw: Hnsw<'static, f32, DistCosine>,
    /// Maps the index's internal point id back to our chunk id.
    ids: Vec<String>,
}

impl VectorIndex {
    /// Builds a fresh index from `(chunk_id, embedding)` pairs. Rebuilt
    /// whenever the retrieval engine needs an up-to-date index for a run;
    /// `hnsw_rs` has no incremental-delete support so we don't try to
    /// maintain one across writes.
    pub fn build(entries: &[(String, Vec<f32>)]) -> Self {
        let nb_elements = entries.len().max(1);
        let hnsw = Hnsw::<f32, DistCosine>::new(
            MAX_NB_CONNECTION,
            nb_elements,
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistCosine {},
        );
        let mut ids = Vec::with_capacity(entries.len());
        for (i, (chunk_id, embedding)) in entries.iter().enumerate() {
            hnsw.insert((embedding.as_slice(), i));
            ids.push(chunk_id.clone());
        }
        Self { hnsw, ids }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Returns up to `k` nearest chunk ids with their cosine similarity
    /// (`1.0 - cosine_distance`), descending by similarity.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f64)> {
        if self.is_empty() {
            return Vec::new();
        }
        self.hnsw
            .search(query, k, EF_SEARCH)
            .into_iter()
            .filter_map(|neighbour| {
                self.ids
                    .get(neighbour.d_id)
                    .map(|id| (id.clone(), 1.0 - neighbour.distance as f64))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dims: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dims];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn search_returns_nearest_by_cosine() {
        let entries = vec![
            ("a".to_string(), unit(8, 0)),
            ("b".to_string(), unit(8, 1)),
            ("c".to_string(), unit(8, 2)),
        ];
        let index = VectorIndex::build(&entries);
        let results = index.search(&unit(8, 0), 1);
        assert_eq!(results[0].0, "a");
        assert!(results[0].1 > 0.99);
    }

    #[test]
    fn empty_index_returns_nothing() {
        let index = VectorIndex::build(&[]);
        assert!(index.search(&unit(8, 0), 3).is_empty());
    }
}
