//! In-memory embedding index and its swappable snapshot holder.

use crate::types::{Embedding, Identity, IdentityId, RecognitionResult};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::Arc;

/// Default cosine-similarity threshold a match must strictly exceed.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone, PartialEq)]
struct IndexEntry {
    embedding: Embedding,
    identity: IdentityId,
}

/// Best match for a target embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Nearest {
    /// Cosine similarity in [-1, 1].
    pub similarity: f64,
    pub identity: IdentityId,
}

/// Flat list of every enrolled embedding with its owner, plus owner names.
///
/// Built wholesale from the identity store and never mutated afterwards;
/// freshness comes from publishing a new instance through [`SharedIndex`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EmbeddingIndex {
    entries: Vec<IndexEntry>,
    names: HashMap<IdentityId, String>,
}

impl EmbeddingIndex {
    /// Flatten identities in the order given (the store's enumeration order).
    pub fn build(identities: &[Identity]) -> Self {
        let mut entries = Vec::with_capacity(identities.iter().map(|i| i.embeddings.len()).sum());
        let mut names = HashMap::with_capacity(identities.len());

        for identity in identities {
            for embedding in &identity.embeddings {
                entries.push(IndexEntry {
                    embedding: embedding.clone(),
                    identity: identity.id.clone(),
                });
            }
            names.insert(identity.id.clone(), identity.username.clone());
        }

        Self { entries, names }
    }

    /// Number of indexed embeddings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identity_count(&self) -> usize {
        self.names.len()
    }

    pub fn username(&self, id: &IdentityId) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    /// Nearest stored embedding by cosine similarity; `None` on an empty index.
    ///
    /// Every entry is scored. On equal similarity the earliest entry wins.
    pub fn query(&self, target: &Embedding) -> Option<Nearest> {
        let mut best: Option<(f64, &IndexEntry)> = None;

        for entry in &self.entries {
            let sim = target.similarity(&entry.embedding);
            match best {
                Some((best_sim, _)) if sim <= best_sim => {}
                // NaN never beats an existing best, but a first NaN is replaced.
                Some((best_sim, _)) if sim.is_nan() && !best_sim.is_nan() => {}
                _ => best = Some((sim, entry)),
            }
        }

        best.map(|(similarity, entry)| Nearest {
            similarity: if similarity.is_nan() { 0.0 } else { similarity },
            identity: entry.identity.clone(),
        })
    }

    /// Decide the reported name for a face: a match must strictly exceed `threshold`.
    pub fn resolve(&self, target: &Embedding, threshold: f64) -> RecognitionResult {
        self.classify(self.query(target), threshold)
    }

    /// Turn a query outcome into the reported result.
    pub fn classify(&self, nearest: Option<Nearest>, threshold: f64) -> RecognitionResult {
        match nearest {
            None => RecognitionResult::no_registered_faces(),
            Some(nearest) if nearest.similarity > threshold => match self.username(&nearest.identity) {
                Some(name) => RecognitionResult::matched(name, nearest.similarity, nearest.identity),
                None => RecognitionResult::unknown(nearest.similarity),
            },
            Some(nearest) => RecognitionResult::unknown(nearest.similarity),
        }
    }
}

/// Owner of the current index snapshot.
///
/// One writer publishes complete indexes; readers grab an `Arc` to whatever
/// was current and keep using it even if a rebuild lands mid-request.
#[derive(Debug)]
pub struct SharedIndex {
    current: ArcSwap<EmbeddingIndex>,
}

impl SharedIndex {
    pub fn new(index: EmbeddingIndex) -> Self {
        Self {
            current: ArcSwap::from_pointee(index),
        }
    }

    pub fn snapshot(&self) -> Arc<EmbeddingIndex> {
        self.current.load_full()
    }

    /// Replace the current index, returning the one it superseded.
    pub fn publish(&self, index: EmbeddingIndex) -> Arc<EmbeddingIndex> {
        self.current.swap(Arc::new(index))
    }
}

impl Default for SharedIndex {
    fn default() -> Self {
        Self::new(EmbeddingIndex::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(id: &str, username: &str, vectors: &[&[f32]]) -> Identity {
        Identity {
            id: IdentityId::new(id),
            username: username.to_string(),
            embeddings: vectors.iter().map(|v| Embedding::new(v.to_vec())).collect(),
            thumbnail: None,
            created_at: String::new(),
        }
    }

    fn gallery() -> Vec<Identity> {
        vec![
            identity("1", "alice", &[&[0.0, 1.0, 0.0], &[0.1, 0.9, 0.0]]),
            identity("2", "bob", &[&[0.0, 0.0, 1.0]]),
            identity("3", "carol", &[&[1.0, 0.0, 0.0]]),
        ]
    }

    #[test]
    fn test_build_flattens_all_embeddings() {
        let index = EmbeddingIndex::build(&gallery());
        assert_eq!(index.len(), 4);
        assert_eq!(index.identity_count(), 3);
        assert_eq!(index.username(&IdentityId::new("2")), Some("bob"));
        assert_eq!(index.username(&IdentityId::new("9")), None);
    }

    #[test]
    fn test_query_empty_index() {
        let index = EmbeddingIndex::default();
        assert!(index.is_empty());
        assert!(index.query(&Embedding::new(vec![1.0, 0.0])).is_none());
    }

    #[test]
    fn test_query_scans_whole_gallery() {
        // Best match is the last entry.
        let index = EmbeddingIndex::build(&gallery());
        let nearest = index.query(&Embedding::new(vec![1.0, 0.0, 0.0])).unwrap();
        assert_eq!(nearest.identity, IdentityId::new("3"));
        assert!((nearest.similarity - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_query_tie_first_occurrence_wins() {
        let index = EmbeddingIndex::build(&[
            identity("a", "first", &[&[1.0, 0.0]]),
            identity("b", "second", &[&[2.0, 0.0]]),
        ]);
        let nearest = index.query(&Embedding::new(vec![3.0, 0.0])).unwrap();
        assert_eq!(nearest.identity, IdentityId::new("a"));
    }

    #[test]
    fn test_query_similarity_stays_in_range() {
        let index = EmbeddingIndex::build(&[identity(
            "x",
            "x",
            &[&[1e-3, -7.0, 2.5], &[-4.0, 0.25, 9.0], &[0.0, 0.0, 0.0], &[3.3, 3.3, 3.3]],
        )]);
        for target in [[1.0, 2.0, 3.0], [-1e6, 1e-6, 0.0], [0.0, 0.0, 0.0], [3.3, 3.3, 3.3]] {
            let nearest = index.query(&Embedding::new(target.to_vec())).unwrap();
            assert!((-1.0..=1.0).contains(&nearest.similarity), "{}", nearest.similarity);
        }
    }

    #[test]
    fn test_resolve_threshold_is_strict() {
        let index = EmbeddingIndex::build(&gallery());
        let target = Embedding::new(vec![1.0, 0.0, 0.0]);
        let exact = index.query(&target).unwrap().similarity;

        let at = index.resolve(&target, exact);
        assert_eq!(at.name, "Unknown");
        assert_eq!(at.probability, exact);

        let below = index.resolve(&target, exact - 1e-8);
        assert_eq!(below.name, "carol");
        assert_eq!(below.id, Some(IdentityId::new("3")));
    }

    #[test]
    fn test_classify_boundary_at_default_threshold() {
        let index = EmbeddingIndex::build(&[identity("1", "alice", &[&[1.0, 0.0]])]);
        let at = |similarity: f64| Some(Nearest { similarity, identity: IdentityId::new("1") });

        assert_eq!(index.classify(at(0.7), DEFAULT_MATCH_THRESHOLD).name, "Unknown");
        assert_eq!(index.classify(at(0.7), DEFAULT_MATCH_THRESHOLD).probability, 0.7);
        assert_eq!(index.classify(at(0.700_000_01), DEFAULT_MATCH_THRESHOLD).name, "alice");
        assert_eq!(index.classify(None, DEFAULT_MATCH_THRESHOLD), RecognitionResult::no_registered_faces());
    }

    #[test]
    fn test_classify_unresolvable_identity_is_unknown() {
        let index = EmbeddingIndex::default();
        let stray = Some(Nearest { similarity: 0.99, identity: IdentityId::new("gone") });
        assert_eq!(index.classify(stray, 0.7), RecognitionResult::unknown(0.99));
    }

    #[test]
    fn test_resolve_below_threshold_keeps_score() {
        let index = EmbeddingIndex::build(&gallery());
        let result = index.resolve(&Embedding::new(vec![1.0, 1.0, 1.0]), 0.9);
        assert_eq!(result.name, "Unknown");
        assert!(result.probability > 0.5 && result.probability < 0.9);
        assert!(result.id.is_none());
    }

    #[test]
    fn test_resolve_empty_index() {
        let result = EmbeddingIndex::default().resolve(&Embedding::new(vec![1.0]), 0.7);
        assert_eq!(result, RecognitionResult::no_registered_faces());
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let identities = gallery();
        assert_eq!(EmbeddingIndex::build(&identities), EmbeddingIndex::build(&identities));
    }

    #[test]
    fn test_shared_index_publish_swaps_snapshot() {
        let shared = SharedIndex::default();
        let before = shared.snapshot();
        assert!(before.is_empty());

        let previous = shared.publish(EmbeddingIndex::build(&gallery()));
        assert!(previous.is_empty());
        assert_eq!(shared.snapshot().len(), 4);
        // A reader holding the old snapshot is unaffected.
        assert!(before.is_empty());
    }
}
