use serde::{Deserialize, Serialize};
use std::fmt;

/// Name reported for a face whose best match did not clear the threshold.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Name reported when recognition runs against an empty index.
pub const NO_REGISTERED_FACES: &str = "No registered faces";

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. Accumulates in f64
    /// so that scores just above the match threshold stay distinguishable
    /// from the threshold itself. Embeddings of different dimension come
    /// from different models and score 0.0.
    pub fn similarity(&self, other: &Embedding) -> f64 {
        if self.dimension() != other.dimension() {
            return 0.0;
        }

        let mut dot = 0.0f64;
        let mut norm_a = 0.0f64;
        let mut norm_b = 0.0f64;

        for (&a, &b) in self.values.iter().zip(other.values.iter()) {
            let (a, b) = (f64::from(a), f64::from(b));
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            (dot / denom).clamp(-1.0, 1.0)
        } else {
            0.0
        }
    }
}

/// Opaque identifier of an enrolled identity, assigned by the identity store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One enrolled person: a username, one embedding per enrollment image and
/// an optional representative thumbnail (base64 grayscale JPEG).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub username: String,
    pub embeddings: Vec<Embedding>,
    pub thumbnail: Option<String>,
    pub created_at: String,
}

/// An identity that has passed enrollment but has not been persisted yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewIdentity {
    pub username: String,
    pub embeddings: Vec<Embedding>,
    pub thumbnail: Option<String>,
}

/// Outcome of recognizing one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionResult {
    pub name: String,
    /// Cosine similarity of the best match, reported even when rejected.
    pub probability: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<IdentityId>,
}

impl RecognitionResult {
    pub fn matched(username: &str, similarity: f64, id: IdentityId) -> Self {
        Self {
            name: username.to_string(),
            probability: similarity,
            id: Some(id),
        }
    }

    pub fn unknown(similarity: f64) -> Self {
        Self {
            name: UNKNOWN_NAME.to_string(),
            probability: similarity,
            id: None,
        }
    }

    pub fn no_registered_faces() -> Self {
        Self {
            name: NO_REGISTERED_FACES.to_string(),
            probability: 0.0,
            id: None,
        }
    }

    pub fn is_match(&self) -> bool {
        self.id.is_some()
    }
}
