use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection-over-union with another box, 0.0 when either is empty.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);

        let overlap = (right - left).max(0.0) * (bottom - top).max(0.0);
        let union = self.area() + other.area() - overlap;
        if union > 0.0 {
            overlap / union
        } else {
            0.0
        }
    }
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Cosine similarity in [-1, 1]. Zero vectors and vectors of different
    /// dimension compare as 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }
        let (dot, norm_a, norm_b) = self.values.iter().zip(&other.values).fold(
            (0.0f32, 0.0f32, 0.0f32),
            |(dot, na, nb), (a, b)| (dot + a * b, na + a * a, nb + b * b),
        );
        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Little-endian f32 encoding used for storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Inverse of [`to_le_bytes`](Self::to_le_bytes). Returns `None` when the
    /// byte length is not a multiple of four.
    pub fn from_le_bytes(bytes: &[u8], model_version: Option<String>) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self {
            values,
            model_version,
        })
    }
}

/// An enrolled reference face for one identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceModel {
    pub id: String,
    pub identity: Identity,
    /// Free-form label, e.g. "front" or "glasses".
    pub label: String,
    pub embedding: Embedding,
    pub created_at: DateTime<Utc>,
}

/// Best gallery entry for a query embedding.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GalleryMatch {
    pub index: usize,
    pub similarity: f32,
}

/// Strategy for comparing a query embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn best_match(&self, query: &Embedding, gallery: &[FaceModel]) -> Option<GalleryMatch>;
}

/// Cosine similarity matcher. Visits every gallery entry; ties keep the
/// earliest entry. Entries whose dimension differs from the query's (another
/// model's embeddings) are never matched.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match(&self, query: &Embedding, gallery: &[FaceModel]) -> Option<GalleryMatch> {
        gallery
            .iter()
            .enumerate()
            .filter(|(_, model)| model.embedding.values.len() == query.values.len())
            .map(|(index, model)| GalleryMatch {
                index,
                similarity: query.similarity(&model.embedding),
            })
            .fold(None, |best: Option<GalleryMatch>, candidate| match best {
                Some(b) if b.similarity >= candidate.similarity => Some(b),
                _ => Some(candidate),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding { values: values.to_vec(), model_version: None }
    }

    fn model(id: &str, who: &str, values: &[f32]) -> FaceModel {
        FaceModel {
            id: id.into(),
            identity: Identity::new(who).unwrap(),
            label: "front".into(),
            embedding: emb(values),
            created_at: Utc::now(),
        }
    }

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_similarity_identical_and_orthogonal() {
        assert!((emb(&[1.0, 0.0, 0.0]).similarity(&emb(&[1.0, 0.0, 0.0])) - 1.0).abs() < 1e-6);
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
        assert!((emb(&[1.0, 0.0]).similarity(&emb(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        assert_eq!(emb(&[0.0, 0.0]).similarity(&emb(&[1.0, 0.0])), 0.0);
    }

    #[test]
    fn test_similarity_dimension_mismatch() {
        // a prefix match must not count as a match
        assert_eq!(emb(&[1.0, 0.0]).similarity(&emb(&[1.0, 0.0, 5.0])), 0.0);
        assert_eq!(emb(&[]).similarity(&emb(&[1.0])), 0.0);
    }

    #[test]
    fn test_best_match_skips_other_dimensions() {
        let gallery = vec![model("a", "alice", &[1.0, 0.0, 0.0]), model("b", "bob", &[0.6, 0.8])];
        let best = CosineMatcher.best_match(&emb(&[1.0, 0.0]), &gallery).unwrap();
        assert_eq!(best.index, 1);
        assert!(CosineMatcher.best_match(&emb(&[1.0, 0.0]), &gallery[..1]).is_none());
    }

    #[test]
    fn test_embedding_bytes_roundtrip_and_bad_length() {
        let e = emb(&[0.5, -1.25, 3.0]);
        let bytes = e.to_le_bytes();
        assert_eq!(bytes.len(), 12);
        let back = Embedding::from_le_bytes(&bytes, Some("w600k_r50".into())).unwrap();
        assert_eq!(back.values, e.values);
        assert!(Embedding::from_le_bytes(&bytes[..5], None).is_none());
    }

    #[test]
    fn test_best_match_scans_whole_gallery() {
        let gallery = vec![
            model("1", "decoy", &[0.0, 1.0, 0.0]),
            model("2", "decoy", &[0.0, 0.0, 1.0]),
            model("3", "alice", &[1.0, 0.0, 0.0]),
        ];
        let m = CosineMatcher.best_match(&emb(&[1.0, 0.0, 0.0]), &gallery).unwrap();
        assert_eq!(m.index, 2);
        assert!((m.similarity - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_best_match_ties_keep_first() {
        let gallery = vec![model("1", "a", &[1.0, 0.0]), model("2", "b", &[1.0, 0.0])];
        let m = CosineMatcher.best_match(&emb(&[1.0, 0.0]), &gallery).unwrap();
        assert_eq!(m.index, 0);
    }

    #[test]
    fn test_best_match_empty_gallery() {
        assert!(CosineMatcher.best_match(&emb(&[1.0]), &[]).is_none());
    }

    #[test]
    fn test_iou() {
        let a = bbox(0.0, 0.0, 10.0, 10.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
        assert!(a.iou(&bbox(20.0, 20.0, 10.0, 10.0)).abs() < 1e-6);
        // 5x10 overlap over a 150 union
        assert!((a.iou(&bbox(5.0, 0.0, 10.0, 10.0)) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(bbox(0.0, 0.0, 0.0, 0.0).iou(&bbox(0.0, 0.0, 0.0, 0.0)), 0.0);
    }
}
