use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>, model_version: Option<String>) -> Self {
        Self {
            values,
            model_version,
        }
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Zero-norm vectors and vectors of differing dimension score 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Element-wise arithmetic mean of `samples`.
    ///
    /// Returns `None` for an empty batch or when dimensions disagree. The
    /// model version is kept only if every sample agrees on it.
    pub fn centroid(samples: &[Embedding]) -> Option<Embedding> {
        let first = samples.first()?;
        let dim = first.dimension();
        if dim == 0 || samples.iter().any(|s| s.dimension() != dim) {
            return None;
        }

        let mut sum = vec![0.0f64; dim];
        for sample in samples {
            for (acc, v) in sum.iter_mut().zip(&sample.values) {
                *acc += f64::from(*v);
            }
        }
        let n = samples.len() as f64;
        let values = sum.into_iter().map(|s| (s / n) as f32).collect();

        let model_version = first
            .model_version
            .clone()
            .filter(|v| samples.iter().all(|s| s.model_version.as_deref() == Some(v.as_str())));

        Some(Embedding {
            values,
            model_version,
        })
    }
}

/// An enrolled person. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Unique external identifier (registration number).
    pub id: String,
    pub name: String,
    /// Centroid of the per-photo embeddings collected at enrollment.
    pub embedding: Embedding,
    /// Enrollment photos in submission order; the first is the representative.
    pub photos: Vec<PathBuf>,
    pub registered_at: String,
}

impl Identity {
    pub fn representative_photo(&self) -> Option<&PathBuf> {
        self.photos.first()
    }

    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id.clone(),
            name: self.name.clone(),
            photo: self.representative_photo().cloned(),
        }
    }
}

/// Plain identity description returned to callers and stored in sessions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    #[serde(alias = "matricule")]
    pub id: String,
    pub name: String,
    pub photo: Option<PathBuf>,
}

/// Verdict for one detected face of a scanned frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Position of the face in detection order.
    pub face_index: usize,
    /// Matched identity, `None` for an unknown face.
    pub identity: Option<IdentitySummary>,
    /// Best cosine similarity observed for this face.
    pub similarity: f32,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Outcome of a scan as surfaced to callers and recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    #[serde(alias = "total_detected", alias = "total_presents")]
    pub total_detected: usize,
    #[serde(default)]
    pub recognized: Vec<IdentitySummary>,
    #[serde(default)]
    pub unknowns: usize,
}

/// Strategy for finding the best gallery entry for a probe embedding.
pub trait Matcher {
    /// Highest-scoring identity and its score, `None` for an empty gallery.
    fn best_match<'a, I>(&self, probe: &Embedding, gallery: I) -> Option<(&'a Identity, f32)>
    where
        I: IntoIterator<Item = &'a Identity>;
}

/// Linear-scan cosine matcher.
///
/// Compares the probe against every entry. Ties keep the earliest entry in
/// gallery order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn best_match<'a, I>(&self, probe: &Embedding, gallery: I) -> Option<(&'a Identity, f32)>
    where
        I: IntoIterator<Item = &'a Identity>,
    {
        let mut best: Option<(&'a Identity, f32)> = None;

        for identity in gallery {
            let sim = probe.similarity(&identity.embedding);
            match best {
                Some((_, best_sim)) if sim <= best_sim => {}
                _ => best = Some((identity, sim)),
            }
        }

        best
    }
}
