//! Known-face recognition: "is this face one of the reference faces?"
//!
//! Compares a candidate embedding against every registry entry by cosine
//! similarity. This is a yes/no signal, not identification.

use crate::registry::KnownFaceRegistry;
use crate::types::Embedding;
use image::imageops::{self, FilterType};
use image::RgbImage;
use thiserror::Error;

/// Default cosine similarity a candidate must exceed to count as known.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Side length faces are resized to before embedding (FaceNet input).
pub const DEFAULT_FACE_SIZE: u32 = 160;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("model file not found: {0} (place the embedding model in the model directory)")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face image")]
    EmptyImage,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Maps a face image to an embedding vector.
///
/// Implementations may be slow (hundreds of milliseconds per call) and may
/// hold mutable inference state, hence `&mut self`.
pub trait Embedder: Send {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError>;
}

/// Resize a face crop to the fixed square embedding input size.
///
/// The aspect ratio is not preserved; embedding models are trained on
/// square crops of roughly square face boxes.
pub fn normalize_face(face: &RgbImage, size: u32) -> RgbImage {
    if face.dimensions() == (size, size) {
        return face.clone();
    }
    imageops::resize(face, size, size, FilterType::Triangle)
}

/// Threshold-based yes/no recognizer over a [`KnownFaceRegistry`].
#[derive(Debug, Clone)]
pub struct RecognitionEngine {
    threshold: f32,
    face_size: u32,
}

impl Default for RecognitionEngine {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_FACE_SIZE)
    }
}

impl RecognitionEngine {
    pub fn new(threshold: f32, face_size: u32) -> Self {
        Self {
            threshold,
            face_size,
        }
    }

    /// Whether the candidate face matches any registry entry.
    ///
    /// Never fails: an empty registry, an empty crop or an embedding failure
    /// all mean "not recognized".
    pub fn is_known(
        &self,
        candidate: &RgbImage,
        registry: &KnownFaceRegistry,
        embedder: &mut dyn Embedder,
    ) -> bool {
        if registry.is_empty() {
            return false;
        }
        if candidate.width() == 0 || candidate.height() == 0 {
            return false;
        }

        let normalized = normalize_face(candidate, self.face_size);
        match embedder.embed(&normalized) {
            Ok(embedding) => self.matches_any(&embedding, registry),
            Err(e) => {
                tracing::debug!(error = %e, "candidate embedding failed; treating as unknown");
                false
            }
        }
    }

    /// Whether `probe` is strictly more similar than the threshold to any entry.
    pub fn matches_any(&self, probe: &Embedding, registry: &KnownFaceRegistry) -> bool {
        registry
            .entries()
            .iter()
            .any(|entry| probe.similarity(&entry.embedding) > self.threshold)
    }
}
