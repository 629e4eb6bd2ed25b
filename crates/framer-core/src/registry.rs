//! Known-face registry: the reference faces a session can select and
//! recognize against.

use crate::recognizer::{normalize_face, Embedder, RecognizerError};
use crate::types::Embedding;
use image::RgbImage;

/// Position of an entry in the registry (or of a face in a detection list).
///
/// Only meaningful within the current session: indices are assigned in load
/// order and change whenever the reference image set changes.
pub type SessionIndex = usize;

/// A labelled reference image awaiting embedding.
#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub label: String,
    pub image: RgbImage,
}

/// One recognized identity: the reference image, its embedding and a label.
#[derive(Debug, Clone)]
pub struct KnownFaceEntry {
    pub reference_image: RgbImage,
    pub embedding: Embedding,
    pub label: String,
}

/// Ordered, read-only-per-session set of known faces.
#[derive(Debug, Clone, Default)]
pub struct KnownFaceRegistry {
    entries: Vec<KnownFaceEntry>,
}

impl KnownFaceRegistry {
    /// Embed every reference image, skipping the ones that fail.
    pub fn build(
        images: Vec<ReferenceImage>,
        embedder: &mut dyn Embedder,
        face_size: u32,
    ) -> Self {
        let mut registry = Self::default();
        for reference in images {
            match Self::embed_reference(&reference.image, embedder, face_size) {
                Ok(embedding) => {
                    registry.push(KnownFaceEntry {
                        reference_image: reference.image,
                        embedding,
                        label: reference.label,
                    });
                }
                Err(e) => {
                    tracing::warn!(label = %reference.label, error = %e, "skipping reference image");
                }
            }
        }
        tracing::info!(count = registry.len(), "known-face registry built");
        registry
    }

    /// Embed a single reference image at the registry's normalized size.
    pub fn embed_reference(
        image: &RgbImage,
        embedder: &mut dyn Embedder,
        face_size: u32,
    ) -> Result<Embedding, RecognizerError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(RecognizerError::EmptyImage);
        }
        embedder.embed(&normalize_face(image, face_size))
    }

    /// Append an entry; its index is the previous length.
    pub fn push(&mut self, entry: KnownFaceEntry) -> SessionIndex {
        self.entries.push(entry);
        self.entries.len() - 1
    }

    pub fn get(&self, index: SessionIndex) -> Option<&KnownFaceEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[KnownFaceEntry] {
        &self.entries
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.label.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recognizer::tests::ScriptedEmbedder;
    use crate::recognizer::RecognitionEngine;

    fn reference(label: &str) -> ReferenceImage {
        ReferenceImage {
            label: label.to_string(),
            image: RgbImage::new(200, 240),
        }
    }

    #[test]
    fn test_build_keeps_insertion_order() {
        let mut embedder = ScriptedEmbedder::returning(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let registry =
            KnownFaceRegistry::build(vec![reference("alice"), reference("bob")], &mut embedder, 160);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.labels().collect::<Vec<_>>(), vec!["alice", "bob"]);
        assert_eq!(registry.get(1).unwrap().embedding.values, vec![0.0, 1.0]);
    }

    #[test]
    fn test_build_skips_failed_embeddings() {
        let mut embedder = ScriptedEmbedder::new(vec![
            Ok(Embedding::new(vec![1.0, 0.0])),
            Err(RecognizerError::InferenceFailed("bad image".into())),
            Ok(Embedding::new(vec![0.0, 1.0])),
        ]);
        let registry = KnownFaceRegistry::build(
            vec![reference("a"), reference("broken"), reference("c")],
            &mut embedder,
            160,
        );
        assert_eq!(registry.labels().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(embedder.calls, 3);
    }

    #[test]
    fn test_build_normalizes_input_size() {
        let mut embedder = ScriptedEmbedder::returning(&[&[1.0]]);
        KnownFaceRegistry::build(vec![reference("a")], &mut embedder, 160);
        assert_eq!(embedder.last_input, Some((160, 160)));
    }

    #[test]
    fn test_reference_image_kept_at_original_size() {
        let mut embedder = ScriptedEmbedder::returning(&[&[1.0]]);
        let registry = KnownFaceRegistry::build(vec![reference("a")], &mut embedder, 160);
        assert_eq!(registry.get(0).unwrap().reference_image.dimensions(), (200, 240));
    }

    #[test]
    fn test_empty_reference_rejected() {
        let mut embedder = ScriptedEmbedder::returning(&[&[1.0]]);
        let result = KnownFaceRegistry::embed_reference(&RgbImage::new(0, 0), &mut embedder, 160);
        assert!(matches!(result, Err(RecognizerError::EmptyImage)));
        assert_eq!(embedder.calls, 0);
    }

    #[test]
    fn test_two_reference_scenario() {
        let mut builder = ScriptedEmbedder::returning(&[&[1.0, 0.0], &[0.0, 1.0]]);
        let registry =
            KnownFaceRegistry::build(vec![reference("x"), reference("y")], &mut builder, 160);
        let engine = RecognitionEngine::default();
        let candidate = RgbImage::new(30, 30);

        let mut probe = ScriptedEmbedder::returning(&[&[1.0, 0.0], &[0.6, 0.6], &[0.0, 0.0]]);
        assert!(engine.is_known(&candidate, &registry, &mut probe));
        assert!(engine.is_known(&candidate, &registry, &mut probe));
        assert!(!engine.is_known(&candidate, &registry, &mut probe));
    }
}
