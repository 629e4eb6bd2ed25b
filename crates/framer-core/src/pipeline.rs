//! Per-frame processing: detect, track, optionally recognize, compose.

use crate::compositor::{AspectRatio, FrameCompositor};
use crate::detector::FaceDetector;
use crate::recognizer::{Embedder, RecognitionEngine};
use crate::registry::{KnownFaceRegistry, SessionIndex};
use crate::tracker::{FaceTracker, TrackerError};
use crate::types::FaceBox;
use image::imageops;
use image::RgbImage;
use std::sync::Arc;

/// Recognition of the tracked face, run every `every` frames.
pub struct TrackedRecognition {
    pub engine: RecognitionEngine,
    pub embedder: Box<dyn Embedder>,
    pub registry: Arc<KnownFaceRegistry>,
    pub every: u32,
}

/// Result of processing one captured frame.
#[derive(Debug, Clone)]
pub struct FrameOutcome {
    pub output: RgbImage,
    /// Faces the detector reported this frame.
    pub faces: usize,
    /// Smoothed crop box, if a tracked face was present.
    pub tracked_box: Option<FaceBox>,
    /// Recognition verdict for the tracked face, when it ran this frame.
    pub tracked_known: Option<bool>,
}

/// Owns the detector, tracker and compositor for one video feed.
pub struct FramePipeline {
    detector: Box<dyn FaceDetector>,
    tracker: FaceTracker,
    compositor: FrameCompositor,
    ratio: AspectRatio,
    recognition: Option<TrackedRecognition>,
    frame_counter: u64,
}

impl FramePipeline {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        tracker: FaceTracker,
        compositor: FrameCompositor,
        ratio: AspectRatio,
    ) -> Self {
        Self {
            detector,
            tracker,
            compositor,
            ratio,
            recognition: None,
            frame_counter: 0,
        }
    }

    /// Enable periodic recognition of the tracked face. `every == 0` disables it.
    pub fn with_recognition(mut self, recognition: TrackedRecognition) -> Self {
        if recognition.every > 0 {
            self.recognition = Some(recognition);
        }
        self
    }

    pub fn select(&mut self, index: Option<SessionIndex>) {
        self.tracker.select(index);
    }

    pub fn set_margin(&mut self, margin: f32) -> Result<(), TrackerError> {
        self.tracker.set_margin(margin)
    }

    pub fn set_ratio(&mut self, ratio: AspectRatio) {
        self.ratio = ratio;
    }

    pub fn tracker(&self) -> &FaceTracker {
        &self.tracker
    }

    pub fn ratio(&self) -> AspectRatio {
        self.ratio
    }

    /// Process one frame. Never fails: a detector error counts as no faces.
    pub fn process(&mut self, frame: &RgbImage) -> FrameOutcome {
        self.frame_counter += 1;

        let faces = match self.detector.detect(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::debug!(error = %e, "detection failed; treating frame as empty");
                Vec::new()
            }
        };

        let tracked_box = self.tracker.advance(&faces);
        let tracked_known = self.recognize_tracked(frame, &faces);
        let output = self.compositor.apply(frame, tracked_box.as_ref(), self.ratio);

        FrameOutcome {
            output,
            faces: faces.len(),
            tracked_box,
            tracked_known,
        }
    }

    fn recognize_tracked(&mut self, frame: &RgbImage, faces: &[FaceBox]) -> Option<bool> {
        let recognition = self.recognition.as_mut()?;
        if self.frame_counter % recognition.every as u64 != 0 {
            return None;
        }
        let face = faces.get(self.tracker.tracked_index()?)?;
        let (x, y, w, h) = face.clamp_to(frame.width(), frame.height())?;
        let crop = imageops::crop_imm(frame, x, y, w, h).to_image();

        Some(recognition.engine.is_known(
            &crop,
            &recognition.registry,
            recognition.embedder.as_mut(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::DetectorError;
    use crate::recognizer::tests::ScriptedEmbedder;
    use crate::registry::KnownFaceEntry;
    use crate::types::Embedding;
    use std::collections::VecDeque;

    struct ScriptedDetector {
        frames: VecDeque<Result<Vec<FaceBox>, DetectorError>>,
    }

    impl FaceDetector for ScriptedDetector {
        fn detect(&mut self, _frame: &RgbImage) -> Result<Vec<FaceBox>, DetectorError> {
            self.frames.pop_front().unwrap_or(Ok(Vec::new()))
        }
    }

    fn pipeline(frames: Vec<Result<Vec<FaceBox>, DetectorError>>) -> FramePipeline {
        FramePipeline::new(
            Box::new(ScriptedDetector { frames: frames.into() }),
            FaceTracker::new(0.5, 0.2).unwrap(),
            FrameCompositor::new(160, 90),
            AspectRatio::WIDE,
        )
    }

    fn face() -> FaceBox {
        FaceBox::new(600.0, 300.0, 80.0, 80.0)
    }

    #[test]
    fn test_idle_outputs_full_frame() {
        let mut p = pipeline(vec![Ok(vec![face()])]);
        let frame = RgbImage::new(1280, 720);
        let outcome = p.process(&frame);
        assert_eq!(outcome.faces, 1);
        assert_eq!(outcome.tracked_box, None);
        assert_eq!(outcome.output.dimensions(), (160, 90));
    }

    #[test]
    fn test_tracking_crops_to_expanded_box() {
        let mut p = pipeline(vec![Ok(vec![face()])]);
        p.select(Some(0));
        let outcome = p.process(&RgbImage::new(1280, 720));
        assert_eq!(outcome.tracked_box, Some(face().expand(0.5)));
    }

    #[test]
    fn test_detector_error_counts_as_no_faces() {
        let mut p = pipeline(vec![Err(DetectorError::InferenceFailed("gpu gone".into()))]);
        p.select(Some(0));
        let outcome = p.process(&RgbImage::new(640, 360));
        assert_eq!(outcome.faces, 0);
        assert_eq!(outcome.tracked_box, None);
        assert_eq!(outcome.output.dimensions(), (160, 90));
    }

    #[test]
    fn test_recognition_runs_on_schedule_for_tracked_face_only() {
        let mut registry = KnownFaceRegistry::default();
        registry.push(KnownFaceEntry {
            reference_image: RgbImage::new(8, 8),
            embedding: Embedding::new(vec![1.0, 0.0]),
            label: "me".into(),
        });

        let mut p = pipeline((0..4).map(|_| Ok(vec![face()])).collect())
            .with_recognition(TrackedRecognition {
                engine: RecognitionEngine::default(),
                embedder: Box::new(ScriptedEmbedder::returning(&[&[1.0, 0.0]])),
                registry: Arc::new(registry),
                every: 2,
            });
        let frame = RgbImage::new(1280, 720);

        // Idle: frame 1 is off-schedule; frame 2 is on schedule but nothing is tracked.
        assert_eq!(p.process(&frame).tracked_known, None);
        assert_eq!(p.process(&frame).tracked_known, None);

        p.select(Some(0));
        assert_eq!(p.process(&frame).tracked_known, None);
        let outcome = p.process(&frame);
        assert_eq!(outcome.tracked_known, Some(true));
    }

    #[test]
    fn test_zero_interval_disables_recognition() {
        let p = pipeline(Vec::new()).with_recognition(TrackedRecognition {
            engine: RecognitionEngine::default(),
            embedder: Box::new(ScriptedEmbedder::returning(&[])),
            registry: Arc::new(KnownFaceRegistry::default()),
            every: 0,
        });
        assert!(p.recognition.is_none());
    }

    #[test]
    fn test_ratio_and_margin_controls() {
        let mut p = pipeline(Vec::new());
        p.set_ratio(AspectRatio::SQUARE);
        assert_eq!(p.ratio(), AspectRatio::SQUARE);
        assert!(p.set_margin(-1.0).is_err());
        p.set_margin(2.0).unwrap();
        assert_eq!(p.tracker().margin(), 2.0);
    }
}
