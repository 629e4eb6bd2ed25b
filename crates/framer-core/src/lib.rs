//! framer-core: face detection, recognition, tracking and output framing.
//!
//! Detection uses SCRFD and embeddings use a FaceNet-style model, both
//! running on ONNX Runtime for CPU inference. Everything downstream of the
//! models (tracking, compositing, known-face matching) is pure and testable
//! without hardware.

pub mod compositor;
pub mod detector;
pub mod embedder;
pub mod pipeline;
pub mod recognizer;
pub mod registry;
pub mod tracker;
pub mod types;

pub use compositor::{AspectRatio, FrameCompositor, RatioError};
pub use detector::{DetectorError, FaceDetector, ScrfdDetector};
pub use embedder::OnnxEmbedder;
pub use pipeline::{FrameOutcome, FramePipeline, TrackedRecognition};
pub use recognizer::{Embedder, RecognitionEngine, RecognizerError};
pub use registry::{KnownFaceEntry, KnownFaceRegistry, ReferenceImage, SessionIndex};
pub use tracker::{FaceTracker, TrackerError};
pub use types::{Embedding, FaceBox};
