//! Face embedding model via ONNX Runtime.
//!
//! Runs a FaceNet-style network on a square RGB face crop and returns the
//! L2-normalized output vector.

use crate::recognizer::{normalize_face, Embedder, RecognizerError};
use crate::types::Embedding;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 128.0;

/// ONNX embedding model taking NCHW float input of `input_size²` pixels.
pub struct OnnxEmbedder {
    session: Session,
    input_size: u32,
    model_version: String,
}

impl OnnxEmbedder {
    pub fn load(model_path: &Path, input_size: u32) -> Result<Self, RecognizerError> {
        if !model_path.exists() {
            return Err(RecognizerError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let model_version = model_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string());

        tracing::info!(
            path = %model_path.display(),
            input_size,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded embedding model"
        );

        Ok(Self {
            session,
            input_size,
            model_version,
        })
    }

    /// Convert an `input_size²` RGB crop to a normalized NCHW tensor.
    fn preprocess(face: &RgbImage, size: usize) -> Array4<f32> {
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, pixel) in face.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }
        tensor
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&mut self, face: &RgbImage) -> Result<Embedding, RecognizerError> {
        if face.width() == 0 || face.height() == 0 {
            return Err(RecognizerError::EmptyImage);
        }

        let face = normalize_face(face, self.input_size);
        let input = Self::preprocess(&face, self.input_size as usize);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| RecognizerError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.is_empty() {
            return Err(RecognizerError::InferenceFailed("model returned an empty embedding".into()));
        }

        let mut values = raw.to_vec();
        l2_normalize(&mut values);

        Ok(Embedding {
            values,
            model_version: Some(self.model_version.clone()),
        })
    }
}

/// Scale to unit length in place. Zero vectors are left untouched.
pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape_and_layout() {
        let mut face = RgbImage::new(4, 4);
        face.put_pixel(1, 2, Rgb([255, 0, 128]));
        let tensor = OnnxEmbedder::preprocess(&face, 4);
        assert_eq!(tensor.shape(), &[1, 3, 4, 4]);
        assert!((tensor[[0, 0, 2, 1]] - (255.0 - 127.5) / 128.0).abs() < 1e-6);
        assert!((tensor[[0, 1, 2, 1]] - (0.0 - 127.5) / 128.0).abs() < 1e-6);
        assert!((tensor[[0, 2, 2, 1]] - (128.0 - 127.5) / 128.0).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_l2_normalize_zero_vector() {
        let mut v = vec![0.0; 3];
        l2_normalize(&mut v);
        assert_eq!(v, vec![0.0; 3]);
    }

    #[test]
    fn test_load_missing_model() {
        let result = OnnxEmbedder::load(Path::new("/nonexistent/facenet.onnx"), 160);
        assert!(matches!(result, Err(RecognizerError::ModelNotFound(_))));
    }
}
