use serde::{Deserialize, Serialize};

/// Axis-aligned face rectangle in frame pixel coordinates.
///
/// Detector output has positive width and height. Coordinates are not
/// clamped: an expanded or smoothed box may extend past the frame edges,
/// and it is the compositor's job to clip it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }

    pub fn center(&self) -> (f32, f32) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    /// Grow the box symmetrically about its center by `margin` on every side,
    /// measured in multiples of the box's own size: `w' = w * (1 + 2 * margin)`.
    pub fn expand(&self, margin: f32) -> FaceBox {
        let (cx, cy) = self.center();
        let width = self.width * (1.0 + 2.0 * margin);
        let height = self.height * (1.0 + 2.0 * margin);
        FaceBox {
            x: cx - width / 2.0,
            y: cy - height / 2.0,
            width,
            height,
        }
    }

    /// Component-wise exponential moving average step:
    /// `alpha * observation + (1 - alpha) * self`.
    pub fn blend(&self, observation: &FaceBox, alpha: f32) -> FaceBox {
        let mix = |prev: f32, obs: f32| alpha * obs + (1.0 - alpha) * prev;
        FaceBox {
            x: mix(self.x, observation.x),
            y: mix(self.y, observation.y),
            width: mix(self.width, observation.width),
            height: mix(self.height, observation.height),
        }
    }

    /// Euclidean distance between the two boxes viewed as `[x, y, w, h]` vectors.
    pub fn distance(&self, other: &FaceBox) -> f32 {
        ((self.x - other.x).powi(2)
            + (self.y - other.y).powi(2)
            + (self.width - other.width).powi(2)
            + (self.height - other.height).powi(2))
        .sqrt()
    }

    /// Clip to a `frame_width × frame_height` frame and snap to whole pixels.
    ///
    /// Returns `(x, y, width, height)`, or `None` when nothing of the box lies
    /// inside the frame.
    pub fn clamp_to(&self, frame_width: u32, frame_height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0.0) as u32;
        let y0 = self.y.max(0.0) as u32;
        let x1 = (self.x + self.width).min(frame_width as f32).max(0.0) as u32;
        let y1 = (self.y + self.height).min(frame_height as f32).max(0.0) as u32;
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Face embedding vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model that produced this embedding (e.g., "facenet").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// Zero when either vector has zero norm or the lengths differ.
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

        if norm_a == 0.0 || norm_b == 0.0 {
            return 0.0;
        }
        (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_similarity_identical() {
        let a = emb(&[1.0, 0.0, 0.0]);
        assert!((a.similarity(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_orthogonal() {
        assert!(emb(&[1.0, 0.0]).similarity(&emb(&[0.0, 1.0])).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_opposite() {
        assert!((emb(&[1.0, 0.0]).similarity(&emb(&[-1.0, 0.0])) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_zero_vector() {
        let zero = emb(&[0.0, 0.0]);
        assert_eq!(zero.similarity(&emb(&[1.0, 0.0])), 0.0);
        assert_eq!(emb(&[1.0, 0.0]).similarity(&zero), 0.0);
        assert_eq!(zero.similarity(&zero), 0.0);
    }

    #[test]
    fn test_similarity_length_mismatch() {
        assert_eq!(emb(&[1.0, 0.0]).similarity(&emb(&[1.0, 0.0, 0.0])), 0.0);
    }

    #[test]
    fn test_similarity_symmetric_and_bounded() {
        let samples = [
            emb(&[0.3, -1.2, 4.0]),
            emb(&[-7.5, 0.1, 0.0]),
            emb(&[1e-3, 2e-3, -5e-3]),
            emb(&[100.0, 100.0, 100.0]),
            emb(&[0.0, 0.0, 0.0]),
        ];
        for a in &samples {
            for b in &samples {
                let ab = a.similarity(b);
                let ba = b.similarity(a);
                assert_eq!(ab, ba);
                assert!((-1.0..=1.0).contains(&ab), "out of range: {ab}");
            }
        }
    }

    #[test]
    fn test_expand_keeps_center() {
        let b = FaceBox::new(100.0, 50.0, 40.0, 60.0);
        let e = b.expand(1.5);
        assert_eq!(e.center(), b.center());
        // 40 * (1 + 3) = 160, 60 * 4 = 240
        assert!((e.width - 160.0).abs() < 1e-4);
        assert!((e.height - 240.0).abs() < 1e-4);
        assert!((e.x - 40.0).abs() < 1e-4);
        assert!((e.y - -40.0).abs() < 1e-4);
    }

    #[test]
    fn test_expand_monotonic_in_margin() {
        let b = FaceBox::new(10.0, 10.0, 30.0, 20.0);
        let mut prev = b.expand(0.0);
        for m in [0.25, 0.5, 1.0, 1.5, 2.0, 3.0] {
            let next = b.expand(m);
            assert!(next.width > prev.width);
            assert!(next.height > prev.height);
            prev = next;
        }
    }

    #[test]
    fn test_blend_weights() {
        let prev = FaceBox::new(0.0, 0.0, 100.0, 100.0);
        let obs = FaceBox::new(10.0, 20.0, 200.0, 50.0);
        let b = prev.blend(&obs, 0.2);
        assert!((b.x - 2.0).abs() < 1e-5);
        assert!((b.y - 4.0).abs() < 1e-5);
        assert!((b.width - 120.0).abs() < 1e-4);
        assert!((b.height - 90.0).abs() < 1e-4);
    }

    #[test]
    fn test_clamp_inside() {
        let b = FaceBox::new(10.5, 20.9, 100.0, 50.0);
        assert_eq!(b.clamp_to(640, 480), Some((10, 20, 100, 50)));
    }

    #[test]
    fn test_clamp_overhanging() {
        let b = FaceBox::new(-50.0, -10.0, 200.0, 600.0);
        assert_eq!(b.clamp_to(640, 480), Some((0, 0, 150, 480)));
    }

    #[test]
    fn test_clamp_outside() {
        assert_eq!(FaceBox::new(700.0, 10.0, 50.0, 50.0).clamp_to(640, 480), None);
        assert_eq!(FaceBox::new(-100.0, 10.0, 50.0, 50.0).clamp_to(640, 480), None);
    }
}
