//! Tracking state machine: which face is pinned, and its smoothed box.
//!
//! The tracked face is addressed by its position in the detector output.
//! That position is a per-frame heuristic, not an identity: detectors do not
//! promise the same ordering from one frame to the next.

use crate::registry::SessionIndex;
use crate::types::FaceBox;
use thiserror::Error;

/// Weight of the newest observation in the moving average.
pub const DEFAULT_ALPHA: f32 = 0.2;

/// Default expansion around the detected face, in face sizes per side.
pub const DEFAULT_MARGIN: f32 = 1.5;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("tracking margin must be a positive finite number, got {0}")]
    InvalidMargin(f32),
    #[error("smoothing factor must be in (0, 1], got {0}")]
    InvalidAlpha(f32),
}

/// Selects one face and follows it with an exponentially smoothed,
/// margin-expanded box.
#[derive(Debug, Clone)]
pub struct FaceTracker {
    tracked: Option<SessionIndex>,
    smoothed: Option<FaceBox>,
    margin: f32,
    alpha: f32,
}

impl Default for FaceTracker {
    fn default() -> Self {
        Self {
            tracked: None,
            smoothed: None,
            margin: DEFAULT_MARGIN,
            alpha: DEFAULT_ALPHA,
        }
    }
}

impl FaceTracker {
    pub fn new(margin: f32, alpha: f32) -> Result<Self, TrackerError> {
        validate_margin(margin)?;
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(TrackerError::InvalidAlpha(alpha));
        }
        Ok(Self {
            margin,
            alpha,
            ..Self::default()
        })
    }

    /// Pin tracking to `index`, or return to idle with `None`.
    ///
    /// Always discards the smoothed box, even when re-selecting the same index.
    pub fn select(&mut self, index: Option<SessionIndex>) {
        self.tracked = index;
        self.smoothed = None;
        match index {
            Some(i) => tracing::info!(index = i, "tracking face"),
            None => tracing::info!("tracking cleared"),
        }
    }

    /// Change the margin. Takes effect on the next [`advance`](Self::advance).
    pub fn set_margin(&mut self, margin: f32) -> Result<(), TrackerError> {
        validate_margin(margin)?;
        self.margin = margin;
        Ok(())
    }

    /// Step the filter with this frame's detections.
    ///
    /// Returns `None` when idle or when the tracked index is missing from
    /// `detections`; a miss leaves the smoothed box alone so tracking resumes
    /// where it left off.
    pub fn advance(&mut self, detections: &[FaceBox]) -> Option<FaceBox> {
        let index = self.tracked?;
        let raw = detections.get(index)?.expand(self.margin);

        let next = match self.smoothed {
            None => raw,
            Some(prev) => prev.blend(&raw, self.alpha),
        };
        self.smoothed = Some(next);
        Some(next)
    }

    pub fn tracked_index(&self) -> Option<SessionIndex> {
        self.tracked
    }

    pub fn smoothed_box(&self) -> Option<FaceBox> {
        self.smoothed
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }
}

fn validate_margin(margin: f32) -> Result<(), TrackerError> {
    if margin.is_finite() && margin > 0.0 {
        Ok(())
    } else {
        Err(TrackerError::InvalidMargin(margin))
    }
}
