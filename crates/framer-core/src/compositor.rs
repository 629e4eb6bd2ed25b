//! Output framing: crop to the tracked box, center-crop to the target
//! aspect ratio, and scale onto the fixed-size output canvas.

use crate::types::FaceBox;
use image::imageops::{self, FilterType};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_OUTPUT_WIDTH: u32 = 960;
pub const DEFAULT_OUTPUT_HEIGHT: u32 = 540;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RatioError {
    #[error("unrecognized aspect ratio '{0}' (expected e.g. 16:9, 1:1, 16:10)")]
    Unrecognized(String),
}

/// Target aspect ratio as an integer `num:den` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AspectRatio {
    num: u32,
    den: u32,
}

impl AspectRatio {
    pub const WIDE: AspectRatio = AspectRatio { num: 16, den: 9 };
    pub const SQUARE: AspectRatio = AspectRatio { num: 1, den: 1 };
    pub const WIDE_16_10: AspectRatio = AspectRatio { num: 16, den: 10 };

    /// Named ratios offered to users.
    pub const PRESETS: [(&'static str, AspectRatio); 3] = [
        ("16:9", Self::WIDE),
        ("1:1", Self::SQUARE),
        ("16:10", Self::WIDE_16_10),
    ];

    pub fn new(num: u32, den: u32) -> Option<Self> {
        (num > 0 && den > 0).then_some(Self { num, den })
    }

    pub fn value(&self) -> f32 {
        self.num as f32 / self.den as f32
    }

    /// Largest centered rectangle of this ratio inside `width × height`,
    /// as `(x, y, w, h)`.
    ///
    /// Exact in integer arithmetic, so a frame that already has this ratio
    /// maps onto itself.
    pub fn fit_within(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
        let (w, h) = (width as u64, height as u64);
        let (num, den) = (self.num as u64, self.den as u64);

        if w * den > h * num {
            let new_w = ((h * num + den / 2) / den).clamp(1, w) as u32;
            ((width - new_w) / 2, 0, new_w, height)
        } else if w * den < h * num {
            let new_h = ((w * den + num / 2) / num).clamp(1, h) as u32;
            (0, (height - new_h) / 2, width, new_h)
        } else {
            (0, 0, width, height)
        }
    }
}

impl Default for AspectRatio {
    fn default() -> Self {
        Self::WIDE
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.num, self.den)
    }
}

impl FromStr for AspectRatio {
    type Err = RatioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((_, preset)) = Self::PRESETS.iter().find(|(name, _)| *name == s) {
            return Ok(*preset);
        }
        let (num, den) = s
            .split_once(':')
            .ok_or_else(|| RatioError::Unrecognized(s.to_string()))?;
        let num = num.trim().parse::<u32>().ok();
        let den = den.trim().parse::<u32>().ok();
        num.zip(den)
            .and_then(|(n, d)| AspectRatio::new(n, d))
            .ok_or_else(|| RatioError::Unrecognized(s.to_string()))
    }
}

impl TryFrom<String> for AspectRatio {
    type Error = RatioError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AspectRatio> for String {
    fn from(ratio: AspectRatio) -> Self {
        ratio.to_string()
    }
}

/// Stateless frame compositor with a fixed output resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCompositor {
    output_width: u32,
    output_height: u32,
}

impl Default for FrameCompositor {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_WIDTH, DEFAULT_OUTPUT_HEIGHT)
    }
}

impl FrameCompositor {
    pub fn new(output_width: u32, output_height: u32) -> Self {
        Self {
            output_width: output_width.max(1),
            output_height: output_height.max(1),
        }
    }

    /// Compose one output frame.
    ///
    /// When `crop` is given it is clipped to the frame and cut out first; a
    /// box with no overlap with the frame is ignored. The result is then
    /// center-cropped to `ratio` and scaled into the largest `ratio`-shaped
    /// area of the output canvas. Any canvas left over (when `ratio` differs
    /// from the output's own ratio) stays black.
    pub fn apply(&self, frame: &RgbImage, crop: Option<&FaceBox>, ratio: AspectRatio) -> RgbImage {
        let mut canvas = RgbImage::new(self.output_width, self.output_height);
        if frame.width() == 0 || frame.height() == 0 {
            return canvas;
        }

        let (bx, by, bw, bh) = crop
            .and_then(|b| b.clamp_to(frame.width(), frame.height()))
            .unwrap_or((0, 0, frame.width(), frame.height()));

        let (rx, ry, rw, rh) = ratio.fit_within(bw, bh);
        let region = imageops::crop_imm(frame, bx + rx, by + ry, rw, rh).to_image();

        let (cx, cy, cw, ch) = ratio.fit_within(self.output_width, self.output_height);
        let scaled = if region.dimensions() == (cw, ch) {
            region
        } else {
            imageops::resize(&region, cw, ch, FilterType::Triangle)
        };

        imageops::replace(&mut canvas, &scaled, cx as i64, cy as i64);
        canvas
    }
}
