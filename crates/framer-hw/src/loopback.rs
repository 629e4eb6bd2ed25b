//! v4l2loopback output: publishes RGB frames as YUYV on a virtual camera.

use crate::frame::{self, FrameError};
use image::RgbImage;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use v4l::prelude::*;
use v4l::video::Output;
use v4l::{Format, FourCC};

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("loopback device not found: {0} (is the v4l2loopback module loaded?)")]
    DeviceNotFound(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("frame is {actual:?}, sink expects {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },
    #[error("write failed: {0}")]
    Write(#[from] std::io::Error),
    #[error("frame conversion failed: {0}")]
    Conversion(#[from] FrameError),
}

/// Writer end of a v4l2loopback device.
pub struct LoopbackSink {
    // Keeps the negotiated format alive for the lifetime of the writer.
    _device: Device,
    file: File,
    width: u32,
    height: u32,
    pub device_path: String,
}

impl LoopbackSink {
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, SinkError> {
        if !Path::new(device_path).exists() {
            return Err(SinkError::DeviceNotFound(device_path.to_string()));
        }
        if width % 2 != 0 {
            return Err(FrameError::OddWidth(width).into());
        }

        let device = Device::with_path(device_path)
            .map_err(|e| SinkError::DeviceNotFound(format!("{device_path}: {e}")))?;

        let requested = Format::new(width, height, FourCC::new(b"YUYV"));
        let negotiated = Output::set_format(&device, &requested).map_err(|e| {
            SinkError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;
        if (negotiated.width, negotiated.height) != (width, height)
            || negotiated.fourcc != requested.fourcc
        {
            return Err(SinkError::FormatNegotiationFailed(format!(
                "device settled on {}x{} {:?}",
                negotiated.width, negotiated.height, negotiated.fourcc
            )));
        }

        let file = OpenOptions::new().write(true).open(device_path)?;

        tracing::info!(device = device_path, width, height, "opened virtual camera");

        Ok(Self {
            _device: device,
            file,
            width,
            height,
            device_path: device_path.to_string(),
        })
    }

    /// Convert and write one frame. The frame must match the sink size.
    pub fn write_frame(&mut self, image: &RgbImage) -> Result<(), SinkError> {
        if image.dimensions() != (self.width, self.height) {
            return Err(SinkError::SizeMismatch {
                expected: (self.width, self.height),
                actual: image.dimensions(),
            });
        }
        let yuyv = frame::rgb_to_yuyv(image)?;
        self.file.write_all(&yuyv)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        let result = LoopbackSink::open("/dev/video-no-loopback", 640, 360);
        assert!(matches!(result, Err(SinkError::DeviceNotFound(_))));
    }
}
