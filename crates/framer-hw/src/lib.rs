//! framer-hw: V4L2 camera capture and v4l2loopback virtual camera output.

pub mod camera;
pub mod frame;
pub mod loopback;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
pub use loopback::{LoopbackSink, SinkError};
