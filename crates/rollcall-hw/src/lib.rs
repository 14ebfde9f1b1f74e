//! rollcall-hw: V4L2 camera capture for the attendance daemon.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::Frame;
