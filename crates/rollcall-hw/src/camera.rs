//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use image::RgbImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Fraction of near-black pixels above which a frame is considered dark.
pub const DARK_FRAME_THRESHOLD: f32 = 0.95;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;
const STREAM_BUFFERS: u32 = 4;
const EBUSY: i32 = 16;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("frame conversion failed: {0}")]
    Conversion(#[from] FrameError),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed, the usual webcam output.
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            Some(Self::Y16)
        } else {
            None
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_rgb(buf, width, height),
            Self::Grey => frame::grey_to_rgb(buf, width, height),
            Self::Y16 => frame::y16_to_rgb(buf, width, height),
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 capture device (e.g. "/dev/video0") and negotiate
    /// 640x480, preferring YUYV.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        let device = open_capture_device(device_path)?;

        let mut requested = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("cannot read current format: {e}")))?;
        requested.fourcc = FourCC::new(b"YUYV");
        requested.width = CAPTURE_WIDTH;
        requested.height = CAPTURE_HEIGHT;

        let negotiated = device
            .set_format(&requested)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("driver rejected {CAPTURE_WIDTH}x{CAPTURE_HEIGHT} YUYV: {e}")))?;
        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "driver offered {:?}; YUYV, GREY or Y16 required",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "capture format agreed"
        );

        Ok(Self {
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start a streaming capture. Buffers stay mapped until the stream is
    /// dropped, so continuous capture should hold on to one stream.
    pub fn stream(&self) -> Result<FrameStream<'_>, CameraError> {
        let inner = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("cannot map capture buffers: {e}")))?;
        Ok(FrameStream { camera: self, inner })
    }

    /// Capture a single frame.
    pub fn capture_frame(&self) -> Result<Frame, CameraError> {
        self.stream()?.next_frame()
    }

    /// Capture-capable V4L2 nodes among /dev/video0..15.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo { path, name: caps.card, driver: caps.driver, bus: caps.bus })
            })
            .collect()
    }
}

fn open_capture_device(device_path: &str) -> Result<Device, CameraError> {
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }

    let device = Device::with_path(device_path).map_err(|e| match e.raw_os_error() {
        Some(EBUSY) => CameraError::DeviceBusy,
        _ => CameraError::DeviceNotFound(format!("{device_path}: {e}")),
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("capability query failed: {e}")))?;
    tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

    if caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        Ok(device)
    } else {
        Err(CameraError::StreamingNotSupported)
    }
}

/// An open capture stream on a [`Camera`].
pub struct FrameStream<'a> {
    camera: &'a Camera,
    inner: MmapStream<'a>,
}

impl FrameStream<'_> {
    /// Dequeue the next buffer and convert it to RGB.
    pub fn next_frame(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = CaptureStream::next(&mut self.inner)
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue failed: {e}")))?;

        let image = self
            .camera
            .pixel_format
            .to_rgb(buf, self.camera.width, self.camera.height)?;
        let is_dark = frame::is_dark_frame(&image, DARK_FRAME_THRESHOLD);

        Ok(Frame {
            image,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
            is_dark,
        })
    }
}
