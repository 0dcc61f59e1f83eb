//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame, FrameError};
use image::GrayImage;
use std::path::Path;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;
const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP: f32 = 0.02;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy: {0}")]
    DeviceBusy(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("device does not support video capture")]
    StreamingNotSupported,
    /// A single buffer could not be turned into a frame; the stream is still usable.
    #[error("bad frame buffer: {0}")]
    BadBuffer(#[from] FrameError),
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
    /// YUYV 4:2:2 packed (2 bytes/pixel, Y channel extracted).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
    /// 16-bit little-endian grayscale.
    Y16,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(Self::Yuyv),
            b"GREY" => Some(Self::Grey),
            b"Y16 " | b"Y16\0" => Some(Self::Y16),
            _ => None,
        }
    }

    fn to_gray(self, buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
        match self {
            Self::Yuyv => frame::yuyv_to_gray(buf, width, height),
            Self::Grey => frame::grey_to_gray(buf, width, height),
            Self::Y16 => frame::y16_to_gray(buf, width, height),
        }
    }
}

/// An open, streaming V4L2 camera.
///
/// The mmap stream is created once on open and reused for every frame.
pub struct Camera {
    stream: MmapStream<'static>,
    pub device_path: String,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    next_sequence: u64,
}

impl Camera {
    /// Open a device (e.g. "/dev/video0") and start streaming at roughly
    /// `width`×`height`; the driver may pick the nearest supported size.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
                CameraError::DeviceBusy(device_path.to_string())
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;
        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format {:?} (need YUYV, GREY or Y16)",
                negotiated.fourcc
            ))
        })?;

        let stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("create mmap stream: {e}")))?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?pixel_format,
            "camera streaming"
        );

        Ok(Self {
            stream,
            device_path: device_path.to_string(),
            width: negotiated.width,
            height: negotiated.height,
            pixel_format,
            next_sequence: 0,
        })
    }

    /// Dequeue the next frame as contrast-enhanced grayscale.
    ///
    /// Dark frames are returned flagged, without enhancement.
    pub fn capture(&mut self) -> Result<Frame, CameraError> {
        let (buf, _meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;

        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let gray = self.pixel_format.to_gray(buf, self.width, self.height)?;
        let mut frame = Frame::new(gray, sequence);
        if !frame.is_dark {
            frame::clahe_enhance(&mut frame.image, CLAHE_TILES, CLAHE_CLIP);
        }
        Ok(frame)
    }

    /// Drop `count` frames while auto-exposure settles.
    pub fn discard(&mut self, count: usize) -> Result<(), CameraError> {
        if count > 0 {
            tracing::debug!(count, device = %self.device_path, "discarding warm-up frames");
        }
        for _ in 0..count {
            self.stream
                .next()
                .map_err(|e| CameraError::CaptureFailed(format!("dequeue buffer: {e}")))?;
        }
        Ok(())
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card.clone(),
                        driver: caps.driver.clone(),
                        bus: caps.bus.clone(),
                    })
            })
            .collect()
    }
}
