//! Where frames come from.

use rollcall_hw::{Camera, CameraError, Frame, ImageDirSource};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SourceError {
    /// One frame could not be decoded; later frames may still be fine.
    #[error("frame decode failed: {0}")]
    Decode(String),
    /// The device or backing store is gone; no further frames will arrive.
    #[error("frame source failed: {0}")]
    Device(String),
}

impl SourceError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// A sequence of frames. `Ok(None)` means the source is exhausted.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    /// Short human-readable name for logs.
    fn describe(&self) -> String;
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        match self.capture() {
            Ok(frame) => Ok(Some(frame)),
            Err(CameraError::BadBuffer(e)) => Err(SourceError::Decode(e.to_string())),
            Err(e) => Err(SourceError::Device(e.to_string())),
        }
    }

    fn describe(&self) -> String {
        format!("camera {} ({}x{})", self.device_path, self.width, self.height)
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        self.next()
            .transpose()
            .map_err(|e| SourceError::Decode(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("image directory {}", self.dir().display())
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
