//! rollcall-hw: frame capture for attendance sessions.
//!
//! Provides V4L2 camera access and an image-directory sequence, both yielding
//! grayscale [`Frame`]s ready for face detection.

pub mod camera;
pub mod frame;
pub mod image_dir;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::{Frame, FrameError};
pub use image_dir::{is_supported_image, list_images, ImageDirSource};
