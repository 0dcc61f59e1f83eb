//! rollcall-core: face detection, recognition and the identity types that
//! flow out of them.
//!
//! SCRFD finds faces and ArcFace turns each face into an embedding, both via
//! ONNX Runtime on the CPU. Embeddings are matched against an enrolled gallery
//! to produce an [`Identity`] with a confidence score.

pub mod alignment;
pub mod detector;
pub mod identity;
pub mod recognizer;
pub mod types;

pub use detector::{DetectorOptions, FaceDetector};
pub use identity::{Detection, Identity, ValidationError};
pub use recognizer::FaceRecognizer;
pub use types::{BoundingBox, CosineMatcher, Embedding, FaceModel, GalleryMatch, Matcher};
