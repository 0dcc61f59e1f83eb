//! Enrollment: image file to stored face model.

use crate::config::Config;
use crate::store::{GalleryStore, StoreError};
use chrono::Utc;
use image::GrayImage;
use rollcall_core::detector::DetectorError;
use rollcall_core::recognizer::RecognizerError;
use rollcall_core::{DetectorOptions, Embedding, FaceDetector, FaceModel, FaceRecognizer, Identity};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("no usable face found in {0}")]
    NoFace(PathBuf),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl EnrollError {
    /// Problems with one input file, as opposed to the models or the store.
    pub fn is_per_file(&self) -> bool {
        matches!(self, Self::Decode { .. } | Self::NoFace(_))
    }
}

/// Finds the most prominent face in an image and embeds it.
pub trait FaceEmbedder {
    /// Embedding and detector score of the best face, or `None` if there is no usable face.
    fn embed_best_face(&mut self, image: &GrayImage) -> Result<Option<(Embedding, f32)>, EnrollError>;
}

/// SCRFD + ArcFace embedder.
pub struct OnnxEmbedder {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxEmbedder {
    pub fn load(config: &Config) -> Result<Self, EnrollError> {
        Ok(Self {
            detector: FaceDetector::load(&config.scrfd_model_path(), DetectorOptions::default())?,
            recognizer: FaceRecognizer::load(&config.arcface_model_path())?,
        })
    }
}

impl FaceEmbedder for OnnxEmbedder {
    fn embed_best_face(&mut self, image: &GrayImage) -> Result<Option<(Embedding, f32)>, EnrollError> {
        let faces = self.detector.detect(image)?;
        let best = faces
            .iter()
            .filter(|f| f.landmarks.is_some())
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));
        let Some(face) = best else {
            return Ok(None);
        };
        tracing::debug!(faces = faces.len(), confidence = face.confidence, "best face selected");
        let embedding = self.recognizer.extract(image, face)?;
        Ok(Some((embedding, face.confidence)))
    }
}

/// Enroll the best face of one image under `identity`.
pub fn enroll_image<E: FaceEmbedder + ?Sized>(
    embedder: &mut E,
    store: &GalleryStore,
    path: &Path,
    identity: &Identity,
    label: &str,
) -> Result<FaceModel, EnrollError> {
    let image = image::open(path)
        .map_err(|source| EnrollError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_luma8();

    let (embedding, score) = embedder
        .embed_best_face(&image)?
        .ok_or_else(|| EnrollError::NoFace(path.to_path_buf()))?;

    let model = FaceModel {
        id: uuid::Uuid::new_v4().to_string(),
        identity: identity.clone(),
        label: label.to_string(),
        embedding,
        created_at: Utc::now(),
    };
    store.insert(&model)?;
    tracing::info!(identity = %identity, file = %path.display(), score, "enrolled");
    Ok(model)
}

/// Enroll a saved unknown-face crop under `identity`, then delete the crop.
///
/// The crop is kept if enrollment fails. Failing to delete it after a
/// successful enrollment is only logged.
pub fn register_unknown<E: FaceEmbedder + ?Sized>(
    embedder: &mut E,
    store: &GalleryStore,
    crop: &Path,
    identity: &Identity,
    label: &str,
) -> Result<FaceModel, EnrollError> {
    let model = enroll_image(embedder, store, crop, identity, label)?;
    if let Err(e) = std::fs::remove_file(crop) {
        tracing::warn!(file = %crop.display(), error = %e, "registered crop not removed");
    }
    Ok(model)
}

/// Identity encoded in a file name: the stem up to the first `_`
/// (`alice_20240902_083000.jpg` belongs to `alice`).
pub fn identity_from_filename(path: &Path) -> Option<Identity> {
    let stem = path.file_stem()?.to_str()?;
    let name = stem.split('_').next()?;
    Identity::new(name).ok()
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportedFace {
    pub file: PathBuf,
    pub identity: Identity,
    pub model_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    pub file: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub enrolled: Vec<ImportedFace>,
    pub skipped: Vec<SkippedFile>,
}

/// Enroll every image in `dir`, naming identities after the files.
///
/// Files without a usable face or identity are skipped with a warning; model
/// and store failures abort the import.
pub fn import_dir<E: FaceEmbedder + ?Sized>(
    embedder: &mut E,
    store: &GalleryStore,
    dir: &Path,
    label: &str,
) -> Result<ImportReport, EnrollError> {
    let mut report = ImportReport::default();

    for path in rollcall_hw::list_images(dir)? {
        let Some(identity) = identity_from_filename(&path) else {
            tracing::warn!(file = %path.display(), "no identity in file name; skipped");
            report.skipped.push(SkippedFile {
                file: path,
                reason: "no identity in file name".into(),
            });
            continue;
        };

        match enroll_image(embedder, store, &path, &identity, label) {
            Ok(model) => report.enrolled.push(ImportedFace {
                file: path,
                identity,
                model_id: model.id,
            }),
            Err(e) if e.is_per_file() => {
                tracing::warn!(file = %path.display(), error = %e, "skipped");
                report.skipped.push(SkippedFile {
                    file: path,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }

    tracing::info!(
        dir = %dir.display(),
        enrolled = report.enrolled.len(),
        skipped = report.skipped.len(),
        "import finished"
    );
    Ok(report)
}
