//! Faces that matched nobody in the gallery.
//!
//! Every sighting is counted. The first sighting of each distinct unknown face
//! in a session is kept, and its crop can be saved so an operator can register
//! it later (`rollcall register-unknown`).

use chrono::{DateTime, Local};
use image::GrayImage;
use rollcall_core::{BoundingBox, Embedding};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Extra context kept around a face box, as a fraction of its longer side.
const CROP_MARGIN: f32 = 0.4;

#[derive(Error, Debug)]
pub enum UnknownFaceError {
    #[error("cannot create {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot save {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnknownSighting {
    /// Close to an unknown face already kept this session.
    Repeat,
    /// First sighting; `saved` is the crop file, if crops are being saved.
    New { saved: Option<PathBuf> },
}

/// Per-session tracker of unrecognized faces.
pub struct UnknownFaces {
    save_dir: Option<PathBuf>,
    threshold: f32,
    seen: Vec<Embedding>,
    sightings: u64,
}

impl UnknownFaces {
    /// Count and dedup only. Two unknown faces are the same person when their
    /// similarity reaches `threshold`.
    pub fn new(threshold: f32) -> Self {
        Self {
            save_dir: None,
            threshold,
            seen: Vec::new(),
            sightings: 0,
        }
    }

    /// Also save the crop of each new unknown face into `dir`.
    pub fn saving_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.save_dir = Some(dir.into());
        self
    }

    /// Record one sighting. `crop` is only rendered for a new face.
    ///
    /// A face whose crop cannot be saved is not kept, so a later sighting
    /// tries again.
    pub fn record<F>(
        &mut self,
        embedding: &Embedding,
        crop: F,
        at: DateTime<Local>,
    ) -> Result<UnknownSighting, UnknownFaceError>
    where
        F: FnOnce() -> GrayImage,
    {
        self.sightings += 1;
        if self.seen.iter().any(|e| e.similarity(embedding) >= self.threshold) {
            return Ok(UnknownSighting::Repeat);
        }

        let saved = match &self.save_dir {
            Some(dir) => {
                let path = dir.join(crop_file_name(at, self.seen.len() + 1));
                save_crop(dir, &path, &crop())?;
                tracing::info!(file = %path.display(), "unknown face saved");
                Some(path)
            }
            None => None,
        };
        self.seen.push(embedding.clone());
        Ok(UnknownSighting::New { saved })
    }

    /// Every unmatched face seen, repeats included.
    pub fn sightings(&self) -> u64 {
        self.sightings
    }

    /// Distinct unknown faces kept this session.
    pub fn distinct(&self) -> usize {
        self.seen.len()
    }
}

/// `unknown_<YYYYmmdd_HHMMSS>_<seq>.png`
fn crop_file_name(at: DateTime<Local>, seq: usize) -> String {
    format!("unknown_{}_{seq:03}.png", at.format("%Y%m%d_%H%M%S"))
}

fn save_crop(dir: &Path, path: &Path, crop: &GrayImage) -> Result<(), UnknownFaceError> {
    std::fs::create_dir_all(dir).map_err(|source| UnknownFaceError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    crop.save(path).map_err(|source| UnknownFaceError::Save {
        path: path.to_path_buf(),
        source,
    })
}

/// The face box plus a margin, clamped to the image. The margin leaves the
/// detector enough context to find the face again at registration.
pub fn face_crop(image: &GrayImage, face: &BoundingBox) -> GrayImage {
    let (width, height) = image.dimensions();
    let margin = face.width.max(face.height).max(0.0) * CROP_MARGIN;
    let clamp = |v: f32, max: u32| (v.max(0.0) as u32).min(max);

    let x0 = clamp((face.x - margin).floor(), width.saturating_sub(1));
    let y0 = clamp((face.y - margin).floor(), height.saturating_sub(1));
    let x1 = clamp((face.x + face.width + margin).ceil(), width).max(x0 + 1).min(width);
    let y1 = clamp((face.y + face.height + margin).ceil(), height).max(y0 + 1).min(height);

    image::imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image()
}

/// Saved unknown-face crops in `dir`, oldest first. A missing directory has none.
pub fn list_unknowns(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    Ok(rollcall_hw::list_images(dir)?
        .into_iter()
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("unknown_"))
        })
        .collect())
}
