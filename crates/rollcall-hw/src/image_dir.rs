//! File-backed frames: every image in a directory, in file-name order.

use crate::frame::{Frame, FrameError};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tiff", "tif"];

/// Whether the path has an image extension we can decode (case-insensitive).
pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Sorted image files under `dir` (not recursive).
pub fn list_images(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && is_supported_image(&path) {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// Yields one grayscale frame per image file.
///
/// A file that fails to decode yields an error for that position only; the
/// next call moves on to the following file.
pub struct ImageDirSource {
    dir: PathBuf,
    pending: VecDeque<PathBuf>,
    next_sequence: u64,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> io::Result<Self> {
        let pending: VecDeque<PathBuf> = list_images(dir)?.into();
        tracing::info!(dir = %dir.display(), frames = pending.len(), "image directory opened");
        Ok(Self {
            dir: dir.to_path_buf(),
            pending,
            next_sequence: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Files not yet yielded.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}

impl Iterator for ImageDirSource {
    type Item = Result<Frame, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.pending.pop_front()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        let decoded = image::open(&path).map_err(|source| FrameError::Decode {
            path: path.clone(),
            source,
        });
        Some(decoded.map(|img| {
            tracing::trace!(path = %path.display(), sequence, "frame loaded");
            Frame::new(img.to_luma8(), sequence)
        }))
    }
}
