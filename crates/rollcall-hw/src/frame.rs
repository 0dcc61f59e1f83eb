//! Frame type and pixel processing: raw buffer conversion, dark-frame check, CLAHE.

use image::GrayImage;
use std::path::PathBuf;

/// Share of near-black pixels above which a frame counts as dark.
pub const DARK_FRAME_RATIO: f32 = 0.95;

/// A captured grayscale frame.
#[derive(Clone)]
pub struct Frame {
    pub image: GrayImage,
    /// Monotonic per-source counter, starting at 0.
    pub sequence: u64,
    /// Lens covered, lights off, or sensor still settling.
    pub is_dark: bool,
}

impl Frame {
    pub fn new(image: GrayImage, sequence: u64) -> Self {
        let is_dark = is_dark_frame(image.as_raw(), DARK_FRAME_RATIO);
        Self {
            image,
            sequence,
            is_dark,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        let raw = self.image.as_raw();
        if raw.is_empty() {
            return 0.0;
        }
        raw.iter().map(|&p| p as f32).sum::<f32>() / raw.len() as f32
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width())
            .field("height", &self.height())
            .field("sequence", &self.sequence)
            .field("is_dark", &self.is_dark)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("cannot decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

fn build(width: u32, height: u32, pixels: Vec<u8>) -> Result<GrayImage, FrameError> {
    let expected = width as usize * height as usize;
    let actual = pixels.len();
    GrayImage::from_raw(width, height, pixels).ok_or(FrameError::InvalidLength { expected, actual })
}

/// Packed YUYV 4:2:2 to grayscale: keep the Y byte of each `[Y0, U, Y1, V]` group.
pub fn yuyv_to_gray(buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = width as usize * height as usize * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: buf.len() });
    }
    build(width, height, buf[..expected].iter().step_by(2).copied().collect())
}

/// 16-bit little-endian grayscale to 8-bit, keeping the high byte.
pub fn y16_to_gray(buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = width as usize * height as usize * 2;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: buf.len() });
    }
    build(width, height, buf[..expected].chunks_exact(2).map(|px| px[1]).collect())
}

/// 8-bit grayscale buffer, trailing bytes ignored.
pub fn grey_to_gray(buf: &[u8], width: u32, height: u32) -> Result<GrayImage, FrameError> {
    let expected = width as usize * height as usize;
    if buf.len() < expected {
        return Err(FrameError::InvalidLength { expected, actual: buf.len() });
    }
    build(width, height, buf[..expected].to_vec())
}

/// True when more than `threshold_pct` of pixels are below 32. Empty input is dark.
pub fn is_dark_frame(gray: &[u8], threshold_pct: f32) -> bool {
    if gray.is_empty() {
        return true;
    }
    let dark = gray.iter().filter(|&&p| p < 32).count();
    dark as f32 / gray.len() as f32 > threshold_pct
}

/// Contrast-limited adaptive histogram equalization, in place.
///
/// The image is split into `tiles`×`tiles` regions; each gets a clipped,
/// redistributed histogram turned into a lookup curve, and every pixel is
/// mapped through a bilinear blend of the four nearest tile curves.
pub fn clahe_enhance(image: &mut GrayImage, tiles: u32, clip_limit: f32) {
    let (width, height) = image.dimensions();
    if tiles == 0 || width < tiles || height < tiles {
        return;
    }
    let tile_w = width / tiles;
    let tile_h = height / tiles;

    let source: &GrayImage = image;
    let curves: Vec<[f32; 256]> = (0..tiles)
        .flat_map(|row| (0..tiles).map(move |col| (col, row)))
        .map(|(col, row)| tile_curve(source, col * tile_w, row * tile_h, tile_w, tile_h, clip_limit))
        .collect();
    let curve = |col: u32, row: u32| &curves[(row * tiles + col) as usize];

    let last = (tiles - 1) as f32;
    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let level = pixel[0] as usize;

        // Position relative to tile centres, clamped at the borders
        let gx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, last);
        let gy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, last);
        let (c0, r0) = (gx as u32, gy as u32);
        let (c1, r1) = ((c0 + 1).min(tiles - 1), (r0 + 1).min(tiles - 1));
        let (wx, wy) = (gx - c0 as f32, gy - r0 as f32);

        let top = curve(c0, r0)[level] * (1.0 - wx) + curve(c1, r0)[level] * wx;
        let bottom = curve(c0, r1)[level] * (1.0 - wx) + curve(c1, r1)[level] * wx;
        pixel[0] = (top * (1.0 - wy) + bottom * wy).round().clamp(0.0, 255.0) as u8;
    }
}

/// Clipped-histogram CDF for one tile, scaled to 0–255.
fn tile_curve(image: &GrayImage, x0: u32, y0: u32, w: u32, h: u32, clip_limit: f32) -> [f32; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            hist[image.get_pixel(x, y)[0] as usize] += 1;
        }
    }

    let area = (w * h) as f32;
    let clip = (clip_limit * area) as u32;
    let excess: u32 = hist.iter_mut().map(|bin| {
        let over = bin.saturating_sub(clip);
        *bin -= over;
        over
    }).sum();
    let (share, remainder) = (excess / 256, (excess % 256) as usize);
    for (i, bin) in hist.iter_mut().enumerate() {
        *bin += share + u32::from(i < remainder);
    }

    let mut cdf = [0f32; 256];
    let mut running = 0f32;
    for (slot, &count) in cdf.iter_mut().zip(&hist) {
        running += count as f32;
        *slot = running;
    }

    let floor = cdf.iter().copied().find(|&v| v > 0.0).unwrap_or(0.0);
    let span = area - floor;
    if span > 0.0 {
        for v in cdf.iter_mut() {
            *v = ((*v - floor) / span * 255.0).clamp(0.0, 255.0);
        }
    }
    cdf
}
