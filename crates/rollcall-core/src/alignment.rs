//! Face alignment via a 4-DOF similarity transform.
//!
//! Detected landmarks are mapped onto the five ArcFace reference points with a
//! closed-form least-squares fit, then the face is resampled into a 112×112
//! crop.

use image::{GrayImage, Luma};

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS: [(f32, f32); 5] = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Scale + rotation + translation:
///
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform {
    pub const IDENTITY: Self = Self { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };

    /// Least-squares fit mapping `src` points onto `dst` points.
    ///
    /// Falls back to the identity when the source points are degenerate
    /// (all coincident).
    pub fn estimate(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> Self {
        let n = src.len() as f32;
        let (sx, sy) = centroid(src);
        let (dx, dy) = centroid(dst);

        let mut spread = 0.0f32;
        let mut cos_term = 0.0f32;
        let mut sin_term = 0.0f32;
        for (&(px, py), &(qx, qy)) in src.iter().zip(dst) {
            let (px, py) = (px - sx, py - sy);
            let (qx, qy) = (qx - dx, qy - dy);
            spread += px * px + py * py;
            cos_term += px * qx + py * qy;
            sin_term += px * qy - py * qx;
        }

        if spread / n < 1e-9 {
            return Self::IDENTITY;
        }

        let a = cos_term / spread;
        let b = sin_term / spread;
        Self {
            a,
            b,
            tx: dx - (a * sx - b * sy),
            ty: dy - (b * sx + a * sy),
        }
    }

    pub fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    /// Inverse transform, or `None` for a zero-scale transform.
    pub fn invert(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let a = self.a / det;
        let b = -self.b / det;
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }

    /// Resample `image` into a `size`×`size` output through this transform.
    ///
    /// Bilinear interpolation; samples outside the source are black.
    pub fn warp(&self, image: &GrayImage, size: u32) -> GrayImage {
        let Some(inverse) = self.invert() else {
            return GrayImage::new(size, size);
        };
        GrayImage::from_fn(size, size, |ox, oy| {
            let (sx, sy) = inverse.apply((ox as f32, oy as f32));
            Luma([sample_bilinear(image, sx, sy)])
        })
    }
}

fn centroid(points: &[(f32, f32); 5]) -> (f32, f32) {
    let n = points.len() as f32;
    let (sum_x, sum_y) = points
        .iter()
        .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
    (sum_x / n, sum_y / n)
}

fn sample_bilinear(image: &GrayImage, x: f32, y: f32) -> u8 {
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let pixel = |px: i64, py: i64| -> f32 {
        if px < 0 || py < 0 || px >= image.width() as i64 || py >= image.height() as i64 {
            0.0
        } else {
            image.get_pixel(px as u32, py as u32)[0] as f32
        }
    };

    let top = pixel(x0, y0) * (1.0 - fx) + pixel(x0 + 1, y0) * fx;
    let bottom = pixel(x0, y0 + 1) * (1.0 - fx) + pixel(x0 + 1, y0 + 1) * fx;
    (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
}

/// Align a detected face to the canonical 112×112 ArcFace crop.
pub fn align_face(image: &GrayImage, landmarks: &[(f32, f32); 5]) -> GrayImage {
    SimilarityTransform::estimate(landmarks, &REFERENCE_LANDMARKS).warp(image, ALIGNED_SIZE)
}
