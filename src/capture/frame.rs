//! Frame data structures and conditioning for captured images

use image::{imageops, GrayImage, Luma};
use imageproc::contrast::otsu_level;
use imageproc::filter::gaussian_blur_f32;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::RoiFractions;

/// Blur applied before Otsu thresholding (about a 3x3 kernel)
const BLUR_SIGMA: f32 = 0.8;

/// A captured grayscale frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Pixel data
    pub image: GrayImage,
    /// File the frame was read from, if any
    pub source: Option<PathBuf>,
    /// Timestamp when frame was captured
    pub timestamp: Instant,
}

impl CapturedFrame {
    /// Create a new captured frame
    pub fn new(image: GrayImage) -> Self {
        Self {
            image,
            source: None,
            timestamp: Instant::now(),
        }
    }

    /// Create a frame read from `path`
    pub fn from_file(image: GrayImage, path: PathBuf) -> Self {
        Self {
            source: Some(path),
            ..Self::new(image)
        }
    }
}

impl RoiFractions {
    /// Pixel rectangle `(x, y, width, height)` inside a `width`x`height` frame
    ///
    /// Fractions are clamped to [0, 1]. Returns `None` when the region is empty.
    pub fn pixel_bounds(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let scale = |fraction: f32, extent: u32| (fraction.clamp(0.0, 1.0) * extent as f32) as u32;

        let x0 = scale(self.left, width);
        let x1 = scale(self.right, width);
        let y0 = scale(self.top, height);
        let y1 = scale(self.bottom, height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// Crop and binarize frames before recognition
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameConditioner {
    pub roi: Option<RoiFractions>,
    pub binarize: bool,
}

impl FrameConditioner {
    pub fn new(roi: Option<RoiFractions>, binarize: bool) -> Self {
        Self { roi, binarize }
    }

    /// Binarize the whole frame (if enabled), then crop to the region of interest
    ///
    /// An empty region leaves the frame uncropped.
    pub fn apply(&self, image: &GrayImage) -> GrayImage {
        let image = if self.binarize {
            binarize(image)
        } else {
            image.clone()
        };

        match self.roi.and_then(|roi| roi.pixel_bounds(image.width(), image.height())) {
            Some((x, y, w, h)) => imageops::crop_imm(&image, x, y, w, h).to_image(),
            None => image,
        }
    }
}

/// Gaussian blur followed by a global Otsu threshold
pub fn binarize(image: &GrayImage) -> GrayImage {
    let blurred = gaussian_blur_f32(image, BLUR_SIGMA);
    let level = otsu_level(&blurred);

    let mut out = blurred;
    for pixel in out.pixels_mut() {
        *pixel = if pixel.0[0] > level { Luma([255]) } else { Luma([0]) };
    }
    out
}
