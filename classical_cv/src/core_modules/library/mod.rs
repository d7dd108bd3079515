// THEORY:
// The Image Library is the pixel-crunching collaborator behind every operation. The
// dispatch layer never computes a gradient or a threshold itself; it asks a library
// for a named capability and annotates or converts the result. Keeping that boundary
// as a trait lets the same catalog run on two very different engines:
//
// - `ImageprocLibrary` (default): pure Rust, composed from the `image` and
//   `imageproc` crates. Capabilities that need trained models or non-free modules are
//   reported as unavailable rather than approximated.
// - `OpencvLibrary` (feature `opencv`): one-to-one calls into OpenCV through the
//   `opencv` crate; `opencv-contrib` adds SURF and STAR/BRIEF.
//
// Detectors return plain data (keypoints, segments, circles, boxes) so drawing stays
// in one place (`annotate`) regardless of which engine found them. All images cross
// the boundary in RGB order; a backend that wants BGR converts on its own side.

pub mod imageproc_backend;
pub mod kernels;
#[cfg(feature = "opencv")]
pub mod opencv_backend;

use crate::core_modules::frame::FloatImage;
use image::{GrayImage, RgbImage};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub use imageproc_backend::ImageprocLibrary;
#[cfg(feature = "opencv")]
pub use opencv_backend::OpencvLibrary;

/// Optional capabilities a library may or may not provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Capability {
    SiftDetector,
    SurfDetector,
    OrbDetector,
    BriefDescriptor,
    HogPeopleDetector,
    HaarCascades,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::SiftDetector,
        Capability::SurfDetector,
        Capability::OrbDetector,
        Capability::BriefDescriptor,
        Capability::HogPeopleDetector,
        Capability::HaarCascades,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::SiftDetector => "SIFT detector",
            Capability::SurfDetector => "SURF detector",
            Capability::OrbDetector => "ORB detector",
            Capability::BriefDescriptor => "STAR/BRIEF extractor",
            Capability::HogPeopleDetector => "HOG people detector",
            Capability::HaarCascades => "Haar cascade classifier",
        })
    }
}

/// Error raised by an Image Library call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LibraryError {
    /// A value the library cannot accept (even kernel size, empty template, ...).
    #[error("{0}")]
    InvalidParameter(String),
    /// The capability is not linked into this library.
    #[error("{0} is not available in the linked image library")]
    Unavailable(Capability),
    /// Any other failure inside the library.
    #[error("{0}")]
    Failed(String),
}

pub type LibraryResult<T> = Result<T, LibraryError>;

/// A detected distinctive image location.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Diameter of the meaningful neighborhood, in pixels.
    pub size: f32,
    /// Orientation in degrees, `None` when the detector doesn't assign one.
    pub angle: Option<f32>,
    pub response: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSegment {
    pub start: (i32, i32),
    pub end: (i32, i32),
}

impl LineSegment {
    pub fn length(&self) -> f64 {
        let dx = (self.end.0 - self.start.0) as f64;
        let dy = (self.end.1 - self.start.1) as f64;
        dx.hypot(dy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Circle {
    pub center: (f32, f32),
    pub radius: f32,
}

/// An axis-aligned detection box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// A per-pixel label map. Label 0 is "unknown", -1 marks watershed boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub width: u32,
    pub height: u32,
    pub data: Vec<i32>,
}

impl Labels {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height, data: vec![0; (width as usize) * (height as usize)] }
    }

    #[inline]
    pub fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> i32 {
        self.data[self.index(x, y)]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, label: i32) {
        let index = self.index(x, y);
        self.data[index] = label;
    }

    pub fn max_label(&self) -> i32 {
        self.data.iter().copied().max().unwrap_or(0)
    }
}

/// Keypoint detector families.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeypointDetector {
    Sift,
    Surf { hessian_threshold: f64 },
    Orb,
    /// STAR detector whose keypoints feed a BRIEF extractor.
    StarBrief,
}

impl KeypointDetector {
    pub fn capability(&self) -> Capability {
        match self {
            KeypointDetector::Sift => Capability::SiftDetector,
            KeypointDetector::Surf { .. } => Capability::SurfDetector,
            KeypointDetector::Orb => Capability::OrbDetector,
            KeypointDetector::StarBrief => Capability::BriefDescriptor,
        }
    }
}

/// Stock Haar cascades.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cascade {
    FrontalFace,
    Eye,
    FullBody,
}

impl Cascade {
    /// File name of the stock OpenCV cascade.
    pub fn file_name(&self) -> &'static str {
        match self {
            Cascade::FrontalFace => "haarcascade_frontalface_default.xml",
            Cascade::Eye => "haarcascade_eye.xml",
            Cascade::FullBody => "haarcascade_fullbody.xml",
        }
    }
}

/// Global threshold flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdMode {
    /// `value > threshold` → max, else 0.
    Binary,
    /// `value > threshold` → 0, else max.
    BinaryInverted,
}

/// Where a library finds its model files.
#[derive(Debug, Clone, Default)]
pub struct ModelPaths {
    /// Directory holding the stock `haarcascade_*.xml` files.
    pub cascade_dir: Option<PathBuf>,
}

/// The pixel-level operations the catalog consumes. All methods are pure: inputs are
/// borrowed, outputs freshly allocated.
pub trait ImageLibrary: Send + Sync {
    /// Short identifier used in status messages and logs.
    fn name(&self) -> &'static str;

    /// Capability query, called once when a dispatcher is built.
    fn supports(&self, capability: Capability) -> bool;

    // --- Filtering ---
    fn gaussian_blur(&self, image: &RgbImage, kernel: (u32, u32), sigma: f64) -> LibraryResult<RgbImage>;
    fn median_blur(&self, image: &RgbImage, kernel: u32) -> LibraryResult<RgbImage>;
    fn median_blur_gray(&self, image: &GrayImage, kernel: u32) -> LibraryResult<GrayImage>;
    fn bilateral_filter(&self, image: &RgbImage, diameter: i32, sigma_color: f64, sigma_space: f64)
        -> LibraryResult<RgbImage>;
    /// 3×3 correlation, saturated to 8 bits.
    fn filter3x3(&self, image: &RgbImage, kernel: &[f32; 9]) -> LibraryResult<RgbImage>;
    /// `alpha·a + beta·b + gamma`, saturated.
    fn add_weighted(&self, a: &RgbImage, alpha: f64, b: &RgbImage, beta: f64, gamma: f64) -> LibraryResult<RgbImage>;
    fn apply_lut(&self, image: &RgbImage, table: &[u8; 256]) -> LibraryResult<RgbImage>;
    fn equalize_histogram(&self, image: &GrayImage) -> LibraryResult<GrayImage>;

    // --- Gradients, edges, corners, lines, circles ---
    /// Derivative of order (`dx`, `dy`) with a `ksize` aperture, as floats.
    fn sobel(&self, image: &GrayImage, dx: u32, dy: u32, ksize: u32) -> LibraryResult<FloatImage>;
    fn canny(&self, image: &GrayImage, low: f64, high: f64) -> LibraryResult<GrayImage>;
    fn corner_harris(&self, image: &GrayImage, block_size: u32, ksize: u32, k: f64) -> LibraryResult<FloatImage>;
    /// 3×3 grayscale dilation of a response map.
    fn dilate_response(&self, response: &FloatImage) -> LibraryResult<FloatImage>;
    /// Probabilistic Hough transform on a binary edge map.
    fn hough_lines(
        &self,
        edges: &GrayImage,
        rho: f64,
        theta: f64,
        threshold: u32,
        min_length: f64,
        max_gap: f64,
    ) -> LibraryResult<Vec<LineSegment>>;
    /// Gradient Hough transform. `max_radius == 0` means "up to the image size".
    #[allow(clippy::too_many_arguments)]
    fn hough_circles(
        &self,
        image: &GrayImage,
        dp: f64,
        min_dist: f64,
        param1: f64,
        param2: f64,
        min_radius: u32,
        max_radius: u32,
    ) -> LibraryResult<Vec<Circle>>;

    // --- Features ---
    fn detect_keypoints(
        &self,
        image: &GrayImage,
        detector: KeypointDetector,
        max_features: usize,
    ) -> LibraryResult<Vec<Keypoint>>;

    // --- Segmentation ---
    /// Global threshold; with `otsu` the level is computed and `threshold` ignored.
    /// Returns the level actually used.
    fn threshold(
        &self,
        image: &GrayImage,
        threshold: f64,
        max_value: u8,
        mode: ThresholdMode,
        otsu: bool,
    ) -> LibraryResult<(f64, GrayImage)>;
    /// Gaussian-weighted adaptive threshold, `THRESH_BINARY` flavor.
    fn adaptive_threshold(&self, image: &GrayImage, max_value: u8, block_size: u32, c: f64) -> LibraryResult<GrayImage>;
    /// Morphological opening with a 3×3 square, repeated `iterations` times per stage.
    fn morphology_open(&self, image: &GrayImage, iterations: u32) -> LibraryResult<GrayImage>;
    fn dilate(&self, image: &GrayImage, iterations: u32) -> LibraryResult<GrayImage>;
    /// Euclidean distance from each non-zero pixel to the nearest zero pixel.
    fn distance_transform(&self, image: &GrayImage) -> LibraryResult<FloatImage>;
    /// 8-connected labelling; background is 0, components are 1..=count.
    fn connected_components(&self, image: &GrayImage) -> LibraryResult<(u32, Labels)>;
    /// Floods `markers` in place; boundaries become -1.
    fn watershed(&self, image: &RgbImage, markers: &mut Labels) -> LibraryResult<()>;
    fn slic(&self, image: &RgbImage, n_segments: u32, compactness: f64) -> LibraryResult<Labels>;

    // --- Object detection ---
    fn detect_people(&self, image: &RgbImage) -> LibraryResult<Vec<BoundingBox>>;
    fn detect_cascade(&self, image: &GrayImage, cascade: Cascade, scale_factor: f64, min_neighbors: u32)
        -> LibraryResult<Vec<BoundingBox>>;
    /// Normalized match score for every template placement.
    fn match_template(&self, image: &GrayImage, template: &GrayImage) -> LibraryResult<FloatImage>;
}

/// Checks a kernel side the way OpenCV does: positive and odd.
pub(crate) fn require_odd(name: &str, value: u32) -> LibraryResult<()> {
    if value == 0 || value % 2 == 0 {
        Err(LibraryError::InvalidParameter(format!("{name} must be a positive odd number, got {value}")))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_kernel_check() {
        assert!(require_odd("ksize", 3).is_ok());
        assert!(require_odd("ksize", 4).is_err());
        assert!(require_odd("ksize", 0).is_err());
    }

    #[test]
    fn unavailable_message_names_the_capability() {
        let message = LibraryError::Unavailable(Capability::SurfDetector).to_string();
        assert_eq!(message, "SURF detector is not available in the linked image library");
    }

    #[test]
    fn labels_index_row_major() {
        let mut labels = Labels::new(3, 2);
        labels.set(2, 1, 7);
        assert_eq!(labels.data[5], 7);
        assert_eq!(labels.get(2, 1), 7);
        assert_eq!(labels.max_label(), 7);
    }
}
