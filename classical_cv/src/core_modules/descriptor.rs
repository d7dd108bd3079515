// THEORY:
// The catalog is a closed set: five categories, twenty-one algorithms. Both are
// enums so that every routing decision is an exhaustive `match`, and strings only
// exist at the edges (shell input, status messages, JSON). Display names are the
// canonical, case-sensitive spellings callers select by.

use crate::core_modules::library::Capability;
use crate::core_modules::params::ParamSpec;
use crate::error::DispatchError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    ImageProcessing,
    EdgeDetection,
    FeatureDetection,
    Segmentation,
    ObjectDetection,
}

impl Category {
    /// Catalog order.
    pub const ALL: [Category; 5] = [
        Category::ImageProcessing,
        Category::EdgeDetection,
        Category::FeatureDetection,
        Category::Segmentation,
        Category::ObjectDetection,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::ImageProcessing => "Image Processing",
            Category::EdgeDetection => "Edge Detection",
            Category::FeatureDetection => "Feature Detection",
            Category::Segmentation => "Segmentation",
            Category::ObjectDetection => "Object Detection",
        }
    }

    /// Algorithms of this category in catalog order.
    pub fn algorithms(&self) -> impl Iterator<Item = Algorithm> + '_ {
        Algorithm::ALL.into_iter().filter(move |algorithm| algorithm.category() == *self)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Category {
    type Err = DispatchError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.name() == name)
            .ok_or_else(|| DispatchError::UnknownCategory(name.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    GaussianBlur,
    MedianFilter,
    BilateralFilter,
    Sharpening,
    HistogramEqualization,
    GammaCorrection,
    Sobel,
    Canny,
    HarrisCorner,
    HoughLines,
    HoughCircles,
    Sift,
    Surf,
    Orb,
    Brief,
    Thresholding,
    Watershed,
    Slic,
    Hog,
    HaarCascade,
    TemplateMatching,
}

impl Algorithm {
    pub const ALL: [Algorithm; 21] = [
        Algorithm::GaussianBlur,
        Algorithm::MedianFilter,
        Algorithm::BilateralFilter,
        Algorithm::Sharpening,
        Algorithm::HistogramEqualization,
        Algorithm::GammaCorrection,
        Algorithm::Sobel,
        Algorithm::Canny,
        Algorithm::HarrisCorner,
        Algorithm::HoughLines,
        Algorithm::HoughCircles,
        Algorithm::Sift,
        Algorithm::Surf,
        Algorithm::Orb,
        Algorithm::Brief,
        Algorithm::Thresholding,
        Algorithm::Watershed,
        Algorithm::Slic,
        Algorithm::Hog,
        Algorithm::HaarCascade,
        Algorithm::TemplateMatching,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::GaussianBlur => "Gaussian Blur",
            Algorithm::MedianFilter => "Median Filter",
            Algorithm::BilateralFilter => "Bilateral Filter",
            Algorithm::Sharpening => "Sharpening",
            Algorithm::HistogramEqualization => "Histogram Equalization",
            Algorithm::GammaCorrection => "Gamma Correction",
            Algorithm::Sobel => "Sobel",
            Algorithm::Canny => "Canny",
            Algorithm::HarrisCorner => "Harris Corner",
            Algorithm::HoughLines => "Hough Lines",
            Algorithm::HoughCircles => "Hough Circles",
            Algorithm::Sift => "SIFT",
            Algorithm::Surf => "SURF",
            Algorithm::Orb => "ORB",
            Algorithm::Brief => "BRIEF",
            Algorithm::Thresholding => "Thresholding",
            Algorithm::Watershed => "Watershed",
            Algorithm::Slic => "SLIC",
            Algorithm::Hog => "HOG",
            Algorithm::HaarCascade => "Haar Cascade",
            Algorithm::TemplateMatching => "Template Matching",
        }
    }

    pub fn category(&self) -> Category {
        use Algorithm::*;
        match self {
            GaussianBlur | MedianFilter | BilateralFilter | Sharpening | HistogramEqualization | GammaCorrection => {
                Category::ImageProcessing
            }
            Sobel | Canny | HarrisCorner | HoughLines | HoughCircles => Category::EdgeDetection,
            Sift | Surf | Orb | Brief => Category::FeatureDetection,
            Thresholding | Watershed | Slic => Category::Segmentation,
            Hog | HaarCascade | TemplateMatching => Category::ObjectDetection,
        }
    }

    /// Finds the algorithm with this display name inside `category`.
    pub fn find(category: Category, name: &str) -> Option<Algorithm> {
        category.algorithms().find(|algorithm| algorithm.name() == name)
    }

    /// Snake-case form used in file names (`gaussian_blur`, `sift`).
    pub fn slug(&self) -> String {
        self.name().to_ascii_lowercase().replace(' ', "_")
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Category {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Algorithm {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Static metadata for one catalog entry.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct AlgorithmDescriptor {
    pub category: Category,
    pub algorithm: Algorithm,
    pub summary: &'static str,
    /// Ordered parameter schema.
    pub params: &'static [ParamSpec],
    /// Optional library capability the algorithm depends on.
    pub requires: Option<Capability>,
    /// Algorithm run instead when `requires` is missing from the library.
    pub fallback: Option<Algorithm>,
}

impl AlgorithmDescriptor {
    pub const fn new(algorithm: Algorithm, category: Category, summary: &'static str, params: &'static [ParamSpec]) -> Self {
        Self { category, algorithm, summary, params, requires: None, fallback: None }
    }

    pub const fn requires(mut self, capability: Capability) -> Self {
        self.requires = Some(capability);
        self
    }

    pub const fn fallback(mut self, algorithm: Algorithm) -> Self {
        self.fallback = Some(algorithm);
        self
    }

    pub fn name(&self) -> &'static str {
        self.algorithm.name()
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|spec| spec.name == name)
    }
}
