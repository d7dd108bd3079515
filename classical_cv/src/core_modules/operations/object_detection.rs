// THEORY:
// Detectors that return boxes. HOG and Haar need trained models the library may not
// carry, so their descriptors name the capability; template matching only needs a
// normalized correlation and runs everywhere.
//
// Boxes are drawn from (x, y) to (x + w, y + h) inclusive, one pixel wider and taller
// than the detection itself, as rectangle corners are conventionally given.

use crate::core_modules::annotate::{self, BLUE, GREEN, YELLOW};
use crate::core_modules::descriptor::{Algorithm, AlgorithmDescriptor, Category};
use crate::core_modules::frame::to_gray;
use crate::core_modules::library::{BoundingBox, Capability, Cascade, ImageLibrary, LibraryResult};
use crate::core_modules::params::{ParamSpec, ParameterSet};
use crate::core_modules::registry::Registry;
use crate::error::DispatchResult;
use image::{GrayImage, Luma, Rgb, RgbImage};

const HAAR_PARAMS: &[ParamSpec] = &[ParamSpec::choice(
    "cascadeType",
    "face",
    &["face", "eye", "fullbody"],
    "Stock cascade; anything else returns the input",
)];

const TEMPLATE_PARAMS: &[ParamSpec] = &[
    ParamSpec::size("templateSize", (50, 50), 1, 10_000, "Template (width, height)"),
    ParamSpec::float("threshold", 0.8, -1.0, 1.0, "Minimum normalized correlation"),
];

const STROKE: u32 = 2;
const HAAR_SCALE_FACTOR: f64 = 1.1;
const HAAR_MIN_NEIGHBORS: u32 = 4;
/// Gray level of the synthetic template.
const TEMPLATE_LEVEL: u8 = 128;

pub fn register(registry: &mut Registry) -> DispatchResult<()> {
    let category = Category::ObjectDetection;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Hog, category, "HOG + linear SVM people detector", &[])
            .requires(Capability::HogPeopleDetector),
        hog,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::HaarCascade, category, "Viola-Jones cascade detector", HAAR_PARAMS)
            .requires(Capability::HaarCascades),
        haar_cascade,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::TemplateMatching, category, "Normalized cross-correlation matches", TEMPLATE_PARAMS),
        template_matching,
    )
}

fn draw_boxes(image: &RgbImage, boxes: &[BoundingBox], color: Rgb<u8>) -> RgbImage {
    let mut out = image.clone();
    for found in boxes {
        let corners = BoundingBox { width: found.width + 1, height: found.height + 1, ..*found };
        annotate::draw_box(&mut out, &corners, color, STROKE);
    }
    out
}

pub fn hog(library: &dyn ImageLibrary, image: &RgbImage, _: &ParameterSet) -> LibraryResult<RgbImage> {
    let people = library.detect_people(image)?;
    tracing::debug!(people = people.len(), "hog detections");
    Ok(draw_boxes(image, &people, GREEN))
}

pub fn haar_cascade(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let cascade = match params.choice("cascadeType")? {
        "face" => Cascade::FrontalFace,
        "eye" => Cascade::Eye,
        "fullbody" => Cascade::FullBody,
        _ => return Ok(image.clone()),
    };
    let found = library.detect_cascade(&to_gray(image), cascade, HAAR_SCALE_FACTOR, HAAR_MIN_NEIGHBORS)?;
    tracing::debug!(?cascade, objects = found.len(), "cascade detections");
    Ok(draw_boxes(image, &found, BLUE))
}

pub fn template_matching(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let (width, height) = params.size("templateSize")?;
    let template = GrayImage::from_pixel(width, height, Luma([TEMPLATE_LEVEL]));
    let scores = library.match_template(&to_gray(image), &template)?;
    let threshold = params.float("threshold")?;

    let matches: Vec<BoundingBox> = scores
        .enumerate_pixels()
        .filter(|(_, _, score)| score.0[0] as f64 >= threshold)
        .map(|(x, y, _)| BoundingBox { x: x as i32, y: y as i32, width, height })
        .collect();
    tracing::debug!(matches = matches.len(), "template matches");
    Ok(draw_boxes(image, &matches, YELLOW))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::library::{ImageprocLibrary, LibraryError};
    use crate::core_modules::params::ParamValue;

    fn haar(kind: &str) -> ParameterSet {
        ParameterSet::new()
            .with("cascadeType", ParamValue::Choice(kind.into()))
            .merged_with(HAAR_PARAMS)
            .unwrap()
    }

    #[test]
    fn unsupported_cascade_returns_the_input() {
        let image = RgbImage::from_fn(30, 30, |x, y| Rgb([x as u8, y as u8, 7]));
        let out = haar_cascade(&ImageprocLibrary::new(), &image, &haar("unsupported")).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn missing_models_are_reported() {
        let image = RgbImage::new(30, 30);
        assert_eq!(
            haar_cascade(&ImageprocLibrary::new(), &image, &haar("face")),
            Err(LibraryError::Unavailable(Capability::HaarCascades))
        );
        assert_eq!(
            hog(&ImageprocLibrary::new(), &image, &ParameterSet::new()),
            Err(LibraryError::Unavailable(Capability::HogPeopleDetector))
        );
    }

    #[test]
    fn template_larger_than_image_is_rejected() {
        let params = ParameterSet::new().merged_with(TEMPLATE_PARAMS).unwrap();
        let result = template_matching(&ImageprocLibrary::new(), &RgbImage::new(20, 20), &params);
        assert!(matches!(result, Err(LibraryError::InvalidParameter(_))));
    }

    #[test]
    fn matches_are_boxed_in_yellow() {
        // A constant template correlates perfectly everywhere.
        let image = RgbImage::from_fn(40, 40, |x, y| Rgb([(x * 6) as u8, (y * 6) as u8, 90]));
        let params = ParameterSet::new()
            .with("templateSize", ParamValue::Size(10, 10))
            .merged_with(TEMPLATE_PARAMS)
            .unwrap();
        let out = template_matching(&ImageprocLibrary::new(), &image, &params).unwrap();
        assert_eq!(out.dimensions(), (40, 40));
        assert_eq!(out.get_pixel(0, 0), &YELLOW);
    }

    #[test]
    fn boxes_include_their_far_corner() {
        let out = draw_boxes(&RgbImage::new(10, 10), &[BoundingBox { x: 1, y: 1, width: 4, height: 4 }], GREEN);
        assert_eq!(out.get_pixel(5, 5), &GREEN);
        assert_eq!(out.get_pixel(6, 6), &GREEN);
        assert_eq!(out.get_pixel(0, 3), &GREEN);
        assert_ne!(out.get_pixel(2, 3), &GREEN);
        assert_ne!(out.get_pixel(7, 7), &GREEN);
    }
}
