// THEORY:
// Segmentation operations partition the image and render the partition: a binary
// map for thresholding, blue region boundaries for watershed, region-average colors
// for SLIC.
//
// Watershed seeds itself. Otsu (inverted) separates dark objects from a light
// background, an opening removes speckle, a dilation of that gives "surely
// background", and pixels far from any background (distance > 0.7 of the maximum)
// are "surely foreground". Each foreground component becomes a marker, the band in
// between stays unlabelled, and the flood decides where it splits.

use super::unsigned;
use crate::core_modules::annotate::BLUE;
use crate::core_modules::descriptor::{Algorithm, AlgorithmDescriptor, Category};
use crate::core_modules::frame::{gray_to_rgb, to_gray};
use crate::core_modules::library::{ImageLibrary, Labels, LibraryResult, ThresholdMode};
use crate::core_modules::params::{ParamSpec, ParameterSet};
use crate::core_modules::registry::Registry;
use crate::error::DispatchResult;
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::collections::HashMap;

const THRESHOLD_PARAMS: &[ParamSpec] = &[ParamSpec::choice(
    "mode",
    "otsu",
    &["otsu", "adaptive", "binary"],
    "Thresholding flavor; anything else returns the luma image",
)];

const SLIC_PARAMS: &[ParamSpec] = &[
    ParamSpec::int("nSegments", 100, 1, 100_000, "Approximate number of superpixels"),
    ParamSpec::float("compactness", 10.0, f64::MIN_POSITIVE, 1000.0, "Color versus space weighting"),
];

const ADAPTIVE_BLOCK: u32 = 11;
const ADAPTIVE_C: f64 = 2.0;
const BINARY_LEVEL: f64 = 127.0;
const OPEN_ITERATIONS: u32 = 2;
const BACKGROUND_DILATIONS: u32 = 3;
const FOREGROUND_FRACTION: f32 = 0.7;

pub fn register(registry: &mut Registry) -> DispatchResult<()> {
    let category = Category::Segmentation;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Thresholding, category, "Otsu, adaptive or fixed binarization", THRESHOLD_PARAMS),
        thresholding,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Watershed, category, "Marker-based watershed boundaries", &[]),
        watershed,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Slic, category, "SLIC superpixels filled with their mean color", SLIC_PARAMS),
        slic,
    )
}

pub fn thresholding(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let gray = to_gray(image);
    let binary = match params.choice("mode")? {
        "otsu" => library.threshold(&gray, 0.0, 255, ThresholdMode::Binary, true)?.1,
        "adaptive" => library.adaptive_threshold(&gray, 255, ADAPTIVE_BLOCK, ADAPTIVE_C)?,
        "binary" => library.threshold(&gray, BINARY_LEVEL, 255, ThresholdMode::Binary, false)?.1,
        _ => gray,
    };
    Ok(gray_to_rgb(&binary))
}

pub fn watershed(library: &dyn ImageLibrary, image: &RgbImage, _: &ParameterSet) -> LibraryResult<RgbImage> {
    let (_, objects) = library.threshold(&to_gray(image), 0.0, 255, ThresholdMode::BinaryInverted, true)?;
    let opened = library.morphology_open(&objects, OPEN_ITERATIONS)?;
    let sure_background = library.dilate(&opened, BACKGROUND_DILATIONS)?;

    let distance = library.distance_transform(&opened)?;
    let cutoff = FOREGROUND_FRACTION * distance.as_raw().iter().copied().fold(0.0, f32::max);
    let sure_foreground = GrayImage::from_fn(distance.width(), distance.height(), |x, y| {
        Luma([if distance.get_pixel(x, y).0[0] > cutoff { 255 } else { 0 }])
    });

    let (components, mut markers) = library.connected_components(&sure_foreground)?;
    tracing::debug!(components, "watershed markers");
    seed_markers(&mut markers, &sure_background, &sure_foreground);
    library.watershed(image, &mut markers)?;

    let mut out = image.clone();
    for (index, label) in markers.data.iter().enumerate() {
        if *label == -1 {
            let (x, y) = (index as u32 % markers.width, index as u32 / markers.width);
            out.put_pixel(x, y, BLUE);
        }
    }
    Ok(out)
}

/// Shifts component labels up by one so the background is 1, then clears the band
/// that is neither surely background nor surely foreground.
fn seed_markers(markers: &mut Labels, sure_background: &GrayImage, sure_foreground: &GrayImage) {
    let unknown = sure_background.as_raw().iter().zip(sure_foreground.as_raw()).map(|(&bg, &fg)| bg.saturating_sub(fg));
    for (label, band) in markers.data.iter_mut().zip(unknown) {
        *label = if band == 255 { 0 } else { *label + 1 };
    }
}

pub fn slic(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let labels = library.slic(image, unsigned(params, "nSegments")?, params.float("compactness")?)?;
    Ok(average_by_label(image, &labels))
}

/// Fills every region with its mean color (truncated to 8 bits). Label 0 is treated as
/// background and painted black.
pub fn average_by_label(image: &RgbImage, labels: &Labels) -> RgbImage {
    let mut sums: HashMap<i32, ([u64; 3], u64)> = HashMap::new();
    for (pixel, label) in image.pixels().zip(&labels.data) {
        let entry = sums.entry(*label).or_insert(([0; 3], 0));
        for c in 0..3 {
            entry.0[c] += pixel.0[c] as u64;
        }
        entry.1 += 1;
    }
    let means: HashMap<i32, Rgb<u8>> = sums
        .into_iter()
        .map(|(label, (sum, count))| (label, Rgb(sum.map(|s| (s / count) as u8))))
        .collect();
    RgbImage::from_fn(image.width(), image.height(), |x, y| match labels.get(x, y) {
        0 => Rgb([0, 0, 0]),
        label => means[&label],
    })
}
