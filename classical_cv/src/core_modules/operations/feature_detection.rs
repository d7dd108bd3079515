// THEORY:
// All four feature detectors share one shape: detect on luma, cap the count, draw
// rich keypoints over the input. They differ only in which detector family the
// library is asked for. SURF and STAR/BRIEF live in optional library modules; their
// descriptors name the capability they need and the always-present detector to run
// when it is missing, and the dispatcher makes that substitution.

use super::unsigned;
use crate::core_modules::annotate;
use crate::core_modules::descriptor::{Algorithm, AlgorithmDescriptor, Category};
use crate::core_modules::frame::to_gray;
use crate::core_modules::library::{Capability, ImageLibrary, KeypointDetector, LibraryResult};
use crate::core_modules::params::{ParamSpec, ParameterSet};
use crate::core_modules::registry::Registry;
use crate::error::DispatchResult;
use image::RgbImage;

const MAX_FEATURES: ParamSpec = ParamSpec::int("maxFeatures", 100, 0, 100_000, "Keypoints kept; 0 keeps all");

const DETECTOR_PARAMS: &[ParamSpec] = &[MAX_FEATURES];

const SURF_PARAMS: &[ParamSpec] = &[
    ParamSpec::float("hessianThreshold", 400.0, 0.0, 100_000.0, "Hessian response threshold"),
    MAX_FEATURES,
];

pub fn register(registry: &mut Registry) -> DispatchResult<()> {
    let category = Category::FeatureDetection;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Sift, category, "Scale-invariant keypoints", DETECTOR_PARAMS)
            .requires(Capability::SiftDetector),
        sift,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Surf, category, "Speeded-up robust features", SURF_PARAMS)
            .requires(Capability::SurfDetector)
            .fallback(Algorithm::Sift),
        surf,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Orb, category, "Oriented FAST keypoints", DETECTOR_PARAMS)
            .requires(Capability::OrbDetector),
        orb,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Brief, category, "STAR keypoints with BRIEF descriptors", DETECTOR_PARAMS)
            .requires(Capability::BriefDescriptor)
            .fallback(Algorithm::Orb),
        brief,
    )
}

fn detect_and_draw(
    library: &dyn ImageLibrary,
    image: &RgbImage,
    detector: KeypointDetector,
    params: &ParameterSet,
) -> LibraryResult<RgbImage> {
    let max_features = unsigned(params, "maxFeatures")? as usize;
    let keypoints = library.detect_keypoints(&to_gray(image), detector, max_features)?;
    tracing::debug!(?detector, keypoints = keypoints.len(), "keypoints detected");
    Ok(annotate::draw_rich_keypoints(image, &keypoints))
}

pub fn sift(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    detect_and_draw(library, image, KeypointDetector::Sift, params)
}

pub fn surf(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let detector = KeypointDetector::Surf { hessian_threshold: params.float("hessianThreshold")? };
    detect_and_draw(library, image, detector, params)
}

pub fn orb(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    detect_and_draw(library, image, KeypointDetector::Orb, params)
}

pub fn brief(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    detect_and_draw(library, image, KeypointDetector::StarBrief, params)
}
