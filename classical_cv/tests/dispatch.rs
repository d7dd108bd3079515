use classical_cv::core_modules::descriptor::{Algorithm, AlgorithmDescriptor, Category};
use classical_cv::core_modules::frame::FloatImage;
use classical_cv::core_modules::library::{
    BoundingBox, Capability, Cascade, Circle, ImageLibrary, ImageprocLibrary, Keypoint, KeypointDetector, Labels,
    LibraryResult, LineSegment, ThresholdMode,
};
use classical_cv::core_modules::params::{ParamValue, ParameterSet};
use classical_cv::{DispatchError, DispatchPool, Dispatcher, DispatcherConfig, Registry};
use futures::future::join_all;
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Wraps the pure-Rust library, counting every call and optionally panicking in the
/// Gaussian blur.
#[derive(Default)]
struct Instrumented {
    inner: ImageprocLibrary,
    calls: AtomicUsize,
    panic_in_blur: bool,
}

impl Instrumented {
    fn panicking() -> Self {
        Self { panic_in_blur: true, ..Self::default() }
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageLibrary for Instrumented {
    fn name(&self) -> &'static str {
        "instrumented"
    }

    fn supports(&self, capability: Capability) -> bool {
        self.inner.supports(capability)
    }

    fn gaussian_blur(&self, image: &RgbImage, kernel: (u32, u32), sigma: f64) -> LibraryResult<RgbImage> {
        self.tick();
        if self.panic_in_blur {
            panic!("blur exploded");
        }
        self.inner.gaussian_blur(image, kernel, sigma)
    }

    fn median_blur(&self, image: &RgbImage, kernel: u32) -> LibraryResult<RgbImage> {
        self.tick();
        self.inner.median_blur(image, kernel)
    }

    fn median_blur_gray(&self, image: &GrayImage, kernel: u32) -> LibraryResult<GrayImage> {
        self.tick();
        self.inner.median_blur_gray(image, kernel)
    }

    fn bilateral_filter(&self, image: &RgbImage, diameter: i32, sigma_color: f64, sigma_space: f64)
        -> LibraryResult<RgbImage> {
        self.tick();
        self.inner.bilateral_filter(image, diameter, sigma_color, sigma_space)
    }

    fn filter3x3(&self, image: &RgbImage, kernel: &[f32; 9]) -> LibraryResult<RgbImage> {
        self.tick();
        self.inner.filter3x3(image, kernel)
    }

    fn add_weighted(&self, a: &RgbImage, alpha: f64, b: &RgbImage, beta: f64, gamma: f64) -> LibraryResult<RgbImage> {
        self.tick();
        self.inner.add_weighted(a, alpha, b, beta, gamma)
    }

    fn apply_lut(&self, image: &RgbImage, table: &[u8; 256]) -> LibraryResult<RgbImage> {
        self.tick();
        self.inner.apply_lut(image, table)
    }

    fn equalize_histogram(&self, image: &GrayImage) -> LibraryResult<GrayImage> {
        self.tick();
        self.inner.equalize_histogram(image)
    }

    fn sobel(&self, image: &GrayImage, dx: u32, dy: u32, ksize: u32) -> LibraryResult<FloatImage> {
        self.tick();
        self.inner.sobel(image, dx, dy, ksize)
    }

    fn canny(&self, image: &GrayImage, low: f64, high: f64) -> LibraryResult<GrayImage> {
        self.tick();
        self.inner.canny(image, low, high)
    }

    fn corner_harris(&self, image: &GrayImage, block_size: u32, ksize: u32, k: f64) -> LibraryResult<FloatImage> {
        self.tick();
        self.inner.corner_harris(image, block_size, ksize, k)
    }

    fn dilate_response(&self, response: &FloatImage) -> LibraryResult<FloatImage> {
        self.tick();
        self.inner.dilate_response(response)
    }

    fn hough_lines(
        &self,
        edges: &GrayImage,
        rho: f64,
        theta: f64,
        threshold: u32,
        min_length: f64,
        max_gap: f64,
    ) -> LibraryResult<Vec<LineSegment>> {
        self.tick();
        self.inner.hough_lines(edges, rho, theta, threshold, min_length, max_gap)
    }

    fn hough_circles(
        &self,
        image: &GrayImage,
        dp: f64,
        min_dist: f64,
        param1: f64,
        param2: f64,
        min_radius: u32,
        max_radius: u32,
    ) -> LibraryResult<Vec<Circle>> {
        self.tick();
        self.inner.hough_circles(image, dp, min_dist, param1, param2, min_radius, max_radius)
    }

    fn detect_keypoints(&self, image: &GrayImage, detector: KeypointDetector, max_features: usize)
        -> LibraryResult<Vec<Keypoint>> {
        self.tick();
        self.inner.detect_keypoints(image, detector, max_features)
    }

    fn threshold(&self, image: &GrayImage, threshold: f64, max_value: u8, mode: ThresholdMode, otsu: bool)
        -> LibraryResult<(f64, GrayImage)> {
        self.tick();
        self.inner.threshold(image, threshold, max_value, mode, otsu)
    }

    fn adaptive_threshold(&self, image: &GrayImage, max_value: u8, block_size: u32, c: f64) -> LibraryResult<GrayImage> {
        self.tick();
        self.inner.adaptive_threshold(image, max_value, block_size, c)
    }

    fn morphology_open(&self, image: &GrayImage, iterations: u32) -> LibraryResult<GrayImage> {
        self.tick();
        self.inner.morphology_open(image, iterations)
    }

    fn dilate(&self, image: &GrayImage, iterations: u32) -> LibraryResult<GrayImage> {
        self.tick();
        self.inner.dilate(image, iterations)
    }

    fn distance_transform(&self, image: &GrayImage) -> LibraryResult<FloatImage> {
        self.tick();
        self.inner.distance_transform(image)
    }

    fn connected_components(&self, image: &GrayImage) -> LibraryResult<(u32, Labels)> {
        self.tick();
        self.inner.connected_components(image)
    }

    fn watershed(&self, image: &RgbImage, markers: &mut Labels) -> LibraryResult<()> {
        self.tick();
        self.inner.watershed(image, markers)
    }

    fn slic(&self, image: &RgbImage, n_segments: u32, compactness: f64) -> LibraryResult<Labels> {
        self.tick();
        self.inner.slic(image, n_segments, compactness)
    }

    fn detect_people(&self, image: &RgbImage) -> LibraryResult<Vec<BoundingBox>> {
        self.tick();
        self.inner.detect_people(image)
    }

    fn detect_cascade(&self, image: &GrayImage, cascade: Cascade, scale_factor: f64, min_neighbors: u32)
        -> LibraryResult<Vec<BoundingBox>> {
        self.tick();
        self.inner.detect_cascade(image, cascade, scale_factor, min_neighbors)
    }

    fn match_template(&self, image: &GrayImage, template: &GrayImage) -> LibraryResult<FloatImage> {
        self.tick();
        self.inner.match_template(image, template)
    }
}

fn dispatcher() -> Dispatcher {
    Dispatcher::with_library(Arc::new(ImageprocLibrary::new()), DispatcherConfig::default()).unwrap()
}

fn random_image(width: u32, height: u32, seed: u64) -> DynamicImage {
    let mut rng = StdRng::seed_from_u64(seed);
    DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |_, _| Rgb([rng.r#gen(), rng.r#gen(), rng.r#gen()])))
}

fn params(pairs: &[(&str, ParamValue)]) -> ParameterSet {
    pairs.iter().fold(ParameterSet::new(), |set, (name, value)| set.with(*name, value.clone()))
}

#[test]
fn every_registered_pair_resolves() {
    let registry = Registry::standard().unwrap();
    for category in registry.categories() {
        for name in registry.list_algorithms(category.name()).unwrap() {
            let entry = registry.lookup(category.name(), name).unwrap();
            assert_eq!(entry.descriptor.category, category);
        }
    }
    assert!(matches!(
        registry.lookup("Segmentation", "Gaussian Blur"),
        Err(DispatchError::UnknownAlgorithm { .. })
    ));
}

#[test]
fn missing_input_never_reaches_the_library() {
    let library = Arc::new(Instrumented::default());
    let dispatcher = Dispatcher::with_library(library.clone(), DispatcherConfig::default()).unwrap();
    let empty = DynamicImage::ImageRgb8(RgbImage::new(0, 12));

    for image in [None, Some(&empty)] {
        let result = dispatcher.process("Image Processing", "Gaussian Blur", image, &ParameterSet::new());
        assert_eq!(result, Err(DispatchError::MissingInput));
    }
    assert_eq!(library.calls(), 0);

    let image = random_image(8, 8, 1);
    dispatcher.process("Image Processing", "Gaussian Blur", Some(&image), &ParameterSet::new()).unwrap();
    assert_eq!(library.calls(), 1);
}

#[test]
fn selection_errors_are_typed() {
    let dispatcher = dispatcher();
    let image = random_image(16, 16, 2);
    assert_eq!(
        dispatcher.process("Edge Detection", "Laplace", Some(&image), &ParameterSet::new()),
        Err(DispatchError::UnknownAlgorithm { category: "Edge Detection".into(), name: "Laplace".into() })
    );
    assert!(matches!(
        dispatcher.process("Astronomy", "Sobel", Some(&image), &ParameterSet::new()),
        Err(DispatchError::UnknownAlgorithm { .. })
    ));
    assert_eq!(
        dispatcher.registry().list_algorithms("Astronomy"),
        Err(DispatchError::UnknownCategory("Astronomy".into()))
    );
}

#[test]
fn bad_parameters_are_rejected_before_running() {
    let library = Arc::new(Instrumented::default());
    let dispatcher = Dispatcher::with_library(library.clone(), DispatcherConfig::default()).unwrap();
    let image = random_image(16, 16, 3);
    for bad in [
        params(&[("radius", ParamValue::Int(3))]),
        params(&[("sigma", ParamValue::Float(-1.0))]),
        params(&[("kernelSize", ParamValue::Choice("large".into()))]),
        params(&[("sigma", ParamValue::Float(f64::NAN))]),
        params(&[("sigma", ParamValue::Float(f64::INFINITY))]),
    ] {
        let result = dispatcher.process("Image Processing", "Gaussian Blur", Some(&image), &bad);
        assert!(matches!(result, Err(DispatchError::InvalidParameter(_))), "{bad}");
    }
    for gamma in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let bad = params(&[("gamma", ParamValue::Float(gamma))]);
        let result = dispatcher.process("Image Processing", "Gamma Correction", Some(&image), &bad);
        assert!(matches!(result, Err(DispatchError::InvalidParameter(_))), "{bad}");
    }
    assert_eq!(library.calls(), 0);
}

#[test]
fn identical_calls_are_bit_identical() {
    let dispatcher = dispatcher();
    let image = random_image(64, 64, 4);
    for algorithm in Algorithm::ALL {
        let category = algorithm.category().name();
        let first = dispatcher.process(category, algorithm.name(), Some(&image), &ParameterSet::new());
        let second = dispatcher.process(category, algorithm.name(), Some(&image), &ParameterSet::new());
        assert_eq!(first, second, "{algorithm}");
    }
}

#[test]
fn every_algorithm_keeps_the_input_size() {
    let dispatcher = dispatcher();
    let image = random_image(100, 80, 5);
    for algorithm in Algorithm::ALL {
        match dispatcher.process(algorithm.category().name(), algorithm.name(), Some(&image), &ParameterSet::new()) {
            Ok(processed) => assert_eq!(processed.image.dimensions(), (100, 80), "{algorithm}"),
            // Only the model-backed detectors may be missing from the pure-Rust library.
            Err(error) => {
                assert!(matches!(algorithm, Algorithm::Hog | Algorithm::HaarCascade), "{algorithm}: {error}");
                assert!(matches!(error, DispatchError::ProcessingFailure(_)));
            }
        }
    }
}

#[test]
fn gaussian_blur_on_random_noise_keeps_shape() {
    let image = random_image(100, 100, 6);
    let processed = dispatcher()
        .process("Image Processing", "Gaussian Blur", Some(&image), &ParameterSet::new())
        .unwrap();
    assert_eq!(processed.image.dimensions(), (100, 100));
    assert_eq!(processed.status, "Successfully applied Gaussian Blur algorithm.");
}

#[test]
fn gamma_round_trip_restores_intensities() {
    let dispatcher = dispatcher();
    let image = random_image(32, 32, 7);
    let up = dispatcher
        .process("Image Processing", "Gamma Correction", Some(&image), &params(&[("gamma", ParamValue::Float(2.0))]))
        .unwrap();
    let down = dispatcher
        .process(
            "Image Processing",
            "Gamma Correction",
            Some(&DynamicImage::ImageRgb8(up.image)),
            &params(&[("gamma", ParamValue::Float(0.5))]),
        )
        .unwrap();
    for (a, b) in image.to_rgb8().pixels().zip(down.image.pixels()) {
        for c in 0..3 {
            assert!((a.0[c] as i16 - b.0[c] as i16).abs() <= 3);
        }
    }
}

#[test]
fn surf_without_its_module_runs_sift() {
    let dispatcher = dispatcher();
    let image = random_image(64, 64, 8);
    let surf = dispatcher
        .process("Feature Detection", "SURF", Some(&image), &params(&[("maxFeatures", ParamValue::Int(20))]))
        .unwrap();
    let sift = dispatcher
        .process("Feature Detection", "SIFT", Some(&image), &params(&[("maxFeatures", ParamValue::Int(20))]))
        .unwrap();
    assert_eq!(surf.image, sift.image);
    assert_eq!(surf.requested, Algorithm::Surf);
    assert_eq!(surf.executed, Algorithm::Sift);
    assert_eq!(surf.fallback.map(|f| f.missing), Some(Capability::SurfDetector));
    assert!(surf.status.starts_with("Successfully applied SURF algorithm."));
    assert!(surf.status.contains("ran SIFT instead"));
}

#[test]
fn brief_without_its_module_runs_orb() {
    let processed = dispatcher()
        .process("Feature Detection", "BRIEF", Some(&random_image(64, 64, 9)), &ParameterSet::new())
        .unwrap();
    assert_eq!(processed.executed, Algorithm::Orb);
}

#[test]
fn canny_on_black_is_all_zero() {
    let black = DynamicImage::ImageRgb8(RgbImage::new(50, 50));
    let processed = dispatcher().process("Edge Detection", "Canny", Some(&black), &ParameterSet::new()).unwrap();
    assert!(processed.image.pixels().all(|p| p.0 == [0, 0, 0]));
}

#[test]
fn unsupported_cascade_returns_the_input() {
    let image = random_image(40, 40, 10);
    let processed = dispatcher()
        .process(
            "Object Detection",
            "Haar Cascade",
            Some(&image),
            &params(&[("cascadeType", ParamValue::Choice("unsupported".into()))]),
        )
        .unwrap();
    assert_eq!(processed.image, image.to_rgb8());
}

#[test]
fn duplicate_registration_is_rejected() {
    let mut registry = Registry::standard().unwrap();
    let entry = registry.get(Algorithm::Sobel).unwrap().clone();
    assert_eq!(
        registry.register(entry.descriptor, entry.operation),
        Err(DispatchError::DuplicateKey { category: "Edge Detection".into(), name: "Sobel".into() })
    );
    let descriptor = AlgorithmDescriptor::new(Algorithm::Sobel, Category::EdgeDetection, "again", &[]);
    assert!(registry.register(descriptor, entry.operation).is_err());
}

#[test]
fn library_panics_become_processing_failures() {
    let dispatcher = Dispatcher::with_library(Arc::new(Instrumented::panicking()), DispatcherConfig::default()).unwrap();
    let image = random_image(20, 20, 11);
    match dispatcher.process("Image Processing", "Gaussian Blur", Some(&image), &ParameterSet::new()) {
        Err(DispatchError::ProcessingFailure(message)) => assert!(message.contains("blur exploded"), "{message}"),
        other => panic!("unexpected {other:?}"),
    }
    let (output, status) = dispatcher.respond("Image Processing", "Gaussian Blur", Some(&image), &ParameterSet::new());
    assert!(output.is_none());
    assert!(status.starts_with("Error processing image: "));
    // The dispatcher stays usable afterwards.
    assert!(dispatcher.process("Image Processing", "Median Filter", Some(&image), &ParameterSet::new()).is_ok());
}

#[test]
fn caller_image_is_left_untouched() {
    let image = random_image(30, 30, 12);
    let before = image.clone();
    dispatcher().process("Segmentation", "Watershed", Some(&image), &ParameterSet::new()).unwrap();
    assert_eq!(image, before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_serves_every_category_concurrently() {
    let config = DispatcherConfig { cascade_dir: None, workers: 4 };
    let dispatcher = Dispatcher::with_library(Arc::new(ImageprocLibrary::new()), config).unwrap();
    let pool = DispatchPool::new(Arc::new(dispatcher));
    let image = Arc::new(random_image(48, 48, 13));

    let requests = [
        ("Image Processing", "Bilateral Filter"),
        ("Edge Detection", "Sobel"),
        ("Feature Detection", "ORB"),
        ("Segmentation", "SLIC"),
        ("Object Detection", "Template Matching"),
    ];
    let results = join_all(
        requests
            .iter()
            .map(|(category, name)| pool.submit(*category, *name, Some(Arc::clone(&image)), ParameterSet::new())),
    )
    .await;
    for ((_, name), result) in requests.iter().zip(results) {
        assert_eq!(result.unwrap().requested.name(), *name);
    }
}
