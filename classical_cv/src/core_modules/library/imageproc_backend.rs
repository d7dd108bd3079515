// THEORY:
// The pure-Rust Image Library. Where `imageproc` already has the routine (Canny,
// median, histogram equalization, Otsu, morphology, distance transform, connected
// components, line Hough, FAST corners, template correlation) it is called directly;
// the rest comes from `kernels`. Model-backed detectors (HOG, Haar) and the non-free
// or contrib-only feature detectors (SURF, STAR/BRIEF) are not approximated: the
// backend says so through `supports` and returns `Unavailable` when asked anyway.

use super::kernels;
use super::{
    require_odd, BoundingBox, Capability, Cascade, Circle, ImageLibrary, Keypoint, KeypointDetector, Labels,
    LibraryError, LibraryResult, LineSegment, ThresholdMode,
};
use crate::core_modules::frame::FloatImage;
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::contrast::{equalize_histogram, otsu_level};
use imageproc::corners::corners_fast9;
use imageproc::distance_transform::{euclidean_squared_distance_transform, Norm};
use imageproc::edges::canny;
use imageproc::filter::median_filter;
use imageproc::hough::{detect_lines, LineDetectionOptions};
use imageproc::morphology;
use imageproc::region_labelling::{connected_components, Connectivity};
use imageproc::template_matching::{match_template, MatchTemplateMethod};

/// FAST threshold ORB uses for its first pass.
const ORB_FAST_THRESHOLD: u8 = 20;
/// Radius of the ORB patch used for orientation; keypoints closer to the border are dropped.
const ORB_PATCH_RADIUS: u32 = 15;
const ORB_PATCH_SIZE: f32 = 31.0;
/// Neighborhood, in Hough space, over which line peaks are suppressed.
const HOUGH_SUPPRESSION_RADIUS: u32 = 8;

#[derive(Debug, Clone, Default)]
pub struct ImageprocLibrary;

impl ImageprocLibrary {
    pub fn new() -> Self {
        Self
    }
}

fn morphology_steps(iterations: u32) -> LibraryResult<u8> {
    u8::try_from(iterations)
        .map_err(|_| LibraryError::InvalidParameter(format!("at most 255 morphology iterations, got {iterations}")))
}

impl ImageLibrary for ImageprocLibrary {
    fn name(&self) -> &'static str {
        "imageproc"
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::SiftDetector | Capability::OrbDetector)
    }

    fn gaussian_blur(&self, image: &RgbImage, kernel: (u32, u32), sigma: f64) -> LibraryResult<RgbImage> {
        for side in [kernel.0, kernel.1] {
            if side != 0 {
                require_odd("Gaussian kernel size", side)?;
            }
        }
        kernels::gaussian_blur_rgb(image, kernel, sigma)
    }

    fn median_blur(&self, image: &RgbImage, kernel: u32) -> LibraryResult<RgbImage> {
        require_odd("median kernel size", kernel)?;
        Ok(median_filter(image, kernel / 2, kernel / 2))
    }

    fn median_blur_gray(&self, image: &GrayImage, kernel: u32) -> LibraryResult<GrayImage> {
        require_odd("median kernel size", kernel)?;
        Ok(median_filter(image, kernel / 2, kernel / 2))
    }

    fn bilateral_filter(&self, image: &RgbImage, diameter: i32, sigma_color: f64, sigma_space: f64)
        -> LibraryResult<RgbImage> {
        kernels::bilateral(image, diameter, sigma_color, sigma_space)
    }

    fn filter3x3(&self, image: &RgbImage, kernel: &[f32; 9]) -> LibraryResult<RgbImage> {
        Ok(kernels::correlate3x3(image, kernel))
    }

    fn add_weighted(&self, a: &RgbImage, alpha: f64, b: &RgbImage, beta: f64, gamma: f64) -> LibraryResult<RgbImage> {
        if a.dimensions() != b.dimensions() {
            return Err(LibraryError::InvalidParameter(format!(
                "cannot blend {:?} with {:?}",
                a.dimensions(),
                b.dimensions()
            )));
        }
        Ok(RgbImage::from_fn(a.width(), a.height(), |x, y| {
            let (pa, pb) = (a.get_pixel(x, y), b.get_pixel(x, y));
            Rgb(std::array::from_fn(|c| {
                crate::core_modules::frame::saturate(pa.0[c] as f64 * alpha + pb.0[c] as f64 * beta + gamma)
            }))
        }))
    }

    fn apply_lut(&self, image: &RgbImage, table: &[u8; 256]) -> LibraryResult<RgbImage> {
        let mut out = image.clone();
        for pixel in out.pixels_mut() {
            pixel.0 = pixel.0.map(|v| table[v as usize]);
        }
        Ok(out)
    }

    fn equalize_histogram(&self, image: &GrayImage) -> LibraryResult<GrayImage> {
        Ok(equalize_histogram(image))
    }

    fn sobel(&self, image: &GrayImage, dx: u32, dy: u32, ksize: u32) -> LibraryResult<FloatImage> {
        kernels::sobel(image, dx, dy, ksize)
    }

    fn canny(&self, image: &GrayImage, low: f64, high: f64) -> LibraryResult<GrayImage> {
        let (low, high) = if low > high { (high, low) } else { (low, high) };
        Ok(canny(image, low as f32, high as f32))
    }

    fn corner_harris(&self, image: &GrayImage, block_size: u32, ksize: u32, k: f64) -> LibraryResult<FloatImage> {
        kernels::harris_response(image, block_size, ksize, k)
    }

    fn dilate_response(&self, response: &FloatImage) -> LibraryResult<FloatImage> {
        Ok(kernels::max_filter3x3(response))
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
        if rho <= 0.0 || theta <= 0.0 {
            return Err(LibraryError::InvalidParameter(format!(
                "rho and theta must be positive, got {rho} and {theta}"
            )));
        }
        // The accumulator resolution is fixed at 1 px and 1 degree.
        let options = LineDetectionOptions { vote_threshold: threshold, suppression_radius: HOUGH_SUPPRESSION_RADIUS };
        let lines: Vec<(f32, f32)> = detect_lines(edges, options)
            .into_iter()
            .map(|line| (line.r, line.angle_in_degrees as f32))
            .collect();
        Ok(kernels::segments_along_lines(edges, &lines, min_length, max_gap.max(0.0)))
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
        if min_dist <= 0.0 || param1 <= 0.0 || param2 <= 0.0 {
            return Err(LibraryError::InvalidParameter(format!(
                "minDist, param1 and param2 must be positive, got {min_dist}, {param1}, {param2}"
            )));
        }
        let edges = canny(image, (param1 / 2.0) as f32, param1 as f32);
        kernels::hough_circles_gradient(image, &edges, dp, min_dist, param2, min_radius, max_radius)
    }

    fn detect_keypoints(
        &self,
        image: &GrayImage,
        detector: KeypointDetector,
        max_features: usize,
    ) -> LibraryResult<Vec<Keypoint>> {
        match detector {
            KeypointDetector::Sift => Ok(kernels::dog_keypoints(image, max_features)),
            KeypointDetector::Orb => {
                let (width, height) = image.dimensions();
                let mut corners: Vec<_> = corners_fast9(image, ORB_FAST_THRESHOLD)
                    .into_iter()
                    .filter(|c| {
                        c.x >= ORB_PATCH_RADIUS
                            && c.y >= ORB_PATCH_RADIUS
                            && c.x + ORB_PATCH_RADIUS < width
                            && c.y + ORB_PATCH_RADIUS < height
                    })
                    .collect();
                corners.sort_by(|a, b| b.score.total_cmp(&a.score).then((a.y, a.x).cmp(&(b.y, b.x))));
                if max_features > 0 {
                    corners.truncate(max_features);
                }
                Ok(corners
                    .into_iter()
                    .map(|c| Keypoint {
                        x: c.x as f32,
                        y: c.y as f32,
                        size: ORB_PATCH_SIZE,
                        angle: Some(kernels::intensity_centroid_angle(image, c.x, c.y, ORB_PATCH_RADIUS as i64)),
                        response: c.score,
                    })
                    .collect())
            }
            other => Err(LibraryError::Unavailable(other.capability())),
        }
    }

    fn threshold(
        &self,
        image: &GrayImage,
        threshold: f64,
        max_value: u8,
        mode: ThresholdMode,
        otsu: bool,
    ) -> LibraryResult<(f64, GrayImage)> {
        let level = if otsu { otsu_level(image) as f64 } else { threshold };
        let (above, below) = match mode {
            ThresholdMode::Binary => (max_value, 0),
            ThresholdMode::BinaryInverted => (0, max_value),
        };
        let mut out = image.clone();
        for pixel in out.pixels_mut() {
            pixel.0[0] = if pixel.0[0] as f64 > level { above } else { below };
        }
        Ok((level, out))
    }

    fn adaptive_threshold(&self, image: &GrayImage, max_value: u8, block_size: u32, c: f64) -> LibraryResult<GrayImage> {
        kernels::adaptive_threshold_gaussian(image, max_value, block_size, c)
    }

    fn morphology_open(&self, image: &GrayImage, iterations: u32) -> LibraryResult<GrayImage> {
        // Repeating a 3×3 step k times is the same as one step with a k-radius square.
        Ok(morphology::open(image, Norm::LInf, morphology_steps(iterations)?))
    }

    fn dilate(&self, image: &GrayImage, iterations: u32) -> LibraryResult<GrayImage> {
        Ok(morphology::dilate(image, Norm::LInf, morphology_steps(iterations)?))
    }

    fn distance_transform(&self, image: &GrayImage) -> LibraryResult<FloatImage> {
        let zeros = GrayImage::from_fn(image.width(), image.height(), |x, y| {
            Luma([if image.get_pixel(x, y).0[0] == 0 { 255 } else { 0 }])
        });
        // Without any zero pixel every distance is reported as the image diagonal.
        let diagonal = (image.width() as f64).hypot(image.height() as f64);
        let squared = euclidean_squared_distance_transform(&zeros);
        Ok(FloatImage::from_fn(image.width(), image.height(), |x, y| {
            let distance = squared.get_pixel(x, y).0[0].sqrt();
            Luma([if distance.is_finite() { distance.min(diagonal) as f32 } else { diagonal as f32 }])
        }))
    }

    fn connected_components(&self, image: &GrayImage) -> LibraryResult<(u32, Labels)> {
        let components = connected_components(image, Connectivity::Eight, Luma([0u8]));
        let mut labels = Labels::new(image.width(), image.height());
        let mut count = 0u32;
        for (slot, pixel) in labels.data.iter_mut().zip(components.pixels()) {
            let label = pixel.0[0];
            count = count.max(label);
            *slot = i32::try_from(label).map_err(|_| LibraryError::Failed("too many components".into()))?;
        }
        Ok((count, labels))
    }

    fn watershed(&self, image: &RgbImage, markers: &mut Labels) -> LibraryResult<()> {
        kernels::watershed_flood(image, markers)
    }

    fn slic(&self, image: &RgbImage, n_segments: u32, compactness: f64) -> LibraryResult<Labels> {
        kernels::slic(image, n_segments, compactness)
    }

    fn detect_people(&self, _image: &RgbImage) -> LibraryResult<Vec<BoundingBox>> {
        Err(LibraryError::Unavailable(Capability::HogPeopleDetector))
    }

    fn detect_cascade(&self, _image: &GrayImage, _cascade: Cascade, _scale_factor: f64, _min_neighbors: u32)
        -> LibraryResult<Vec<BoundingBox>> {
        Err(LibraryError::Unavailable(Capability::HaarCascades))
    }

    fn match_template(&self, image: &GrayImage, template: &GrayImage) -> LibraryResult<FloatImage> {
        let (tw, th) = template.dimensions();
        if tw == 0 || th == 0 {
            return Err(LibraryError::InvalidParameter("template must not be empty".into()));
        }
        if tw > image.width() || th > image.height() {
            return Err(LibraryError::InvalidParameter(format!(
                "template {tw}x{th} is larger than the image {}x{}",
                image.width(),
                image.height()
            )));
        }
        let cross = match_template(image, template, MatchTemplateMethod::CrossCorrelation);
        Ok(kernels::ccoeff_normed(image, template, &cross))
    }
}
