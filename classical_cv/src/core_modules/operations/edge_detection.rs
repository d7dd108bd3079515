// THEORY:
// Gradient-based detectors. Sobel and Canny produce edge maps that are replicated to
// three channels; Harris, Hough lines and Hough circles annotate a copy of the input
// instead. All work on the Rec. 601 luma of the input.

use super::unsigned;
use crate::core_modules::annotate::{self, GREEN, RED};
use crate::core_modules::descriptor::{Algorithm, AlgorithmDescriptor, Category};
use crate::core_modules::frame::{gray_to_rgb, to_gray};
use crate::core_modules::library::{ImageLibrary, LibraryResult};
use crate::core_modules::params::{ParamSpec, ParameterSet};
use crate::core_modules::registry::Registry;
use crate::error::DispatchResult;
use image::{GrayImage, Luma, RgbImage};
use std::f64::consts::PI;

const SOBEL_PARAMS: &[ParamSpec] = &[
    ParamSpec::int("ksize", 3, 1, 31, "Odd aperture size"),
    ParamSpec::int("dx", 1, 0, 2, "Order of the x derivative"),
    ParamSpec::int("dy", 1, 0, 2, "Order of the y derivative"),
];

const CANNY_PARAMS: &[ParamSpec] = &[
    ParamSpec::float("t1", 50.0, 0.0, 10_000.0, "Lower hysteresis threshold"),
    ParamSpec::float("t2", 150.0, 0.0, 10_000.0, "Upper hysteresis threshold"),
];

const HARRIS_PARAMS: &[ParamSpec] = &[
    ParamSpec::int("blockSize", 2, 1, 31, "Neighborhood size"),
    ParamSpec::int("ksize", 3, 1, 31, "Odd Sobel aperture"),
    ParamSpec::float("k", 0.04, 0.0, 1.0, "Harris free parameter"),
    ParamSpec::float("threshold", 0.01, 0.0, 1.0, "Fraction of the strongest response marked as corner"),
];

const HOUGH_LINES_PARAMS: &[ParamSpec] = &[
    ParamSpec::float("rho", 1.0, f64::MIN_POSITIVE, 1000.0, "Distance resolution in pixels"),
    ParamSpec::float("theta", PI / 180.0, f64::MIN_POSITIVE, PI, "Angle resolution in radians"),
    ParamSpec::int("threshold", 100, 1, 10_000, "Accumulator votes needed"),
    ParamSpec::float("minLen", 50.0, 0.0, 10_000.0, "Shortest segment kept"),
    ParamSpec::float("maxGap", 10.0, 0.0, 10_000.0, "Largest gap bridged within a segment"),
];

const HOUGH_CIRCLES_PARAMS: &[ParamSpec] = &[
    ParamSpec::float("dp", 1.0, 1.0, 16.0, "Inverse accumulator resolution"),
    ParamSpec::float("minDist", 50.0, f64::MIN_POSITIVE, 100_000.0, "Minimum distance between centers"),
    ParamSpec::float("param1", 50.0, f64::MIN_POSITIVE, 100_000.0, "Upper Canny threshold"),
    ParamSpec::float("param2", 30.0, f64::MIN_POSITIVE, 100_000.0, "Center accumulator threshold"),
    ParamSpec::int("minRadius", 0, 0, 10_000, "Smallest radius"),
    ParamSpec::int("maxRadius", 0, 0, 10_000, "Largest radius; 0 means unbounded"),
];

/// Canny thresholds applied before the probabilistic Hough transform.
const HOUGH_CANNY: (f64, f64) = (50.0, 150.0);
const HOUGH_MEDIAN_KERNEL: u32 = 5;
const STROKE: u32 = 2;
const CENTER_DOT_RADIUS: i32 = 3;

pub fn register(registry: &mut Registry) -> DispatchResult<()> {
    let category = Category::EdgeDetection;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Sobel, category, "Normalized gradient magnitude", SOBEL_PARAMS),
        sobel,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Canny, category, "Hysteresis edge map", CANNY_PARAMS),
        canny,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::HarrisCorner, category, "Harris corners marked in red", HARRIS_PARAMS),
        harris_corner,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::HoughLines, category, "Probabilistic Hough line segments", HOUGH_LINES_PARAMS),
        hough_lines,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::HoughCircles, category, "Gradient Hough circles", HOUGH_CIRCLES_PARAMS),
        hough_circles,
    )
}

pub fn sobel(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let gray = to_gray(image);
    let ksize = unsigned(params, "ksize")?;
    let gx = library.sobel(&gray, unsigned(params, "dx")?, 0, ksize)?;
    let gy = library.sobel(&gray, 0, unsigned(params, "dy")?, ksize)?;

    let magnitude: Vec<f64> = gx
        .as_raw()
        .iter()
        .zip(gy.as_raw())
        .map(|(&x, &y)| (x as f64).hypot(y as f64))
        .collect();
    let max = magnitude.iter().copied().fold(0.0_f64, f64::max);
    let scaled = GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = magnitude[y as usize * gray.width() as usize + x as usize];
        // Truncating conversion, as an 8-bit cast of the scaled magnitude.
        Luma([if max > 0.0 { (value * 255.0 / max) as u8 } else { 0 }])
    });
    Ok(gray_to_rgb(&scaled))
}

pub fn canny(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let edges = library.canny(&to_gray(image), params.float("t1")?, params.float("t2")?)?;
    Ok(gray_to_rgb(&edges))
}

pub fn harris_corner(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let response = library.corner_harris(
        &to_gray(image),
        unsigned(params, "blockSize")?,
        unsigned(params, "ksize")?,
        params.float("k")?,
    )?;
    let dilated = library.dilate_response(&response)?;
    let max = dilated.as_raw().iter().copied().fold(f32::MIN, f32::max);
    let cutoff = params.float("threshold")? * max as f64;

    let mut out = image.clone();
    for (x, y, value) in dilated.enumerate_pixels() {
        if value.0[0] as f64 > cutoff {
            out.put_pixel(x, y, RED);
        }
    }
    Ok(out)
}

pub fn hough_lines(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let edges = library.canny(&to_gray(image), HOUGH_CANNY.0, HOUGH_CANNY.1)?;
    let segments = library.hough_lines(
        &edges,
        params.float("rho")?,
        params.float("theta")?,
        unsigned(params, "threshold")?,
        params.float("minLen")?,
        params.float("maxGap")?,
    )?;
    tracing::debug!(segments = segments.len(), "hough lines");
    let mut out = image.clone();
    for segment in &segments {
        annotate::draw_segment(&mut out, segment, GREEN, STROKE);
    }
    Ok(out)
}

pub fn hough_circles(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let smoothed = library.median_blur_gray(&to_gray(image), HOUGH_MEDIAN_KERNEL)?;
    let circles = library.hough_circles(
        &smoothed,
        params.float("dp")?,
        params.float("minDist")?,
        params.float("param1")?,
        params.float("param2")?,
        unsigned(params, "minRadius")?,
        unsigned(params, "maxRadius")?,
    )?;
    tracing::debug!(circles = circles.len(), "hough circles");
    let mut out = image.clone();
    for circle in &circles {
        annotate::draw_circle(&mut out, circle, GREEN, STROKE);
        annotate::draw_dot(&mut out, circle.center, CENTER_DOT_RADIUS, RED);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::library::ImageprocLibrary;
    use crate::core_modules::params::ParamValue;
    use image::Rgb;

    fn defaults(schema: &[ParamSpec]) -> ParameterSet {
        ParameterSet::new().merged_with(schema).unwrap()
    }

    fn black(size: u32) -> RgbImage {
        RgbImage::new(size, size)
    }

    /// Left half black, right half white.
    fn step(size: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, _| if x < size / 2 { Rgb([0, 0, 0]) } else { Rgb([255, 255, 255]) })
    }

    #[test]
    fn canny_on_black_is_all_zero() {
        let out = canny(&ImageprocLibrary::new(), &black(64), &defaults(CANNY_PARAMS)).unwrap();
        assert_eq!(out.dimensions(), (64, 64));
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn sobel_of_a_flat_image_is_zero() {
        let flat = RgbImage::from_pixel(20, 20, Rgb([120, 40, 200]));
        let out = sobel(&ImageprocLibrary::new(), &flat, &defaults(SOBEL_PARAMS)).unwrap();
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn sobel_peaks_at_the_step() {
        let params = ParameterSet::new().with("dy", ParamValue::Int(0)).with("dx", ParamValue::Int(1));
        let params = params.merged_with(SOBEL_PARAMS).unwrap();
        // dy = 0 asks for a zero-order derivative, which the library rejects.
        assert!(sobel(&ImageprocLibrary::new(), &step(20), &params).is_err());

        let out = sobel(&ImageprocLibrary::new(), &step(20), &defaults(SOBEL_PARAMS)).unwrap();
        let brightest = out.pixels().map(|p| p.0[0]).max().unwrap();
        assert_eq!(brightest, 255);
        assert_eq!(out.get_pixel(2, 10).0[0], 0);
        assert!(out.get_pixel(10, 10).0[0] > 0 || out.get_pixel(9, 10).0[0] > 0);
    }

    #[test]
    fn harris_leaves_flat_images_alone() {
        let flat = RgbImage::from_pixel(24, 24, Rgb([80, 80, 80]));
        let out = harris_corner(&ImageprocLibrary::new(), &flat, &defaults(HARRIS_PARAMS)).unwrap();
        assert_eq!(out, flat);
    }

    #[test]
    fn harris_marks_square_corners() {
        let image = RgbImage::from_fn(40, 40, |x, y| {
            if (10..30).contains(&x) && (10..30).contains(&y) { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        });
        let out = harris_corner(&ImageprocLibrary::new(), &image, &defaults(HARRIS_PARAMS)).unwrap();
        let near_corner = (7..13).any(|y| (7..13).any(|x| out.get_pixel(x, y) == &RED));
        assert!(near_corner);
        assert_ne!(out.get_pixel(20, 20), &RED);
    }

    #[test]
    fn hough_lines_draw_green_segments() {
        let image = RgbImage::from_fn(100, 100, |_, y| {
            if (45..55).contains(&y) { Rgb([255, 255, 255]) } else { Rgb([0, 0, 0]) }
        });
        let params = ParameterSet::new()
            .with("threshold", ParamValue::Int(40))
            .with("minLen", ParamValue::Float(30.0))
            .merged_with(HOUGH_LINES_PARAMS)
            .unwrap();
        let out = hough_lines(&ImageprocLibrary::new(), &image, &params).unwrap();
        assert!(out.pixels().any(|p| *p == GREEN));
    }

    #[test]
    fn hough_circles_on_black_find_nothing() {
        let out = hough_circles(&ImageprocLibrary::new(), &black(80), &defaults(HOUGH_CIRCLES_PARAMS)).unwrap();
        assert_eq!(out, black(80));
    }
}
