// THEORY:
// Pixel-wise and neighborhood filters. Every operation here returns an image of the
// input's size and color layout; none of them annotate. Sharpening and histogram
// equalization are compositions (blur + weighted sum, RGB → YUV → RGB), the rest
// are single library calls.

use super::unsigned;
use crate::core_modules::descriptor::{Algorithm, AlgorithmDescriptor, Category};
use crate::core_modules::frame::{from_yuv, to_yuv};
use crate::core_modules::library::{ImageLibrary, LibraryResult};
use crate::core_modules::params::{ParamSpec, ParameterSet};
use crate::core_modules::registry::Registry;
use crate::error::DispatchResult;
use image::RgbImage;

const GAUSSIAN_PARAMS: &[ParamSpec] = &[
    ParamSpec::size("kernelSize", (5, 5), 0, 255, "Gaussian kernel (width, height); odd, or 0 to derive from sigma"),
    ParamSpec::float("sigma", 1.0, 0.0, 100.0, "Standard deviation of the kernel"),
];

const MEDIAN_PARAMS: &[ParamSpec] = &[ParamSpec::int("kernelSize", 5, 1, 255, "Odd aperture side")];

const BILATERAL_PARAMS: &[ParamSpec] = &[
    ParamSpec::int("diameter", 15, -1, 99, "Neighborhood diameter; non-positive derives it from sigmaSpace"),
    ParamSpec::float("sigmaColor", 75.0, 0.0, 1000.0, "Color-space sigma"),
    ParamSpec::float("sigmaSpace", 75.0, 0.0, 1000.0, "Coordinate-space sigma"),
];

const SHARPENING_PARAMS: &[ParamSpec] = &[ParamSpec::choice(
    "mode",
    "laplacian",
    &["laplacian", "unsharp"],
    "laplacian kernel or unsharp mask; anything else returns the input",
)];

const GAMMA_PARAMS: &[ParamSpec] = &[ParamSpec::float("gamma", 1.0, f64::MIN_POSITIVE, 100.0, "Gamma; > 1 brightens")];

/// Center-weighted Laplacian sharpening kernel.
const LAPLACIAN_SHARPEN: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 9.0, -1.0, -1.0, -1.0, -1.0];
const UNSHARP_SIGMA: f64 = 2.0;
const UNSHARP_AMOUNT: f64 = 1.5;

pub fn register(registry: &mut Registry) -> DispatchResult<()> {
    let category = Category::ImageProcessing;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::GaussianBlur, category, "Gaussian smoothing", GAUSSIAN_PARAMS),
        gaussian_blur,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::MedianFilter, category, "Median denoising", MEDIAN_PARAMS),
        median_filter,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::BilateralFilter, category, "Edge-preserving smoothing", BILATERAL_PARAMS),
        bilateral_filter,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::Sharpening, category, "Laplacian or unsharp-mask sharpening", SHARPENING_PARAMS),
        sharpening,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::HistogramEqualization, category, "Luma histogram equalization", &[]),
        histogram_equalization,
    )?;
    registry.register(
        AlgorithmDescriptor::new(Algorithm::GammaCorrection, category, "Lookup-table gamma correction", GAMMA_PARAMS),
        gamma_correction,
    )
}

pub fn gaussian_blur(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    library.gaussian_blur(image, params.size("kernelSize")?, params.float("sigma")?)
}

pub fn median_filter(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    library.median_blur(image, unsigned(params, "kernelSize")?)
}

pub fn bilateral_filter(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    let diameter = params.int("diameter")? as i32;
    library.bilateral_filter(image, diameter, params.float("sigmaColor")?, params.float("sigmaSpace")?)
}

pub fn sharpening(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    match params.choice("mode")? {
        "laplacian" => library.filter3x3(image, &LAPLACIAN_SHARPEN),
        "unsharp" => {
            let blurred = library.gaussian_blur(image, (0, 0), UNSHARP_SIGMA)?;
            library.add_weighted(image, UNSHARP_AMOUNT, &blurred, 1.0 - UNSHARP_AMOUNT, 0.0)
        }
        _ => Ok(image.clone()),
    }
}

pub fn histogram_equalization(library: &dyn ImageLibrary, image: &RgbImage, _: &ParameterSet) -> LibraryResult<RgbImage> {
    let mut planes = to_yuv(image);
    planes.y = library.equalize_histogram(&planes.y)?;
    Ok(from_yuv(&planes))
}

pub fn gamma_correction(library: &dyn ImageLibrary, image: &RgbImage, params: &ParameterSet) -> LibraryResult<RgbImage> {
    library.apply_lut(image, &gamma_table(params.float("gamma")?))
}

/// `out = ⌊255 · (in / 255)^(1 / gamma)⌋`.
pub fn gamma_table(gamma: f64) -> [u8; 256] {
    let inverse = 1.0 / gamma;
    let mut table = [0u8; 256];
    for (level, entry) in table.iter_mut().enumerate() {
        *entry = (255.0 * (level as f64 / 255.0).powf(inverse)).floor().clamp(0.0, 255.0) as u8;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::library::ImageprocLibrary;
    use crate::core_modules::operations::fixtures::scene;
    use crate::core_modules::params::ParamValue;
    use image::Rgb;

    fn merged(schema: &[ParamSpec], set: ParameterSet) -> ParameterSet {
        set.merged_with(schema).unwrap()
    }

    #[test]
    fn gamma_one_is_identity() {
        let table = gamma_table(1.0);
        assert!(table.iter().enumerate().all(|(i, &v)| v as usize == i));
    }

    #[test]
    fn gamma_and_its_inverse_nearly_cancel() {
        let library = ImageprocLibrary::new();
        let image = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 16 + y) as u8, (y * 16) as u8, 255 - (x * 16) as u8]));
        let brighten = merged(GAMMA_PARAMS, ParameterSet::new().with("gamma", ParamValue::Float(2.0)));
        let darken = merged(GAMMA_PARAMS, ParameterSet::new().with("gamma", ParamValue::Float(0.5)));
        let once = gamma_correction(&library, &image, &brighten).unwrap();
        let back = gamma_correction(&library, &once, &darken).unwrap();
        for (a, b) in image.pixels().zip(back.pixels()) {
            for c in 0..3 {
                assert!((a.0[c] as i16 - b.0[c] as i16).abs() <= 3, "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn gaussian_blur_keeps_shape_and_smooths() {
        let library = ImageprocLibrary::new();
        let image = scene(60, 40);
        let out = gaussian_blur(&library, &image, &merged(GAUSSIAN_PARAMS, ParameterSet::new())).unwrap();
        assert_eq!(out.dimensions(), (60, 40));
        assert_ne!(out, image);
    }

    #[test]
    fn even_gaussian_kernel_is_a_parameter_error() {
        let library = ImageprocLibrary::new();
        let params = merged(GAUSSIAN_PARAMS, ParameterSet::new().with("kernelSize", ParamValue::Size(4, 4)));
        let error = gaussian_blur(&library, &scene(20, 20), &params).unwrap_err();
        assert!(matches!(error, crate::core_modules::library::LibraryError::InvalidParameter(_)));
    }

    #[test]
    fn median_filter_removes_salt() {
        let library = ImageprocLibrary::new();
        let mut image = RgbImage::from_pixel(15, 15, Rgb([50, 50, 50]));
        image.put_pixel(7, 7, Rgb([255, 255, 255]));
        let out = median_filter(&library, &image, &merged(MEDIAN_PARAMS, ParameterSet::new())).unwrap();
        assert_eq!(out.get_pixel(7, 7), &Rgb([50, 50, 50]));
    }

    #[test]
    fn unknown_sharpening_mode_returns_the_input() {
        let library = ImageprocLibrary::new();
        let image = scene(30, 30);
        let params = merged(SHARPENING_PARAMS, ParameterSet::new().with("mode", ParamValue::Choice("emboss".into())));
        assert_eq!(sharpening(&library, &image, &params).unwrap(), image);
    }

    #[test]
    fn sharpening_leaves_flat_regions_alone() {
        let library = ImageprocLibrary::new();
        let image = RgbImage::from_pixel(12, 12, Rgb([90, 120, 150]));
        for mode in ["laplacian", "unsharp"] {
            let params = merged(SHARPENING_PARAMS, ParameterSet::new().with("mode", ParamValue::Choice(mode.into())));
            assert_eq!(sharpening(&library, &image, &params).unwrap(), image, "{mode}");
        }
    }

    #[test]
    fn equalization_stretches_a_narrow_histogram() {
        let library = ImageprocLibrary::new();
        let image = RgbImage::from_fn(32, 32, |x, _| {
            let level = 100 + (x / 4) as u8;
            Rgb([level, level, level])
        });
        let out = histogram_equalization(&library, &image, &ParameterSet::new()).unwrap();
        let spread = |img: &RgbImage| {
            let values: Vec<u8> = img.pixels().map(|p| p.0[0]).collect();
            values.iter().max().copied().unwrap_or(0) - values.iter().min().copied().unwrap_or(0)
        };
        assert_eq!(out.dimensions(), image.dimensions());
        assert!(spread(&out) > spread(&image));
    }
}
