// THEORY:
// The `frame` module is the image model of the crate. Callers hand us whatever the
// decoder produced (`DynamicImage`: gray or color, 8/16-bit or float, with or without
// alpha); every operation downstream works on one canonical layout, a 3-channel 8-bit
// RGB buffer. This module owns that normalization and the handful of color-space
// conversions the operations need around it.
//
// Key principles:
// 1.  **One canonical layout**: `normalize` is the only entry into the operation
//     layer. Gray input is replicated up to three channels; operations that need gray
//     internally convert down themselves with `to_gray`.
// 2.  **Rec. 601 luma**: gray conversion uses the classic 0.299/0.587/0.114 weights,
//     the same weights OpenCV's BGR2GRAY uses, so both library backends see the same
//     gray image for the same input.
// 3.  **No aliasing**: every conversion allocates. The caller's image is never touched.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use std::path::Path;

/// A single-channel `f32` image, used for gradient, response and distance maps.
pub type FloatImage = ImageBuffer<Luma<f32>, Vec<f32>>;

/// Element type of an input image's channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElementType {
    U8,
    U16,
    F32,
}

/// Dimensions and layout of an input image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageShape {
    pub width: u32,
    pub height: u32,
    /// 1 (gray), 2 (gray + alpha), 3 (color) or 4 (color + alpha).
    pub channels: u8,
    pub element: ElementType,
}

impl ImageShape {
    pub fn of(image: &DynamicImage) -> Self {
        let color = image.color();
        let element = match color.bytes_per_pixel() / color.channel_count() {
            1 => ElementType::U8,
            2 => ElementType::U16,
            _ => ElementType::F32,
        };
        Self {
            width: image.width(),
            height: image.height(),
            channels: color.channel_count(),
            element,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Converts any decoded image into the canonical 3-channel 8-bit RGB layout.
pub fn normalize(image: &DynamicImage) -> RgbImage {
    match image {
        DynamicImage::ImageRgb8(rgb) => rgb.clone(),
        DynamicImage::ImageLuma8(gray) => gray_to_rgb(gray),
        other => other.to_rgb8(),
    }
}

/// Rec. 601 luma of one RGB pixel, rounded like OpenCV's fixed-point conversion.
#[inline]
pub fn luminance(pixel: &Rgb<u8>) -> u8 {
    let [red, green, blue] = pixel.0;
    let luma = 0.299_f64 * red as f64 + 0.587_f64 * green as f64 + 0.114_f64 * blue as f64;
    luma.round().clamp(0.0, 255.0) as u8
}

pub fn to_gray(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        Luma([luminance(image.get_pixel(x, y))])
    })
}

pub fn gray_to_rgb(gray: &GrayImage) -> RgbImage {
    RgbImage::from_fn(gray.width(), gray.height(), |x, y| {
        let value = gray.get_pixel(x, y).0[0];
        Rgb([value, value, value])
    })
}

/// Y, U and V planes of an image, each stored as 8-bit with U/V offset by 128.
pub struct YuvPlanes {
    pub y: GrayImage,
    pub u: GrayImage,
    pub v: GrayImage,
}

pub fn to_yuv(image: &RgbImage) -> YuvPlanes {
    let (width, height) = image.dimensions();
    let mut planes = YuvPlanes {
        y: GrayImage::new(width, height),
        u: GrayImage::new(width, height),
        v: GrayImage::new(width, height),
    };
    for (x, y, pixel) in image.enumerate_pixels() {
        let [red, green, blue] = pixel.0.map(f64::from);
        let luma = 0.299 * red + 0.587 * green + 0.114 * blue;
        let u = 0.492 * (blue - luma) + 128.0;
        let v = 0.877 * (red - luma) + 128.0;
        planes.y.put_pixel(x, y, Luma([saturate(luma)]));
        planes.u.put_pixel(x, y, Luma([saturate(u)]));
        planes.v.put_pixel(x, y, Luma([saturate(v)]));
    }
    planes
}

pub fn from_yuv(planes: &YuvPlanes) -> RgbImage {
    RgbImage::from_fn(planes.y.width(), planes.y.height(), |x, y| {
        let luma = planes.y.get_pixel(x, y).0[0] as f64;
        let u = planes.u.get_pixel(x, y).0[0] as f64 - 128.0;
        let v = planes.v.get_pixel(x, y).0[0] as f64 - 128.0;
        Rgb([
            saturate(luma + 1.140 * v),
            saturate(luma - 0.395 * u - 0.581 * v),
            saturate(luma + 2.032 * u),
        ])
    })
}

/// Rounds and clamps a value into the 8-bit range.
#[inline]
pub fn saturate(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

/// Writes an RGB image as PNG.
pub fn save_png(path: impl AsRef<Path>, image: &RgbImage) -> Result<(), image::ImageError> {
    image.save_with_format(path, image::ImageFormat::Png)
}
