// THEORY:
// The OpenCV Image Library: every trait method is one call (or a short chain of
// calls) into the `opencv` crate with the same arguments the catalog documents.
// Images arrive as RGB buffers and are converted to BGR `Mat`s here, because OpenCV's
// color routines and stock detectors assume BGR. SLIC is the one exception: the
// catalog follows scikit-image's SLIC, which OpenCV does not implement, so both
// backends share the in-crate kernel.

use super::kernels;
use super::{
    require_odd, BoundingBox, Capability, Cascade, Circle, ImageLibrary, Keypoint, KeypointDetector, Labels,
    LibraryError, LibraryResult, LineSegment, ModelPaths, ThresholdMode,
};
use crate::core_modules::frame::FloatImage;
use image::{GrayImage, RgbImage};
use opencv::core::{self, KeyPoint, Mat, Point, Rect, Scalar, Size, Vec3f, Vec4i, Vector};
use opencv::prelude::*;
use opencv::{features2d, imgproc, objdetect};

impl From<opencv::Error> for LibraryError {
    fn from(error: opencv::Error) -> Self {
        match error.code {
            core::StsBadArg | core::StsOutOfRange | core::StsBadSize | core::StsAssert => {
                LibraryError::InvalidParameter(error.message)
            }
            _ => LibraryError::Failed(error.message),
        }
    }
}

fn size_mismatch() -> LibraryError {
    LibraryError::Failed("OpenCV returned a buffer of unexpected size".into())
}

fn rgb_to_bgr(image: &RgbImage) -> LibraryResult<Mat> {
    let mut rgb = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        core::CV_8UC3,
        Scalar::all(0.0),
    )?;
    rgb.data_bytes_mut()?.copy_from_slice(image.as_raw());
    let mut bgr = Mat::default();
    imgproc::cvt_color(&rgb, &mut bgr, imgproc::COLOR_RGB2BGR, 0)?;
    Ok(bgr)
}

fn bgr_to_rgb(mat: &Mat) -> LibraryResult<RgbImage> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;
    RgbImage::from_raw(rgb.cols() as u32, rgb.rows() as u32, rgb.data_bytes()?.to_vec()).ok_or_else(size_mismatch)
}

fn gray_to_mat(image: &GrayImage) -> LibraryResult<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        core::CV_8UC1,
        Scalar::all(0.0),
    )?;
    mat.data_bytes_mut()?.copy_from_slice(image.as_raw());
    Ok(mat)
}

fn mat_to_gray(mat: &Mat) -> LibraryResult<GrayImage> {
    GrayImage::from_raw(mat.cols() as u32, mat.rows() as u32, mat.data_bytes()?.to_vec()).ok_or_else(size_mismatch)
}

fn mat_to_float(mat: &Mat) -> LibraryResult<FloatImage> {
    let mut float = Mat::default();
    mat.convert_to(&mut float, core::CV_32F, 1.0, 0.0)?;
    FloatImage::from_raw(float.cols() as u32, float.rows() as u32, float.data_typed::<f32>()?.to_vec())
        .ok_or_else(size_mismatch)
}

fn float_to_mat(image: &FloatImage) -> LibraryResult<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(
        image.height() as i32,
        image.width() as i32,
        core::CV_32FC1,
        Scalar::all(0.0),
    )?;
    mat.data_typed_mut::<f32>()?.copy_from_slice(image.as_raw());
    Ok(mat)
}

fn labels_to_mat(labels: &Labels) -> LibraryResult<Mat> {
    let mut mat = Mat::new_rows_cols_with_default(
        labels.height as i32,
        labels.width as i32,
        core::CV_32SC1,
        Scalar::all(0.0),
    )?;
    mat.data_typed_mut::<i32>()?.copy_from_slice(&labels.data);
    Ok(mat)
}

fn square_kernel() -> LibraryResult<Mat> {
    Ok(Mat::ones(3, 3, core::CV_8U)?.to_mat()?)
}

/// Converts OpenCV keypoints. `ranked` keeps the strongest `max_features` (how SIFT
/// and ORB cap their output); otherwise the first `max_features` in detector order.
fn keypoints_from(found: &Vector<KeyPoint>, ranked: bool, max_features: usize) -> Vec<Keypoint> {
    let mut keypoints: Vec<Keypoint> = found
        .iter()
        .map(|k| Keypoint {
            x: k.pt().x,
            y: k.pt().y,
            size: k.size(),
            angle: (k.angle() >= 0.0).then(|| k.angle()),
            response: k.response(),
        })
        .collect();
    if ranked {
        keypoints.sort_by(|a, b| {
            b.response
                .total_cmp(&a.response)
                .then(a.y.total_cmp(&b.y))
                .then(a.x.total_cmp(&b.x))
        });
    }
    if max_features > 0 {
        keypoints.truncate(max_features);
    }
    keypoints
}

fn boxes_from(found: &Vector<Rect>) -> Vec<BoundingBox> {
    found
        .iter()
        .map(|r| BoundingBox { x: r.x, y: r.y, width: r.width.max(0) as u32, height: r.height.max(0) as u32 })
        .collect()
}

/// OpenCV-backed library. Haar cascades are looked up in `models.cascade_dir`.
#[derive(Debug, Clone, Default)]
pub struct OpencvLibrary {
    models: ModelPaths,
}

impl OpencvLibrary {
    pub fn new(models: ModelPaths) -> Self {
        Self { models }
    }

    #[cfg(feature = "opencv-contrib")]
    fn detect_contrib(&self, gray: &Mat, detector: KeypointDetector) -> LibraryResult<Vector<KeyPoint>> {
        use opencv::xfeatures2d;
        let mut found = Vector::<KeyPoint>::new();
        match detector {
            KeypointDetector::Surf { hessian_threshold } => {
                let mut surf = xfeatures2d::SURF::create(hessian_threshold, 4, 3, false, false)?;
                surf.detect(gray, &mut found, &Mat::default())?;
            }
            _ => {
                let mut star = xfeatures2d::StarDetector::create_def()?;
                star.detect(gray, &mut found, &Mat::default())?;
                let mut brief = xfeatures2d::BriefDescriptorExtractor::create_def()?;
                let mut descriptors = Mat::default();
                brief.compute(gray, &mut found, &mut descriptors)?;
            }
        }
        Ok(found)
    }

    #[cfg(not(feature = "opencv-contrib"))]
    fn detect_contrib(&self, _gray: &Mat, detector: KeypointDetector) -> LibraryResult<Vector<KeyPoint>> {
        Err(LibraryError::Unavailable(detector.capability()))
    }
}

impl ImageLibrary for OpencvLibrary {
    fn name(&self) -> &'static str {
        "OpenCV"
    }

    fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::SiftDetector | Capability::OrbDetector | Capability::HogPeopleDetector => true,
            Capability::SurfDetector | Capability::BriefDescriptor => cfg!(feature = "opencv-contrib"),
            Capability::HaarCascades => self.models.cascade_dir.as_ref().is_some_and(|dir| dir.is_dir()),
        }
    }

    fn gaussian_blur(&self, image: &RgbImage, kernel: (u32, u32), sigma: f64) -> LibraryResult<RgbImage> {
        for side in [kernel.0, kernel.1] {
            if side != 0 {
                require_odd("Gaussian kernel size", side)?;
            }
        }
        let src = rgb_to_bgr(image)?;
        let mut dst = Mat::default();
        let size = Size::new(kernel.0 as i32, kernel.1 as i32);
        imgproc::gaussian_blur(&src, &mut dst, size, sigma, 0.0, core::BORDER_DEFAULT)?;
        bgr_to_rgb(&dst)
    }

    fn median_blur(&self, image: &RgbImage, kernel: u32) -> LibraryResult<RgbImage> {
        require_odd("median kernel size", kernel)?;
        let src = rgb_to_bgr(image)?;
        let mut dst = Mat::default();
        imgproc::median_blur(&src, &mut dst, kernel as i32)?;
        bgr_to_rgb(&dst)
    }

    fn median_blur_gray(&self, image: &GrayImage, kernel: u32) -> LibraryResult<GrayImage> {
        require_odd("median kernel size", kernel)?;
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::median_blur(&src, &mut dst, kernel as i32)?;
        mat_to_gray(&dst)
    }

    fn bilateral_filter(&self, image: &RgbImage, diameter: i32, sigma_color: f64, sigma_space: f64)
        -> LibraryResult<RgbImage> {
        let src = rgb_to_bgr(image)?;
        let mut dst = Mat::default();
        imgproc::bilateral_filter(&src, &mut dst, diameter, sigma_color, sigma_space, core::BORDER_DEFAULT)?;
        bgr_to_rgb(&dst)
    }

    fn filter3x3(&self, image: &RgbImage, kernel: &[f32; 9]) -> LibraryResult<RgbImage> {
        let src = rgb_to_bgr(image)?;
        let mut taps = Mat::new_rows_cols_with_default(3, 3, core::CV_32F, Scalar::all(0.0))?;
        taps.data_typed_mut::<f32>()?.copy_from_slice(kernel);
        let mut dst = Mat::default();
        imgproc::filter_2d(&src, &mut dst, -1, &taps, Point::new(-1, -1), 0.0, core::BORDER_DEFAULT)?;
        bgr_to_rgb(&dst)
    }

    fn add_weighted(&self, a: &RgbImage, alpha: f64, b: &RgbImage, beta: f64, gamma: f64) -> LibraryResult<RgbImage> {
        let (src_a, src_b) = (rgb_to_bgr(a)?, rgb_to_bgr(b)?);
        let mut dst = Mat::default();
        core::add_weighted(&src_a, alpha, &src_b, beta, gamma, &mut dst, -1)?;
        bgr_to_rgb(&dst)
    }

    fn apply_lut(&self, image: &RgbImage, table: &[u8; 256]) -> LibraryResult<RgbImage> {
        let src = rgb_to_bgr(image)?;
        let mut lut = Mat::new_rows_cols_with_default(1, 256, core::CV_8UC1, Scalar::all(0.0))?;
        lut.data_bytes_mut()?.copy_from_slice(table);
        let mut dst = Mat::default();
        core::lut(&src, &lut, &mut dst)?;
        bgr_to_rgb(&dst)
    }

    fn equalize_histogram(&self, image: &GrayImage) -> LibraryResult<GrayImage> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::equalize_hist(&src, &mut dst)?;
        mat_to_gray(&dst)
    }

    fn sobel(&self, image: &GrayImage, dx: u32, dy: u32, ksize: u32) -> LibraryResult<FloatImage> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::sobel(&src, &mut dst, core::CV_32F, dx as i32, dy as i32, ksize as i32, 1.0, 0.0, core::BORDER_DEFAULT)?;
        mat_to_float(&dst)
    }

    fn canny(&self, image: &GrayImage, low: f64, high: f64) -> LibraryResult<GrayImage> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::canny(&src, &mut dst, low, high, 3, false)?;
        mat_to_gray(&dst)
    }

    fn corner_harris(&self, image: &GrayImage, block_size: u32, ksize: u32, k: f64) -> LibraryResult<FloatImage> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::corner_harris(&src, &mut dst, block_size as i32, ksize as i32, k, core::BORDER_DEFAULT)?;
        mat_to_float(&dst)
    }

    fn dilate_response(&self, response: &FloatImage) -> LibraryResult<FloatImage> {
        let src = float_to_mat(response)?;
        let mut dst = Mat::default();
        imgproc::dilate(
            &src,
            &mut dst,
            &Mat::default(),
            Point::new(-1, -1),
            1,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;
        mat_to_float(&dst)
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
        let src = gray_to_mat(edges)?;
        let mut lines = Vector::<Vec4i>::new();
        imgproc::hough_lines_p(&src, &mut lines, rho, theta, threshold as i32, min_length, max_gap)?;
        Ok(lines
            .iter()
            .map(|l| LineSegment { start: (l[0], l[1]), end: (l[2], l[3]) })
            .collect())
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
        let src = gray_to_mat(image)?;
        let mut circles = Vector::<Vec3f>::new();
        imgproc::hough_circles(
            &src,
            &mut circles,
            imgproc::HOUGH_GRADIENT,
            dp,
            min_dist,
            param1,
            param2,
            min_radius as i32,
            max_radius as i32,
        )?;
        Ok(circles
            .iter()
            .map(|c| Circle { center: (c[0], c[1]), radius: c[2] })
            .collect())
    }

    fn detect_keypoints(
        &self,
        image: &GrayImage,
        detector: KeypointDetector,
        max_features: usize,
    ) -> LibraryResult<Vec<Keypoint>> {
        let gray = gray_to_mat(image)?;
        let found = match detector {
            KeypointDetector::Sift => {
                let mut sift = features2d::SIFT::create_def()?;
                let mut found = Vector::<KeyPoint>::new();
                sift.detect(&gray, &mut found, &Mat::default())?;
                found
            }
            KeypointDetector::Orb => {
                let mut orb = features2d::ORB::create_def()?;
                let mut found = Vector::<KeyPoint>::new();
                orb.detect(&gray, &mut found, &Mat::default())?;
                found
            }
            contrib => self.detect_contrib(&gray, contrib)?,
        };
        let ranked = !matches!(detector, KeypointDetector::StarBrief);
        Ok(keypoints_from(&found, ranked, max_features))
    }

    fn threshold(
        &self,
        image: &GrayImage,
        threshold: f64,
        max_value: u8,
        mode: ThresholdMode,
        otsu: bool,
    ) -> LibraryResult<(f64, GrayImage)> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        let mut kind = match mode {
            ThresholdMode::Binary => imgproc::THRESH_BINARY,
            ThresholdMode::BinaryInverted => imgproc::THRESH_BINARY_INV,
        };
        if otsu {
            kind |= imgproc::THRESH_OTSU;
        }
        let level = imgproc::threshold(&src, &mut dst, threshold, max_value as f64, kind)?;
        Ok((level, mat_to_gray(&dst)?))
    }

    fn adaptive_threshold(&self, image: &GrayImage, max_value: u8, block_size: u32, c: f64) -> LibraryResult<GrayImage> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::adaptive_threshold(
            &src,
            &mut dst,
            max_value as f64,
            imgproc::ADAPTIVE_THRESH_GAUSSIAN_C,
            imgproc::THRESH_BINARY,
            block_size as i32,
            c,
        )?;
        mat_to_gray(&dst)
    }

    fn morphology_open(&self, image: &GrayImage, iterations: u32) -> LibraryResult<GrayImage> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::morphology_ex(
            &src,
            &mut dst,
            imgproc::MORPH_OPEN,
            &square_kernel()?,
            Point::new(-1, -1),
            iterations as i32,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;
        mat_to_gray(&dst)
    }

    fn dilate(&self, image: &GrayImage, iterations: u32) -> LibraryResult<GrayImage> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::dilate(
            &src,
            &mut dst,
            &square_kernel()?,
            Point::new(-1, -1),
            iterations as i32,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;
        mat_to_gray(&dst)
    }

    fn distance_transform(&self, image: &GrayImage) -> LibraryResult<FloatImage> {
        let src = gray_to_mat(image)?;
        let mut dst = Mat::default();
        imgproc::distance_transform(&src, &mut dst, imgproc::DIST_L2, 5, core::CV_32F)?;
        mat_to_float(&dst)
    }

    fn connected_components(&self, image: &GrayImage) -> LibraryResult<(u32, Labels)> {
        let src = gray_to_mat(image)?;
        let mut labels_mat = Mat::default();
        let total = imgproc::connected_components(&src, &mut labels_mat, 8, core::CV_32S)?;
        let mut labels = Labels::new(image.width(), image.height());
        labels.data.copy_from_slice(labels_mat.data_typed::<i32>()?);
        // OpenCV counts the background as a component.
        Ok(((total - 1).max(0) as u32, labels))
    }

    fn watershed(&self, image: &RgbImage, markers: &mut Labels) -> LibraryResult<()> {
        let src = rgb_to_bgr(image)?;
        let mut markers_mat = labels_to_mat(markers)?;
        imgproc::watershed(&src, &mut markers_mat)?;
        markers.data.copy_from_slice(markers_mat.data_typed::<i32>()?);
        Ok(())
    }

    fn slic(&self, image: &RgbImage, n_segments: u32, compactness: f64) -> LibraryResult<Labels> {
        kernels::slic(image, n_segments, compactness)
    }

    fn detect_people(&self, image: &RgbImage) -> LibraryResult<Vec<BoundingBox>> {
        let src = rgb_to_bgr(image)?;
        let mut hog = objdetect::HOGDescriptor::default()?;
        hog.set_svm_detector(&objdetect::HOGDescriptor::get_default_people_detector()?)?;
        let mut found = Vector::<Rect>::new();
        hog.detect_multi_scale(&src, &mut found, 0.0, Size::new(8, 8), Size::new(4, 4), 1.05, 2.0, false)?;
        Ok(boxes_from(&found))
    }

    fn detect_cascade(&self, image: &GrayImage, cascade: Cascade, scale_factor: f64, min_neighbors: u32)
        -> LibraryResult<Vec<BoundingBox>> {
        let dir = self
            .models
            .cascade_dir
            .as_ref()
            .ok_or(LibraryError::Unavailable(Capability::HaarCascades))?;
        let path = dir.join(cascade.file_name());
        let path = path
            .to_str()
            .ok_or_else(|| LibraryError::Failed(format!("cascade path {} is not valid UTF-8", path.display())))?;
        let mut classifier = objdetect::CascadeClassifier::new(path)?;
        if classifier.empty()? {
            return Err(LibraryError::Failed(format!("could not load cascade {path}")));
        }
        let src = gray_to_mat(image)?;
        let mut found = Vector::<Rect>::new();
        classifier.detect_multi_scale(
            &src,
            &mut found,
            scale_factor,
            min_neighbors as i32,
            0,
            Size::new(0, 0),
            Size::new(0, 0),
        )?;
        Ok(boxes_from(&found))
    }

    fn match_template(&self, image: &GrayImage, template: &GrayImage) -> LibraryResult<FloatImage> {
        let (src, templ) = (gray_to_mat(image)?, gray_to_mat(template)?);
        let mut dst = Mat::default();
        imgproc::match_template(&src, &templ, &mut dst, imgproc::TM_CCOEFF_NORMED, &core::no_array())?;
        mat_to_float(&dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    #[test]
    fn round_trips_rgb_through_bgr() {
        let image = RgbImage::from_fn(4, 3, |x, y| Rgb([(x * 60) as u8, (y * 80) as u8, 7]));
        let mat = rgb_to_bgr(&image).unwrap();
        assert_eq!(bgr_to_rgb(&mat).unwrap(), image);
    }

    #[test]
    fn canny_on_black_is_empty() {
        let library = OpencvLibrary::default();
        let edges = library.canny(&GrayImage::new(32, 32), 50.0, 150.0).unwrap();
        assert!(edges.pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn haar_needs_a_cascade_directory() {
        let library = OpencvLibrary::default();
        assert!(!library.supports(Capability::HaarCascades));
        assert_eq!(
            library.detect_cascade(&GrayImage::from_pixel(8, 8, Luma([0])), Cascade::Eye, 1.1, 4),
            Err(LibraryError::Unavailable(Capability::HaarCascades))
        );
    }
}
