// THEORY:
// Numeric routines the pure-Rust backend needs but `imageproc` does not ship in the
// exact form the catalog calls for. Each one reproduces the OpenCV (or scikit-image)
// semantics the catalog is specified against, built on plain buffers:
//
// - separable correlation with OpenCV-style borders (Gaussian, Sobel, box sums)
// - bilateral filtering, Harris response, Gaussian adaptive threshold
// - probabilistic Hough segments on top of `imageproc::hough::detect_lines`
// - gradient Hough circles
// - a difference-of-Gaussians keypoint detector and the ORB intensity centroid
// - marker-based watershed flooding and SLIC superpixels
//
// Every routine is deterministic: the same input always yields the same output, and
// ties are broken by raster order.

use crate::core_modules::frame::FloatImage;
use crate::core_modules::library::{Circle, Keypoint, Labels, LibraryError, LibraryResult, LineSegment};
use image::{GrayImage, Luma, Rgb, RgbImage};
use imageproc::filter::gaussian_blur_f32;
use std::collections::VecDeque;
use std::sync::OnceLock;

/// How samples outside the image are synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Border {
    /// `gfedcb|abcdefgh|gfedcba`, OpenCV's default.
    Reflect101,
    /// `aaaaaa|abcdefgh|hhhhhhh`
    Replicate,
}

#[inline]
pub fn border_index(i: i64, n: i64, border: Border) -> usize {
    if n <= 1 {
        return 0;
    }
    match border {
        Border::Replicate => i.clamp(0, n - 1) as usize,
        Border::Reflect101 => {
            let period = 2 * (n - 1);
            let mut j = i.rem_euclid(period);
            if j >= n {
                j = period - j;
            }
            j as usize
        }
    }
}

/// Separable correlation of an interleaved buffer. The anchor of each kernel is its
/// middle tap (`len / 2`), as in OpenCV.
pub fn separable_filter(
    data: &[f32],
    width: u32,
    height: u32,
    channels: usize,
    kx: &[f32],
    ky: &[f32],
    border: Border,
) -> Vec<f32> {
    let (w, h) = (width as i64, height as i64);
    let (rx, ry) = ((kx.len() / 2) as i64, (ky.len() / 2) as i64);
    let stride = width as usize * channels;

    let mut horizontal = vec![0.0f32; data.len()];
    for y in 0..height as usize {
        let row = &data[y * stride..(y + 1) * stride];
        for x in 0..w {
            for c in 0..channels {
                let mut acc = 0.0f32;
                for (i, weight) in kx.iter().enumerate() {
                    let sx = border_index(x + i as i64 - rx, w, border);
                    acc += weight * row[sx * channels + c];
                }
                horizontal[y * stride + x as usize * channels + c] = acc;
            }
        }
    }

    let mut out = vec![0.0f32; data.len()];
    for y in 0..h {
        for (i, weight) in ky.iter().enumerate() {
            let sy = border_index(y + i as i64 - ry, h, border);
            let src = &horizontal[sy * stride..(sy + 1) * stride];
            let dst = &mut out[y as usize * stride..(y as usize + 1) * stride];
            for (d, s) in dst.iter_mut().zip(src) {
                *d += weight * s;
            }
        }
    }
    out
}

#[inline]
pub fn saturate_f32(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn to_f32(data: &[u8]) -> Vec<f32> {
    data.iter().map(|&v| v as f32).collect()
}

fn buffer_error() -> LibraryError {
    LibraryError::Failed("image buffer size mismatch".into())
}

/// Sigma OpenCV derives from a kernel size when none is given.
pub fn sigma_for_kernel(size: u32) -> f64 {
    0.3 * ((size as f64 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Kernel size OpenCV derives from a sigma for 8-bit images.
pub fn kernel_for_sigma(sigma: f64) -> u32 {
    ((sigma * 3.0 * 2.0 + 1.0).round() as u32) | 1
}

/// Normalized 1-D Gaussian of `size` taps.
pub fn gaussian_kernel(size: u32, sigma: f64) -> Vec<f32> {
    let sigma = if sigma <= 0.0 { sigma_for_kernel(size) } else { sigma };
    let center = (size as f64 - 1.0) / 2.0;
    let weights: Vec<f64> = (0..size)
        .map(|i| {
            let d = i as f64 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.iter().map(|w| (w / sum) as f32).collect()
}

/// Gaussian blur of an RGB image. A zero kernel side is derived from `sigma`; a
/// non-positive `sigma` is derived from the kernel side.
pub fn gaussian_blur_rgb(image: &RgbImage, kernel: (u32, u32), sigma: f64) -> LibraryResult<RgbImage> {
    let (mut kw, mut kh) = kernel;
    if kw == 0 && kh == 0 && sigma <= 0.0 {
        return Err(LibraryError::InvalidParameter("Gaussian blur needs a kernel size or a sigma".into()));
    }
    if kw == 0 {
        kw = kernel_for_sigma(sigma);
    }
    if kh == 0 {
        kh = kernel_for_sigma(sigma);
    }
    let kx = gaussian_kernel(kw, sigma);
    let ky = gaussian_kernel(kh, sigma);
    let (width, height) = image.dimensions();
    let filtered = separable_filter(&to_f32(image.as_raw()), width, height, 3, &kx, &ky, Border::Reflect101);
    RgbImage::from_raw(width, height, filtered.into_iter().map(saturate_f32).collect()).ok_or_else(buffer_error)
}

/// Sobel kernel of the given derivative order, built by repeated binomial smoothing
/// and differencing.
pub fn sobel_kernel(order: u32, ksize: u32) -> Vec<f32> {
    let ksize = ksize as usize;
    let order = order as usize;
    if ksize == 1 {
        return vec![1.0];
    }
    let mut k = vec![0i64; ksize + 1];
    k[0] = 1;
    for _ in 0..ksize.saturating_sub(order + 1) {
        let mut old = k[0];
        for j in 1..=ksize {
            let new = k[j] + k[j - 1];
            k[j - 1] = old;
            old = new;
        }
    }
    for _ in 0..order {
        let mut old = -k[0];
        for j in 1..=ksize {
            let new = k[j - 1] - k[j];
            k[j - 1] = old;
            old = new;
        }
    }
    k.truncate(ksize);
    k.into_iter().map(|v| v as f32).collect()
}

/// Sobel derivative of order (`dx`, `dy`) with OpenCV's aperture rules: `ksize` odd and
/// at most 31, a size of 1 meaning an unsmoothed 3-tap derivative.
pub fn sobel(gray: &GrayImage, dx: u32, dy: u32, ksize: u32) -> LibraryResult<FloatImage> {
    if ksize % 2 == 0 || ksize > 31 {
        return Err(LibraryError::InvalidParameter(format!(
            "Sobel ksize must be odd and at most 31, got {ksize}"
        )));
    }
    if dx + dy == 0 {
        return Err(LibraryError::InvalidParameter("Sobel needs dx > 0 or dy > 0".into()));
    }
    let size_x = if ksize == 1 && dx > 0 { 3 } else { ksize };
    let size_y = if ksize == 1 && dy > 0 { 3 } else { ksize };
    if dx >= size_x || dy >= size_y {
        return Err(LibraryError::InvalidParameter(format!(
            "derivative order ({dx}, {dy}) must be below the aperture size {ksize}"
        )));
    }
    let kx = sobel_kernel(dx, size_x);
    let ky = sobel_kernel(dy, size_y);
    let (width, height) = gray.dimensions();
    let filtered = separable_filter(&to_f32(gray.as_raw()), width, height, 1, &kx, &ky, Border::Reflect101);
    FloatImage::from_raw(width, height, filtered).ok_or_else(buffer_error)
}

/// Harris corner response `det(M) - k·trace(M)²` over a `block_size` window.
pub fn harris_response(gray: &GrayImage, block_size: u32, ksize: u32, k: f64) -> LibraryResult<FloatImage> {
    if block_size == 0 {
        return Err(LibraryError::InvalidParameter("Harris block size must be positive".into()));
    }
    let gx = sobel(gray, 1, 0, ksize)?;
    let gy = sobel(gray, 0, 1, ksize)?;
    let scale = 1.0 / ((1u64 << (ksize - 1)) as f32 * block_size as f32 * 255.0);

    let (width, height) = gray.dimensions();
    let mut products = Vec::with_capacity(gx.as_raw().len() * 3);
    for (&a, &b) in gx.as_raw().iter().zip(gy.as_raw()) {
        let (a, b) = (a * scale, b * scale);
        products.extend_from_slice(&[a * a, a * b, b * b]);
    }
    let ones = vec![1.0f32; block_size as usize];
    let sums = separable_filter(&products, width, height, 3, &ones, &ones, Border::Reflect101);
    let k = k as f32;
    let response = sums
        .chunks_exact(3)
        .map(|m| {
            let (a, b, c) = (m[0], m[1], m[2]);
            a * c - b * b - k * (a + c) * (a + c)
        })
        .collect();
    FloatImage::from_raw(width, height, response).ok_or_else(buffer_error)
}

/// 3×3 maximum filter, used for non-maximum suppression of response maps.
pub fn max_filter3x3(image: &FloatImage) -> FloatImage {
    let (w, h) = (image.width() as i64, image.height() as i64);
    FloatImage::from_fn(image.width(), image.height(), |x, y| {
        let mut best = f32::MIN;
        for oy in -1..=1 {
            for ox in -1..=1 {
                let sx = border_index(x as i64 + ox, w, Border::Reflect101);
                let sy = border_index(y as i64 + oy, h, Border::Reflect101);
                best = best.max(image.get_pixel(sx as u32, sy as u32).0[0]);
            }
        }
        Luma([best])
    })
}

/// Edge-preserving smoothing with a circular window. `diameter <= 0` derives the window
/// from `sigma_space`.
pub fn bilateral(image: &RgbImage, diameter: i32, sigma_color: f64, sigma_space: f64) -> LibraryResult<RgbImage> {
    let sigma_color = if sigma_color <= 0.0 { 1.0 } else { sigma_color };
    let sigma_space = if sigma_space <= 0.0 { 1.0 } else { sigma_space };
    let radius = if diameter <= 0 { (sigma_space * 1.5).round() as i64 } else { (diameter / 2) as i64 }.max(1);

    let color_coeff = -0.5 / (sigma_color * sigma_color);
    let space_coeff = -0.5 / (sigma_space * sigma_space);
    let color_weights: Vec<f32> = (0..256 * 3).map(|d| ((d * d) as f64 * color_coeff).exp() as f32).collect();
    let mut taps = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let r2 = (dx * dx + dy * dy) as f64;
            if r2.sqrt() <= radius as f64 {
                taps.push((dx, dy, (r2 * space_coeff).exp() as f32));
            }
        }
    }

    let (w, h) = (image.width() as i64, image.height() as i64);
    let mut out = RgbImage::new(image.width(), image.height());
    for (x, y, center) in image.enumerate_pixels() {
        let mut sum = [0.0f32; 3];
        let mut norm = 0.0f32;
        for &(dx, dy, space_weight) in &taps {
            let sx = border_index(x as i64 + dx, w, Border::Reflect101);
            let sy = border_index(y as i64 + dy, h, Border::Reflect101);
            let sample = image.get_pixel(sx as u32, sy as u32);
            let distance: usize = (0..3).map(|c| (sample.0[c] as i32 - center.0[c] as i32).unsigned_abs() as usize).sum();
            let weight = space_weight * color_weights[distance];
            for c in 0..3 {
                sum[c] += weight * sample.0[c] as f32;
            }
            norm += weight;
        }
        out.put_pixel(x, y, Rgb(sum.map(|v| saturate_f32(v / norm))));
    }
    Ok(out)
}

/// Gaussian-weighted adaptive threshold: a pixel is set when it exceeds its weighted
/// neighborhood mean minus `c`.
pub fn adaptive_threshold_gaussian(gray: &GrayImage, max_value: u8, block_size: u32, c: f64) -> LibraryResult<GrayImage> {
    if block_size < 3 || block_size % 2 == 0 {
        return Err(LibraryError::InvalidParameter(format!(
            "adaptive threshold block size must be odd and at least 3, got {block_size}"
        )));
    }
    let kernel = gaussian_kernel(block_size, 0.0);
    let (width, height) = gray.dimensions();
    let means = separable_filter(&to_f32(gray.as_raw()), width, height, 1, &kernel, &kernel, Border::Replicate);
    let data = gray
        .as_raw()
        .iter()
        .zip(means)
        .map(|(&v, mean)| if v as f64 - saturate_f32(mean) as f64 > -c { max_value } else { 0 })
        .collect();
    GrayImage::from_raw(width, height, data).ok_or_else(buffer_error)
}

/// Turns infinite Hough lines `(r, angle°)` into finite segments by walking each line
/// across the edge map, bridging gaps up to `max_gap` and keeping runs of at least
/// `min_length`. Pixels consumed by an accepted segment are not reused.
pub fn segments_along_lines(edges: &GrayImage, lines: &[(f32, f32)], min_length: f64, max_gap: f64) -> Vec<LineSegment> {
    let (width, height) = edges.dimensions();
    let (w, h) = (width as i32, height as i32);
    let mut used = vec![false; (width as usize) * (height as usize)];
    let extent = w + h;
    let mut segments = Vec::new();

    let is_edge = |used: &[bool], x: i32, y: i32| -> bool {
        x >= 0 && y >= 0 && x < w && y < h && {
            let i = y as usize * width as usize + x as usize;
            !used[i] && edges.as_raw()[i] > 0
        }
    };

    for &(r, angle) in lines {
        let theta = (angle as f64).to_radians();
        let (cos, sin) = (theta.cos(), theta.sin());
        let origin = (r as f64 * cos, r as f64 * sin);
        let direction = (-sin, cos);
        let normal = (cos.round() as i32, sin.round() as i32);

        let mut run: Vec<(i32, i32)> = Vec::new();
        let mut gap = 0.0f64;
        let close = |run: &mut Vec<(i32, i32)>, used: &mut [bool], segments: &mut Vec<LineSegment>| {
            if let (Some(&start), Some(&end)) = (run.first(), run.last()) {
                let segment = LineSegment { start, end };
                if segment.length() >= min_length {
                    for &(x, y) in run.iter() {
                        used[y as usize * width as usize + x as usize] = true;
                    }
                    segments.push(segment);
                }
            }
            run.clear();
        };

        for t in -extent..=extent {
            let px = (origin.0 + t as f64 * direction.0).round() as i32;
            let py = (origin.1 + t as f64 * direction.1).round() as i32;
            let hit = [(px, py), (px + normal.0, py + normal.1), (px - normal.0, py - normal.1)]
                .into_iter()
                .find(|&(x, y)| is_edge(used.as_slice(), x, y));
            match hit {
                Some(point) => {
                    if run.last() != Some(&point) {
                        run.push(point);
                    }
                    gap = 0.0;
                }
                None if !run.is_empty() => {
                    gap += 1.0;
                    if gap > max_gap {
                        close(&mut run, used.as_mut_slice(), &mut segments);
                        gap = 0.0;
                    }
                }
                None => {}
            }
        }
        close(&mut run, used.as_mut_slice(), &mut segments);
    }
    segments
}

/// Gradient Hough transform for circles. `edges` is the Canny map of `gray` at
/// `param1`; accumulator cells above `accumulator_threshold` become center candidates
/// and each accepted center gets the best-supported radius.
#[allow(clippy::too_many_arguments)]
pub fn hough_circles_gradient(
    gray: &GrayImage,
    edges: &GrayImage,
    dp: f64,
    min_dist: f64,
    accumulator_threshold: f64,
    min_radius: u32,
    max_radius: u32,
) -> LibraryResult<Vec<Circle>> {
    if dp < 1.0 {
        return Err(LibraryError::InvalidParameter(format!("dp must be at least 1, got {dp}")));
    }
    let (width, height) = gray.dimensions();
    let max_radius = if max_radius == 0 { width.max(height) } else { max_radius };
    if max_radius < min_radius {
        return Err(LibraryError::InvalidParameter(format!(
            "maxRadius {max_radius} is below minRadius {min_radius}"
        )));
    }
    let gx = sobel(gray, 1, 0, 3)?;
    let gy = sobel(gray, 0, 1, 3)?;

    let acc_w = ((width as f64 / dp).ceil() as usize).max(1);
    let acc_h = ((height as f64 / dp).ceil() as usize).max(1);
    let mut accumulator = vec![0u32; acc_w * acc_h];
    let mut edge_points = Vec::new();

    for (x, y, edge) in edges.enumerate_pixels() {
        if edge.0[0] == 0 {
            continue;
        }
        let (vx, vy) = (gx.get_pixel(x, y).0[0] as f64, gy.get_pixel(x, y).0[0] as f64);
        let magnitude = vx.hypot(vy);
        if magnitude == 0.0 {
            continue;
        }
        edge_points.push((x as f64, y as f64));
        let (ux, uy) = (vx / magnitude, vy / magnitude);
        for sign in [1.0, -1.0] {
            for radius in min_radius.max(1)..=max_radius {
                let cx = x as f64 + sign * ux * radius as f64;
                let cy = y as f64 + sign * uy * radius as f64;
                if cx < 0.0 || cy < 0.0 || cx >= width as f64 || cy >= height as f64 {
                    break;
                }
                let (ax, ay) = ((cx / dp) as usize, (cy / dp) as usize);
                accumulator[ay * acc_w + ax] += 1;
            }
        }
    }

    let mut centers = Vec::new();
    for ay in 0..acc_h {
        for ax in 0..acc_w {
            let votes = accumulator[ay * acc_w + ax];
            if (votes as f64) <= accumulator_threshold {
                continue;
            }
            let is_peak = (ay.saturating_sub(1)..=(ay + 1).min(acc_h - 1)).all(|ny| {
                (ax.saturating_sub(1)..=(ax + 1).min(acc_w - 1)).all(|nx| {
                    let other = accumulator[ny * acc_w + nx];
                    other < votes || (other == votes && (ny, nx) >= (ay, ax))
                })
            });
            if is_peak {
                centers.push((votes, ax, ay));
            }
        }
    }
    centers.sort_by(|a, b| b.0.cmp(&a.0).then((a.2, a.1).cmp(&(b.2, b.1))));

    let min_dist_sq = min_dist * min_dist;
    let mut circles: Vec<Circle> = Vec::new();
    let mut histogram = vec![0u32; max_radius as usize + 2];
    for (_, ax, ay) in centers {
        let cx = (ax as f64 + 0.5) * dp;
        let cy = (ay as f64 + 0.5) * dp;
        if circles.iter().any(|c| {
            let (dx, dy) = (c.center.0 as f64 - cx, c.center.1 as f64 - cy);
            dx * dx + dy * dy < min_dist_sq
        }) {
            continue;
        }
        histogram.iter_mut().for_each(|bin| *bin = 0);
        for &(ex, ey) in &edge_points {
            let distance = (ex - cx).hypot(ey - cy).round() as u32;
            if distance >= min_radius.max(1) && distance <= max_radius {
                histogram[distance as usize] += 1;
            }
        }
        let best = (min_radius.max(1)..=max_radius)
            .map(|r| (histogram[r as usize] as f64 / r as f64, r))
            .fold(None, |best: Option<(f64, u32)>, candidate| match best {
                Some(b) if b.0 >= candidate.0 => Some(b),
                _ => Some(candidate),
            });
        if let Some((_, radius)) = best {
            if histogram[radius as usize] as f64 >= accumulator_threshold / 2.0 {
                circles.push(Circle { center: (cx as f32, cy as f32), radius: radius as f32 });
            }
        }
    }
    Ok(circles)
}

/// Difference-of-Gaussians scale-space extrema with contrast and edge rejection, each
/// keypoint oriented by its dominant gradient. Strongest first; `max_features == 0`
/// keeps all of them.
pub fn dog_keypoints(gray: &GrayImage, max_features: usize) -> Vec<Keypoint> {
    const LAYERS: usize = 3;
    const SIGMA: f32 = 1.6;
    const CONTRAST: f32 = 0.04;
    const EDGE: f32 = 10.0;
    const BORDER: u32 = 5;

    let (width, height) = gray.dimensions();
    if width.min(height) < 2 * BORDER + 3 {
        return Vec::new();
    }
    let octaves = (((width.min(height) as f32).log2() as i32) - 3).clamp(1, 6) as usize;
    let k = 2f32.powf(1.0 / LAYERS as f32);
    let increments: Vec<f32> = (0..LAYERS + 3)
        .map(|i| {
            if i == 0 {
                (SIGMA * SIGMA - 0.25).sqrt()
            } else {
                let previous = SIGMA * k.powi(i as i32 - 1);
                let total = previous * k;
                (total * total - previous * previous).sqrt()
            }
        })
        .collect();

    let mut base = gaussian_blur_f32(
        &FloatImage::from_fn(width, height, |x, y| Luma([gray.get_pixel(x, y).0[0] as f32 / 255.0])),
        increments[0],
    );
    let prelim = 0.5 * CONTRAST / LAYERS as f32;
    let mut keypoints = Vec::new();

    for octave in 0..octaves {
        let (w, h) = base.dimensions();
        if w.min(h) < 2 * BORDER + 3 {
            break;
        }
        let mut gaussians = vec![base.clone()];
        for sigma in &increments[1..] {
            let next = gaussian_blur_f32(&gaussians[gaussians.len() - 1], *sigma);
            gaussians.push(next);
        }
        let dogs: Vec<Vec<f32>> = gaussians
            .windows(2)
            .map(|pair| pair[1].as_raw().iter().zip(pair[0].as_raw()).map(|(a, b)| a - b).collect())
            .collect();
        let at = |layer: &[f32], x: u32, y: u32| layer[(y * w + x) as usize];
        let scale = (1u32 << octave) as f32;

        for layer in 1..=LAYERS {
            let (below, current, above) = (dogs[layer - 1].as_slice(), dogs[layer].as_slice(), dogs[layer + 1].as_slice());
            for y in BORDER..h - BORDER {
                for x in BORDER..w - BORDER {
                    let value = at(current, x, y);
                    if value.abs() <= prelim {
                        continue;
                    }
                    let mut is_max = true;
                    let mut is_min = true;
                    for plane in [below, current, above] {
                        for ny in y - 1..=y + 1 {
                            for nx in x - 1..=x + 1 {
                                if std::ptr::eq(plane, current) && nx == x && ny == y {
                                    continue;
                                }
                                let other = at(plane, nx, ny);
                                is_max &= value > other;
                                is_min &= value < other;
                            }
                        }
                    }
                    if !(is_max || is_min) || value.abs() < CONTRAST / LAYERS as f32 {
                        continue;
                    }
                    let dxx = at(current, x + 1, y) + at(current, x - 1, y) - 2.0 * value;
                    let dyy = at(current, x, y + 1) + at(current, x, y - 1) - 2.0 * value;
                    let dxy = (at(current, x + 1, y + 1) - at(current, x - 1, y + 1) - at(current, x + 1, y - 1)
                        + at(current, x - 1, y - 1))
                        / 4.0;
                    let trace = dxx + dyy;
                    let det = dxx * dyy - dxy * dxy;
                    if det <= 0.0 || trace * trace * EDGE >= (EDGE + 1.0) * (EDGE + 1.0) * det {
                        continue;
                    }
                    let layer_sigma = SIGMA * 2f32.powf(layer as f32 / LAYERS as f32);
                    keypoints.push(Keypoint {
                        x: x as f32 * scale,
                        y: y as f32 * scale,
                        size: layer_sigma * scale * 2.0,
                        angle: Some(dominant_orientation(&gaussians[layer], x, y, 1.5 * layer_sigma)),
                        response: value.abs(),
                    });
                }
            }
        }
        let source = &gaussians[LAYERS];
        base = FloatImage::from_fn(w / 2, h / 2, |x, y| *source.get_pixel(x * 2, y * 2));
    }

    keypoints.sort_by(|a, b| {
        b.response
            .total_cmp(&a.response)
            .then(a.y.total_cmp(&b.y))
            .then(a.x.total_cmp(&b.x))
    });
    if max_features > 0 {
        keypoints.truncate(max_features);
    }
    keypoints
}

/// Peak of a 36-bin, Gaussian-weighted gradient orientation histogram, in degrees.
fn dominant_orientation(image: &FloatImage, x: u32, y: u32, sigma: f32) -> f32 {
    let radius = (3.0 * sigma).round() as i64;
    let (w, h) = (image.width() as i64, image.height() as i64);
    let mut histogram = [0.0f32; 36];
    let coeff = -1.0 / (2.0 * sigma * sigma);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            let (px, py) = (x as i64 + dx, y as i64 + dy);
            if px <= 0 || py <= 0 || px >= w - 1 || py >= h - 1 {
                continue;
            }
            let sample = |sx: i64, sy: i64| image.get_pixel(sx as u32, sy as u32).0[0];
            let gx = sample(px + 1, py) - sample(px - 1, py);
            let gy = sample(px, py + 1) - sample(px, py - 1);
            let weight = (((dx * dx + dy * dy) as f32) * coeff).exp();
            let degrees = gy.atan2(gx).to_degrees().rem_euclid(360.0);
            let bin = ((degrees / 10.0) as usize).min(35);
            histogram[bin] += weight * gx.hypot(gy);
        }
    }
    let best = histogram
        .iter()
        .enumerate()
        .fold(0, |best, (i, &v)| if v > histogram[best] { i } else { best });
    best as f32 * 10.0 + 5.0
}

/// ORB orientation: angle of the vector from a corner to the intensity centroid of the
/// disc of `radius` around it, in degrees.
pub fn intensity_centroid_angle(gray: &GrayImage, x: u32, y: u32, radius: i64) -> f32 {
    let (w, h) = (gray.width() as i64, gray.height() as i64);
    let (mut m01, mut m10) = (0.0f64, 0.0f64);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dx * dx + dy * dy > radius * radius {
                continue;
            }
            let (px, py) = (x as i64 + dx, y as i64 + dy);
            if px < 0 || py < 0 || px >= w || py >= h {
                continue;
            }
            let value = gray.get_pixel(px as u32, py as u32).0[0] as f64;
            m10 += dx as f64 * value;
            m01 += dy as f64 * value;
        }
    }
    (m01.atan2(m10).to_degrees() as f32).rem_euclid(360.0)
}

/// 3×3 correlation of an RGB image with a reflected border, saturated to 8 bits.
pub fn correlate3x3(image: &RgbImage, kernel: &[f32; 9]) -> RgbImage {
    let (w, h) = (image.width() as i64, image.height() as i64);
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let mut acc = [0.0f32; 3];
        for (tap, weight) in kernel.iter().enumerate() {
            let sx = border_index(x as i64 + (tap % 3) as i64 - 1, w, Border::Reflect101);
            let sy = border_index(y as i64 + (tap / 3) as i64 - 1, h, Border::Reflect101);
            let sample = image.get_pixel(sx as u32, sy as u32);
            for c in 0..3 {
                acc[c] += weight * sample.0[c] as f32;
            }
        }
        Rgb(acc.map(saturate_f32))
    })
}

/// Zero-mean normalized cross-correlation (`TM_CCOEFF_NORMED`). `cross` holds the raw
/// `Σ I·T` for every placement; window sums come from integral images. A constant
/// template scores 1 everywhere.
pub fn ccoeff_normed(image: &GrayImage, template: &GrayImage, cross: &FloatImage) -> FloatImage {
    let (tw, th) = template.dimensions();
    let area = (tw as f64) * (th as f64);
    let template_sum: f64 = template.as_raw().iter().map(|&v| v as f64).sum();
    let template_mean = template_sum / area;
    let template_norm = (template.as_raw().iter().map(|&v| (v as f64).powi(2)).sum::<f64>()
        - area * template_mean * template_mean)
        .max(0.0)
        .sqrt();
    if template_norm < f64::EPSILON {
        return FloatImage::from_pixel(cross.width(), cross.height(), Luma([1.0]));
    }

    let (width, height) = image.dimensions();
    let stride = width as usize + 1;
    let mut sums = vec![0.0f64; stride * (height as usize + 1)];
    let mut squares = vec![0.0f64; stride * (height as usize + 1)];
    for y in 0..height as usize {
        for x in 0..width as usize {
            let v = image.as_raw()[y * width as usize + x] as f64;
            let i = (y + 1) * stride + x + 1;
            sums[i] = v + sums[i - 1] + sums[i - stride] - sums[i - stride - 1];
            squares[i] = v * v + squares[i - 1] + squares[i - stride] - squares[i - stride - 1];
        }
    }
    let window = |table: &[f64], x: usize, y: usize| {
        let (x1, y1) = (x + tw as usize, y + th as usize);
        table[y1 * stride + x1] - table[y * stride + x1] - table[y1 * stride + x] + table[y * stride + x]
    };

    FloatImage::from_fn(cross.width(), cross.height(), |x, y| {
        let (x, y) = (x as usize, y as usize);
        let sum = window(&sums, x, y);
        let variance = (window(&squares, x, y) - sum * sum / area).max(0.0);
        let numerator = cross.get_pixel(x as u32, y as u32).0[0] as f64 - sum * template_mean;
        let denominator = variance.sqrt() * template_norm;
        let score = if numerator.abs() < denominator {
            numerator / denominator
        } else if numerator.abs() < denominator * 1.125 {
            numerator.signum()
        } else {
            0.0
        };
        Luma([score as f32])
    })
}

const WATERSHED_BOUNDARY: i32 = -1;
const IN_QUEUE: i32 = -2;

/// Meyer flooding from the positive markers. The priority of a pixel is the largest
/// per-channel difference to the pixel that queued it. Pixels reached by two different
/// labels, and the one-pixel image frame, become -1.
pub fn watershed_flood(image: &RgbImage, markers: &mut Labels) -> LibraryResult<()> {
    let (width, height) = image.dimensions();
    if markers.width != width || markers.height != height {
        return Err(LibraryError::InvalidParameter(format!(
            "marker map {}x{} does not match image {width}x{height}",
            markers.width, markers.height
        )));
    }
    for x in 0..width {
        markers.set(x, 0, WATERSHED_BOUNDARY);
        markers.set(x, height - 1, WATERSHED_BOUNDARY);
    }
    for y in 0..height {
        markers.set(0, y, WATERSHED_BOUNDARY);
        markers.set(width - 1, y, WATERSHED_BOUNDARY);
    }
    if width < 3 || height < 3 {
        return Ok(());
    }

    let difference = |a: (u32, u32), b: (u32, u32)| -> usize {
        let (pa, pb) = (image.get_pixel(a.0, a.1), image.get_pixel(b.0, b.1));
        (0..3).map(|c| (pa.0[c] as i32 - pb.0[c] as i32).unsigned_abs() as usize).max().unwrap_or(0)
    };
    let neighbors = |x: u32, y: u32| [(x - 1, y), (x + 1, y), (x, y - 1), (x, y + 1)];

    let mut queues: Vec<VecDeque<(u32, u32)>> = vec![VecDeque::new(); 256];
    let mut level = 256usize;

    for y in 1..height - 1 {
        for x in 1..width - 1 {
            if markers.get(x, y) != 0 {
                continue;
            }
            let priority = neighbors(x, y)
                .into_iter()
                .filter(|&(nx, ny)| markers.get(nx, ny) > 0)
                .map(|n| difference((x, y), n))
                .min();
            if let Some(priority) = priority {
                queues[priority].push_back((x, y));
                markers.set(x, y, IN_QUEUE);
                level = level.min(priority);
            }
        }
    }

    while level < 256 {
        let Some((x, y)) = queues[level].pop_front() else {
            level += 1;
            continue;
        };
        let mut label = 0;
        for (nx, ny) in neighbors(x, y) {
            let other = markers.get(nx, ny);
            if other > 0 {
                if label == 0 {
                    label = other;
                } else if label != other {
                    label = WATERSHED_BOUNDARY;
                }
            }
        }
        markers.set(x, y, label);
        if label == WATERSHED_BOUNDARY || label == 0 {
            continue;
        }
        for (nx, ny) in neighbors(x, y) {
            if markers.get(nx, ny) == 0 {
                let priority = difference((nx, ny), (x, y));
                queues[priority].push_back((nx, ny));
                markers.set(nx, ny, IN_QUEUE);
                level = level.min(priority);
            }
        }
    }
    for label in markers.data.iter_mut() {
        if *label == IN_QUEUE {
            *label = WATERSHED_BOUNDARY;
        }
    }
    Ok(())
}

static SRGB_TO_LINEAR_LUT: OnceLock<[f32; 256]> = OnceLock::new();

#[inline]
fn srgb_to_linear(value: u8) -> f32 {
    let table = SRGB_TO_LINEAR_LUT.get_or_init(|| {
        let mut table = [0.0f32; 256];
        for (i, entry) in table.iter_mut().enumerate() {
            let normalized = i as f32 / 255.0;
            *entry = if normalized <= 0.04045 {
                normalized / 12.92
            } else {
                ((normalized + 0.055) / 1.055).powf(2.4)
            };
        }
        table
    });
    table[value as usize]
}

/// CIE L*a*b* under D65.
pub fn rgb_to_lab(pixel: &Rgb<u8>) -> [f32; 3] {
    let [r, g, b] = pixel.0.map(srgb_to_linear);
    let x = (0.412_453 * r + 0.357_580 * g + 0.180_423 * b) / 0.950_456;
    let y = 0.212_671 * r + 0.715_160 * g + 0.072_169 * b;
    let z = (0.019_334 * r + 0.119_193 * g + 0.950_227 * b) / 1.088_754;
    let f = |t: f32| if t > 0.008_856 { t.cbrt() } else { 7.787 * t + 16.0 / 116.0 };
    let (fx, fy, fz) = (f(x), f(y), f(z));
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// SLIC superpixels in L*a*b* space on a regular seed grid, followed by a
/// connectivity pass that folds fragments into a neighbor. Labels start at 1.
pub fn slic(image: &RgbImage, n_segments: u32, compactness: f64) -> LibraryResult<Labels> {
    const ITERATIONS: usize = 10;
    if n_segments == 0 {
        return Err(LibraryError::InvalidParameter("n_segments must be positive".into()));
    }
    if compactness <= 0.0 {
        return Err(LibraryError::InvalidParameter(format!("compactness must be positive, got {compactness}")));
    }
    let (width, height) = image.dimensions();
    let (w, h) = (width as usize, height as usize);
    let lab: Vec<[f32; 3]> = image.pixels().map(rgb_to_lab).collect();

    let step = ((w * h) as f64 / n_segments as f64).sqrt().max(1.0);
    let mut centers: Vec<[f64; 5]> = Vec::new();
    let mut cy = step / 2.0;
    while cy < h as f64 {
        let mut cx = step / 2.0;
        while cx < w as f64 {
            let (px, py) = (cx as usize, cy as usize);
            let [l, a, b] = lab[py * w + px];
            centers.push([py as f64, px as f64, l as f64, a as f64, b as f64]);
            cx += step;
        }
        cy += step;
    }
    if centers.is_empty() {
        centers.push([0.0, 0.0, lab[0][0] as f64, lab[0][1] as f64, lab[0][2] as f64]);
    }

    let spatial_weight = (compactness / step).powi(2);
    let window = (2.0 * step).ceil() as i64;
    let mut assignment = vec![usize::MAX; w * h];
    let mut distance = vec![f64::INFINITY; w * h];

    for _ in 0..ITERATIONS {
        distance.iter_mut().for_each(|d| *d = f64::INFINITY);
        for (index, center) in centers.iter().enumerate() {
            let (y0, x0) = (center[0] as i64, center[1] as i64);
            for y in (y0 - window).max(0)..(y0 + window + 1).min(h as i64) {
                for x in (x0 - window).max(0)..(x0 + window + 1).min(w as i64) {
                    let i = y as usize * w + x as usize;
                    let [l, a, b] = lab[i];
                    let color = (l as f64 - center[2]).powi(2) + (a as f64 - center[3]).powi(2) + (b as f64 - center[4]).powi(2);
                    let spatial = (y as f64 - center[0]).powi(2) + (x as f64 - center[1]).powi(2);
                    let d = color + spatial * spatial_weight;
                    if d < distance[i] {
                        distance[i] = d;
                        assignment[i] = index;
                    }
                }
            }
        }
        let mut sums = vec![[0.0f64; 6]; centers.len()];
        for (i, &index) in assignment.iter().enumerate() {
            if index == usize::MAX {
                continue;
            }
            let [l, a, b] = lab[i];
            let sum = &mut sums[index];
            sum[0] += (i / w) as f64;
            sum[1] += (i % w) as f64;
            sum[2] += l as f64;
            sum[3] += a as f64;
            sum[4] += b as f64;
            sum[5] += 1.0;
        }
        for (center, sum) in centers.iter_mut().zip(&sums) {
            if sum[5] > 0.0 {
                for c in 0..5 {
                    center[c] = sum[c] / sum[5];
                }
            }
        }
    }

    let min_size = ((0.5 * (w * h) as f64 / centers.len() as f64) as usize).max(1);
    Ok(enforce_connectivity(&assignment, width, height, min_size))
}

fn enforce_connectivity(assignment: &[usize], width: u32, height: u32, min_size: usize) -> Labels {
    let (w, h) = (width as usize, height as usize);
    let mut labels = Labels::new(width, height);
    let mut next = 0i32;
    let mut component = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..w * h {
        if labels.data[start] != 0 {
            continue;
        }
        let adjacent = [start.checked_sub(1).filter(|_| start % w != 0), start.checked_sub(w)]
            .into_iter()
            .flatten()
            .map(|i| labels.data[i])
            .find(|&label| label > 0);

        component.clear();
        queue.push_back(start);
        labels.data[start] = -1;
        while let Some(i) = queue.pop_front() {
            component.push(i);
            let (x, y) = (i % w, i / w);
            let mut visit = |j: usize| {
                if labels.data[j] == 0 && assignment[j] == assignment[start] {
                    labels.data[j] = -1;
                    queue.push_back(j);
                }
            };
            if x > 0 {
                visit(i - 1);
            }
            if x + 1 < w {
                visit(i + 1);
            }
            if y > 0 {
                visit(i - w);
            }
            if y + 1 < h {
                visit(i + w);
            }
        }

        let label = match adjacent {
            Some(label) if component.len() < min_size => label,
            _ => {
                next += 1;
                next
            }
        };
        for &i in &component {
            labels.data[i] = label;
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reflect101_mirrors_without_repeating_the_edge() {
        assert_eq!(border_index(-1, 5, Border::Reflect101), 1);
        assert_eq!(border_index(-2, 5, Border::Reflect101), 2);
        assert_eq!(border_index(5, 5, Border::Reflect101), 3);
        assert_eq!(border_index(-3, 5, Border::Replicate), 0);
        assert_eq!(border_index(7, 1, Border::Reflect101), 0);
    }

    #[test]
    fn sobel_kernels_match_opencv() {
        assert_eq!(sobel_kernel(0, 3), vec![1.0, 2.0, 1.0]);
        assert_eq!(sobel_kernel(1, 3), vec![-1.0, 0.0, 1.0]);
        assert_eq!(sobel_kernel(2, 3), vec![1.0, -2.0, 1.0]);
        assert_eq!(sobel_kernel(1, 5), vec![-1.0, -2.0, 0.0, 2.0, 1.0]);
        assert_eq!(sobel_kernel(0, 5), vec![1.0, 4.0, 6.0, 4.0, 1.0]);
    }

    #[test]
    fn gaussian_kernel_is_normalized_and_symmetric() {
        let kernel = gaussian_kernel(5, 0.0);
        let sum: f32 = kernel.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!((kernel[0] - kernel[4]).abs() < 1e-7);
        assert!(kernel[2] > kernel[1]);
        assert_eq!(kernel_for_sigma(2.0), 13);
    }

    #[test]
    fn blur_keeps_a_flat_image_flat() {
        let image = RgbImage::from_pixel(9, 7, Rgb([40, 90, 200]));
        let blurred = gaussian_blur_rgb(&image, (5, 5), 0.0).unwrap();
        assert!(blurred.pixels().all(|p| *p == Rgb([40, 90, 200])));
    }

    #[test]
    fn sobel_finds_a_vertical_step() {
        let gray = GrayImage::from_fn(8, 4, |x, _| Luma([if x < 4 { 0 } else { 100 }]));
        let gx = sobel(&gray, 1, 0, 3).unwrap();
        assert_eq!(gx.get_pixel(1, 1).0[0], 0.0);
        assert!(gx.get_pixel(4, 1).0[0] > 0.0);
        assert!(sobel(&gray, 1, 0, 4).is_err());
    }

    #[test]
    fn harris_peaks_at_a_corner() {
        let gray = GrayImage::from_fn(20, 20, |x, y| Luma([if x >= 10 && y >= 10 { 255 } else { 0 }]));
        let response = harris_response(&gray, 2, 3, 0.04).unwrap();
        let corner = response.get_pixel(10, 10).0[0];
        let edge = response.get_pixel(15, 10).0[0];
        let flat = response.get_pixel(3, 3).0[0];
        assert!(corner > edge);
        assert!(corner > flat);
    }

    #[test]
    fn bilateral_keeps_a_sharp_step() {
        let image = RgbImage::from_fn(12, 6, |x, _| if x < 6 { Rgb([0, 0, 0]) } else { Rgb([250, 250, 250]) });
        let filtered = bilateral(&image, 9, 75.0, 75.0).unwrap();
        assert!(filtered.get_pixel(5, 3).0[0] < 10);
        assert!(filtered.get_pixel(6, 3).0[0] > 240);
    }

    #[test]
    fn adaptive_threshold_marks_bright_spots() {
        let gray = GrayImage::from_fn(21, 21, |x, y| Luma([if x == 10 && y == 10 { 200 } else { 50 }]));
        let binary = adaptive_threshold_gaussian(&gray, 255, 11, 2.0).unwrap();
        assert_eq!(binary.get_pixel(10, 10).0[0], 255);
        assert!(adaptive_threshold_gaussian(&gray, 255, 4, 2.0).is_err());
    }

    #[test]
    fn segments_follow_a_drawn_line() {
        let mut edges = GrayImage::new(40, 40);
        for x in 5..35 {
            edges.put_pixel(x, 20, Luma([255]));
        }
        let segments = segments_along_lines(&edges, &[(20.0, 90.0)], 10.0, 2.0);
        assert_eq!(segments.len(), 1);
        assert!(segments[0].length() >= 28.0);
        assert!(segments_along_lines(&edges, &[(20.0, 90.0)], 50.0, 2.0).is_empty());
    }

    #[test]
    fn identity_correlation_is_a_copy() {
        let image = RgbImage::from_fn(5, 4, |x, y| Rgb([(x * 40) as u8, (y * 50) as u8, 7]));
        let identity = [0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0];
        assert_eq!(correlate3x3(&image, &identity), image);
    }

    #[test]
    fn constant_template_scores_one_everywhere() {
        let image = GrayImage::from_fn(10, 10, |x, y| Luma([(x * y) as u8]));
        let template = GrayImage::from_pixel(3, 3, Luma([128]));
        let cross = FloatImage::new(8, 8);
        let scores = ccoeff_normed(&image, &template, &cross);
        assert!(scores.pixels().all(|p| p.0[0] == 1.0));
    }

    #[test]
    fn ccoeff_finds_the_exact_patch() {
        let image = GrayImage::from_fn(12, 12, |x, y| Luma([((x * 37 + y * 91) % 251) as u8]));
        let template = image::imageops::crop_imm(&image, 4, 5, 3, 3).to_image();
        let cross = FloatImage::from_fn(10, 10, |x, y| {
            let mut acc = 0.0f32;
            for ty in 0..3 {
                for tx in 0..3 {
                    acc += image.get_pixel(x + tx, y + ty).0[0] as f32 * template.get_pixel(tx, ty).0[0] as f32;
                }
            }
            Luma([acc])
        });
        let scores = ccoeff_normed(&image, &template, &cross);
        assert!((scores.get_pixel(4, 5).0[0] - 1.0).abs() < 1e-3);
        assert!(scores.pixels().all(|p| p.0[0] <= 1.0 + 1e-6));
    }

    #[test]
    fn watershed_splits_two_markers() {
        let image = RgbImage::from_fn(12, 6, |x, _| if x < 6 { Rgb([0, 0, 0]) } else { Rgb([200, 200, 200]) });
        let mut markers = Labels::new(12, 6);
        markers.set(2, 3, 1);
        markers.set(9, 3, 2);
        watershed_flood(&image, &mut markers).unwrap();
        assert_eq!(markers.get(0, 0), -1);
        assert_eq!(markers.get(3, 2), 1);
        assert_eq!(markers.get(8, 2), 2);
        assert!(markers.data.iter().all(|&l| l == -1 || l == 1 || l == 2));
    }

    #[test]
    fn slic_labels_cover_the_image() {
        let image = RgbImage::from_fn(40, 40, |x, y| if x < 20 { Rgb([200, 30, 30]) } else if y < 20 { Rgb([30, 200, 30]) } else { Rgb([30, 30, 200]) });
        let labels = slic(&image, 16, 10.0).unwrap();
        assert!(labels.data.iter().all(|&l| l >= 1));
        assert!(labels.max_label() >= 3);
        assert_ne!(labels.get(5, 5), labels.get(35, 35));
        assert!(slic(&image, 0, 10.0).is_err());
    }

    #[test]
    fn dog_finds_a_blob_deterministically() {
        let gray = GrayImage::from_fn(64, 64, |x, y| {
            let d = ((x as f32 - 32.0).powi(2) + (y as f32 - 32.0).powi(2)).sqrt();
            Luma([if d < 5.0 { 255 } else { 0 }])
        });
        let first = dog_keypoints(&gray, 0);
        assert!(!first.is_empty());
        assert_eq!(first, dog_keypoints(&gray, 0));
        assert!(dog_keypoints(&gray, 1).len() <= 1);
    }

    #[test]
    fn lab_of_white_is_full_lightness() {
        let [l, a, b] = rgb_to_lab(&Rgb([255, 255, 255]));
        assert!((l - 100.0).abs() < 0.5);
        assert!(a.abs() < 0.5 && b.abs() < 0.5);
    }
}
