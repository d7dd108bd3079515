// THEORY:
// Detectors return geometry; this module turns geometry into pixels. Keeping all
// drawing here means both library backends produce identically styled overlays and
// the operations stay a few lines of "detect, then draw". Thick strokes are built
// from several 1-px `imageproc` strokes centered on the geometry, which is how
// OpenCV's thickness looks on axis-aligned and near-axis shapes.

use crate::core_modules::library::{BoundingBox, Circle, Keypoint, LineSegment};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

pub const RED: Rgb<u8> = Rgb([255, 0, 0]);
pub const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
pub const BLUE: Rgb<u8> = Rgb([0, 0, 255]);
pub const YELLOW: Rgb<u8> = Rgb([255, 255, 0]);

/// Fixed color cycle for keypoint overlays, so repeated runs draw identical images.
const KEYPOINT_PALETTE: [Rgb<u8>; 8] = [
    Rgb([230, 25, 75]),
    Rgb([60, 180, 75]),
    Rgb([255, 225, 25]),
    Rgb([0, 130, 200]),
    Rgb([245, 130, 48]),
    Rgb([145, 30, 180]),
    Rgb([70, 240, 240]),
    Rgb([240, 50, 230]),
];

/// Offsets covering a `thickness`-wide square brush centered on the stroke.
fn brush(thickness: u32) -> impl Iterator<Item = (i32, i32)> {
    let thickness = thickness.max(1) as i32;
    let start = -(thickness - 1) / 2;
    (start..start + thickness).flat_map(move |dy| (start..start + thickness).map(move |dx| (dx, dy)))
}

pub fn draw_segment(image: &mut RgbImage, segment: &LineSegment, color: Rgb<u8>, thickness: u32) {
    for (dx, dy) in brush(thickness) {
        let start = ((segment.start.0 + dx) as f32, (segment.start.1 + dy) as f32);
        let end = ((segment.end.0 + dx) as f32, (segment.end.1 + dy) as f32);
        draw_line_segment_mut(image, start, end, color);
    }
}

pub fn draw_circle(image: &mut RgbImage, circle: &Circle, color: Rgb<u8>, thickness: u32) {
    let center = (circle.center.0.round() as i32, circle.center.1.round() as i32);
    let radius = circle.radius.round() as i32;
    let thickness = thickness.max(1) as i32;
    let inner = radius - (thickness - 1) / 2;
    for r in inner.max(0)..inner.max(0) + thickness {
        draw_hollow_circle_mut(image, center, r, color);
    }
}

/// Small filled dot, used for circle centers.
pub fn draw_dot(image: &mut RgbImage, center: (f32, f32), radius: i32, color: Rgb<u8>) {
    draw_filled_circle_mut(image, (center.0.round() as i32, center.1.round() as i32), radius, color);
}

/// Outlines `bounds` with a stroke centered on its edges: for even thickness the
/// extra ring falls outside the box.
pub fn draw_box(image: &mut RgbImage, bounds: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    if bounds.width == 0 || bounds.height == 0 {
        return;
    }
    let thickness = thickness.max(1) as i32;
    let outset = thickness / 2;
    for grow in (outset + 1 - thickness..=outset).rev() {
        let width = bounds.width as i32 + 2 * grow;
        let height = bounds.height as i32 + 2 * grow;
        if width <= 0 || height <= 0 {
            break;
        }
        let rect = Rect::at(bounds.x - grow, bounds.y - grow).of_size(width as u32, height as u32);
        draw_hollow_rect_mut(image, rect, color);
    }
}

/// Draws each keypoint as a circle of its size plus, when it has one, a tick from the
/// center along its orientation.
pub fn draw_rich_keypoints(image: &RgbImage, keypoints: &[Keypoint]) -> RgbImage {
    let mut out = image.clone();
    for (index, keypoint) in keypoints.iter().enumerate() {
        let color = KEYPOINT_PALETTE[index % KEYPOINT_PALETTE.len()];
        let radius = (keypoint.size / 2.0).round().max(1.0);
        let center = (keypoint.x.round() as i32, keypoint.y.round() as i32);
        draw_hollow_circle_mut(&mut out, center, radius as i32, color);
        if let Some(angle) = keypoint.angle {
            let radians = angle.to_radians();
            let tip = (keypoint.x + radius * radians.cos(), keypoint.y + radius * radians.sin());
            draw_line_segment_mut(&mut out, (keypoint.x, keypoint.y), tip, color);
        }
    }
    out
}
