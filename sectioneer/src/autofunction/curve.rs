//! Diagnostic value-vs-score curve rendering.
//!
//! One PNG per completed pass: candidate magnitude on x, mean criterion
//! score on y, samples joined by straight segments. Enough to eyeball
//! whether the sweep bracketed the optimum; plotting beyond that belongs in
//! the GUI.

use std::path::Path;

use image::{Rgb, RgbImage};

use crate::microscope::SweepValue;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const MARGIN: u32 = 40;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([80, 80, 80]);
const CURVE: Rgb<u8> = Rgb([30, 90, 200]);
const MARKER: Rgb<u8> = Rgb([200, 60, 30]);

/// Renders the candidate means to `path`. Two-axis candidates plot their
/// magnitude on x.
pub fn save_curve(
    candidates: &[(SweepValue, f64)],
    path: &Path,
) -> Result<(), image::ImageError> {
    let mut points: Vec<(f64, f64)> = candidates
        .iter()
        .map(|(value, score)| (value.magnitude(), *score))
        .collect();
    points.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);
    draw_axes(&mut img);

    if !points.is_empty() {
        let (x_min, x_max) = span(points.iter().map(|p| p.0));
        let (y_min, y_max) = span(points.iter().map(|p| p.1));

        let to_px = |(x, y): (f64, f64)| {
            let fx = (x - x_min) / (x_max - x_min);
            let fy = (y - y_min) / (y_max - y_min);
            let px = MARGIN as f64 + fx * (WIDTH - 2 * MARGIN) as f64;
            let py = (HEIGHT - MARGIN) as f64 - fy * (HEIGHT - 2 * MARGIN) as f64;
            (px as i64, py as i64)
        };

        for pair in points.windows(2) {
            draw_segment(&mut img, to_px(pair[0]), to_px(pair[1]), CURVE);
        }
        for &point in &points {
            draw_marker(&mut img, to_px(point), MARKER);
        }
    }

    img.save(path)
}

/// Min/max with a small synthetic span for degenerate inputs.
fn span(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (mut min, mut max) = (f64::INFINITY, f64::NEG_INFINITY);
    for v in values {
        min = min.min(v);
        max = max.max(v);
    }
    if !min.is_finite() || !max.is_finite() {
        return (0.0, 1.0);
    }
    if max - min < f64::EPSILON {
        (min - 0.5, max + 0.5)
    } else {
        (min, max)
    }
}

fn draw_axes(img: &mut RgbImage) {
    for x in MARGIN..WIDTH - MARGIN {
        img.put_pixel(x, HEIGHT - MARGIN, AXIS);
    }
    for y in MARGIN..=HEIGHT - MARGIN {
        img.put_pixel(MARGIN, y, AXIS);
    }
}

fn draw_segment(img: &mut RgbImage, from: (i64, i64), to: (i64, i64), color: Rgb<u8>) {
    let steps = (to.0 - from.0).abs().max((to.1 - from.1).abs()).max(1);
    for i in 0..=steps {
        let x = from.0 + (to.0 - from.0) * i / steps;
        let y = from.1 + (to.1 - from.1) * i / steps;
        put_clamped(img, x, y, color);
    }
}

fn draw_marker(img: &mut RgbImage, (x, y): (i64, i64), color: Rgb<u8>) {
    for dx in -2..=2 {
        for dy in -2..=2 {
            put_clamped(img, x + dx, y + dy, color);
        }
    }
}

fn put_clamped(img: &mut RgbImage, x: i64, y: i64, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < WIDTH && (y as u32) < HEIGHT {
        img.put_pixel(x as u32, y as u32, color);
    }
}
