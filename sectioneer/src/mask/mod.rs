//! Region masking for criterion evaluation and drift tracking.
//!
//! The engine consumes masks through the [`MaskModel`] trait: a production
//! deployment can plug a segmentation-model adapter behind it, while the
//! built-in implementations cover fixed fractional rectangles
//! ([`RectMask`]) and thresholded binary masks ([`BinaryMask`]).
//!
//! `get_masked_images` returning `None` signals *masking insufficiency*:
//! not enough masked pixels to score meaningfully. Callers treat that as a
//! soft failure and fall back to the unmasked frame.

use ndarray::Array2;

use crate::config::MaskConfig;
use crate::frame::Frame;
use crate::geom::Point;

/// Mask collaborator consumed by scoring and drift correction.
pub trait MaskModel: Send {
    /// Refreshes the mask from a newly acquired frame.
    fn update_img(&mut self, frame: &Frame);

    /// Masked sub-images of `frame`; restricted to one scan line when
    /// `line` is given. `None` means not enough masked pixels.
    fn get_masked_images(&self, frame: &Frame, line: Option<usize>) -> Option<Vec<Frame>>;

    /// Mask centroid in pixel coordinates of the last updated frame.
    fn get_center(&self) -> Option<Point>;
}

/// Fixed fractional rectangles from configuration.
#[derive(Clone, Debug)]
pub struct RectMask {
    config: MaskConfig,
    frame_shape: Option<(usize, usize)>,
}

impl RectMask {
    pub fn new(config: MaskConfig) -> Self {
        Self {
            config,
            frame_shape: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

impl MaskModel for RectMask {
    fn update_img(&mut self, frame: &Frame) {
        self.frame_shape = Some(frame.shape());
    }

    fn get_masked_images(&self, frame: &Frame, line: Option<usize>) -> Option<Vec<Frame>> {
        let (rows, cols) = frame.shape();
        let total = (rows * cols) as f64;
        let mut regions = Vec::new();

        for area in &self.config.areas {
            let (x, y, w, h) = area.to_pixels(cols, rows);
            if w == 0 || h == 0 {
                continue;
            }
            if (w * h) as f64 / total < self.config.min_fraction {
                continue;
            }
            match line {
                None => {
                    let cropped = frame.crop(area);
                    regions.push(cropped);
                }
                Some(l) => {
                    // only regions the line actually crosses contribute
                    if l >= y && l < y + h {
                        if let Some(full_line) = frame.line(l) {
                            let sliced = Frame::new(
                                full_line.data.slice(ndarray::s![.., x..x + w]).to_owned(),
                                frame.pixel_size,
                            );
                            regions.push(sliced);
                        }
                    }
                }
            }
        }

        if regions.is_empty() {
            None
        } else {
            Some(regions)
        }
    }

    fn get_center(&self) -> Option<Point> {
        let (rows, cols) = self.frame_shape?;
        if self.config.areas.is_empty() {
            return None;
        }
        let mut cx = 0.0;
        let mut cy = 0.0;
        for area in &self.config.areas {
            let c = area.center();
            cx += c.x * cols as f64;
            cy += c.y * rows as f64;
        }
        let n = self.config.areas.len() as f64;
        Some(Point::new(cx / n, cy / n))
    }
}

/// Intensity-thresholded binary mask.
///
/// On every update the frame is thresholded, connected components are
/// labelled and the largest inscribed rectangle of each component becomes a
/// scoring region. Stands in for a segmentation-model mask in virtual runs.
#[derive(Clone, Debug)]
pub struct BinaryMask {
    threshold: f32,
    min_fraction: f64,
    rectangles: Vec<PixelRect>,
    centroid: Option<Point>,
    frame_shape: Option<(usize, usize)>,
}

/// A pixel-space rectangle `(x, y, width, height)`.
pub type PixelRect = (usize, usize, usize, usize);

impl BinaryMask {
    pub fn new(threshold: f32, min_fraction: f64) -> Self {
        Self {
            threshold,
            min_fraction,
            rectangles: Vec::new(),
            centroid: None,
            frame_shape: None,
        }
    }

    pub fn rectangles(&self) -> &[PixelRect] {
        &self.rectangles
    }
}

impl MaskModel for BinaryMask {
    fn update_img(&mut self, frame: &Frame) {
        let mask = frame.data.mapv(|v| v > self.threshold);
        self.frame_shape = Some(frame.shape());
        self.rectangles = largest_rectangles(&mask);

        let count = mask.iter().filter(|&&m| m).count();
        self.centroid = if count == 0 {
            None
        } else {
            let mut cx = 0.0;
            let mut cy = 0.0;
            for ((r, c), &m) in mask.indexed_iter() {
                if m {
                    cx += c as f64;
                    cy += r as f64;
                }
            }
            Some(Point::new(cx / count as f64, cy / count as f64))
        };
    }

    fn get_masked_images(&self, frame: &Frame, line: Option<usize>) -> Option<Vec<Frame>> {
        let (rows, cols) = frame.shape();
        let total = (rows * cols) as f64;
        let mut regions = Vec::new();

        for &(x, y, w, h) in &self.rectangles {
            if w == 0 || h == 0 || (w * h) as f64 / total < self.min_fraction {
                continue;
            }
            let x1 = (x + w).min(cols);
            let y1 = (y + h).min(rows);
            match line {
                None => {
                    let region = frame.data.slice(ndarray::s![y..y1, x..x1]).to_owned();
                    regions.push(Frame::new(region, frame.pixel_size));
                }
                Some(l) => {
                    if l >= y && l < y1 {
                        let region = frame.data.slice(ndarray::s![l..l + 1, x..x1]).to_owned();
                        regions.push(Frame::new(region, frame.pixel_size));
                    }
                }
            }
        }

        if regions.is_empty() {
            None
        } else {
            Some(regions)
        }
    }

    fn get_center(&self) -> Option<Point> {
        self.centroid
    }
}

/// Largest inscribed axis-aligned rectangle of every connected component.
///
/// Components use 8-connectivity. The per-component search is the classic
/// histogram dynamic program over mask rows.
pub fn largest_rectangles(mask: &Array2<bool>) -> Vec<PixelRect> {
    let (rows, cols) = (mask.shape()[0], mask.shape()[1]);
    let mut labels: Array2<u32> = Array2::zeros((rows, cols));
    let mut next_label = 0u32;

    // 8-connected component labelling via BFS
    for r in 0..rows {
        for c in 0..cols {
            if !mask[[r, c]] || labels[[r, c]] != 0 {
                continue;
            }
            next_label += 1;
            let mut queue = std::collections::VecDeque::from([(r, c)]);
            labels[[r, c]] = next_label;
            while let Some((qr, qc)) = queue.pop_front() {
                for dr in -1i64..=1 {
                    for dc in -1i64..=1 {
                        let nr = qr as i64 + dr;
                        let nc = qc as i64 + dc;
                        if nr < 0 || nc < 0 || nr >= rows as i64 || nc >= cols as i64 {
                            continue;
                        }
                        let (nr, nc) = (nr as usize, nc as usize);
                        if mask[[nr, nc]] && labels[[nr, nc]] == 0 {
                            labels[[nr, nc]] = next_label;
                            queue.push_back((nr, nc));
                        }
                    }
                }
            }
        }
    }

    let mut rectangles = Vec::with_capacity(next_label as usize);
    for label in 1..=next_label {
        let mut heights = vec![0usize; cols];
        let mut best_area = 0usize;
        let mut best: PixelRect = (0, 0, 0, 0);

        for r in 0..rows {
            for c in 0..cols {
                heights[c] = if labels[[r, c]] == label {
                    heights[c] + 1
                } else {
                    0
                };
            }
            for c in 0..cols {
                if heights[c] == 0 {
                    continue;
                }
                let mut min_height = heights[c];
                for k in (0..=c).rev() {
                    if heights[k] == 0 {
                        break;
                    }
                    min_height = min_height.min(heights[k]);
                    let area = min_height * (c - k + 1);
                    if area > best_area {
                        best_area = area;
                        best = (k, r + 1 - min_height, c - k + 1, min_height);
                    }
                }
            }
        }
        if best_area > 0 {
            rectangles.push(best);
        }
    }
    rectangles
}
