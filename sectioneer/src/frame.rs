//! Acquired image frames.
//!
//! A [`Frame`] is a single grayscale acquisition: an `ndarray` of f32
//! intensities plus the physical pixel size it was scanned at. The scoring
//! pipeline works on frames (or views into them) exclusively; conversion to
//! `image::GrayImage` happens only at the filesystem boundary.

use std::path::Path;

use ndarray::{s, Array2, ArrayView2};

use crate::geom::ScanningArea;

/// One grayscale acquisition.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Intensities, row-major `(rows, cols)`.
    pub data: Array2<f32>,
    /// Physical pixel size in metres.
    pub pixel_size: f64,
}

impl Frame {
    pub fn new(data: Array2<f32>, pixel_size: f64) -> Self {
        Self { data, pixel_size }
    }

    /// Frame dimensions as `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        let s = self.data.shape();
        (s[0], s[1])
    }

    /// A single scan line as a 1 x cols frame.
    ///
    /// Returns `None` when `line` is out of range.
    pub fn line(&self, line: usize) -> Option<Frame> {
        let (rows, _) = self.shape();
        if line >= rows {
            return None;
        }
        let row = self.data.slice(s![line..line + 1, ..]).to_owned();
        Some(Frame::new(row, self.pixel_size))
    }

    /// Crops to a fractional scanning area.
    pub fn crop(&self, area: &ScanningArea) -> Frame {
        let (rows, cols) = self.shape();
        let (x, y, w, h) = area.to_pixels(cols, rows);
        let cropped = self.data.slice(s![y..y + h, x..x + w]).to_owned();
        Frame::new(cropped, self.pixel_size)
    }

    /// Read-only view of the intensities.
    pub fn view(&self) -> ArrayView2<'_, f32> {
        self.data.view()
    }

    /// Mean intensity of one row, 0.0 when the row is out of range.
    pub fn row_mean(&self, row: usize) -> f32 {
        let (rows, cols) = self.shape();
        if row >= rows || cols == 0 {
            return 0.0;
        }
        self.data.slice(s![row, ..]).mean().unwrap_or(0.0)
    }

    /// Reads a grayscale image file into a frame, intensities scaled to
    /// `[0, 1]`.
    pub fn load_png(path: &Path, pixel_size: f64) -> Result<Frame, image::ImageError> {
        let img = image::open(path)?.to_luma8();
        let (cols, rows) = img.dimensions();
        let data = Array2::from_shape_fn((rows as usize, cols as usize), |(r, c)| {
            img.get_pixel(c as u32, r as u32).0[0] as f32 / 255.0
        });
        Ok(Frame::new(data, pixel_size))
    }

    /// Writes the frame as an 8-bit grayscale PNG.
    ///
    /// Intensities are min-max normalized; a constant frame maps to black.
    pub fn save_png(&self, path: &Path) -> Result<(), image::ImageError> {
        let (rows, cols) = self.shape();
        let min = self.data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = self.data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let span = if max > min { max - min } else { 1.0 };

        let mut img = image::GrayImage::new(cols as u32, rows as u32);
        for ((r, c), v) in self.data.indexed_iter() {
            let byte = (((v - min) / span) * 255.0).clamp(0.0, 255.0) as u8;
            img.put_pixel(c as u32, r as u32, image::Luma([byte]));
        }
        img.save(path)
    }
}
