//! Image-quality (resolution) scoring.
//!
//! A [`CriterionEvaluator`] turns one frame (or masked sub-regions of it,
//! or a single scan line) into a scalar score. The pipeline is: crop a
//! border fraction, optionally split into tiles sized from a physical tile
//! length, score every tile with the configured criterion function, reduce
//! tile scores with one configured reducer, and reduce across masked regions
//! with a second one.
//!
//! # Failure absorption
//!
//! Scoring faults stay inside this module: a tile whose criterion fails is
//! skipped and logged; when *every* tile of a region fails the region scores
//! `0` with an error log. The public boundary never returns `NaN` and never
//! propagates a scoring error. Masking insufficiency falls back to the
//! unmasked frame.
//!
//! # Concurrency
//!
//! [`CriterionEvaluator::score_async`] spawns a short-lived worker thread
//! and hands back a [`ScoreHandle`]. The handle is `#[must_use]`: the owner
//! stores it and joins it before the shared state the worker reads is
//! touched again: join-by-handle, never by timing.

pub mod math;
mod worker;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::config::{CriterionConfig, CriterionKind};
use crate::frame::Frame;
use crate::mask::MaskModel;

pub use worker::ScoreHandle;

/// Scoring faults, absorbed at the tile/region boundary.
#[derive(Debug, Error)]
pub enum CriterionError {
    #[error("empty input image")]
    EmptyInput,

    #[error("input too small: {rows}x{cols}")]
    InputTooSmall { rows: usize, cols: usize },

    #[error("constant input image")]
    ConstantInput,

    #[error("correlation never crossed the threshold")]
    NoThresholdCrossing,

    #[error("criterion produced a non-finite value")]
    NonFinite,
}

/// Configured scoring pipeline for one named criterion.
#[derive(Clone, Debug)]
pub struct CriterionEvaluator {
    config: CriterionConfig,
}

impl CriterionEvaluator {
    pub fn new(config: CriterionConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> CriterionKind {
        self.config.criterion
    }

    /// Scores one frame, with optional masking and line restriction.
    ///
    /// Never returns `NaN`; all scoring faults collapse to `0.0` with a log
    /// entry.
    pub fn score(
        &self,
        frame: &Frame,
        mask: Option<&dyn MaskModel>,
        line: Option<usize>,
    ) -> f64 {
        let regions = self.extract_regions(frame, mask, line);
        self.score_regions(&regions)
    }

    /// The sub-frames that scoring will run on: masked regions when a mask
    /// yields enough pixels, otherwise the whole frame (or requested line).
    pub fn extract_regions(
        &self,
        frame: &Frame,
        mask: Option<&dyn MaskModel>,
        line: Option<usize>,
    ) -> Vec<Frame> {
        if let Some(mask) = mask {
            match mask.get_masked_images(frame, line) {
                Some(regions) => return regions,
                None => {
                    error!(
                        criterion = %self.config.name,
                        "not enough masked pixels, masking omitted"
                    );
                }
            }
        }
        match line {
            Some(l) => frame.line(l).into_iter().collect(),
            None => vec![frame.clone()],
        }
    }

    /// Reduces the per-region scores with the configured region reducer.
    pub fn score_regions(&self, regions: &[Frame]) -> f64 {
        if regions.is_empty() {
            error!(criterion = %self.config.name, "no regions to score");
            return 0.0;
        }
        let scores: Vec<f64> = regions.iter().map(|r| self.region_score(r)).collect();
        self.config.final_regions_resolution.reduce(&scores)
    }

    /// Border crop, tiling and tile-score reduction for one region.
    fn region_score(&self, region: &Frame) -> f64 {
        let (rows, cols) = region.shape();
        if rows == 0 || cols == 0 {
            error!(criterion = %self.config.name, "empty region");
            return 0.0;
        }

        // scan lines cannot be tiled
        if rows == 1 || cols == 1 {
            return match self.tile_score(region.view(), region.pixel_size) {
                Ok(score) => score,
                Err(e) => {
                    error!(criterion = %self.config.name, error = %e, "line scoring failed");
                    0.0
                }
            };
        }

        let cropped = self.crop_border(region);
        let tiles = self.tiles(&cropped);

        let mut scores = Vec::with_capacity(tiles.len());
        for tile in &tiles {
            match self.tile_score(tile.view(), cropped.pixel_size) {
                Ok(score) => scores.push(score),
                Err(e) => {
                    warn!(criterion = %self.config.name, error = %e, "tile scoring failed, skipping tile");
                }
            }
        }
        debug!(
            criterion = %self.config.name,
            tiles = tiles.len(),
            scored = scores.len(),
            "region tiled"
        );

        if scores.is_empty() {
            error!(criterion = %self.config.name, "all tiles failed, region scores 0");
            0.0
        } else {
            self.config.final_resolution.reduce(&scores)
        }
    }

    fn crop_border(&self, region: &Frame) -> Frame {
        let (rows, cols) = region.shape();
        let border_r = (rows as f64 * self.config.border) as usize;
        let border_c = (cols as f64 * self.config.border) as usize;
        if border_r == 0 && border_c == 0 {
            return region.clone();
        }
        let data = region
            .data
            .slice(ndarray::s![
                border_r..rows - border_r,
                border_c..cols - border_c
            ])
            .to_owned();
        Frame::new(data, region.pixel_size)
    }

    /// Non-overlapping tile grid; the whole region when tiling is disabled
    /// or the tile would not fit.
    fn tiles(&self, region: &Frame) -> Vec<Frame> {
        let (rows, cols) = region.shape();
        if self.config.tile_size <= 0.0 {
            return vec![region.clone()];
        }

        let mut tile_px = (self.config.tile_size / region.pixel_size) as usize;
        tile_px -= tile_px % 4; // FRC splits need a multiple of 4
        if tile_px < 4 || tile_px > rows || tile_px > cols {
            return vec![region.clone()];
        }

        let mut tiles = Vec::new();
        let mut r = 0;
        while r + tile_px <= rows {
            let mut c = 0;
            while c + tile_px <= cols {
                let data = region
                    .data
                    .slice(ndarray::s![r..r + tile_px, c..c + tile_px])
                    .to_owned();
                tiles.push(Frame::new(data, region.pixel_size));
                c += tile_px;
            }
            r += tile_px;
        }
        tiles
    }

    fn tile_score(
        &self,
        view: ndarray::ArrayView2<'_, f32>,
        pixel_size: f64,
    ) -> Result<f64, CriterionError> {
        let [lowest, highest] = self.config.detail;
        let score = match self.config.criterion {
            CriterionKind::Bandpass => {
                math::bandpass_energy(&view, pixel_size, lowest, highest)?
            }
            CriterionKind::BandpassVar => {
                math::bandpass_variance(&view, pixel_size, lowest, highest)?
            }
            CriterionKind::Fft => math::fft_band_energy(&view, pixel_size, lowest, highest)?,
            CriterionKind::Frc => math::frc_resolution(&view, pixel_size)?,
        };
        if !score.is_finite() {
            return Err(CriterionError::NonFinite);
        }
        Ok(score)
    }

    /// Scores regions on a worker thread; see [`ScoreHandle`].
    ///
    /// `finalize` runs on the worker after scoring with
    /// `(score, slice_number)`.
    pub fn score_async<F>(
        &self,
        regions: Vec<Frame>,
        slice_number: u64,
        finalize: F,
    ) -> ScoreHandle
    where
        F: FnOnce(f64, u64) + Send + 'static,
    {
        worker::spawn(self.clone(), regions, slice_number, finalize)
    }
}
