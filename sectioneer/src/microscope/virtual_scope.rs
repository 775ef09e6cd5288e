//! In-memory microscope for tests and hardware-free runs.
//!
//! `VirtualMicroscope` honours the full [`Beam`]/[`Microscope`] contract with
//! plain field storage and synthesizes frames whose sharpness depends on how
//! far the working distance and stigmator sit from their ideal values. That
//! makes the autofunctions genuinely optimizable against it: sweeping the
//! working distance towards `ideal_working_distance` raises every focus
//! criterion.

use ndarray::Array2;

use crate::frame::Frame;
use crate::geom::{Point, StagePosition};

use super::{Beam, BeamKind, Microscope, MicroscopeError};

/// Default electron working distance the synthetic sample is in focus at.
pub const IDEAL_WORKING_DISTANCE: f64 = 4e-3;

/// Beam shift deflection range on either axis (metres).
const BEAM_SHIFT_LIMIT: f64 = 50e-6;

/// One simulated beam column.
#[derive(Clone, Debug)]
pub struct VirtualBeam {
    working_distance: f64,
    stigmator: Point,
    lens_alignment: Point,
    beam_shift: Point,
    contrast: f64,
    brightness: f64,
    blanked: bool,
    acquiring: bool,
    dwell_time: f64,
    line_integration: u32,
    resolution: (u32, u32),
    horizontal_field_width: f64,
    /// Working distance at which the synthetic sample is sharp.
    pub ideal_working_distance: f64,
    /// Stigmation at which the synthetic sample is sharp.
    pub ideal_stigmator: Point,
    frames_grabbed: u64,
}

impl VirtualBeam {
    fn new() -> Self {
        Self {
            working_distance: IDEAL_WORKING_DISTANCE,
            stigmator: Point::default(),
            lens_alignment: Point::default(),
            beam_shift: Point::default(),
            contrast: 0.5,
            brightness: 0.5,
            blanked: false,
            acquiring: false,
            dwell_time: 1e-6,
            line_integration: 1,
            resolution: (512, 384),
            horizontal_field_width: 10e-6,
            ideal_working_distance: IDEAL_WORKING_DISTANCE,
            ideal_stigmator: Point::default(),
            frames_grabbed: 0,
        }
    }

    /// Sharpness in (0, 1]: 1.0 in perfect focus, falling off with defocus
    /// and stigmation distance.
    fn sharpness(&self) -> f64 {
        let defocus = (self.working_distance - self.ideal_working_distance).abs();
        let stig = (self.stigmator - self.ideal_stigmator).radius();
        let defocus_term = (-(defocus / 2e-6).powi(2)).exp();
        let stig_term = (-(stig / 0.5).powi(2)).exp();
        (defocus_term * stig_term).max(1e-3)
    }

    /// Deterministic per-pixel noise in [0, 1).
    fn noise(r: usize, c: usize, seed: u64) -> f32 {
        let mut h = seed
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            .wrapping_add((r as u64) << 32 | c as u64);
        h ^= h >> 33;
        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
        h ^= h >> 33;
        (h & 0xffff) as f32 / 65536.0
    }
}

impl Beam for VirtualBeam {
    fn working_distance(&self) -> Result<f64, MicroscopeError> {
        Ok(self.working_distance)
    }

    fn set_working_distance(&mut self, wd: f64) -> Result<(), MicroscopeError> {
        self.working_distance = wd;
        Ok(())
    }

    fn stigmator(&self) -> Result<Point, MicroscopeError> {
        Ok(self.stigmator)
    }

    fn set_stigmator(&mut self, value: Point) -> Result<(), MicroscopeError> {
        self.stigmator = value;
        Ok(())
    }

    fn lens_alignment(&self) -> Result<Point, MicroscopeError> {
        Ok(self.lens_alignment)
    }

    fn set_lens_alignment(&mut self, value: Point) -> Result<(), MicroscopeError> {
        self.lens_alignment = value;
        Ok(())
    }

    fn beam_shift(&self) -> Result<Point, MicroscopeError> {
        Ok(self.beam_shift)
    }

    fn set_beam_shift(&mut self, value: Point) -> Result<(), MicroscopeError> {
        if value.x.abs() > BEAM_SHIFT_LIMIT || value.y.abs() > BEAM_SHIFT_LIMIT {
            return Err(MicroscopeError::Command {
                command: "set_beam_shift",
                reason: format!("({}, {}) outside deflection range", value.x, value.y),
            });
        }
        self.beam_shift = value;
        Ok(())
    }

    fn beam_shift_limit(&self) -> f64 {
        BEAM_SHIFT_LIMIT
    }

    fn detector_contrast(&self) -> Result<f64, MicroscopeError> {
        Ok(self.contrast)
    }

    fn set_detector_contrast(&mut self, value: f64) -> Result<(), MicroscopeError> {
        self.contrast = value.clamp(0.0, 1.0);
        Ok(())
    }

    fn detector_brightness(&self) -> Result<f64, MicroscopeError> {
        Ok(self.brightness)
    }

    fn set_detector_brightness(&mut self, value: f64) -> Result<(), MicroscopeError> {
        self.brightness = value.clamp(0.0, 1.0);
        Ok(())
    }

    fn blank(&mut self) -> Result<(), MicroscopeError> {
        self.blanked = true;
        Ok(())
    }

    fn unblank(&mut self) -> Result<(), MicroscopeError> {
        self.blanked = false;
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<(), MicroscopeError> {
        self.acquiring = true;
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<(), MicroscopeError> {
        self.acquiring = false;
        Ok(())
    }

    fn grab_frame(&mut self) -> Result<Frame, MicroscopeError> {
        let (cols, rows) = self.resolution;
        let (cols, rows) = (cols as usize, rows as usize);
        let sharpness = self.sharpness() as f32;
        let seed = self.frames_grabbed;
        self.frames_grabbed += 1;

        // low-frequency structure everywhere, high-frequency texture scaled
        // by focus quality
        let mut data = Array2::zeros((rows, cols));
        for ((r, c), v) in data.indexed_iter_mut() {
            let x = c as f32 / cols as f32;
            let y = r as f32 / rows as f32;
            let low = 0.5
                + 0.25 * (x * 6.0 * std::f32::consts::PI).sin()
                + 0.15 * (y * 4.0 * std::f32::consts::PI).cos();
            let high = Self::noise(r, c, seed) - 0.5;
            let value = self.brightness as f32 + self.contrast as f32 * (low - 0.5)
                + sharpness * high * 0.5;
            *v = if self.blanked { 0.0 } else { value.clamp(0.0, 1.5) };
        }
        Ok(Frame::new(data, self.pixel_size()?))
    }

    fn dwell_time(&self) -> Result<f64, MicroscopeError> {
        Ok(self.dwell_time)
    }

    fn set_dwell_time(&mut self, seconds: f64) -> Result<(), MicroscopeError> {
        self.dwell_time = seconds;
        Ok(())
    }

    fn line_integration(&self) -> Result<u32, MicroscopeError> {
        Ok(self.line_integration)
    }

    fn set_line_integration(&mut self, lines: u32) -> Result<(), MicroscopeError> {
        self.line_integration = lines.max(1);
        Ok(())
    }

    fn resolution(&self) -> Result<(u32, u32), MicroscopeError> {
        Ok(self.resolution)
    }

    fn set_resolution(&mut self, cols: u32, rows: u32) -> Result<(), MicroscopeError> {
        self.resolution = (cols, rows);
        Ok(())
    }

    fn pixel_size(&self) -> Result<f64, MicroscopeError> {
        Ok(self.horizontal_field_width / self.resolution.0 as f64)
    }
}

/// Simulated instrument: electron + ion columns and an ideal stage.
#[derive(Clone, Debug)]
pub struct VirtualMicroscope {
    electron: VirtualBeam,
    ion: VirtualBeam,
    stage: StagePosition,
}

impl VirtualMicroscope {
    pub fn new() -> Self {
        Self {
            electron: VirtualBeam::new(),
            ion: VirtualBeam::new(),
            stage: StagePosition::default(),
        }
    }

    /// Mutable access to the electron column for test setup.
    pub fn electron_mut(&mut self) -> &mut VirtualBeam {
        &mut self.electron
    }
}

impl Default for VirtualMicroscope {
    fn default() -> Self {
        Self::new()
    }
}

impl Microscope for VirtualMicroscope {
    fn beam(&mut self, kind: BeamKind) -> &mut dyn Beam {
        match kind {
            BeamKind::Electron => &mut self.electron,
            BeamKind::Ion => &mut self.ion,
        }
    }

    fn position(&self) -> Result<StagePosition, MicroscopeError> {
        Ok(self.stage)
    }

    fn move_stage(&mut self, goal: StagePosition) -> Result<(), MicroscopeError> {
        self.stage = goal;
        Ok(())
    }
}
