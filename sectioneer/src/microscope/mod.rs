//! Microscope collaborator interface.
//!
//! The acquisition engine never talks to a vendor SDK directly; it consumes
//! the [`Beam`] and [`Microscope`] traits. A production build wires a vendor
//! adapter behind these traits, tests and hardware-free runs use
//! [`VirtualMicroscope`](virtual_scope::VirtualMicroscope).
//!
//! Stage moves and large beam shifts are *verified*: after issuing the
//! command the implementation re-reads the position and retries up to a
//! configured trial count until it settles within tolerance. A beam shift
//! that exceeds the deflection range is substituted by a stage move, which
//! callers learn about through the `bool` result of
//! [`Microscope::beam_shift_with_verification`].

pub mod variable;
pub mod virtual_scope;

use thiserror::Error;

use crate::config::ImagePreset;
use crate::frame::Frame;
use crate::geom::{Point, StagePosition};

pub use variable::{SweepValue, VariableHandle};
pub use virtual_scope::VirtualMicroscope;

/// Hardware faults raised by beam or stage commands.
#[derive(Debug, Error)]
pub enum MicroscopeError {
    /// A command was rejected or failed on the hardware side.
    #[error("{command} failed: {reason}")]
    Command { command: &'static str, reason: String },

    /// A verified move did not settle within tolerance.
    #[error("stage move not verified after {trials} trials (residual {residual:.3e} m, tolerance {tolerance:.3e} m)")]
    MoveVerification {
        trials: u32,
        residual: f64,
        tolerance: f64,
    },

    /// No frame is available (acquisition not running / grab failed).
    #[error("frame grab failed: {0}")]
    GrabFailed(String),
}

/// One beam column (electron or ion) and its detector.
pub trait Beam: Send {
    fn working_distance(&self) -> Result<f64, MicroscopeError>;
    fn set_working_distance(&mut self, wd: f64) -> Result<(), MicroscopeError>;

    fn stigmator(&self) -> Result<Point, MicroscopeError>;
    fn set_stigmator(&mut self, value: Point) -> Result<(), MicroscopeError>;

    fn lens_alignment(&self) -> Result<Point, MicroscopeError>;
    fn set_lens_alignment(&mut self, value: Point) -> Result<(), MicroscopeError>;

    fn beam_shift(&self) -> Result<Point, MicroscopeError>;
    fn set_beam_shift(&mut self, value: Point) -> Result<(), MicroscopeError>;

    /// Maximum deflection the beam shift can reach on either axis.
    fn beam_shift_limit(&self) -> f64;

    fn detector_contrast(&self) -> Result<f64, MicroscopeError>;
    fn set_detector_contrast(&mut self, value: f64) -> Result<(), MicroscopeError>;
    fn detector_brightness(&self) -> Result<f64, MicroscopeError>;
    fn set_detector_brightness(&mut self, value: f64) -> Result<(), MicroscopeError>;

    fn blank(&mut self) -> Result<(), MicroscopeError>;
    fn unblank(&mut self) -> Result<(), MicroscopeError>;

    fn start_acquisition(&mut self) -> Result<(), MicroscopeError>;
    fn stop_acquisition(&mut self) -> Result<(), MicroscopeError>;

    /// Grabs one complete frame at the current imaging parameters.
    fn grab_frame(&mut self) -> Result<Frame, MicroscopeError>;

    fn dwell_time(&self) -> Result<f64, MicroscopeError>;
    fn set_dwell_time(&mut self, seconds: f64) -> Result<(), MicroscopeError>;

    fn line_integration(&self) -> Result<u32, MicroscopeError>;
    fn set_line_integration(&mut self, lines: u32) -> Result<(), MicroscopeError>;

    /// Scan resolution as `(columns, rows)`.
    fn resolution(&self) -> Result<(u32, u32), MicroscopeError>;
    fn set_resolution(&mut self, cols: u32, rows: u32) -> Result<(), MicroscopeError>;

    /// Physical pixel size at the current field width, in metres.
    fn pixel_size(&self) -> Result<f64, MicroscopeError>;

    /// Applies a named imaging preset in one go.
    fn apply_preset(&mut self, preset: &ImagePreset) -> Result<(), MicroscopeError> {
        self.set_resolution(preset.resolution[0], preset.resolution[1])?;
        self.set_dwell_time(preset.dwell_time)?;
        self.set_line_integration(preset.line_integration)?;
        Ok(())
    }
}

/// Which beam column is active.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BeamKind {
    Electron,
    Ion,
}

/// The whole instrument: two beam columns plus the stage.
pub trait Microscope: Send {
    fn beam(&mut self, kind: BeamKind) -> &mut dyn Beam;

    /// Raw stage position, unverified.
    fn position(&self) -> Result<StagePosition, MicroscopeError>;

    /// Issues an absolute move, unverified.
    fn move_stage(&mut self, goal: StagePosition) -> Result<(), MicroscopeError>;

    /// Moves the stage and re-reads the position until it settles within
    /// `tolerance`, retrying up to `trials` times.
    fn move_stage_verified(
        &mut self,
        goal: StagePosition,
        trials: u32,
        tolerance: f64,
    ) -> Result<(), MicroscopeError> {
        let mut residual = f64::INFINITY;
        for _ in 0..trials.max(1) {
            self.move_stage(goal)?;
            residual = self.position()?.linear_distance(&goal);
            if residual <= tolerance {
                return Ok(());
            }
        }
        Err(MicroscopeError::MoveVerification {
            trials,
            residual,
            tolerance,
        })
    }

    /// Relative verified move.
    fn move_stage_relative_verified(
        &mut self,
        delta: StagePosition,
        trials: u32,
        tolerance: f64,
    ) -> Result<(), MicroscopeError> {
        let goal = self.position()? + delta;
        self.move_stage_verified(goal, trials, tolerance)
    }

    /// Conversion factor from electron beam shift to stage travel.
    ///
    /// Beam shift and stage axes are not generally parallel; the virtual
    /// implementation uses 1.0.
    fn beam_shift_to_stage_move(&self) -> f64 {
        1.0
    }

    /// Applies an absolute electron beam shift, substituting a stage move
    /// when the shift exceeds the deflection range.
    ///
    /// Returns `true` when the shift was applied as a beam shift, `false`
    /// when a stage move was substituted (the beam shift is then re-zeroed).
    fn beam_shift_with_verification(
        &mut self,
        shift: Point,
        trials: u32,
        tolerance: f64,
    ) -> Result<bool, MicroscopeError> {
        let factor = self.beam_shift_to_stage_move();
        let beam = self.beam(BeamKind::Electron);
        let limit = beam.beam_shift_limit();

        if shift.x.abs() <= limit && shift.y.abs() <= limit {
            beam.set_beam_shift(shift)?;
            return Ok(true);
        }

        tracing::warn!(
            x = shift.x,
            y = shift.y,
            limit,
            "beam shift out of range, substituting stage move"
        );
        beam.set_beam_shift(Point::default())?;
        let delta = StagePosition::lateral(shift.x * factor, shift.y * factor);
        self.move_stage_relative_verified(delta, trials, tolerance)?;
        Ok(false)
    }
}
