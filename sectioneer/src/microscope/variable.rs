//! Typed handles for sweepable microscope variables.
//!
//! Configuration names a variable once; the scheduler resolves it into a
//! [`VariableHandle`] at load time and every subsequent read/write goes
//! through the typed handle, never by string lookup per call.

use crate::config::SweepVariable;
use crate::geom::Point;

use super::{Beam, MicroscopeError};

/// A value a sweep can set: scalar (working distance) or two-axis
/// (stigmation, lens alignment).
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SweepValue {
    Scalar(f64),
    Pair(Point),
}

impl SweepValue {
    /// Scalar payload; the pair magnitude for two-axis values.
    pub fn magnitude(&self) -> f64 {
        match self {
            SweepValue::Scalar(v) => *v,
            SweepValue::Pair(p) => p.radius(),
        }
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            SweepValue::Scalar(v) => Some(*v),
            SweepValue::Pair(_) => None,
        }
    }

    pub fn as_pair(&self) -> Option<Point> {
        match self {
            SweepValue::Pair(p) => Some(*p),
            SweepValue::Scalar(_) => None,
        }
    }
}

impl std::fmt::Display for SweepValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SweepValue::Scalar(v) => write!(f, "{v:.6e}"),
            SweepValue::Pair(p) => write!(f, "({:.6e}, {:.6e})", p.x, p.y),
        }
    }
}

/// Read/write access to one live microscope variable.
#[derive(Clone, Copy, Debug)]
pub struct VariableHandle {
    variable: SweepVariable,
}

impl VariableHandle {
    pub fn new(variable: SweepVariable) -> Self {
        Self { variable }
    }

    pub fn variable(&self) -> SweepVariable {
        self.variable
    }

    /// Reads the live value from the beam.
    pub fn read(&self, beam: &dyn Beam) -> Result<SweepValue, MicroscopeError> {
        let value = match self.variable {
            SweepVariable::WorkingDistance => SweepValue::Scalar(beam.working_distance()?),
            SweepVariable::StigmatorX => SweepValue::Scalar(beam.stigmator()?.x),
            SweepVariable::StigmatorY => SweepValue::Scalar(beam.stigmator()?.y),
            SweepVariable::Stigmator => SweepValue::Pair(beam.stigmator()?),
            SweepVariable::LensAlignmentX => SweepValue::Scalar(beam.lens_alignment()?.x),
            SweepVariable::LensAlignmentY => SweepValue::Scalar(beam.lens_alignment()?.y),
            SweepVariable::LensAlignment => SweepValue::Pair(beam.lens_alignment()?),
        };
        Ok(value)
    }

    /// Writes the live value to the beam.
    ///
    /// Writing a scalar to an x/y component preserves the other component.
    pub fn write(&self, beam: &mut dyn Beam, value: SweepValue) -> Result<(), MicroscopeError> {
        match (self.variable, value) {
            (SweepVariable::WorkingDistance, SweepValue::Scalar(v)) => {
                beam.set_working_distance(v)
            }
            (SweepVariable::StigmatorX, SweepValue::Scalar(v)) => {
                let mut s = beam.stigmator()?;
                s.x = v;
                beam.set_stigmator(s)
            }
            (SweepVariable::StigmatorY, SweepValue::Scalar(v)) => {
                let mut s = beam.stigmator()?;
                s.y = v;
                beam.set_stigmator(s)
            }
            (SweepVariable::Stigmator, SweepValue::Pair(p)) => beam.set_stigmator(p),
            (SweepVariable::LensAlignmentX, SweepValue::Scalar(v)) => {
                let mut a = beam.lens_alignment()?;
                a.x = v;
                beam.set_lens_alignment(a)
            }
            (SweepVariable::LensAlignmentY, SweepValue::Scalar(v)) => {
                let mut a = beam.lens_alignment()?;
                a.y = v;
                beam.set_lens_alignment(a)
            }
            (SweepVariable::LensAlignment, SweepValue::Pair(p)) => beam.set_lens_alignment(p),
            (variable, value) => Err(MicroscopeError::Command {
                command: "set sweep variable",
                reason: format!("{variable:?} cannot take {value:?}"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::microscope::{BeamKind, Microscope, VirtualMicroscope};

    #[test]
    fn test_scalar_component_write_preserves_other_axis() {
        let mut scope = VirtualMicroscope::new();
        let beam = scope.beam(BeamKind::Electron);
        beam.set_stigmator(Point::new(0.1, 0.2)).unwrap();

        let handle = VariableHandle::new(SweepVariable::StigmatorX);
        handle.write(beam, SweepValue::Scalar(0.5)).unwrap();

        assert_eq!(beam.stigmator().unwrap(), Point::new(0.5, 0.2));
    }

    #[test]
    fn test_pair_round_trip() {
        let mut scope = VirtualMicroscope::new();
        let beam = scope.beam(BeamKind::Electron);

        let handle = VariableHandle::new(SweepVariable::Stigmator);
        handle
            .write(beam, SweepValue::Pair(Point::new(-0.3, 0.4)))
            .unwrap();

        assert_eq!(
            handle.read(beam).unwrap(),
            SweepValue::Pair(Point::new(-0.3, 0.4))
        );
        assert!((handle.read(beam).unwrap().magnitude() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_mismatched_value_kind_is_rejected() {
        let mut scope = VirtualMicroscope::new();
        let beam = scope.beam(BeamKind::Electron);

        let handle = VariableHandle::new(SweepVariable::WorkingDistance);
        let err = handle
            .write(beam, SweepValue::Pair(Point::new(1.0, 2.0)))
            .unwrap_err();
        assert!(matches!(err, MicroscopeError::Command { .. }));
    }
}
