//! Stored electron-column state.
//!
//! The optimized beam parameters survive process restarts through a small
//! YAML file: captured after every autofunction pass, re-applied at the
//! start of each cycle before corrections run.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::geom::Point;
use crate::microscope::{Beam, MicroscopeError};

#[derive(Debug, Error)]
pub enum BeamStateError {
    #[error("failed to access beam state file {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse beam state: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Microscope(#[from] MicroscopeError),
}

/// The persisted subset of the electron column.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeamState {
    pub working_distance: f64,
    pub stigmator: Point,
    pub lens_alignment: Point,
}

impl BeamState {
    /// Reads the live values off the beam.
    pub fn capture(beam: &dyn Beam) -> Result<Self, MicroscopeError> {
        Ok(Self {
            working_distance: beam.working_distance()?,
            stigmator: beam.stigmator()?,
            lens_alignment: beam.lens_alignment()?,
        })
    }

    /// Writes the stored values back to the beam.
    pub fn apply(&self, beam: &mut dyn Beam) -> Result<(), MicroscopeError> {
        beam.set_working_distance(self.working_distance)?;
        beam.set_stigmator(self.stigmator)?;
        beam.set_lens_alignment(self.lens_alignment)?;
        Ok(())
    }

    /// Loads the state file; `None` when no file exists yet (first run).
    pub fn load(path: &Path) -> Result<Option<Self>, BeamStateError> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(path).map_err(|source| BeamStateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Some(serde_yaml::from_str(&raw)?))
    }

    pub fn save(&self, path: &Path) -> Result<(), BeamStateError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| BeamStateError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
        fs::write(path, serde_yaml::to_string(self)?).map_err(|source| BeamStateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "beam state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::microscope::{BeamKind, Microscope, VirtualMicroscope};

    #[test]
    fn test_state_round_trips_through_file_and_beam() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("beam.yaml");

        let state = BeamState {
            working_distance: 4.2e-3,
            stigmator: Point::new(0.1, -0.2),
            lens_alignment: Point::new(0.01, 0.02),
        };
        state.save(&path).unwrap();

        let loaded = BeamState::load(&path).unwrap().unwrap();
        assert_eq!(loaded, state);

        let mut scope = VirtualMicroscope::new();
        let beam = scope.beam(BeamKind::Electron);
        loaded.apply(beam).unwrap();
        assert_eq!(BeamState::capture(beam).unwrap(), state);
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BeamState::load(&dir.path().join("nope.yaml"))
            .unwrap()
            .is_none());
    }
}
