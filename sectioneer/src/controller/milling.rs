//! Slice milling collaborator.
//!
//! Pattern generation itself belongs to the vendor tooling; the engine only
//! drives the ion column around a rectangle that advances by one slice
//! thickness per cycle. The advanced rectangle is published through a
//! [`SharedScanningArea`] so an overlay holding a handle tracks the pattern
//! without re-subscribing.

use tracing::info;

use crate::config::MillingSettings;
use crate::geom::SharedScanningArea;
use crate::microscope::{BeamKind, Microscope, MicroscopeError};

/// Milling collaborator consumed by the slice cycle.
pub trait Mill: Send {
    fn mill_slice(
        &mut self,
        scope: &mut dyn Microscope,
        settings: &MillingSettings,
        slice_number: u64,
    ) -> Result<(), MicroscopeError>;
}

/// Built-in rectangle-pattern milling.
#[derive(Debug, Default)]
pub struct PatternMilling {
    overlay: SharedScanningArea,
}

impl PatternMilling {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for overlay rendering; observes every pattern advance.
    pub fn overlay(&self) -> SharedScanningArea {
        self.overlay.clone()
    }
}

impl Mill for PatternMilling {
    fn mill_slice(
        &mut self,
        scope: &mut dyn Microscope,
        settings: &MillingSettings,
        slice_number: u64,
    ) -> Result<(), MicroscopeError> {
        let ion = scope.beam(BeamKind::Ion);

        // advance the pattern by one slice thickness per slice, converted
        // into the fractional frame of the ion image
        let (_, rows) = ion.resolution()?;
        let pixel_size = ion.pixel_size()?;
        let dy = settings.slice_distance * slice_number as f64 / (pixel_size * rows as f64);

        let area = settings.pattern_area;
        self.overlay
            .update(area.x, area.y + dy, area.width, area.height);

        info!(
            slice_number,
            x = area.x,
            y = area.y + dy,
            width = area.width,
            height = area.height,
            depth = settings.depth,
            "milling slice pattern"
        );

        ion.unblank()?;
        ion.start_acquisition()?;
        ion.stop_acquisition()?;
        ion.blank()?;
        Ok(())
    }
}
