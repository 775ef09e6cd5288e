//! In-cycle image-driven adjustments: drift correction and automatic
//! detector contrast/brightness.

use tracing::{debug, info};

use crate::config::{ContrastBrightnessSettings, StageSettings};
use crate::frame::Frame;
use crate::geom::Point;
use crate::mask::MaskModel;
use crate::microscope::{Beam, BeamKind, Microscope, MicroscopeError};

/// Intensity fractions counting as saturated / dark, for frames normalized
/// to roughly [0, 1].
const SATURATED_LEVEL: f32 = 0.98;
const DARK_LEVEL: f32 = 0.02;

/// Masked-centroid drift correction.
///
/// The mask is refreshed from the acquired frame; the offset of its centroid
/// from the frame center, scaled by the pixel size, is applied as a verified
/// beam shift in the opposite direction so the tracked feature returns to
/// center. Sub-pixel offsets are ignored.
pub fn correct_drift(
    scope: &mut dyn Microscope,
    mask: &mut dyn MaskModel,
    frame: &Frame,
    stage: &StageSettings,
) -> Result<Option<Point>, MicroscopeError> {
    mask.update_img(frame);
    let center = match mask.get_center() {
        Some(c) => c,
        None => {
            debug!("drift correction skipped, mask has no centroid");
            return Ok(None);
        }
    };

    let (rows, cols) = frame.shape();
    let frame_center = Point::new(cols as f64 / 2.0, rows as f64 / 2.0);
    let delta_px = center - frame_center;
    if delta_px.radius() < 1.0 {
        return Ok(None);
    }

    let correction = delta_px * -frame.pixel_size;
    let current = scope.beam(BeamKind::Electron).beam_shift()?;
    scope.beam_shift_with_verification(
        current + correction,
        stage.move_trials,
        stage.move_tolerance,
    )?;

    info!(x = correction.x, y = correction.y, "drift correction applied");
    Ok(Some(correction))
}

/// Detector nudges applied by [`auto_contrast_brightness`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectorAdjustment {
    pub contrast_delta: f64,
    pub brightness_delta: f64,
}

/// Proportional contrast/brightness control from frame statistics.
///
/// Too many saturated pixels pull contrast and brightness down; too many
/// dark pixels push brightness up; a too-narrow used intensity band pushes
/// contrast up. Returns `None` when the frame is within all allowances.
pub fn auto_contrast_brightness(
    beam: &mut dyn Beam,
    frame: &Frame,
    settings: &ContrastBrightnessSettings,
) -> Result<Option<DetectorAdjustment>, MicroscopeError> {
    let total = frame.data.len().max(1) as f64;
    let saturated = frame.data.iter().filter(|&&v| v >= SATURATED_LEVEL).count() as f64 / total;
    let dark = frame.data.iter().filter(|&&v| v <= DARK_LEVEL).count() as f64 / total;
    let min = frame.data.iter().cloned().fold(f32::INFINITY, f32::min);
    let max = frame.data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let band = (max - min).max(0.0) as f64;

    let mut contrast_delta = 0.0;
    let mut brightness_delta = 0.0;

    if saturated > settings.allowed_saturation {
        let excess = saturated - settings.allowed_saturation;
        contrast_delta -= settings.p_contrast * excess;
        brightness_delta -= settings.p_brightness * excess;
    }
    if dark > settings.allowed_saturation {
        brightness_delta += settings.p_brightness * (dark - settings.allowed_saturation);
    }
    if band < settings.allowed_minimal_band {
        contrast_delta += settings.p_contrast * (settings.allowed_minimal_band - band);
    }

    if contrast_delta == 0.0 && brightness_delta == 0.0 {
        return Ok(None);
    }

    let contrast = beam.detector_contrast()? + contrast_delta;
    let brightness = beam.detector_brightness()? + brightness_delta;
    beam.set_detector_contrast(contrast)?;
    beam.set_detector_brightness(brightness)?;

    info!(
        saturated_fraction = saturated,
        dark_fraction = dark,
        band,
        contrast_delta,
        brightness_delta,
        "detector contrast/brightness adjusted"
    );
    Ok(Some(DetectorAdjustment {
        contrast_delta,
        brightness_delta,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures;
    use crate::mask::BinaryMask;
    use crate::microscope::VirtualMicroscope;
    use ndarray::Array2;

    fn cb_settings() -> ContrastBrightnessSettings {
        let mut s = test_fixtures::settings().contrast_brightness;
        s.enabled = true;
        s
    }

    #[test]
    fn test_saturated_frame_reduces_contrast() {
        let mut scope = VirtualMicroscope::new();
        let beam = scope.beam(BeamKind::Electron);
        let before = beam.detector_contrast().unwrap();

        let frame = Frame::new(Array2::from_elem((32, 32), 1.0), 1e-9);
        let adjustment = auto_contrast_brightness(beam, &frame, &cb_settings())
            .unwrap()
            .unwrap();

        assert!(adjustment.contrast_delta < 0.0);
        assert!(beam.detector_contrast().unwrap() < before);
    }

    #[test]
    fn test_narrow_band_raises_contrast() {
        let mut scope = VirtualMicroscope::new();
        let beam = scope.beam(BeamKind::Electron);

        // all intensities squeezed into a tenth of the range
        let frame = Frame::new(
            Array2::from_shape_fn((32, 32), |(r, _)| 0.45 + 0.1 * (r as f32 / 32.0)),
            1e-9,
        );
        let adjustment = auto_contrast_brightness(beam, &frame, &cb_settings())
            .unwrap()
            .unwrap();
        assert!(adjustment.contrast_delta > 0.0);
    }

    #[test]
    fn test_healthy_frame_needs_no_adjustment() {
        let mut scope = VirtualMicroscope::new();
        let beam = scope.beam(BeamKind::Electron);

        let frame = Frame::new(
            Array2::from_shape_fn((32, 32), |(r, c)| {
                0.1 + 0.8 * ((r * 32 + c) as f32 / 1024.0)
            }),
            1e-9,
        );
        assert!(auto_contrast_brightness(beam, &frame, &cb_settings())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_drift_correction_recenters_feature() {
        let mut scope = VirtualMicroscope::new();
        let stage = test_fixtures::settings().stage;

        // bright blob centered at (24, 24) in a 32x32 frame: 8 px off center
        let mut data = Array2::zeros((32, 32));
        for r in 22..27 {
            for c in 22..27 {
                data[[r, c]] = 1.0;
            }
        }
        let pixel_size = 10e-9;
        let frame = Frame::new(data, pixel_size);

        let mut mask = BinaryMask::new(0.5, 0.0);
        let shift = correct_drift(&mut scope, &mut mask, &frame, &stage)
            .unwrap()
            .unwrap();

        assert!((shift.x - -8.0 * pixel_size).abs() < 1e-12);
        assert!((shift.y - -8.0 * pixel_size).abs() < 1e-12);
        let applied = scope.beam(BeamKind::Electron).beam_shift().unwrap();
        assert_eq!(applied, shift);
    }
}
