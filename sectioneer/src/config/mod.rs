//! Settings tree for the acquisition engine.
//!
//! The whole configuration lives in one YAML file and is re-read at the start
//! of every slice cycle, so edits made while a run is in progress take effect
//! at the next slice. Loading is strict: required keys that are missing or
//! malformed fail the load; there are no silent defaults for required
//! fields. Cross-references (an autofunction naming a criterion, image preset
//! or mask) are resolved during [`Settings::validate`] and are equally fatal.
//!
//! # Layout
//!
//! ```text
//! general:                error behaviour, additive beam shift, beam settings file
//! acquisition:            wd/y correction, active image + criterion, imaging switch
//! stage:                  move verification trials + tolerance
//! autofunction:           max_attempts + list of autofunction specs
//! criterion_calculation:  named criterion configs (border, tiling, detail band)
//! image:                  named imaging presets
//! mask:                   named masks (fractional rectangles, min pixel fraction)
//! drift_correction:       mode + mask reference
//! milling:                pattern area, depth, slice distance
//! email:                  sender / receiver
//! dirs:                   output images, logs, templates
//! ```

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geom::{Point, ScanningArea};

/// Errors raised while loading or validating the settings tree.
///
/// All of these are fatal at initialization; the engine never runs with a
/// partially valid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("autofunction '{autofunction}' references unknown {kind} '{name}'")]
    UnknownReference {
        autofunction: String,
        kind: &'static str,
        name: String,
    },

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Response to a raised fault, applied in declaration-independent fixed
/// order: email, stop, exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorBehaviour {
    /// Best-effort notification; send failures are logged, never escalated.
    Email,
    /// Sets the cooperative stop flag checked between cycle steps.
    Stop,
    /// Re-raises as a fatal error terminating the run.
    Exception,
}

/// The microscope variable an autofunction sweeps.
///
/// Resolved once at configuration load into a typed handle; never re-looked
/// up by name per call. Scalar variables sweep with the basic/interleaved
/// strategies, two-axis variables with the spiral strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepVariable {
    WorkingDistance,
    StigmatorX,
    StigmatorY,
    /// Two-axis stigmation (spiral sweeps).
    Stigmator,
    LensAlignmentX,
    LensAlignmentY,
    /// Two-axis lens alignment (spiral sweeps).
    LensAlignment,
}

impl SweepVariable {
    /// True for variables that carry an (x, y) pair.
    pub fn is_two_axis(&self) -> bool {
        matches!(self, SweepVariable::Stigmator | SweepVariable::LensAlignment)
    }
}

/// Which sweeping strategy generates the candidate values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStrategyKind {
    Basic,
    Spiral,
    Interleaved,
}

/// How the autofunction pass is driven by the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutofunctionKind {
    /// Full sweep in a single scheduler invocation.
    Full,
    /// One sweep entry per invocation, spread across slices.
    Step,
    /// Whole sweep within one continuous scan, one value per line stripe.
    Line,
}

/// Firing condition of an autofunction.
///
/// An integer fires on slice-number modulus (slice 0 is exempt), a float
/// fires when the measured resolution exceeds the threshold (the resolution
/// metric grows as focus degrades).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecuteCondition {
    EverySlices(u32),
    ResolutionAbove(f64),
}

impl ExecuteCondition {
    /// Evaluates the condition for the given slice and last measured
    /// resolution.
    ///
    /// Slice 0 never fires an integer condition: the very first slice has no
    /// settled imaging state worth optimizing against.
    pub fn fires(&self, slice_number: u64, resolution: f64) -> bool {
        match *self {
            ExecuteCondition::EverySlices(n) => {
                n > 0 && slice_number > 0 && slice_number % n as u64 == 0
            }
            ExecuteCondition::ResolutionAbove(threshold) => resolution > threshold,
        }
    }
}

/// Reduction applied across per-tile or per-region scores.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    Min,
    Max,
    Mean,
    Median,
}

impl Reducer {
    /// Reduces a non-empty slice of scores. Returns 0.0 for an empty slice.
    pub fn reduce(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Reducer::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Reducer::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Reducer::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reducer::Median => {
                let mut sorted = values.to_vec();
                sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                let mid = sorted.len() / 2;
                if sorted.len() % 2 == 0 {
                    (sorted[mid - 1] + sorted[mid]) / 2.0
                } else {
                    sorted[mid]
                }
            }
        }
    }
}

/// Immutable configuration of one schedulable optimization task.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutofunctionSpec {
    pub name: String,
    pub kind: AutofunctionKind,
    pub variable: SweepVariable,
    pub sweeping_strategy: SweepStrategyKind,
    /// Offsets added to the base value: `[low, high]`, low typically negative.
    pub sweeping_range: [f64; 2],
    /// Hard limits for the swept variable. Scalar sweeps clamp to
    /// `[min, max]`; spiral sweeps skip points whose radius exceeds `max`.
    pub sweeping_max_limits: [f64; 2],
    pub sweeping_steps: u32,
    pub sweeping_total_cycles: u32,
    /// Ring count for spiral sweeps.
    #[serde(default)]
    pub sweeping_spiral_cycles: Option<u32>,
    pub criterion_name: String,
    pub image_name: String,
    #[serde(default)]
    pub mask_name: Option<String>,
    pub execute: ExecuteCondition,
    /// Lateral stage offset applied before the pass to focus on a
    /// sacrificial area away from the sample; reverted afterwards.
    #[serde(default)]
    pub stage_offset: Option<Point>,
}

/// Named criterion configuration (scoring parameters).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CriterionConfig {
    pub name: String,
    pub criterion: CriterionKind,
    /// Border fraction cropped from each side before tiling.
    pub border: f64,
    /// Physical tile edge length in metres; 0 disables tiling.
    pub tile_size: f64,
    /// Detail band `[lowest, highest]` in metres (lowest > highest).
    pub detail: [f64; 2],
    /// Reduction across tiles of one region.
    pub final_resolution: Reducer,
    /// Reduction across masked regions.
    pub final_regions_resolution: Reducer,
    #[serde(default)]
    pub mask_name: Option<String>,
}

/// The per-tile scoring function.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    /// Mean absolute value of the gaussian band-passed image.
    Bandpass,
    /// Variance of the gaussian band-passed image.
    BandpassVar,
    /// Band-limited FFT amplitude sum (1D lines and 2D images).
    Fft,
    /// Fourier-ring correlation against a diagonal split of the image.
    Frc,
}

/// Named imaging preset applied before acquisition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImagePreset {
    pub name: String,
    /// `[columns, rows]`.
    pub resolution: [u32; 2],
    /// Dwell time per pixel in seconds.
    pub dwell_time: f64,
    pub line_integration: u32,
    pub bit_depth: u32,
}

/// Named mask: fractional rectangles with a minimum valid-pixel fraction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MaskConfig {
    pub name: String,
    pub areas: Vec<ScanningArea>,
    /// Minimum fraction of masked pixels for a region to count.
    pub min_fraction: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GeneralSettings {
    pub error_behaviour: HashSet<ErrorBehaviour>,
    /// Constant beam-shift added to the per-slice y correction.
    pub additive_beam_shift: Point,
    /// Path of the stored beam settings applied at LoadBeamSettings.
    pub beam_settings_file: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AcquisitionSettings {
    /// Working-distance increment applied every slice (slice thickness).
    pub wd_correction: f64,
    /// Beam-shift y increment applied every slice.
    pub y_correction: f64,
    pub image_name: String,
    pub criterion_name: String,
    pub imaging_enabled: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageSettings {
    /// Maximum verified-move attempts before a hardware fault is raised.
    pub move_trials: u32,
    /// Linear settling tolerance in metres.
    pub move_tolerance: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AutofunctionSettings {
    /// Attempt limit per scheduled task before escalation clears the queue.
    pub max_attempts: u32,
    pub autofunctions: Vec<AutofunctionSpec>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriftCorrectionSettings {
    pub enabled: bool,
    #[serde(default)]
    pub mask_name: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MillingSettings {
    /// Pattern rectangle in fractional ion-image coordinates.
    pub pattern_area: ScanningArea,
    /// Milling depth in metres.
    pub depth: f64,
    /// Physical slice thickness; the pattern advances by this much per slice.
    pub slice_distance: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContrastBrightnessSettings {
    pub enabled: bool,
    /// Fraction of saturated / zeroed pixels tolerated before adjusting.
    pub allowed_saturation: f64,
    /// Minimum used fraction of the intensity range.
    pub allowed_minimal_band: f64,
    pub p_contrast: f64,
    pub p_brightness: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmailSettings {
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub receiver: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DirSettings {
    pub output_images: PathBuf,
    pub log: PathBuf,
    pub templates: PathBuf,
}

/// The complete settings tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    pub general: GeneralSettings,
    pub acquisition: AcquisitionSettings,
    pub stage: StageSettings,
    pub autofunction: AutofunctionSettings,
    pub criterion_calculation: Vec<CriterionConfig>,
    pub image: Vec<ImagePreset>,
    pub mask: Vec<MaskConfig>,
    pub drift_correction: DriftCorrectionSettings,
    pub milling: MillingSettings,
    pub contrast_brightness: ContrastBrightnessSettings,
    pub email: EmailSettings,
    pub dirs: DirSettings,
}

impl Settings {
    /// Loads and validates the settings tree from a YAML file.
    pub fn load(path: &Path) -> Result<Settings, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = serde_yaml::from_str(&raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Cross-reference and range validation; fatal on any failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for c in &self.criterion_calculation {
            if !(0.0..0.5).contains(&c.border) {
                return Err(ConfigError::InvalidValue {
                    field: "criterion_calculation.border",
                    reason: format!("{} not in [0, 0.5)", c.border),
                });
            }
            if c.tile_size < 0.0 {
                return Err(ConfigError::InvalidValue {
                    field: "criterion_calculation.tile_size",
                    reason: format!("{} is negative", c.tile_size),
                });
            }
            if c.detail[0] <= c.detail[1] {
                return Err(ConfigError::InvalidValue {
                    field: "criterion_calculation.detail",
                    reason: "lowest detail must be coarser (larger) than highest".into(),
                });
            }
            if let Some(mask) = &c.mask_name {
                self.find_mask(mask)
                    .ok_or_else(|| ConfigError::UnknownReference {
                        autofunction: c.name.clone(),
                        kind: "mask",
                        name: mask.clone(),
                    })?;
            }
        }

        self.find_criterion(&self.acquisition.criterion_name)
            .ok_or_else(|| ConfigError::UnknownReference {
                autofunction: "acquisition".into(),
                kind: "criterion",
                name: self.acquisition.criterion_name.clone(),
            })?;
        self.find_image(&self.acquisition.image_name)
            .ok_or_else(|| ConfigError::UnknownReference {
                autofunction: "acquisition".into(),
                kind: "image preset",
                name: self.acquisition.image_name.clone(),
            })?;

        for af in &self.autofunction.autofunctions {
            if af.sweeping_steps < 2 {
                return Err(ConfigError::InvalidValue {
                    field: "autofunction.sweeping_steps",
                    reason: format!("'{}' needs at least 2 steps", af.name),
                });
            }
            if af.sweeping_total_cycles == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "autofunction.sweeping_total_cycles",
                    reason: format!("'{}' needs at least 1 cycle", af.name),
                });
            }
            if af.sweeping_strategy == SweepStrategyKind::Spiral {
                if !af.variable.is_two_axis() {
                    return Err(ConfigError::InvalidValue {
                        field: "autofunction.sweeping_strategy",
                        reason: format!("'{}': spiral sweep needs a two-axis variable", af.name),
                    });
                }
                if af.sweeping_spiral_cycles.unwrap_or(0) == 0 {
                    return Err(ConfigError::InvalidValue {
                        field: "autofunction.sweeping_spiral_cycles",
                        reason: format!("'{}' needs sweeping_spiral_cycles >= 1", af.name),
                    });
                }
            } else if af.variable.is_two_axis() {
                return Err(ConfigError::InvalidValue {
                    field: "autofunction.variable",
                    reason: format!("'{}': two-axis variable needs the spiral strategy", af.name),
                });
            }

            self.find_criterion(&af.criterion_name).ok_or_else(|| {
                ConfigError::UnknownReference {
                    autofunction: af.name.clone(),
                    kind: "criterion",
                    name: af.criterion_name.clone(),
                }
            })?;
            self.find_image(&af.image_name)
                .ok_or_else(|| ConfigError::UnknownReference {
                    autofunction: af.name.clone(),
                    kind: "image preset",
                    name: af.image_name.clone(),
                })?;
            if let Some(mask) = &af.mask_name {
                self.find_mask(mask)
                    .ok_or_else(|| ConfigError::UnknownReference {
                        autofunction: af.name.clone(),
                        kind: "mask",
                        name: mask.clone(),
                    })?;
            }
        }

        if let Some(mask) = &self.drift_correction.mask_name {
            self.find_mask(mask)
                .ok_or_else(|| ConfigError::UnknownReference {
                    autofunction: "drift_correction".into(),
                    kind: "mask",
                    name: mask.clone(),
                })?;
        }

        Ok(())
    }

    pub fn find_criterion(&self, name: &str) -> Option<&CriterionConfig> {
        self.criterion_calculation.iter().find(|c| c.name == name)
    }

    pub fn find_image(&self, name: &str) -> Option<&ImagePreset> {
        self.image.iter().find(|i| i.name == name)
    }

    pub fn find_mask(&self, name: &str) -> Option<&MaskConfig> {
        self.mask.iter().find(|m| m.name == name)
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::settings;
    use super::*;

    #[test]
    fn test_valid_settings_pass_validation() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn test_unknown_criterion_reference_is_fatal() {
        let mut s = settings();
        s.autofunction.autofunctions[0].criterion_name = "nope".into();
        assert!(matches!(
            s.validate(),
            Err(ConfigError::UnknownReference { kind: "criterion", .. })
        ));
    }

    #[test]
    fn test_spiral_requires_two_axis_variable() {
        let mut s = settings();
        s.autofunction.autofunctions[0].sweeping_strategy = SweepStrategyKind::Spiral;
        s.autofunction.autofunctions[0].sweeping_spiral_cycles = Some(2);
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_execute_condition_yaml_shapes() {
        let modulus: ExecuteCondition = serde_yaml::from_str("3").unwrap();
        assert_eq!(modulus, ExecuteCondition::EverySlices(3));

        let threshold: ExecuteCondition = serde_yaml::from_str("0.5").unwrap();
        assert_eq!(threshold, ExecuteCondition::ResolutionAbove(0.5));
    }

    #[test]
    fn test_execute_modulus_fires() {
        let cond = ExecuteCondition::EverySlices(3);
        assert!(cond.fires(6, 0.0));
        assert!(!cond.fires(7, 0.0));
        // slice 0 is exempt
        assert!(!cond.fires(0, 0.0));
    }

    #[test]
    fn test_execute_resolution_threshold_fires() {
        let cond = ExecuteCondition::ResolutionAbove(0.5);
        assert!(cond.fires(1, 0.8));
        assert!(!cond.fires(1, 0.3));
    }

    #[test]
    fn test_reducer_median() {
        assert_eq!(Reducer::Median.reduce(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(Reducer::Median.reduce(&[4.0, 1.0, 2.0, 3.0]), 2.5);
        assert_eq!(Reducer::Mean.reduce(&[]), 0.0);
    }

    #[test]
    fn test_settings_yaml_round_trip() {
        let s = settings();
        let yaml = serde_yaml::to_string(&s).unwrap();
        let back: Settings = serde_yaml::from_str(&yaml).unwrap();
        assert!(back.validate().is_ok());
        assert_eq!(back.autofunction.max_attempts, 5);
    }

    #[test]
    fn test_missing_required_key_fails_parse() {
        // drop the whole `stage` section
        let s = settings();
        let mut value: serde_yaml::Value = serde_yaml::to_value(&s).unwrap();
        value.as_mapping_mut().unwrap().remove("stage");
        let yaml = serde_yaml::to_string(&value).unwrap();
        assert!(serde_yaml::from_str::<Settings>(&yaml).is_err());
    }
}
