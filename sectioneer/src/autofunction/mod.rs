//! Autofunctions: configured optimization passes over one microscope
//! variable.
//!
//! One pass walks `Prepare -> (per plan entry: SetValue -> Acquire -> Score)
//! -> Evaluate`. Prepare optionally moves the stage to a sacrificial focus
//! area and refreshes the mask; Evaluate averages the criterion samples per
//! candidate value, commits the best candidate to the live variable, renders
//! a value-vs-score diagnostic curve and moves the stage back.
//!
//! Three driving modes exist, selected by configuration and dispatched
//! through the closed [`AutofunctionRunner`] enum (resolved once at load,
//! never by name per call):
//!
//! - **Full**: the whole pass inside one scheduler invocation.
//! - **Step** ([`StepAutofunction`]): one plan entry per invocation, spread
//!   across slices so a long sweep never blocks a cycle.
//! - **Line** ([`LineAutofunction`]): the whole sweep inside one continuous
//!   scan, one value per beam-blanking stripe.

mod curve;
mod line;
mod step;

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::{
    AutofunctionKind, AutofunctionSpec, ConfigError, ImagePreset, Settings, StageSettings,
};
use crate::criterion::CriterionEvaluator;
use crate::geom::StagePosition;
use crate::mask::MaskModel;
use crate::microscope::{
    BeamKind, Microscope, MicroscopeError, SweepValue, VariableHandle,
};
use crate::sweep::{SweepError, SweepPlan, SweepSample, SweepStrategy};

pub use line::LineAutofunction;
pub use step::StepAutofunction;

/// Faults raised during an optimization pass.
#[derive(Debug, Error)]
pub enum AutofunctionError {
    #[error(transparent)]
    Microscope(#[from] MicroscopeError),

    #[error(transparent)]
    Sweep(#[from] SweepError),

    #[error("autofunction '{name}' produced an empty sweep plan")]
    EmptyPlan { name: String },

    #[error("autofunction '{name}' has no criterion samples to evaluate")]
    NoSamples { name: String },

    #[error("failed to write diagnostic curve: {0}")]
    Curve(#[from] image::ImageError),
}

/// One scored sweep entry.
#[derive(Clone, Copy, Debug)]
pub struct CriterionSample {
    pub repetition: u32,
    pub value: SweepValue,
    pub score: f64,
    /// Differential baseline samples of the interleaved strategy; excluded
    /// from candidate selection.
    pub is_baseline: bool,
}

/// The shared pass machinery of every autofunction variant.
#[derive(Debug)]
pub struct Autofunction {
    spec: AutofunctionSpec,
    strategy: SweepStrategy,
    handle: VariableHandle,
    evaluator: CriterionEvaluator,
    preset: ImagePreset,
    samples: Vec<CriterionSample>,
}

impl Autofunction {
    /// Resolves one spec against the settings tree. The references were
    /// checked during [`Settings::validate`], but resolution stays fallible
    /// rather than trusting call order.
    pub fn from_spec(spec: &AutofunctionSpec, settings: &Settings) -> Result<Self, ConfigError> {
        let criterion = settings.find_criterion(&spec.criterion_name).ok_or_else(|| {
            ConfigError::UnknownReference {
                autofunction: spec.name.clone(),
                kind: "criterion",
                name: spec.criterion_name.clone(),
            }
        })?;
        let preset = settings
            .find_image(&spec.image_name)
            .ok_or_else(|| ConfigError::UnknownReference {
                autofunction: spec.name.clone(),
                kind: "image preset",
                name: spec.image_name.clone(),
            })?;
        Ok(Self {
            spec: spec.clone(),
            strategy: SweepStrategy::from_spec(spec),
            handle: VariableHandle::new(spec.variable),
            evaluator: CriterionEvaluator::new(criterion.clone()),
            preset: preset.clone(),
            samples: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn mask_name(&self) -> Option<&str> {
        self.spec.mask_name.as_deref()
    }

    /// Evaluates the firing condition against the slice number and the last
    /// measured resolution.
    pub fn check_firing(&self, slice_number: u64, resolution: f64) -> bool {
        self.spec.execute.fires(slice_number, resolution)
    }

    pub fn samples(&self) -> &[CriterionSample] {
        &self.samples
    }

    /// Moves to the sacrificial area, applies the imaging preset, refreshes
    /// the mask and plans the sweep from the live base value.
    pub fn prepare(
        &mut self,
        scope: &mut dyn Microscope,
        mask: Option<&mut (dyn MaskModel + '_)>,
        stage: &StageSettings,
    ) -> Result<SweepPlan, AutofunctionError> {
        if let Some(offset) = self.spec.stage_offset {
            info!(autofunction = %self.spec.name, x = offset.x, y = offset.y,
                "moving to sacrificial focus area");
            scope.move_stage_relative_verified(
                StagePosition::lateral(offset.x, offset.y),
                stage.move_trials,
                stage.move_tolerance,
            )?;
        }

        let beam = scope.beam(BeamKind::Electron);
        beam.apply_preset(&self.preset)?;

        if let Some(mask) = mask {
            let frame = beam.grab_frame()?;
            mask.update_img(&frame);
        }

        let base = self.handle.read(scope.beam(BeamKind::Electron))?;
        let plan = self.strategy.plan(base)?;
        if plan.is_empty() {
            return Err(AutofunctionError::EmptyPlan {
                name: self.spec.name.clone(),
            });
        }
        debug!(autofunction = %self.spec.name, entries = plan.len(), %base, "sweep planned");

        self.samples.clear();
        Ok(plan)
    }

    /// Writes the variable for the plan entry without acquiring.
    pub fn set_value(
        &self,
        scope: &mut dyn Microscope,
        sample: &SweepSample,
    ) -> Result<(), AutofunctionError> {
        info!(autofunction = %self.spec.name, value = %sample.value,
            repetition = sample.repetition, "setting sweep value");
        self.handle
            .write(scope.beam(BeamKind::Electron), sample.value)?;
        Ok(())
    }

    /// One plan entry: set the value, acquire a frame, score it.
    pub fn run_entry(
        &mut self,
        scope: &mut dyn Microscope,
        mask: Option<&dyn MaskModel>,
        sample: SweepSample,
    ) -> Result<(), AutofunctionError> {
        self.set_value(scope, &sample)?;
        let frame = scope.beam(BeamKind::Electron).grab_frame()?;
        let score = self.evaluator.score(&frame, mask, None);
        self.push_score(&sample, score);
        Ok(())
    }

    /// Records a score that was computed outside of [`Self::run_entry`].
    pub fn push_score(&mut self, sample: &SweepSample, score: f64) {
        debug!(autofunction = %self.spec.name, value = %sample.value, score, "criterion sample");
        self.samples.push(CriterionSample {
            repetition: sample.repetition,
            value: sample.value,
            score,
            is_baseline: sample.is_baseline,
        });
    }

    /// Commits the best candidate and reverts the stage offset.
    pub fn evaluate(
        &mut self,
        scope: &mut dyn Microscope,
        stage: &StageSettings,
        curve_path: Option<&Path>,
    ) -> Result<(), AutofunctionError> {
        let candidates = mean_by_candidate(&self.samples);
        let (best, best_score) =
            best_candidate(&candidates).ok_or_else(|| AutofunctionError::NoSamples {
                name: self.spec.name.clone(),
            })?;

        info!(autofunction = %self.spec.name, value = %best, score = best_score,
            "committing best candidate");
        self.handle.write(scope.beam(BeamKind::Electron), best)?;

        if let Some(path) = curve_path {
            curve::save_curve(&candidates, path)?;
        }

        if let Some(offset) = self.spec.stage_offset {
            scope.move_stage_relative_verified(
                StagePosition::lateral(-offset.x, -offset.y),
                stage.move_trials,
                stage.move_tolerance,
            )?;
        }
        Ok(())
    }

    /// The whole pass in one call. Always completes (`true`) unless it
    /// errors.
    pub fn run_full(
        &mut self,
        scope: &mut dyn Microscope,
        mut mask: Option<&mut (dyn MaskModel + '_)>,
        stage: &StageSettings,
        curve_path: Option<&Path>,
    ) -> Result<bool, AutofunctionError> {
        let plan = self.prepare(scope, mask.as_deref_mut(), stage)?;
        for sample in plan.samples() {
            self.run_entry(scope, mask.as_deref(), *sample)?;
        }
        self.evaluate(scope, stage, curve_path)?;
        Ok(true)
    }

    pub(crate) fn evaluator(&self) -> &CriterionEvaluator {
        &self.evaluator
    }
}

/// Mean score per distinct candidate value, baselines excluded, in first
/// occurrence order.
pub(crate) fn mean_by_candidate(samples: &[CriterionSample]) -> Vec<(SweepValue, f64)> {
    let mut grouped: Vec<(SweepValue, Vec<f64>)> = Vec::new();
    for sample in samples {
        if sample.is_baseline {
            continue;
        }
        match grouped.iter_mut().find(|(v, _)| *v == sample.value) {
            Some((_, scores)) => scores.push(sample.score),
            None => grouped.push((sample.value, vec![sample.score])),
        }
    }
    grouped
        .into_iter()
        .map(|(value, scores)| {
            let mean = scores.iter().sum::<f64>() / scores.len() as f64;
            (value, mean)
        })
        .collect()
}

/// The candidate with the maximum mean score; ties keep the earliest.
pub(crate) fn best_candidate(candidates: &[(SweepValue, f64)]) -> Option<(SweepValue, f64)> {
    let mut best: Option<(SweepValue, f64)> = None;
    for &(value, score) in candidates {
        match best {
            Some((_, s)) if score <= s => {}
            _ => best = Some((value, score)),
        }
    }
    best
}

/// Closed dispatch over the three driving modes.
#[derive(Debug)]
pub enum AutofunctionRunner {
    Full(Autofunction),
    Step(StepAutofunction),
    Line(LineAutofunction),
}

impl AutofunctionRunner {
    pub fn from_spec(spec: &AutofunctionSpec, settings: &Settings) -> Result<Self, ConfigError> {
        let inner = Autofunction::from_spec(spec, settings)?;
        Ok(match spec.kind {
            AutofunctionKind::Full => AutofunctionRunner::Full(inner),
            AutofunctionKind::Step => AutofunctionRunner::Step(StepAutofunction::new(inner)),
            AutofunctionKind::Line => AutofunctionRunner::Line(LineAutofunction::new(inner)),
        })
    }

    pub fn name(&self) -> &str {
        self.inner().name()
    }

    pub fn mask_name(&self) -> Option<&str> {
        self.inner().mask_name()
    }

    pub fn check_firing(&self, slice_number: u64, resolution: f64) -> bool {
        self.inner().check_firing(slice_number, resolution)
    }

    fn inner(&self) -> &Autofunction {
        match self {
            AutofunctionRunner::Full(a) => a,
            AutofunctionRunner::Step(s) => s.inner(),
            AutofunctionRunner::Line(l) => l.inner(),
        }
    }

    /// One scheduler invocation: a single plan entry for the step variant,
    /// the whole pass otherwise. `Ok(true)` signals completion.
    pub fn invoke(
        &mut self,
        scope: &mut dyn Microscope,
        mask: Option<&mut (dyn MaskModel + '_)>,
        stage: &StageSettings,
        curve_path: Option<&Path>,
    ) -> Result<bool, AutofunctionError> {
        match self {
            AutofunctionRunner::Full(a) => a.run_full(scope, mask, stage, curve_path),
            AutofunctionRunner::Step(s) => s.run_step(scope, mask, stage, curve_path),
            AutofunctionRunner::Line(l) => l.run(scope, mask, stage, curve_path),
        }
    }

    /// Joins any in-flight background scoring of the step variant.
    pub fn join_pending(&mut self) {
        if let AutofunctionRunner::Step(s) = self {
            s.wait_for_scoring();
        }
    }

    /// Progress of a partially consumed step sweep, `(done, total)`.
    pub fn progress(&self) -> Option<(usize, usize)> {
        match self {
            AutofunctionRunner::Step(s) => s.progress(),
            _ => None,
        }
    }
}
