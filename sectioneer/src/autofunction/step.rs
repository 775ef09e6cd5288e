//! Step-driven autofunction: one sweep entry per invocation.
//!
//! A long sweep split across slice cycles: each call advances exactly one
//! plan entry and returns `false`; the call that consumes the last entry
//! evaluates the pass and returns `true`, after which the cursor is reset
//! and the next call starts a fresh plan. Scoring of the entry's frame runs
//! on a background worker joined at the start of the next call (or through
//! [`StepAutofunction::wait_for_scoring`]), so the cycle never waits for the
//! criterion while hardware work is available.

use std::path::Path;

use crate::config::StageSettings;
use crate::criterion::ScoreHandle;
use crate::mask::MaskModel;
use crate::microscope::{BeamKind, Microscope};
use crate::sweep::{SweepPlan, SweepSample};

use super::{Autofunction, AutofunctionError};

#[derive(Debug)]
pub struct StepAutofunction {
    inner: Autofunction,
    plan: Option<SweepPlan>,
    cursor: usize,
    pending: Option<(SweepSample, ScoreHandle)>,
}

impl StepAutofunction {
    pub fn new(inner: Autofunction) -> Self {
        Self {
            inner,
            plan: None,
            cursor: 0,
            pending: None,
        }
    }

    pub(crate) fn inner(&self) -> &Autofunction {
        &self.inner
    }

    /// `(entries consumed, plan length)` while a sweep is in progress.
    pub fn progress(&self) -> Option<(usize, usize)> {
        self.plan.as_ref().map(|p| (self.cursor, p.len()))
    }

    /// Joins the in-flight background score, folding it into the sample set.
    pub fn wait_for_scoring(&mut self) {
        if let Some((sample, handle)) = self.pending.take() {
            let score = handle.join();
            self.inner.push_score(&sample, score);
        }
    }

    /// Advances one plan entry. Returns `true` on the call that consumes the
    /// last entry, after evaluating and resetting the cursor.
    pub fn run_step(
        &mut self,
        scope: &mut dyn Microscope,
        mut mask: Option<&mut (dyn MaskModel + '_)>,
        stage: &StageSettings,
        curve_path: Option<&Path>,
    ) -> Result<bool, AutofunctionError> {
        self.wait_for_scoring();

        let plan = match self.plan.take() {
            Some(plan) => plan,
            None => {
                self.cursor = 0;
                self.inner.prepare(scope, mask.as_deref_mut(), stage)?
            }
        };

        let sample = *plan
            .get(self.cursor)
            .ok_or_else(|| AutofunctionError::EmptyPlan {
                name: self.inner.name().to_string(),
            })?;

        self.inner.set_value(scope, &sample)?;
        let frame = scope.beam(BeamKind::Electron).grab_frame()?;
        let regions = self
            .inner
            .evaluator()
            .extract_regions(&frame, mask.as_deref(), None);
        let handle = self
            .inner
            .evaluator()
            .score_async(regions, self.cursor as u64, |_, _| {});
        self.pending = Some((sample, handle));

        self.cursor += 1;
        if self.cursor >= plan.len() {
            self.wait_for_scoring();
            self.inner.evaluate(scope, stage, curve_path)?;
            self.cursor = 0;
            Ok(true)
        } else {
            self.plan = Some(plan);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures;
    use crate::microscope::VirtualMicroscope;

    fn step_af() -> StepAutofunction {
        let mut settings = test_fixtures::settings();
        settings.image[0].resolution = [128, 96];
        let inner =
            Autofunction::from_spec(&settings.autofunction.autofunctions[0], &settings).unwrap();
        StepAutofunction::new(inner)
    }

    fn stage() -> StageSettings {
        StageSettings {
            move_trials: 3,
            move_tolerance: 1e-6,
        }
    }

    #[test]
    fn test_five_entry_plan_completes_on_fifth_call() {
        // steps=5, total_cycles=1 in the fixture: a 5-entry plan
        let mut af = step_af();
        let mut scope = VirtualMicroscope::new();
        let stage = stage();

        for call in 1..=4 {
            let done = af.run_step(&mut scope, None, &stage, None).unwrap();
            assert!(!done, "call {call} should not complete");
            assert_eq!(af.progress(), Some((call, 5)));
        }
        let done = af.run_step(&mut scope, None, &stage, None).unwrap();
        assert!(done);
        // cursor reset, no plan in flight
        assert_eq!(af.progress(), None);
    }

    #[test]
    fn test_cursor_restarts_cleanly_after_completion() {
        let mut af = step_af();
        let mut scope = VirtualMicroscope::new();
        let stage = stage();

        for _ in 0..4 {
            assert!(!af.run_step(&mut scope, None, &stage, None).unwrap());
        }
        assert!(af.run_step(&mut scope, None, &stage, None).unwrap());

        // the second sweep behaves exactly like the first
        assert!(!af.run_step(&mut scope, None, &stage, None).unwrap());
        assert_eq!(af.progress(), Some((1, 5)));
    }

    #[test]
    fn test_wait_for_scoring_is_idempotent() {
        let mut af = step_af();
        let mut scope = VirtualMicroscope::new();
        let stage = stage();

        af.run_step(&mut scope, None, &stage, None).unwrap();
        af.wait_for_scoring();
        af.wait_for_scoring();
        assert_eq!(af.inner().samples().len(), 1);
    }
}
