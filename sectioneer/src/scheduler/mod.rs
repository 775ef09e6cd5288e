//! Autofunction scheduling: firing conditions, FIFO queue, attempt limits.
//!
//! Once per slice cycle the scheduler evaluates every autofunction's firing
//! condition (slice-number modulus, from which slice 0 is exempt, or resolution
//! threshold), enqueues newly fired tasks unless they are already queued
//! (identity by task, the same autofunction is never queued twice
//! concurrently), then invokes the queue head exactly once: a single plan
//! entry for the step variant, a full pass otherwise. Completion pops the
//! task; tasks are never reordered.
//!
//! When the head's attempt counter reaches the configured maximum the
//! scheduler escalates (operator email plus a blocking acknowledgement
//! gate) and clears the **entire queue**: repeated failure of one task
//! usually means a systemic problem (stage drift, sample loss), not a local
//! one.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::autofunction::AutofunctionRunner;
use crate::config::{ConfigError, Settings, StageSettings};
use crate::escalation::{ErrorEscalationHandler, EscalationError};
use crate::mask::MaskModel;
use crate::microscope::Microscope;
use crate::telemetry::RunMetrics;

/// One queue entry: which autofunction, and how often it has been invoked
/// without completing.
#[derive(Clone, Copy, Debug)]
struct ScheduledTask {
    index: usize,
    attempts: u32,
}

pub struct AutofunctionScheduler {
    runners: Vec<AutofunctionRunner>,
    queue: VecDeque<ScheduledTask>,
    max_attempts: u32,
}

impl AutofunctionScheduler {
    /// Builds all runners from the validated settings tree.
    pub fn new(settings: &Settings) -> Result<Self, ConfigError> {
        let runners = settings
            .autofunction
            .autofunctions
            .iter()
            .map(|spec| AutofunctionRunner::from_spec(spec, settings))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            autofunctions = runners.len(),
            max_attempts = settings.autofunction.max_attempts,
            "autofunction scheduler initialized"
        );
        Ok(Self {
            runners,
            queue: VecDeque::new(),
            max_attempts: settings.autofunction.max_attempts,
        })
    }

    /// Names of all configured autofunctions, for display.
    pub fn names(&self) -> Vec<&str> {
        self.runners.iter().map(|r| r.name()).collect()
    }

    /// Names currently waiting in the queue, head first.
    pub fn queued_names(&self) -> Vec<&str> {
        self.queue
            .iter()
            .map(|t| self.runners[t.index].name())
            .collect()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Joins any in-flight background scoring of step autofunctions.
    pub fn join_pending(&mut self) {
        for runner in &mut self.runners {
            runner.join_pending();
        }
    }

    /// One scheduling cycle: enqueue fired tasks, then invoke the head once.
    #[allow(clippy::too_many_arguments)]
    pub fn run_cycle(
        &mut self,
        scope: &mut dyn Microscope,
        masks: &mut HashMap<String, Box<dyn MaskModel>>,
        stage: &StageSettings,
        slice_number: u64,
        resolution: f64,
        escalation: &ErrorEscalationHandler,
        metrics: &RunMetrics,
        curve_dir: Option<&Path>,
    ) -> Result<(), EscalationError> {
        self.enqueue_fired(slice_number, resolution);

        // attempt limit is checked before the next invocation, so the final
        // failed attempt is still followed by exactly one escalation
        if let Some(head) = self.queue.front() {
            if head.attempts >= self.max_attempts {
                let name = self.runners[head.index].name();
                error!(
                    autofunction = name,
                    attempts = head.attempts,
                    "attempt limit reached, escalating and clearing the queue"
                );
                metrics.record_escalation();
                escalation.notify_exhaustion(name, head.attempts);
                self.queue.clear();
                return Ok(());
            }
        }

        let (index, attempts) = match self.queue.front_mut() {
            Some(head) => {
                head.attempts += 1;
                (head.index, head.attempts)
            }
            None => return Ok(()),
        };

        let runner = &mut self.runners[index];
        info!(
            autofunction = runner.name(),
            attempt = attempts,
            slice_number,
            "invoking autofunction"
        );

        let curve_path =
            curve_dir.map(|dir| curve_file(dir, slice_number, runner.name(), attempts));
        let mask_name = runner.mask_name().map(str::to_owned);
        let mask = match mask_name {
            Some(name) => masks.get_mut(&name).map(|boxed| boxed.as_mut()),
            None => None,
        };

        match runner.invoke(scope, mask, stage, curve_path.as_deref()) {
            Ok(true) => {
                info!(autofunction = runner.name(), "autofunction completed");
                metrics.record_autofunction_run();
                self.queue.pop_front();
            }
            Ok(false) => {
                if let Some((done, total)) = runner.progress() {
                    info!(autofunction = runner.name(), done, total, "sweep in progress");
                }
            }
            Err(e) => {
                escalation.handle("autofunction", &e)?;
            }
        }
        Ok(())
    }

    fn enqueue_fired(&mut self, slice_number: u64, resolution: f64) {
        for (index, runner) in self.runners.iter().enumerate() {
            if !runner.check_firing(slice_number, resolution) {
                continue;
            }
            if self.queue.iter().any(|t| t.index == index) {
                warn!(
                    autofunction = runner.name(),
                    "already queued, not adding again"
                );
                continue;
            }
            info!(autofunction = runner.name(), slice_number, "added to scheduler queue");
            self.queue.push_back(ScheduledTask { index, attempts: 0 });
        }
    }
}

/// `<curve_dir>/<slice:05>/<name>_af_curve_<attempt:02>.png`, directories
/// created on demand. The attempt number keeps one curve per invocation, so
/// a re-run after a soft failure does not overwrite the earlier dump. Falls
/// back to the flat directory when creation fails.
fn curve_file(curve_dir: &Path, slice_number: u64, name: &str, attempt: u32) -> PathBuf {
    let file = format!("{name}_af_curve_{attempt:02}.png");
    let dir = curve_dir.join(format!("{slice_number:05}"));
    if let Err(e) = fs::create_dir_all(&dir) {
        warn!(dir = %dir.display(), error = %e, "cannot create curve directory");
        return curve_dir.join(file);
    }
    dir.join(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures;
    use crate::config::{AutofunctionKind, ExecuteCondition};
    use crate::escalation::test_support::{CountingGate, RecordingEmail};
    use crate::escalation::{AutoAcknowledge, StopFlag};
    use crate::microscope::VirtualMicroscope;

    fn settings_with(kind: AutofunctionKind, max_attempts: u32) -> Settings {
        let mut settings = test_fixtures::settings();
        settings.image[0].resolution = [64, 48];
        settings.autofunction.max_attempts = max_attempts;
        settings.autofunction.autofunctions[0].kind = kind;
        settings.autofunction.autofunctions[0].execute = ExecuteCondition::EverySlices(3);
        settings
    }

    fn escalation_with_gate(
        gate: CountingGate,
    ) -> ErrorEscalationHandler {
        let settings = test_fixtures::settings();
        ErrorEscalationHandler::new(
            &settings.general,
            settings.email.clone(),
            Box::new(RecordingEmail::default()),
            Box::new(gate),
            StopFlag::new(),
        )
    }

    fn run_one(
        scheduler: &mut AutofunctionScheduler,
        scope: &mut VirtualMicroscope,
        settings: &Settings,
        slice_number: u64,
        escalation: &ErrorEscalationHandler,
        metrics: &RunMetrics,
    ) {
        let mut masks = HashMap::new();
        scheduler
            .run_cycle(
                scope,
                &mut masks,
                &settings.stage,
                slice_number,
                0.0,
                escalation,
                metrics,
                None,
            )
            .unwrap();
    }

    #[test]
    fn test_firing_task_is_never_enqueued_twice() {
        let settings = settings_with(AutofunctionKind::Step, 100);
        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();

        scheduler.enqueue_fired(3, 0.0);
        scheduler.enqueue_fired(3, 0.0);
        assert_eq!(scheduler.queue_len(), 1);
    }

    #[test]
    fn test_full_pass_completes_and_pops_in_one_cycle() {
        let settings = settings_with(AutofunctionKind::Full, 5);
        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();
        let mut scope = VirtualMicroscope::new();
        let escalation = escalation_with_gate(CountingGate::default());
        let metrics = RunMetrics::new();

        run_one(&mut scheduler, &mut scope, &settings, 3, &escalation, &metrics);
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(metrics.snapshot().autofunction_runs, 1);
    }

    #[test]
    fn test_step_variant_stays_queued_until_plan_is_consumed() {
        // steps=5, one entry per cycle: queued for 4 cycles, done on the 5th
        let settings = settings_with(AutofunctionKind::Step, 100);
        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();
        let mut scope = VirtualMicroscope::new();
        let escalation = escalation_with_gate(CountingGate::default());
        let metrics = RunMetrics::new();

        run_one(&mut scheduler, &mut scope, &settings, 3, &escalation, &metrics);
        for slice in 4..7 {
            assert_eq!(scheduler.queue_len(), 1);
            run_one(&mut scheduler, &mut scope, &settings, slice, &escalation, &metrics);
        }
        run_one(&mut scheduler, &mut scope, &settings, 7, &escalation, &metrics);
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(metrics.snapshot().autofunction_runs, 1);
    }

    #[test]
    fn test_attempt_limit_escalates_once_and_clears_queue() {
        // 5x5 basic sweep = 25 step entries but max_attempts = 5: after five
        // invocations the sixth cycle escalates and empties the queue
        let mut settings = settings_with(AutofunctionKind::Step, 5);
        settings.autofunction.autofunctions[0].sweeping_total_cycles = 5;
        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();
        let mut scope = VirtualMicroscope::new();

        let gate = CountingGate::default();
        let acks = gate.count.clone();
        let escalation = escalation_with_gate(gate);
        let metrics = RunMetrics::new();

        run_one(&mut scheduler, &mut scope, &settings, 3, &escalation, &metrics);
        for slice in 4..8 {
            run_one(&mut scheduler, &mut scope, &settings, slice, &escalation, &metrics);
        }
        assert_eq!(scheduler.queue_len(), 1);
        assert_eq!(*acks.lock(), 0);

        run_one(&mut scheduler, &mut scope, &settings, 8, &escalation, &metrics);
        assert_eq!(*acks.lock(), 1);
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(metrics.snapshot().escalations, 1);

        // the next cycle proceeds normally with a fresh attempt counter
        run_one(&mut scheduler, &mut scope, &settings, 9, &escalation, &metrics);
        assert_eq!(*acks.lock(), 1);
    }

    #[test]
    fn test_fifo_order_is_preserved() {
        let mut settings = settings_with(AutofunctionKind::Step, 100);
        let mut second = settings.autofunction.autofunctions[0].clone();
        second.name = "autostig".into();
        settings.autofunction.autofunctions.push(second);

        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();
        scheduler.enqueue_fired(3, 0.0);
        assert_eq!(scheduler.queued_names(), vec!["autofocus", "autostig"]);
    }

    #[test]
    fn test_nothing_happens_without_fired_conditions() {
        let settings = settings_with(AutofunctionKind::Full, 5);
        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();
        let mut scope = VirtualMicroscope::new();
        let escalation = escalation_with_gate(CountingGate::default());
        let metrics = RunMetrics::new();

        // slice 4 does not satisfy the every-3-slices condition
        run_one(&mut scheduler, &mut scope, &settings, 4, &escalation, &metrics);
        assert_eq!(scheduler.queue_len(), 0);
        assert_eq!(metrics.snapshot().autofunction_runs, 0);
    }

    #[test]
    fn test_slice_zero_never_fires_modulus_conditions() {
        let settings = settings_with(AutofunctionKind::Full, 5);
        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();
        scheduler.enqueue_fired(0, 0.0);
        assert_eq!(scheduler.queue_len(), 0);
    }

    #[test]
    fn test_curve_filename_carries_the_attempt_number() {
        let settings = settings_with(AutofunctionKind::Full, 5);
        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();
        let mut scope = VirtualMicroscope::new();
        let escalation = escalation_with_gate(CountingGate::default());
        let metrics = RunMetrics::new();
        let dir = tempfile::tempdir().unwrap();

        let mut masks = HashMap::new();
        scheduler
            .run_cycle(
                &mut scope,
                &mut masks,
                &settings.stage,
                3,
                0.0,
                &escalation,
                &metrics,
                Some(dir.path()),
            )
            .unwrap();

        // first invocation for slice 3: attempt 1
        assert!(dir.path().join("00003/autofocus_af_curve_01.png").exists());
    }

    #[test]
    fn test_step_curve_is_saved_under_its_final_attempt() {
        // steps=5, one entry per cycle: evaluation (and the curve dump)
        // happens on the fifth invocation
        let settings = settings_with(AutofunctionKind::Step, 100);
        let mut scheduler = AutofunctionScheduler::new(&settings).unwrap();
        let mut scope = VirtualMicroscope::new();
        let escalation = escalation_with_gate(CountingGate::default());
        let metrics = RunMetrics::new();
        let dir = tempfile::tempdir().unwrap();

        for slice in 3..8 {
            let mut masks = HashMap::new();
            scheduler
                .run_cycle(
                    &mut scope,
                    &mut masks,
                    &settings.stage,
                    slice,
                    0.0,
                    &escalation,
                    &metrics,
                    Some(dir.path()),
                )
                .unwrap();
        }

        assert_eq!(scheduler.queue_len(), 0);
        assert!(dir.path().join("00007/autofocus_af_curve_05.png").exists());
    }

    #[test]
    fn test_auto_acknowledge_gate_is_usable() {
        // smoke check for the unattended-run gate
        let settings = test_fixtures::settings();
        let escalation = ErrorEscalationHandler::new(
            &settings.general,
            settings.email.clone(),
            Box::new(RecordingEmail::default()),
            Box::new(AutoAcknowledge),
            StopFlag::new(),
        );
        escalation.notify_exhaustion("autofocus", 5);
    }
}
