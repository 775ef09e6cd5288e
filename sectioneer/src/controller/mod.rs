//! Top-level per-slice acquisition state machine.
//!
//! One [`SliceCycleController`] owns the microscope, the autofunction
//! scheduler, the masks and the escalation policy, and walks each slice
//! through a fixed step order:
//!
//! ```text
//! Mill -> LoadBeamSettings -> ApplyDriftAndWdCorrection -> RunAutofunctions
//!      -> Acquire -> StepAutofunctionOnAcquiredImage -> DriftCorrect
//!      -> AutoContrastBrightness -> ScoreResolution (async)
//! ```
//!
//! The cooperative stop flag is polled between every step; a stop request
//! takes effect at the next boundary, never mid-operation. Step failures
//! route through the [`ErrorEscalationHandler`] and do not abort the cycle
//! by themselves; only the `exception` behaviour (or a configuration fault)
//! terminates the run.
//!
//! Resolution scoring is fire-and-forget relative to `cycle()` returning:
//! the handle is stored and joined at the *entry* of the next cycle, before
//! any shared state is touched again. Settings are re-read at every cycle
//! entry, so live edits take effect at the next slice; the per-slice context
//! is rebuilt from scratch, never mutated in place.

pub mod adjust;
pub mod beam_state;
pub mod milling;

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{ConfigError, Settings};
use crate::criterion::{CriterionEvaluator, ScoreHandle};
use crate::escalation::{
    AcknowledgeGate, EmailSender, ErrorEscalationHandler, EscalationError, StopFlag,
};
use crate::frame::Frame;
use crate::geom::Point;
use crate::mask::{MaskModel, RectMask};
use crate::microscope::{Beam, BeamKind, Microscope};
use crate::scheduler::AutofunctionScheduler;
use crate::telemetry::{RunMetrics, SliceRecord};

pub use adjust::{auto_contrast_brightness, correct_drift, DetectorAdjustment};
pub use beam_state::{BeamState, BeamStateError};
pub use milling::{Mill, PatternMilling};

/// Faults that terminate the run (everything else is absorbed or routed
/// through escalation).
#[derive(Debug, Error)]
pub enum ControlError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Escalation(#[from] EscalationError),

    #[error("failed to prepare run directories: {0}")]
    Io(#[from] std::io::Error),
}

pub struct SliceCycleController {
    settings_path: PathBuf,
    scope: Box<dyn Microscope>,
    scheduler: AutofunctionScheduler,
    masks: HashMap<String, Box<dyn MaskModel>>,
    escalation: ErrorEscalationHandler,
    mill: Box<dyn Mill>,
    stop: StopFlag,
    running: Arc<AtomicBool>,
    metrics: Arc<RunMetrics>,
    last_resolution: Arc<Mutex<f64>>,
    pending_score: Option<ScoreHandle>,
    slice_number: u64,
}

impl SliceCycleController {
    /// Loads and validates the settings, prepares the run directories and
    /// wires all collaborators.
    pub fn new(
        settings_path: PathBuf,
        scope: Box<dyn Microscope>,
        email: Box<dyn EmailSender>,
        gate: Box<dyn AcknowledgeGate>,
    ) -> Result<Self, ControlError> {
        let settings = Settings::load(&settings_path)?;

        fs::create_dir_all(&settings.dirs.output_images)?;
        fs::create_dir_all(&settings.dirs.log)?;
        fs::create_dir_all(&settings.dirs.templates)?;

        let masks: HashMap<String, Box<dyn MaskModel>> = settings
            .mask
            .iter()
            .map(|m| {
                let boxed: Box<dyn MaskModel> = Box::new(RectMask::new(m.clone()));
                (m.name.clone(), boxed)
            })
            .collect();

        let stop = StopFlag::new();
        let escalation = ErrorEscalationHandler::new(
            &settings.general,
            settings.email.clone(),
            email,
            gate,
            stop.clone(),
        );
        let scheduler = AutofunctionScheduler::new(&settings)?;

        Ok(Self {
            settings_path,
            scope,
            scheduler,
            masks,
            escalation,
            mill: Box::new(PatternMilling::new()),
            stop,
            running: Arc::new(AtomicBool::new(false)),
            metrics: Arc::new(RunMetrics::new()),
            last_resolution: Arc::new(Mutex::new(0.0)),
            pending_score: None,
            slice_number: 0,
        })
    }

    /// Handle for requesting a cooperative stop (e.g. from a signal handler).
    pub fn stop_flag(&self) -> StopFlag {
        self.stop.clone()
    }

    /// Requests a cooperative stop at the next step boundary.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> Arc<RunMetrics> {
        self.metrics.clone()
    }

    /// Resolution measured for the most recently scored slice.
    pub fn last_resolution(&self) -> f64 {
        *self.last_resolution.lock()
    }

    pub fn autofunction_names(&self) -> Vec<String> {
        self.scheduler.names().iter().map(|s| s.to_string()).collect()
    }

    pub fn queued_autofunctions(&self) -> Vec<String> {
        self.scheduler
            .queued_names()
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    /// Runs slice cycles from `start_slice` until stopped or a fatal error.
    pub fn run(&mut self, start_slice: u64) -> Result<(), ControlError> {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("acquisition already running");
            return Ok(());
        }
        self.stop.clear();
        self.slice_number = start_slice;

        let result = loop {
            match self.cycle() {
                Ok(true) => {
                    info!(slice_number = self.slice_number, "slice completed");
                    self.metrics.record_slice_completed();
                    self.slice_number += 1;
                }
                Ok(false) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        // workers must always be joined, even on the error path
        if let Some(handle) = self.pending_score.take() {
            handle.join();
        }
        self.scheduler.join_pending();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    /// One slice cycle. `Ok(false)` means a stop was honoured.
    pub fn cycle(&mut self) -> Result<bool, ControlError> {
        // join the previous slice's background work before touching any
        // state it reads
        if let Some(handle) = self.pending_score.take() {
            handle.join();
        }
        self.scheduler.join_pending();

        if self.check_stop() {
            return Ok(false);
        }

        // fresh context per slice: re-read settings so live edits apply
        let settings = Settings::load(&self.settings_path)?;
        let mut record = SliceRecord::new(self.slice_number);
        info!(slice_number = self.slice_number, "starting slice cycle");

        if !settings.acquisition.imaging_enabled {
            warn!(slice_number = self.slice_number, "imaging disabled, skipping slice steps");
            record.set("imaging_enabled", false);
            self.write_record(record, &settings);
            return Ok(true);
        }

        if let Err(e) =
            self.mill
                .mill_slice(self.scope.as_mut(), &settings.milling, self.slice_number)
        {
            self.escalation.handle("milling", &e)?;
        }
        if self.check_stop() {
            return Ok(false);
        }

        if let Err(e) = self.load_beam_settings(&settings) {
            self.escalation.handle("beam settings", &e)?;
        }
        if self.check_stop() {
            return Ok(false);
        }

        if let Err(e) = self.apply_corrections(&settings, &mut record) {
            self.escalation.handle("correction", &e)?;
        }
        if self.check_stop() {
            return Ok(false);
        }

        let resolution = *self.last_resolution.lock();
        self.scheduler.run_cycle(
            self.scope.as_mut(),
            &mut self.masks,
            &settings.stage,
            self.slice_number,
            resolution,
            &self.escalation,
            self.metrics.as_ref(),
            Some(settings.dirs.log.as_path()),
        )?;
        record.set("autofunction_queue", self.queued_autofunctions());
        if let Err(e) = self.save_beam_state(&settings) {
            self.escalation.handle("beam settings", &e)?;
        }
        if self.check_stop() {
            return Ok(false);
        }

        let frame = match self.acquire(&settings, &mut record) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.escalation.handle("acquire", &e)?;
                None
            }
        };
        if self.check_stop() {
            self.flush_record_on_stop(record, &settings);
            return Ok(false);
        }

        // join any in-flight step-autofunction scoring before further beam
        // mutation
        self.scheduler.join_pending();

        let frame = match frame {
            Some(frame) => frame,
            None => {
                self.write_record(record, &settings);
                return Ok(true);
            }
        };

        if settings.drift_correction.enabled {
            if let Err(e) = self.drift_correct(&settings, &frame, &mut record) {
                self.escalation.handle("drift correction", &e)?;
            }
        }
        if self.check_stop() {
            self.flush_record_on_stop(record, &settings);
            return Ok(false);
        }

        if settings.contrast_brightness.enabled {
            match auto_contrast_brightness(
                self.scope.beam(BeamKind::Electron),
                &frame,
                &settings.contrast_brightness,
            ) {
                Ok(Some(adjustment)) => {
                    record.set("contrast_delta", adjustment.contrast_delta);
                    record.set("brightness_delta", adjustment.brightness_delta);
                }
                Ok(None) => {}
                Err(e) => self.escalation.handle("contrast brightness", &e)?,
            }
        }
        if self.check_stop() {
            self.flush_record_on_stop(record, &settings);
            return Ok(false);
        }

        self.score_resolution(&settings, frame, record);
        Ok(true)
    }

    /// Polls the stop flag; on a stop, acquisition on both columns is ended
    /// so the instrument is left idle.
    fn check_stop(&mut self) -> bool {
        if !self.stop.is_set() {
            return false;
        }
        warn!(slice_number = self.slice_number, "stop requested, ending cycle");
        for kind in [BeamKind::Electron, BeamKind::Ion] {
            if let Err(e) = self.scope.beam(kind).stop_acquisition() {
                error!(error = %e, "failed to stop acquisition");
            }
        }
        true
    }

    fn load_beam_settings(&mut self, settings: &Settings) -> Result<(), BeamStateError> {
        match BeamState::load(&settings.general.beam_settings_file)? {
            Some(state) => {
                state.apply(self.scope.beam(BeamKind::Electron))?;
                info!(working_distance = state.working_distance, "beam state applied");
            }
            None => {
                warn!(
                    path = %settings.general.beam_settings_file.display(),
                    "no stored beam state, keeping live values"
                );
            }
        }
        Ok(())
    }

    fn save_beam_state(&mut self, settings: &Settings) -> Result<(), BeamStateError> {
        let state = BeamState::capture(self.scope.beam(BeamKind::Electron))?;
        state.save(&settings.general.beam_settings_file)
    }

    /// Working-distance increment for the slice thickness plus the y beam
    /// shift compensating the viewing geometry.
    fn apply_corrections(
        &mut self,
        settings: &Settings,
        record: &mut SliceRecord,
    ) -> Result<(), crate::microscope::MicroscopeError> {
        let beam = self.scope.beam(BeamKind::Electron);
        let wd = beam.working_distance()? + settings.acquisition.wd_correction;
        beam.set_working_distance(wd)?;
        info!(working_distance = wd, increment = settings.acquisition.wd_correction,
            "working distance correction applied");

        let delta = settings.general.additive_beam_shift
            + Point::new(0.0, settings.acquisition.y_correction);
        let shift = beam.beam_shift()? + delta;
        let applied_as_shift = self.scope.beam_shift_with_verification(
            shift,
            settings.stage.move_trials,
            settings.stage.move_tolerance,
        )?;

        record.set("working_distance", wd);
        record.set("y_correction", settings.acquisition.y_correction);
        record.set("beam_shift_applied", applied_as_shift);
        Ok(())
    }

    /// Applies the acquisition preset, grabs and saves the slice image.
    fn acquire(
        &mut self,
        settings: &Settings,
        record: &mut SliceRecord,
    ) -> Result<Frame, AcquireError> {
        let preset = settings
            .find_image(&settings.acquisition.image_name)
            .ok_or_else(|| ConfigError::UnknownReference {
                autofunction: "acquisition".into(),
                kind: "image preset",
                name: settings.acquisition.image_name.clone(),
            })?;

        let beam = self.scope.beam(BeamKind::Electron);
        beam.apply_preset(preset)?;
        let frame = beam.grab_frame()?;

        record.set("stigmator", beam.stigmator()?);
        record.set("beam_shift", beam.beam_shift()?);
        record.set("pixel_size", frame.pixel_size);
        record.set("stage_position", self.scope.position()?);

        let path = settings
            .dirs
            .output_images
            .join(format!("slice_{:05}.png", self.slice_number));
        frame.save_png(&path)?;
        info!(path = %path.display(), "slice image saved");
        Ok(frame)
    }

    fn drift_correct(
        &mut self,
        settings: &Settings,
        frame: &Frame,
        record: &mut SliceRecord,
    ) -> Result<(), crate::microscope::MicroscopeError> {
        let mask = settings
            .drift_correction
            .mask_name
            .as_ref()
            .and_then(|name| self.masks.get_mut(name));
        let mask = match mask {
            Some(mask) => mask,
            None => {
                warn!("drift correction enabled without a resolvable mask");
                return Ok(());
            }
        };
        if let Some(shift) =
            correct_drift(self.scope.as_mut(), mask.as_mut(), frame, &settings.stage)?
        {
            record.set("drift_correction", shift);
        }
        Ok(())
    }

    /// Spawns the background resolution scorer; the finalize callback stores
    /// the measured resolution and persists the slice record.
    fn score_resolution(&mut self, settings: &Settings, frame: Frame, mut record: SliceRecord) {
        let criterion = match settings.find_criterion(&settings.acquisition.criterion_name) {
            Some(c) => c.clone(),
            None => {
                // unreachable after validation; keep the record either way
                error!(name = %settings.acquisition.criterion_name, "unknown resolution criterion");
                self.write_record(record, settings);
                return;
            }
        };

        if let Some(name) = &criterion.mask_name {
            if let Some(mask) = self.masks.get_mut(name) {
                mask.update_img(&frame);
            }
        }
        let mask = criterion
            .mask_name
            .as_ref()
            .and_then(|name| self.masks.get(name))
            .map(|boxed| boxed.as_ref());

        let evaluator = CriterionEvaluator::new(criterion.clone());
        let regions = evaluator.extract_regions(&frame, mask, None);

        let log_dir = settings.dirs.log.clone();
        let last_resolution = self.last_resolution.clone();
        let handle = evaluator.score_async(regions, self.slice_number, move |score, slice| {
            *last_resolution.lock() = score;
            record.set("resolution", score);
            if let Err(e) = record.write(&log_dir) {
                error!(slice_number = slice, error = %e, "failed to write slice record");
            }
            info!(slice_number = slice, resolution = score, "slice resolution measured");
        });
        self.pending_score = Some(handle);
    }

    /// A stop between acquisition and scoring still persists the slice
    /// record, so a saved frame always has matching telemetry. The never
    /// measured resolution is recorded as null.
    fn flush_record_on_stop(&self, mut record: SliceRecord, settings: &Settings) {
        record.set("resolution", Option::<f64>::None);
        self.write_record(record, settings);
    }

    fn write_record(&self, record: SliceRecord, settings: &Settings) {
        if let Err(e) = record.write(&settings.dirs.log) {
            error!(slice_number = self.slice_number, error = %e, "failed to write slice record");
        }
    }
}

/// Faults of the acquire step, routed through escalation as one unit.
#[derive(Debug, Error)]
enum AcquireError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Microscope(#[from] crate::microscope::MicroscopeError),

    #[error("failed to save slice image: {0}")]
    Image(#[from] image::ImageError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures;
    use crate::escalation::{AutoAcknowledge, LogEmail};
    use crate::microscope::virtual_scope::IDEAL_WORKING_DISTANCE;
    use crate::microscope::VirtualMicroscope;

    fn write_settings(dir: &std::path::Path) -> PathBuf {
        let mut settings = test_fixtures::settings();
        settings.dirs.output_images = dir.join("out/images");
        settings.dirs.log = dir.join("out/logs");
        settings.dirs.templates = dir.join("out/templates");
        settings.general.beam_settings_file = dir.join("out/beam.yaml");
        settings.image[0].resolution = [64, 48];
        // band within reach of the virtual pixel size (~156 nm at 64 cols)
        settings.criterion_calculation[0].detail = [2000e-9, 400e-9];

        let path = dir.join("settings.yaml");
        std::fs::write(&path, serde_yaml::to_string(&settings).unwrap()).unwrap();
        path
    }

    fn controller(dir: &std::path::Path) -> SliceCycleController {
        SliceCycleController::new(
            write_settings(dir),
            Box::new(VirtualMicroscope::new()),
            Box::new(LogEmail),
            Box::new(AutoAcknowledge),
        )
        .unwrap()
    }

    #[test]
    fn test_cycle_produces_image_and_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(dir.path());

        assert!(ctl.cycle().unwrap());
        // entering the next cycle joins the slice-0 scorer, after which the
        // record is guaranteed on disk
        assert!(ctl.cycle().unwrap());

        assert!(dir.path().join("out/images/slice_00000.png").exists());
        assert!(dir.path().join("out/logs/00000/record.yaml").exists());
        assert!(ctl.last_resolution() > 0.0);
    }

    #[test]
    fn test_stop_flag_ends_cycle_before_any_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(dir.path());

        ctl.stop();
        assert!(!ctl.cycle().unwrap());
        assert!(!dir.path().join("out/images/slice_00000.png").exists());
    }

    #[test]
    fn test_stop_after_acquire_still_writes_record() {
        use crate::geom::StagePosition;
        use crate::microscope::MicroscopeError;

        // triggers the shared stop flag on the first stage readback, which
        // during a default cycle happens while the acquisition telemetry is
        // recorded; the stop is then honoured at the step boundary after
        // the frame was saved
        struct StopOnPosition {
            scope: VirtualMicroscope,
            stop: Arc<Mutex<Option<StopFlag>>>,
        }

        impl Microscope for StopOnPosition {
            fn beam(&mut self, kind: BeamKind) -> &mut dyn Beam {
                self.scope.beam(kind)
            }
            fn position(&self) -> Result<StagePosition, MicroscopeError> {
                if let Some(stop) = self.stop.lock().as_ref() {
                    stop.trigger();
                }
                self.scope.position()
            }
            fn move_stage(&mut self, goal: StagePosition) -> Result<(), MicroscopeError> {
                self.scope.move_stage(goal)
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let slot: Arc<Mutex<Option<StopFlag>>> = Arc::new(Mutex::new(None));
        let mut ctl = SliceCycleController::new(
            write_settings(dir.path()),
            Box::new(StopOnPosition {
                scope: VirtualMicroscope::new(),
                stop: slot.clone(),
            }),
            Box::new(LogEmail),
            Box::new(AutoAcknowledge),
        )
        .unwrap();
        slot.lock().replace(ctl.stop_flag());

        assert!(!ctl.cycle().unwrap());

        // the image and its record both exist; resolution was never measured
        assert!(dir.path().join("out/images/slice_00000.png").exists());
        let raw =
            std::fs::read_to_string(dir.path().join("out/logs/00000/record.yaml")).unwrap();
        let record: serde_yaml::Value = serde_yaml::from_str(&raw).unwrap();
        assert!(record["values"]["resolution"].is_null());
        assert!(record["values"]["pixel_size"].as_f64().is_some());
    }

    #[test]
    fn test_run_honours_stop_and_clears_running_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(dir.path());

        // run() clears any pre-set stop first, so request it from a second
        // thread as a signal handler would
        let stop = ctl.stop_flag();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(200));
            stop.trigger();
        });

        ctl.run(0).unwrap();
        trigger.join().unwrap();

        assert!(!ctl.is_running());
        // at least the first cycle ran before the stop took effect
        assert!(ctl.metrics().snapshot().slices_completed >= 1);
    }

    #[test]
    fn test_wd_correction_advances_working_distance() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctl = controller(dir.path());

        assert!(ctl.cycle().unwrap());
        // slice 0 fires no autofunction (slice 0 is exempt), so the change
        // is exactly one wd_correction increment
        let wd = ctl
            .scope
            .beam(BeamKind::Electron)
            .working_distance()
            .unwrap();
        assert!((wd - (IDEAL_WORKING_DISTANCE + 30e-9)).abs() < 1e-12);
    }

    #[test]
    fn test_imaging_disabled_skips_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_settings(dir.path());

        let mut settings = test_fixtures::settings();
        settings.dirs.output_images = dir.path().join("out/images");
        settings.dirs.log = dir.path().join("out/logs");
        settings.dirs.templates = dir.path().join("out/templates");
        settings.general.beam_settings_file = dir.path().join("out/beam.yaml");
        settings.acquisition.imaging_enabled = false;
        std::fs::write(&path, serde_yaml::to_string(&settings).unwrap()).unwrap();

        let mut ctl = SliceCycleController::new(
            path,
            Box::new(VirtualMicroscope::new()),
            Box::new(LogEmail),
            Box::new(AutoAcknowledge),
        )
        .unwrap();

        assert!(ctl.cycle().unwrap());
        assert!(!dir.path().join("out/images/slice_00000.png").exists());
        // the record is still written
        assert!(dir.path().join("out/logs/00000/record.yaml").exists());
    }
}
