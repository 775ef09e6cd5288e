//! Line-driven autofunction: the whole sweep inside one continuous scan.
//!
//! The beam is blanked, a continuous acquisition started, and the variable
//! stepped through the plan while toggling the blanker: each candidate gets
//! an unblanked stripe of scan lines, each transition a short blanked gap.
//! The resulting frame is partitioned into stripes separated by near-zero
//! rows; every line of a stripe becomes one criterion sample for the value
//! that was active while it was scanned. Stripes listed as forbidden (scan
//! artifacts at the frame edges, typically the first stripe) are excluded.

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::StageSettings;
use crate::frame::Frame;
use crate::mask::MaskModel;
use crate::microscope::{BeamKind, Microscope};

use super::{Autofunction, AutofunctionError};

/// Rows whose mean falls below this fraction of the brightest row count as
/// blanked separators.
const SEPARATOR_FRACTION: f32 = 0.1;

/// Blanked gap between stripes, in scan lines.
const GAP_LINES: u32 = 2;

#[derive(Debug)]
pub struct LineAutofunction {
    inner: Autofunction,
    /// Stripe indices excluded from attribution.
    forbidden_stripes: Vec<usize>,
}

impl LineAutofunction {
    pub fn new(inner: Autofunction) -> Self {
        Self {
            inner,
            forbidden_stripes: Vec::new(),
        }
    }

    pub(crate) fn inner(&self) -> &Autofunction {
        &self.inner
    }

    pub fn set_forbidden_stripes(&mut self, stripes: Vec<usize>) {
        self.forbidden_stripes = stripes;
    }

    /// The whole sweep in one invocation; always completes unless it errors.
    pub fn run(
        &mut self,
        scope: &mut dyn Microscope,
        mut mask: Option<&mut (dyn MaskModel + '_)>,
        stage: &StageSettings,
        curve_path: Option<&Path>,
    ) -> Result<bool, AutofunctionError> {
        let plan = self.inner.prepare(scope, mask.as_deref_mut(), stage)?;

        let (line_time, lines_per_stripe) = {
            let beam = scope.beam(BeamKind::Electron);
            let (cols, rows) = beam.resolution()?;
            let line_time = beam.dwell_time()? * beam.line_integration()? as f64 * cols as f64;
            let lines = (rows as usize / (2 * plan.len())).max(1);
            (line_time, lines)
        };
        debug!(
            autofunction = %self.inner.name(),
            entries = plan.len(),
            lines_per_stripe,
            line_time_s = line_time,
            "line sweep timing"
        );

        let frame = {
            let beam = scope.beam(BeamKind::Electron);
            beam.blank()?;
            beam.start_acquisition()?;
            drop(beam);

            for sample in plan.samples() {
                self.inner.set_value(scope, sample)?;
                let beam = scope.beam(BeamKind::Electron);
                beam.unblank()?;
                sleep_s(line_time * lines_per_stripe as f64);
                beam.blank()?;
                sleep_s(line_time * GAP_LINES as f64);
            }

            let beam = scope.beam(BeamKind::Electron);
            beam.stop_acquisition()?;
            beam.unblank()?;
            beam.grab_frame()?
        };

        let stripes = find_stripes(&frame, SEPARATOR_FRACTION);
        let usable: Vec<(usize, usize)> = stripes
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.forbidden_stripes.contains(i))
            .map(|(_, s)| *s)
            .collect();
        if usable.len() != plan.len() {
            warn!(
                autofunction = %self.inner.name(),
                stripes = usable.len(),
                entries = plan.len(),
                "stripe count does not match sweep entries"
            );
        }

        for (sample, &(start, end)) in plan.samples().iter().zip(usable.iter()) {
            for line in start..end {
                let score = self.inner.evaluator().score(&frame, mask.as_deref(), Some(line));
                self.inner.push_score(sample, score);
            }
        }

        self.inner.evaluate(scope, stage, curve_path)?;
        Ok(true)
    }
}

fn sleep_s(seconds: f64) {
    if seconds > 0.0 {
        thread::sleep(Duration::from_secs_f64(seconds));
    }
}

/// Contiguous runs of non-separator rows as `(start, end)` half-open ranges.
fn find_stripes(frame: &Frame, separator_fraction: f32) -> Vec<(usize, usize)> {
    let (rows, _) = frame.shape();
    let means: Vec<f32> = (0..rows).map(|r| frame.row_mean(r)).collect();
    let max_mean = means.iter().cloned().fold(0.0f32, f32::max);
    if max_mean <= 0.0 {
        return Vec::new();
    }
    let threshold = max_mean * separator_fraction;

    let mut stripes = Vec::new();
    let mut start = None;
    for (row, &mean) in means.iter().enumerate() {
        match (mean > threshold, start) {
            (true, None) => start = Some(row),
            (false, Some(s)) => {
                stripes.push((s, row));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        stripes.push((s, rows));
    }
    stripes
}
