//! Background scoring worker.
//!
//! Resolution scoring of an acquired slice can take longer than the next
//! milling step, so it runs off the acquisition thread. The contract is
//! deliberately narrow: one worker per in-flight score, owned through a
//! `#[must_use]` handle that the caller joins before reusing any state the
//! score feeds into.

use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::frame::Frame;

use super::CriterionEvaluator;

/// Handle to one in-flight background score.
///
/// Dropping the handle without joining leaks the thread and loses the
/// result, hence the `must_use`.
#[must_use = "the scoring thread must be joined before the next slice cycle"]
#[derive(Debug)]
pub struct ScoreHandle {
    thread: JoinHandle<f64>,
    slice_number: u64,
}

impl ScoreHandle {
    /// Slice the in-flight score belongs to.
    pub fn slice_number(&self) -> u64 {
        self.slice_number
    }

    /// Blocks until the worker finishes and returns its score.
    ///
    /// A panicked worker yields `0.0` with an error log; scoring is
    /// advisory and must never take the acquisition loop down.
    pub fn join(self) -> f64 {
        let slice_number = self.slice_number;
        match self.thread.join() {
            Ok(score) => score,
            Err(_) => {
                error!(slice_number, "scoring worker panicked");
                0.0
            }
        }
    }
}

/// Spawns the scoring thread. `finalize` runs on the worker after the score
/// is computed, before the handle resolves.
pub(super) fn spawn<F>(
    evaluator: CriterionEvaluator,
    regions: Vec<Frame>,
    slice_number: u64,
    finalize: F,
) -> ScoreHandle
where
    F: FnOnce(f64, u64) + Send + 'static,
{
    let thread = thread::spawn(move || {
        let score = evaluator.score_regions(&regions);
        debug!(slice_number, score, "background score finished");
        finalize(score, slice_number);
        score
    });

    ScoreHandle {
        thread,
        slice_number,
    }
}
