//! Sweeping strategies: candidate-value generation for autofunctions.
//!
//! A strategy turns the live base value of a microscope variable into a
//! [`SweepPlan`], a finite ordered list of `(repetition, value)` samples.
//! Plans are immutable once generated and consumed exactly once per
//! optimization pass; a partially consumed plan is abandoned, never reused
//! (the step autofunction keeps its own cursor instead).
//!
//! Three strategies exist:
//!
//! - **Basic**: zig-zag linear sweep. Each repetition covers
//!   `base + [low, high]` in `steps` even samples, alternating direction per
//!   repetition to cancel first-order drift and hysteresis between passes.
//!   Out-of-limit values are clamped to the nearest limit with a warning.
//! - **Spiral**: two-axis sweep over concentric rings, for stigmation-like
//!   variables. Odd rings are phase-shifted by half a step for coverage;
//!   traversal direction alternates per repetition; points outside the
//!   radial hard limit are skipped with a warning.
//! - **Interleaved**: a basic sweep with the base value re-inserted before
//!   every candidate, giving each sample a paired differential baseline.

use thiserror::Error;
use tracing::warn;

use crate::config::{AutofunctionSpec, SweepStrategyKind};
use crate::geom::Point;
use crate::microscope::SweepValue;

/// Sweep construction faults.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("strategy {strategy:?} cannot sweep from base value {base:?}")]
    BaseKindMismatch {
        strategy: SweepStrategyKind,
        base: SweepValue,
    },
}

/// One planned candidate: which repetition it belongs to and the value to set.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SweepSample {
    pub repetition: u32,
    pub value: SweepValue,
    /// True for the re-inserted baseline samples of the interleaved strategy.
    pub is_baseline: bool,
}

impl SweepSample {
    fn candidate(repetition: u32, value: SweepValue) -> Self {
        Self {
            repetition,
            value,
            is_baseline: false,
        }
    }

    fn baseline(repetition: u32, value: SweepValue) -> Self {
        Self {
            repetition,
            value,
            is_baseline: true,
        }
    }
}

/// A finite ordered sequence of candidate values for one pass.
#[derive(Clone, Debug)]
pub struct SweepPlan {
    samples: Vec<SweepSample>,
}

impl SweepPlan {
    pub fn samples(&self) -> &[SweepSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SweepSample> {
        self.samples.get(index)
    }
}

/// A configured sweeping strategy, resolved once from an autofunction spec.
#[derive(Clone, Debug)]
pub struct SweepStrategy {
    kind: SweepStrategyKind,
    range: [f64; 2],
    max_limits: [f64; 2],
    steps: u32,
    total_cycles: u32,
    spiral_cycles: u32,
}

impl SweepStrategy {
    pub fn from_spec(spec: &AutofunctionSpec) -> Self {
        Self {
            kind: spec.sweeping_strategy,
            range: spec.sweeping_range,
            max_limits: spec.sweeping_max_limits,
            steps: spec.sweeping_steps,
            total_cycles: spec.sweeping_total_cycles,
            spiral_cycles: spec.sweeping_spiral_cycles.unwrap_or(1),
        }
    }

    pub fn kind(&self) -> SweepStrategyKind {
        self.kind
    }

    /// Generates the plan for one pass starting from the live base value.
    pub fn plan(&self, base: SweepValue) -> Result<SweepPlan, SweepError> {
        match (self.kind, base) {
            (SweepStrategyKind::Basic, SweepValue::Scalar(b)) => Ok(self.plan_basic(b)),
            (SweepStrategyKind::Interleaved, SweepValue::Scalar(b)) => {
                Ok(self.plan_interleaved(b))
            }
            (SweepStrategyKind::Spiral, SweepValue::Pair(b)) => Ok(self.plan_spiral(b)),
            (kind, base) => Err(SweepError::BaseKindMismatch {
                strategy: kind,
                base,
            }),
        }
    }

    /// Evenly spaced scalar candidates for one repetition, zig-zag ordered.
    fn linear_space(&self, base: f64, repetition: u32) -> Vec<f64> {
        let low = base + self.range[0];
        let high = base + self.range[1];
        let n = self.steps as usize;
        let mut values: Vec<f64> = (0..n)
            .map(|i| {
                if n == 1 {
                    low
                } else {
                    low + (high - low) * i as f64 / (n - 1) as f64
                }
            })
            .collect();
        if repetition % 2 == 1 {
            values.reverse();
        }
        values
    }

    fn clamp_to_limits(&self, value: f64) -> f64 {
        let [min, max] = self.max_limits;
        if value < min || value > max {
            let clamped = value.clamp(min, max);
            warn!(value, min, max, clamped, "sweep value out of limits, clamping");
            clamped
        } else {
            value
        }
    }

    fn plan_basic(&self, base: f64) -> SweepPlan {
        let mut samples = Vec::with_capacity((self.steps * self.total_cycles) as usize);
        for repetition in 0..self.total_cycles {
            for value in self.linear_space(base, repetition) {
                let value = self.clamp_to_limits(value);
                samples.push(SweepSample::candidate(repetition, SweepValue::Scalar(value)));
            }
        }
        SweepPlan { samples }
    }

    fn plan_interleaved(&self, base: f64) -> SweepPlan {
        let inner = self.plan_basic(base);
        let mut samples = Vec::with_capacity(inner.len() * 2);
        for sample in inner.samples() {
            samples.push(SweepSample::baseline(
                sample.repetition,
                SweepValue::Scalar(base),
            ));
            samples.push(*sample);
        }
        SweepPlan { samples }
    }

    fn plan_spiral(&self, base: Point) -> SweepPlan {
        let steps_per_ring = self.steps as usize;
        let rings = self.spiral_cycles as usize;
        let total = steps_per_ring * rings;
        let radial_extent = self.range[1];
        let radial_limit = self.max_limits[1];

        let mut samples = Vec::with_capacity(total * self.total_cycles as usize);
        for repetition in 0..self.total_cycles {
            let order: Box<dyn Iterator<Item = usize>> = if repetition % 2 == 0 {
                Box::new(0..total)
            } else {
                Box::new((0..total).rev())
            };
            for s in order {
                let ring = s / steps_per_ring;
                let step = s % steps_per_ring;
                // rings start at one step of radius to avoid a degenerate
                // zero-radius ring
                let radius = radial_extent / rings as f64 * (ring + 1) as f64;
                let mut angle =
                    2.0 * std::f64::consts::PI / steps_per_ring as f64 * step as f64;
                if ring % 2 == 1 {
                    // half-step phase shift on odd rings for better coverage
                    angle += std::f64::consts::PI / steps_per_ring as f64;
                }
                let value = base + Point::new(angle.cos() * radius, angle.sin() * radius);
                if value.radius() > radial_limit {
                    warn!(
                        x = value.x,
                        y = value.y,
                        limit = radial_limit,
                        "spiral sweep point outside radial limit, skipping"
                    );
                    continue;
                }
                samples.push(SweepSample::candidate(repetition, SweepValue::Pair(value)));
            }
        }
        SweepPlan { samples }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures::focus_spec;

    fn strategy(range: [f64; 2], limits: [f64; 2], steps: u32, cycles: u32) -> SweepStrategy {
        let mut spec = focus_spec();
        spec.sweeping_range = range;
        spec.sweeping_max_limits = limits;
        spec.sweeping_steps = steps;
        spec.sweeping_total_cycles = cycles;
        SweepStrategy::from_spec(&spec)
    }

    fn scalars(plan: &SweepPlan) -> Vec<f64> {
        plan.samples()
            .iter()
            .map(|s| s.value.as_scalar().unwrap())
            .collect()
    }

    #[test]
    fn test_basic_sweep_entry_count() {
        let plan = strategy([-2.0, 2.0], [0.0, 100.0], 5, 3)
            .plan(SweepValue::Scalar(10.0))
            .unwrap();
        assert_eq!(plan.len(), 15);
    }

    #[test]
    fn test_basic_zig_zag_values() {
        // base=10, range=(-2,2), steps=5, total_cycles=2:
        // repetition 0 ascends 8..12, repetition 1 descends 12..8
        let plan = strategy([-2.0, 2.0], [0.0, 100.0], 5, 2)
            .plan(SweepValue::Scalar(10.0))
            .unwrap();
        let values = scalars(&plan);
        assert_eq!(values[..5], [8.0, 9.0, 10.0, 11.0, 12.0]);
        assert_eq!(values[5..], [12.0, 11.0, 10.0, 9.0, 8.0]);
        assert!(plan.samples()[..5].iter().all(|s| s.repetition == 0));
        assert!(plan.samples()[5..].iter().all(|s| s.repetition == 1));
    }

    #[test]
    fn test_consecutive_repetitions_reverse_direction() {
        let plan = strategy([-1.0, 1.0], [-100.0, 100.0], 4, 4)
            .plan(SweepValue::Scalar(0.0))
            .unwrap();
        let values = scalars(&plan);
        for rep in 0..4usize {
            let chunk = &values[rep * 4..(rep + 1) * 4];
            let ascending = chunk.windows(2).all(|w| w[1] > w[0]);
            let descending = chunk.windows(2).all(|w| w[1] < w[0]);
            if rep % 2 == 0 {
                assert!(ascending, "repetition {rep} should ascend");
            } else {
                assert!(descending, "repetition {rep} should descend");
            }
        }
    }

    #[test]
    fn test_out_of_limit_values_clamp_to_nearest_bound() {
        let plan = strategy([-2.0, 2.0], [9.0, 11.0], 5, 1)
            .plan(SweepValue::Scalar(10.0))
            .unwrap();
        let values = scalars(&plan);
        // 8 clamps up to 9, 12 clamps down to 11; count is preserved
        assert_eq!(values, vec![9.0, 9.0, 10.0, 11.0, 11.0]);
    }

    #[test]
    fn test_interleaved_pairs_base_with_each_candidate() {
        let mut spec = focus_spec();
        spec.sweeping_strategy = SweepStrategyKind::Interleaved;
        spec.sweeping_range = [-1.0, 1.0];
        spec.sweeping_max_limits = [-100.0, 100.0];
        spec.sweeping_steps = 3;
        spec.sweeping_total_cycles = 1;
        let plan = SweepStrategy::from_spec(&spec)
            .plan(SweepValue::Scalar(5.0))
            .unwrap();
        let samples = plan.samples();
        assert_eq!(samples.len(), 6);
        for pair in samples.chunks(2) {
            assert!(pair[0].is_baseline);
            assert_eq!(pair[0].value, SweepValue::Scalar(5.0));
            assert!(!pair[1].is_baseline);
        }
    }

    #[test]
    fn test_spiral_ring_radii_and_direction() {
        let mut spec = focus_spec();
        spec.sweeping_strategy = SweepStrategyKind::Spiral;
        spec.variable = crate::config::SweepVariable::Stigmator;
        spec.sweeping_range = [0.0, 1.0];
        spec.sweeping_max_limits = [0.0, 10.0];
        spec.sweeping_steps = 4;
        spec.sweeping_total_cycles = 2;
        spec.sweeping_spiral_cycles = Some(2);
        let strategy = SweepStrategy::from_spec(&spec);

        let plan = strategy.plan(SweepValue::Pair(Point::default())).unwrap();
        // 2 rings x 4 steps x 2 repetitions, nothing skipped
        assert_eq!(plan.len(), 16);

        let radii: Vec<f64> = plan
            .samples()
            .iter()
            .map(|s| s.value.as_pair().unwrap().radius())
            .collect();
        // repetition 0: inner ring first
        assert!(radii[..4].iter().all(|r| (r - 0.5).abs() < 1e-9));
        assert!(radii[4..8].iter().all(|r| (r - 1.0).abs() < 1e-9));
        // repetition 1 reversed: outer ring first
        assert!(radii[8..12].iter().all(|r| (r - 1.0).abs() < 1e-9));
    }

    #[test]
    fn test_spiral_skips_points_beyond_radial_limit() {
        let mut spec = focus_spec();
        spec.sweeping_strategy = SweepStrategyKind::Spiral;
        spec.variable = crate::config::SweepVariable::Stigmator;
        spec.sweeping_range = [0.0, 1.0];
        spec.sweeping_max_limits = [0.0, 0.6];
        spec.sweeping_steps = 4;
        spec.sweeping_total_cycles = 1;
        spec.sweeping_spiral_cycles = Some(2);
        let strategy = SweepStrategy::from_spec(&spec);

        let plan = strategy.plan(SweepValue::Pair(Point::default())).unwrap();
        // outer ring (radius 1.0) is entirely outside the 0.6 limit
        assert_eq!(plan.len(), 4);
        assert!(plan
            .samples()
            .iter()
            .all(|s| s.value.as_pair().unwrap().radius() <= 0.6 + 1e-9));
    }

    #[test]
    fn test_spiral_rejects_scalar_base() {
        let mut spec = focus_spec();
        spec.sweeping_strategy = SweepStrategyKind::Spiral;
        spec.sweeping_spiral_cycles = Some(1);
        let strategy = SweepStrategy::from_spec(&spec);
        assert!(matches!(
            strategy.plan(SweepValue::Scalar(1.0)),
            Err(SweepError::BaseKindMismatch { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn test_basic_sweep_always_stays_within_limits(
            base in -10.0f64..10.0,
            half in 0.1f64..5.0,
            steps in 2u32..12,
            cycles in 1u32..4,
        ) {
            let plan = strategy([-half, half], [-8.0, 8.0], steps, cycles)
                .plan(SweepValue::Scalar(base))
                .unwrap();
            proptest::prop_assert_eq!(plan.len(), (steps * cycles) as usize);
            for value in scalars(&plan) {
                proptest::prop_assert!((-8.0..=8.0).contains(&value));
            }
        }

        #[test]
        fn test_interleaved_sweep_alternates_baselines(
            base in -5.0f64..5.0,
            steps in 2u32..8,
        ) {
            let mut spec = focus_spec();
            spec.sweeping_strategy = SweepStrategyKind::Interleaved;
            spec.sweeping_range = [-1.0, 1.0];
            spec.sweeping_max_limits = [-100.0, 100.0];
            spec.sweeping_steps = steps;
            spec.sweeping_total_cycles = 1;
            let plan = SweepStrategy::from_spec(&spec)
                .plan(SweepValue::Scalar(base))
                .unwrap();
            for (i, sample) in plan.samples().iter().enumerate() {
                proptest::prop_assert_eq!(sample.is_baseline, i % 2 == 0);
            }
        }
    }

    #[test]
    fn test_odd_rings_are_phase_shifted() {
        let mut spec = focus_spec();
        spec.sweeping_strategy = SweepStrategyKind::Spiral;
        spec.variable = crate::config::SweepVariable::Stigmator;
        spec.sweeping_range = [0.0, 1.0];
        spec.sweeping_max_limits = [0.0, 10.0];
        spec.sweeping_steps = 4;
        spec.sweeping_total_cycles = 1;
        spec.sweeping_spiral_cycles = Some(2);
        let plan = SweepStrategy::from_spec(&spec)
            .plan(SweepValue::Pair(Point::default()))
            .unwrap();

        // first point of ring 0 sits at angle 0, first point of ring 1 at
        // half a step (45 degrees for 4 steps)
        let ring0 = plan.samples()[0].value.as_pair().unwrap();
        let ring1 = plan.samples()[4].value.as_pair().unwrap();
        assert!((ring0.y).abs() < 1e-9);
        assert!((ring1.y.atan2(ring1.x) - std::f64::consts::FRAC_PI_4).abs() < 1e-9);
    }
}
