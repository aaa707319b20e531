// Copyright (c) 2024 Mike Tsao

use crate::{
    composition::Element,
    error::{PulseError, Result, ValidationError},
    sequencing::{Goto, PositionSettings, Sequence},
    types::ChannelId,
};
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use strum_macros::{Display, EnumIter, EnumString};
use tracing::info;

/// How a swept parameter moves from `start` to `stop`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumIter, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Interpolation {
    /// Evenly spaced values.
    #[default]
    Linear,
    /// Evenly spaced ratios. Both endpoints must be positive.
    Log,
}

/// One parameter of one segment that varies across a sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SweepTarget {
    #[allow(missing_docs)]
    pub channel: ChannelId,
    /// Name of the segment within the channel's blueprint.
    pub segment: String,
    #[allow(missing_docs)]
    pub parameter: String,
    #[allow(missing_docs)]
    pub start: f64,
    #[allow(missing_docs)]
    pub stop: f64,
    /// Which loop of the [LoopPlan] drives this target. Targets sharing a
    /// loop move together.
    pub loop_index: usize,
    #[allow(missing_docs)]
    pub interpolation: Interpolation,
}
impl SweepTarget {
    /// A linear sweep driven by loop 0.
    pub fn new(channel: ChannelId, segment: &str, parameter: &str, start: f64, stop: f64) -> Self {
        Self {
            channel,
            segment: segment.to_string(),
            parameter: parameter.to_string(),
            start,
            stop,
            loop_index: 0,
            interpolation: Interpolation::Linear,
        }
    }

    #[allow(missing_docs)]
    pub fn in_loop(mut self, loop_index: usize) -> Self {
        self.loop_index = loop_index;
        self
    }

    #[allow(missing_docs)]
    pub fn logarithmic(mut self) -> Self {
        self.interpolation = Interpolation::Log;
        self
    }

    /// The value at progress `f`, 0 at `start` and 1 at `stop`.
    pub fn value_at(&self, f: f64) -> f64 {
        match self.interpolation {
            Interpolation::Linear => self.start + (self.stop - self.start) * f,
            Interpolation::Log => self.start * (self.stop / self.start).powf(f),
        }
    }

    /// Every value this target takes in a loop of `count` iterations.
    pub fn values(&self, count: usize) -> Vec<f64> {
        (0..count).map(|i| self.value_at(progress(i, count))).collect()
    }
}

/// Iteration counts of nested loops, outermost first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopPlan(pub Vec<usize>);
impl LoopPlan {
    /// How many combinations the plan enumerates.
    pub fn combinations(&self) -> usize {
        self.0.iter().product()
    }

    /// The iteration of every loop for combination `n`, outermost loop
    /// changing slowest.
    pub fn indices(&self, n: usize) -> Vec<usize> {
        let mut stride = self.combinations();
        self.0
            .iter()
            .map(|count| {
                stride /= count;
                (n / stride) % count
            })
            .collect()
    }
}

fn progress(i: usize, n: usize) -> f64 {
    if n <= 1 {
        0.0
    } else {
        i as f64 / (n - 1) as f64
    }
}

/// Turns one element plus a set of swept parameters into a sequence with
/// one position per combination.
#[derive(Clone, Copy, Debug, Default)]
pub struct SweepExpander;
impl SweepExpander {
    /// Builds the sweep. Everything is checked before any synthesis, so a bad
    /// target fails fast.
    pub fn expand(
        base: &Element,
        targets: &[SweepTarget],
        plan: &LoopPlan,
        defaults: &PositionSettings,
    ) -> Result<Sequence> {
        Self::expand_with_cancel(base, targets, plan, defaults, &AtomicBool::new(false))
    }

    /// Like [expand()](Self::expand), but gives up between combinations once
    /// `cancel` is set.
    pub fn expand_with_cancel(
        base: &Element,
        targets: &[SweepTarget],
        plan: &LoopPlan,
        defaults: &PositionSettings,
        cancel: &AtomicBool,
    ) -> Result<Sequence> {
        Self::validate(base, targets, plan)?;
        defaults.validate()?;
        let settings = PositionSettings {
            goto: Goto::Next,
            ..defaults.clone()
        };

        let total = plan.combinations();
        let mut sequence = Sequence::default();
        for n in 0..total {
            if cancel.load(Ordering::Relaxed) {
                return Err(PulseError::Interrupted {
                    completed: n,
                    total,
                });
            }
            let indices = plan.indices(n);
            let mut blueprints = base.blueprints().clone();
            for target in targets.iter() {
                let count = plan.0[target.loop_index];
                let value = target.value_at(progress(indices[target.loop_index], count));
                if let Some(blueprint) = blueprints.get_mut(&target.channel) {
                    blueprint.set_parameter(&target.segment, &target.parameter, value)?;
                }
            }
            let mut element = Element::build(blueprints, base.sample_rate())?;
            if let Some(name) = base.name() {
                element = element.named(name);
            }
            sequence.add_position(Arc::new(element), settings.clone())?;
        }
        info!(positions = total, targets = targets.len(), "expanded sweep");
        Ok(sequence)
    }

    /// The common case: one parameter swept linearly over `steps` values.
    #[allow(clippy::too_many_arguments)]
    pub fn linear(
        base: &Element,
        channel: ChannelId,
        segment: &str,
        parameter: &str,
        start: f64,
        stop: f64,
        steps: usize,
        defaults: &PositionSettings,
    ) -> Result<Sequence> {
        Self::expand(
            base,
            &[SweepTarget::new(channel, segment, parameter, start, stop)],
            &LoopPlan(vec![steps]),
            defaults,
        )
    }

    fn validate(base: &Element, targets: &[SweepTarget], plan: &LoopPlan) -> Result<()> {
        if let Some(loop_index) = plan.0.iter().position(|count| *count == 0) {
            return Err(ValidationError::EmptyLoop(loop_index).into());
        }
        for target in targets.iter() {
            if target.loop_index >= plan.0.len() {
                return Err(ValidationError::UnknownLoop {
                    loop_index: target.loop_index,
                    loop_count: plan.0.len(),
                }
                .into());
            }
            let blueprint = base
                .blueprint(target.channel)
                .ok_or(ValidationError::UnknownChannel(target.channel))?;
            let segment = blueprint
                .segment(&target.segment)
                .ok_or_else(|| ValidationError::UnknownSegment(target.segment.clone()))?;
            if segment.parameter(&target.parameter).is_none() {
                return Err(ValidationError::UnknownParameter {
                    kind: segment.kind().to_string(),
                    parameter: target.parameter.clone(),
                }
                .into());
            }
            if target.interpolation == Interpolation::Log && !(target.start > 0.0 && target.stop > 0.0)
            {
                return Err(ValidationError::NonPositiveLogSweep {
                    start: target.start,
                    stop: target.stop,
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{composition::BluePrint, synthesis::Segment, types::SampleRate};
    use float_cmp::approx_eq;
    use std::collections::BTreeMap;

    fn base() -> Element {
        let mut blueprints = BTreeMap::default();
        blueprints.insert(
            ChannelId(1),
            BluePrint::with_segments([
                Segment::ramp(0.0, 0.0, 1.0e-8).named("level"),
                Segment::sine(1.0e8, 0.5, 0.0, 0.0, 1.0e-8).named("tone"),
            ])
            .unwrap(),
        );
        Element::build(blueprints, SampleRate(1.0e9))
            .unwrap()
            .named("detuning")
    }

    fn swept_values(sequence: &Sequence, segment: &str, parameter: &str) -> Vec<f64> {
        sequence
            .positions()
            .map(|(_, p)| {
                p.element()
                    .and_then(|e| e.blueprint(ChannelId(1)))
                    .and_then(|bp| bp.segment(segment))
                    .and_then(|s| s.parameter(parameter))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn plan_indices_run_outer_loop_slowest() {
        let plan = LoopPlan(vec![3, 2]);
        assert_eq!(plan.combinations(), 6);
        let all: Vec<Vec<usize>> = (0..6).map(|n| plan.indices(n)).collect();
        assert_eq!(
            all,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![1, 0],
                vec![1, 1],
                vec![2, 0],
                vec![2, 1]
            ]
        );
    }

    #[test]
    fn linear_sweep_hits_both_endpoints() {
        let s = SweepExpander::linear(
            &base(),
            ChannelId(1),
            "level",
            "stop",
            0.0,
            10.0,
            3,
            &PositionSettings::default(),
        )
        .unwrap();
        assert_eq!(s.len(), 3);
        assert_eq!(swept_values(&s, "level", "stop"), vec![0.0, 5.0, 10.0]);
        assert_eq!(
            s.position(1).unwrap().element().and_then(|e| e.name()),
            Some("detuning")
        );
        assert_eq!(s.edges(), vec![(1, 2), (2, 3), (3, 1)]);
    }

    #[test]
    fn nested_loops_enumerate_the_product() {
        let targets = [
            SweepTarget::new(ChannelId(1), "level", "stop", 1.0, 3.0),
            SweepTarget::new(ChannelId(1), "tone", "frequency", 1.0e6, 1.0e8)
                .in_loop(1)
                .logarithmic(),
        ];
        let s = SweepExpander::expand(
            &base(),
            &targets,
            &LoopPlan(vec![3, 2]),
            &PositionSettings::default(),
        )
        .unwrap();
        assert_eq!(s.len(), 6);
        assert_eq!(
            swept_values(&s, "level", "stop"),
            vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]
        );
        let frequencies = swept_values(&s, "tone", "frequency");
        assert!(approx_eq!(f64, frequencies[0], 1.0e6, ulps = 4));
        assert!(approx_eq!(f64, frequencies[1], 1.0e8, ulps = 4));
        assert!(approx_eq!(f64, frequencies[5], 1.0e8, ulps = 4));
    }

    #[test]
    fn single_iteration_uses_start() {
        let target = SweepTarget::new(ChannelId(1), "level", "stop", 2.0, 9.0);
        assert_eq!(target.values(1), vec![2.0]);
        let log = SweepTarget::new(ChannelId(1), "level", "stop", 1.0, 100.0).logarithmic();
        let values = log.values(3);
        assert!(approx_eq!(f64, values[1], 10.0, ulps = 4));
    }

    #[test]
    fn defaults_apply_but_gotos_chain() {
        let defaults = PositionSettings {
            repetitions: 7,
            goto: Goto::Position(1),
            ..Default::default()
        };
        let s = SweepExpander::linear(&base(), ChannelId(1), "level", "stop", 0.0, 1.0, 2, &defaults)
            .unwrap();
        assert_eq!(s.position(2).unwrap().repetitions(), 7);
        assert!(!s.position(1).unwrap().has_explicit_goto());
    }

    #[test]
    fn bad_targets_fail_before_synthesis() {
        let defaults = PositionSettings::default();
        let e = base();
        let check = |targets: &[SweepTarget], plan: Vec<usize>| {
            SweepExpander::expand(&e, targets, &LoopPlan(plan), &defaults).unwrap_err()
        };
        let ok = SweepTarget::new(ChannelId(1), "level", "stop", 0.0, 1.0);
        assert_eq!(
            check(&[ok.clone().in_loop(2)], vec![3, 2]),
            PulseError::Validation(ValidationError::UnknownLoop {
                loop_index: 2,
                loop_count: 2
            })
        );
        assert_eq!(
            check(&[ok.clone()], vec![3, 0]),
            PulseError::Validation(ValidationError::EmptyLoop(1))
        );
        assert_eq!(
            check(
                &[SweepTarget::new(ChannelId(2), "level", "stop", 0.0, 1.0)],
                vec![2]
            ),
            PulseError::Validation(ValidationError::UnknownChannel(ChannelId(2)))
        );
        assert_eq!(
            check(
                &[SweepTarget::new(ChannelId(1), "nope", "stop", 0.0, 1.0)],
                vec![2]
            ),
            PulseError::Validation(ValidationError::UnknownSegment("nope".to_string()))
        );
        assert!(matches!(
            check(
                &[SweepTarget::new(ChannelId(1), "level", "tau", 0.0, 1.0)],
                vec![2]
            ),
            PulseError::Validation(ValidationError::UnknownParameter { .. })
        ));
        assert_eq!(
            check(
                &[SweepTarget::new(ChannelId(1), "tone", "frequency", 0.0, 1.0).logarithmic()],
                vec![2]
            ),
            PulseError::Validation(ValidationError::NonPositiveLogSweep {
                start: 0.0,
                stop: 1.0
            })
        );
    }

    #[test]
    fn cancellation_stops_expansion() {
        let cancel = AtomicBool::new(true);
        assert_eq!(
            SweepExpander::expand_with_cancel(
                &base(),
                &[],
                &LoopPlan(vec![4]),
                &PositionSettings::default(),
                &cancel
            )
            .unwrap_err(),
            PulseError::Interrupted {
                completed: 0,
                total: 4
            }
        );
    }
}
