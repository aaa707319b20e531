// Copyright (c) 2024 Mike Tsao

use super::segment::{ExponentialDirection, Marker, Segment, SegmentShape};
use crate::{
    error::{PulseError, Result, ValidationError},
    types::{MarkerTrack, SampleRate, Seconds},
};
use bit_vec::BitVec;
use core::f64::consts::TAU;
use tracing::warn;

/// A condition that synthesis corrected on its own. The caller is told, but
/// nothing fails.
#[derive(Clone, Debug, PartialEq)]
pub enum SynthesisWarning {
    /// The duration was shorter than one sample period and was raised to it.
    MinimumDuration {
        #[allow(missing_docs)]
        segment: String,
        #[allow(missing_docs)]
        requested: Seconds,
        #[allow(missing_docs)]
        clamped: Seconds,
    },
    /// A marker extended past the end of its segment and was shortened.
    MarkerBounds {
        #[allow(missing_docs)]
        segment: String,
        #[allow(missing_docs)]
        track: MarkerTrack,
        #[allow(missing_docs)]
        requested: Marker,
        #[allow(missing_docs)]
        clamped: Marker,
    },
}

/// Samples and marker bits for one stretch of one channel.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SegmentSamples {
    #[allow(missing_docs)]
    pub samples: Vec<f64>,
    #[allow(missing_docs)]
    pub marker1: BitVec,
    #[allow(missing_docs)]
    pub marker2: BitVec,
}
impl SegmentSamples {
    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Appends another stretch with no gap.
    pub fn extend(&mut self, other: SegmentSamples) {
        self.samples.extend(other.samples);
        self.marker1.extend(other.marker1.iter());
        self.marker2.extend(other.marker2.iter());
    }

    /// The value a following hold-until segment would carry.
    pub fn last_value(&self) -> Option<f64> {
        self.samples.last().copied()
    }
}

/// What synthesizing one segment produced.
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesizedSegment {
    #[allow(missing_docs)]
    pub data: SegmentSamples,
    /// The duration after hold-until resolution and minimum-duration
    /// clamping.
    pub duration: Seconds,
    #[allow(missing_docs)]
    pub warnings: Vec<SynthesisWarning>,
}

/// Where a segment sits within its blueprint.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SynthesisContext {
    /// Time already covered by earlier segments.
    pub elapsed: Seconds,
    /// Last sample of the previous segment, or zero for the first one.
    pub carried_value: f64,
}

/// Turns segments into samples at a fixed rate. Synthesis is a pure function
/// of the segment, the rate, and the [SynthesisContext].
#[derive(Clone, Copy, Debug)]
pub struct SegmentSynthesizer {
    sample_rate: SampleRate,
}
impl SegmentSynthesizer {
    /// Fails if the rate cannot drive synthesis.
    pub fn new(sample_rate: SampleRate) -> Result<Self> {
        if !sample_rate.is_valid() {
            return Err(ValidationError::InvalidSampleRate(sample_rate).into());
        }
        Ok(Self { sample_rate })
    }

    #[allow(missing_docs)]
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Produces samples and marker bits for one segment.
    pub fn synthesize(
        &self,
        segment: &Segment,
        context: SynthesisContext,
    ) -> Result<SynthesizedSegment> {
        segment.validate()?;
        let mut warnings = Vec::default();

        let requested = match segment.shape() {
            SegmentShape::HoldUntil { absolute_time } => {
                let gap = absolute_time.0 - context.elapsed.0;
                if gap < 0.0 {
                    return Err(PulseError::Scheduling {
                        segment: segment.name().to_string(),
                        absolute_time: *absolute_time,
                        elapsed: context.elapsed,
                        gap: Seconds(gap),
                    });
                }
                Seconds(gap)
            }
            _ => segment.duration(),
        };
        let period = self.sample_rate.period();
        let duration = if requested.0 < period.0 {
            warn!(
                segment = segment.name(),
                requested = requested.0,
                "duration below one sample period; clamping"
            );
            warnings.push(SynthesisWarning::MinimumDuration {
                segment: segment.name().to_string(),
                requested,
                clamped: period,
            });
            period
        } else {
            requested
        };

        let n = self.sample_rate.sample_count(duration);
        let samples = self.render(segment.shape(), n, context.carried_value)?;

        let [marker1, marker2] = [MarkerTrack::Marker1, MarkerTrack::Marker2].map(|track| {
            let requested = *segment.marker(track);
            let clamped = requested.clamped_to(duration);
            if clamped != requested {
                warn!(
                    segment = segment.name(),
                    %track,
                    "marker extends past its segment; clamping"
                );
                warnings.push(SynthesisWarning::MarkerBounds {
                    segment: segment.name().to_string(),
                    track,
                    requested,
                    clamped,
                });
            }
            self.marker_bits(&clamped, n)
        });

        Ok(SynthesizedSegment {
            data: SegmentSamples {
                samples,
                marker1,
                marker2,
            },
            duration,
            warnings,
        })
    }

    fn render(&self, shape: &SegmentShape, n: usize, carried_value: f64) -> Result<Vec<f64>> {
        let sr = self.sample_rate.0;
        let time = |i: usize| i as f64 / sr;
        let samples = match shape {
            SegmentShape::Ramp { start, stop } => (0..n)
                .map(|i| start + (stop - start) * i as f64 / n as f64)
                .collect(),
            SegmentShape::Sine {
                frequency,
                amplitude,
                phase,
                offset,
            } => (0..n)
                .map(|i| amplitude * (TAU * frequency * time(i) + phase).sin() + offset)
                .collect(),
            SegmentShape::Gaussian {
                amplitude,
                width,
                center,
                offset,
            } => (0..n)
                .map(|i| {
                    let z = (time(i) - center) / width;
                    amplitude * (-0.5 * z * z).exp() + offset
                })
                .collect(),
            SegmentShape::Exponential {
                amplitude,
                tau,
                direction,
            } => (0..n)
                .map(|i| {
                    let decay = (-time(i) / tau).exp();
                    match direction {
                        ExponentialDirection::Rise => amplitude * (1.0 - decay),
                        ExponentialDirection::Decay => amplitude * decay,
                    }
                })
                .collect(),
            SegmentShape::HoldUntil { .. } => vec![carried_value; n],
            SegmentShape::Custom(expression) => {
                let compiled = expression.compile()?;
                (0..n).map(|i| compiled.evaluate(time(i))).collect()
            }
        };
        Ok(samples)
    }

    fn marker_bits(&self, marker: &Marker, n: usize) -> BitVec {
        let mut bits = BitVec::from_elem(n, false);
        if marker.is_off() {
            return bits;
        }
        let start = self.sample_rate.index_of(marker.delay).min(n);
        let len = (marker.duration.0 * self.sample_rate.0).round() as usize;
        let end = (start + len).min(n);
        (start..end).for_each(|i| bits.set(i, true));
        bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesis::CustomExpression;
    use float_cmp::approx_eq;
    use std::collections::BTreeMap;

    fn gigasample() -> SegmentSynthesizer {
        SegmentSynthesizer::new(SampleRate(1.0e9)).unwrap()
    }

    #[test]
    fn ramp_of_one_microsecond_at_one_gigasample() {
        let s = gigasample()
            .synthesize(&Segment::ramp(0.0, 1.0, 1.0e-6), SynthesisContext::default())
            .unwrap();
        assert_eq!(s.data.len(), 1000);
        assert_eq!(s.data.samples[0], 0.0);
        assert!(approx_eq!(f64, s.data.samples[500], 0.5, ulps = 2));
        assert!(approx_eq!(f64, s.data.samples[999], 0.999, ulps = 2));
        assert!(s.warnings.is_empty());
        assert_eq!(s.data.marker1.len(), 1000);
        assert!(s.data.marker1.none());
    }

    #[test]
    fn synthesis_is_deterministic() {
        let segment = Segment::sine(3.3e6, 0.7, 0.25, -0.1, 3.7e-6);
        let a = gigasample()
            .synthesize(&segment, SynthesisContext::default())
            .unwrap();
        let b = gigasample()
            .synthesize(&segment, SynthesisContext::default())
            .unwrap();
        assert_eq!(a, b);
        let a_bits: Vec<u64> = a.data.samples.iter().map(|v| v.to_bits()).collect();
        let b_bits: Vec<u64> = b.data.samples.iter().map(|v| v.to_bits()).collect();
        assert_eq!(a_bits, b_bits);
    }

    #[test]
    fn shapes_follow_their_formulas() {
        let synth = SegmentSynthesizer::new(SampleRate(1000.0)).unwrap();
        let ctx = SynthesisContext::default();

        let sine = synth
            .synthesize(&Segment::sine(250.0, 2.0, 0.0, 1.0, 0.004), ctx)
            .unwrap();
        let expected = [1.0, 3.0, 1.0, -1.0];
        for (got, want) in sine.data.samples.iter().zip(expected) {
            assert!(approx_eq!(f64, *got, want, epsilon = 1e-12));
        }

        let gauss = synth
            .synthesize(&Segment::gaussian(1.0, 0.002, 0.005, 0.5, 0.01), ctx)
            .unwrap();
        assert!(approx_eq!(f64, gauss.data.samples[5], 1.5, epsilon = 1e-12));
        assert!(approx_eq!(
            f64,
            gauss.data.samples[7],
            (-0.5f64).exp() + 0.5,
            epsilon = 1e-12
        ));

        let rise = synth
            .synthesize(
                &Segment::exponential(2.0, 0.001, ExponentialDirection::Rise, 0.005),
                ctx,
            )
            .unwrap();
        assert_eq!(rise.data.samples[0], 0.0);
        assert!(approx_eq!(
            f64,
            rise.data.samples[1],
            2.0 * (1.0 - (-1.0f64).exp()),
            epsilon = 1e-12
        ));

        let decay = synth
            .synthesize(
                &Segment::exponential(2.0, 0.001, ExponentialDirection::Decay, 0.005),
                ctx,
            )
            .unwrap();
        assert_eq!(decay.data.samples[0], 2.0);
        assert!(approx_eq!(
            f64,
            decay.data.samples[2],
            2.0 * (-2.0f64).exp(),
            epsilon = 1e-12
        ));

        let mut parameters = BTreeMap::default();
        parameters.insert("a".to_string(), 3.0);
        let custom = synth
            .synthesize(
                &Segment::custom(CustomExpression::new("t, a: a * t * 1000", parameters), 0.003),
                ctx,
            )
            .unwrap();
        assert_eq!(custom.data.len(), 3);
        for (got, want) in custom.data.samples.iter().zip([0.0, 3.0, 6.0]) {
            assert!(approx_eq!(f64, *got, want, epsilon = 1e-12));
        }
    }

    #[test]
    fn hold_until_fills_the_gap_with_the_carried_value() {
        let synth = SegmentSynthesizer::new(SampleRate(1000.0)).unwrap();
        let held = synth
            .synthesize(
                &Segment::hold_until(0.010),
                SynthesisContext {
                    elapsed: Seconds(0.004),
                    carried_value: 0.25,
                },
            )
            .unwrap();
        assert_eq!(held.data.samples, vec![0.25; 6]);
        assert!(approx_eq!(f64, held.duration.0, 0.006, epsilon = 1e-15));
    }

    #[test]
    fn hold_until_in_the_past_names_the_gap() {
        let synth = SegmentSynthesizer::new(SampleRate(1000.0)).unwrap();
        let e = synth
            .synthesize(
                &Segment::hold_until(0.002).named("wait"),
                SynthesisContext {
                    elapsed: Seconds(0.005),
                    carried_value: 0.0,
                },
            )
            .unwrap_err();
        match e {
            PulseError::Scheduling { segment, gap, .. } => {
                assert_eq!(segment, "wait");
                assert!(approx_eq!(f64, gap.0, -0.003, epsilon = 1e-15));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_durations_clamp_to_one_sample() {
        let s = gigasample()
            .synthesize(&Segment::ramp(1.0, 2.0, 1.0e-12), SynthesisContext::default())
            .unwrap();
        assert_eq!(s.data.samples, vec![1.0]);
        assert_eq!(s.duration.0, 1.0e-9);
        assert!(matches!(
            s.warnings.as_slice(),
            [SynthesisWarning::MinimumDuration { .. }]
        ));
    }

    #[test]
    fn markers_are_high_inside_their_window() {
        let synth = SegmentSynthesizer::new(SampleRate(1000.0)).unwrap();
        let segment = Segment::ramp(0.0, 1.0, 0.010)
            .with_marker(MarkerTrack::Marker1, Marker::new(0.002, 0.003))
            .with_marker(MarkerTrack::Marker2, Marker::new(0.0, 0.001));
        let s = synth.synthesize(&segment, SynthesisContext::default()).unwrap();
        let m1: Vec<bool> = s.data.marker1.iter().collect();
        assert_eq!(
            m1,
            vec![false, false, true, true, true, false, false, false, false, false]
        );
        assert!(s.data.marker2[0]);
        assert!(!s.data.marker2[1]);
    }

    #[test]
    fn overlong_markers_are_clamped_and_reported() {
        let synth = SegmentSynthesizer::new(SampleRate(1000.0)).unwrap();
        let segment = Segment::ramp(0.0, 1.0, 0.010)
            .named("r")
            .with_marker(MarkerTrack::Marker2, Marker::new(0.009, 0.003));
        let s = synth.synthesize(&segment, SynthesisContext::default()).unwrap();
        match s.warnings.as_slice() {
            [SynthesisWarning::MarkerBounds {
                segment,
                track,
                clamped,
                ..
            }] => {
                assert_eq!(segment, "r");
                assert_eq!(*track, MarkerTrack::Marker2);
                assert!(approx_eq!(
                    f64,
                    clamped.delay.0 + clamped.duration.0,
                    0.010,
                    epsilon = 1e-15
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(s.data.marker2[9]);
        assert_eq!(s.data.marker2.iter().filter(|b| *b).count(), 1);
    }

    #[test]
    fn rejects_bad_sample_rates() {
        assert!(SegmentSynthesizer::new(SampleRate(0.0)).is_err());
        assert!(SegmentSynthesizer::new(SampleRate(-5.0)).is_err());
    }
}
