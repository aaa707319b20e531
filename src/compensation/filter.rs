// Copyright (c) 2024 Mike Tsao

use crate::{
    error::{PulseError, Result, ValidationError},
    types::SampleRate,
};
use core::f64::consts::TAU;
use derivative::Derivative;
use rustfft::{num_complex::Complex, FftPlanner};
use serde::{Deserialize, Serialize};

/// How an RC filter's corner is specified.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Cutoff {
    /// -3 dB frequency in Hertz.
    Frequency(f64),
    /// RC time constant in seconds.
    TimeConstant(f64),
}
impl Cutoff {
    /// The equivalent RC time constant.
    pub fn tau(&self) -> f64 {
        match self {
            Cutoff::Frequency(f) => 1.0 / (TAU * f),
            Cutoff::TimeConstant(tau) => *tau,
        }
    }

    fn value(&self) -> f64 {
        match self {
            Cutoff::Frequency(v) | Cutoff::TimeConstant(v) => *v,
        }
    }
}

/// A measured or tabulated response. Frequencies ascend and are non-negative;
/// phases are in radians. Negative frequencies mirror the table with negated
/// phase.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SampledResponse {
    #[allow(missing_docs)]
    pub frequencies: Vec<f64>,
    #[allow(missing_docs)]
    pub magnitudes: Vec<f64>,
    #[allow(missing_docs)]
    pub phases: Vec<f64>,
}
impl SampledResponse {
    fn interpolate(&self, frequency: f64) -> Complex<f64> {
        let f = frequency.abs();
        let last = self.frequencies.len() - 1;
        let (magnitude, phase) = if f <= self.frequencies[0] {
            (self.magnitudes[0], self.phases[0])
        } else if f >= self.frequencies[last] {
            (self.magnitudes[last], self.phases[last])
        } else {
            let upper = self.frequencies.partition_point(|x| *x <= f);
            let lower = upper - 1;
            let span = self.frequencies[upper] - self.frequencies[lower];
            let w = (f - self.frequencies[lower]) / span;
            (
                self.magnitudes[lower] + w * (self.magnitudes[upper] - self.magnitudes[lower]),
                self.phases[lower] + w * (self.phases[upper] - self.phases[lower]),
            )
        };
        let phase = if frequency < 0.0 { -phase } else { phase };
        Complex::from_polar(magnitude, phase)
    }
}

/// A channel's frequency response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "model")]
pub enum FilterSpec {
    /// `H(f) = (1 + j2πfτ)^-order`
    RcLowPass {
        #[allow(missing_docs)]
        cutoff: Cutoff,
        #[allow(missing_docs)]
        order: u32,
    },
    /// `H(f) = (j2πfτ / (1 + j2πfτ))^order`, with `H(0) = dc_gain`.
    RcHighPass {
        #[allow(missing_docs)]
        cutoff: Cutoff,
        #[allow(missing_docs)]
        order: u32,
        #[allow(missing_docs)]
        dc_gain: f64,
    },
    #[allow(missing_docs)]
    Sampled(SampledResponse),
}
impl FilterSpec {
    /// The complex response at `frequency` Hertz, which may be negative.
    pub fn response(&self, frequency: f64) -> Complex<f64> {
        match self {
            FilterSpec::RcLowPass { cutoff, order } => {
                let s = Complex::new(0.0, TAU * frequency * cutoff.tau());
                (Complex::new(1.0, 0.0) + s).powi(-(*order as i32))
            }
            FilterSpec::RcHighPass {
                cutoff,
                order,
                dc_gain,
            } => {
                if frequency == 0.0 {
                    return Complex::new(*dc_gain, 0.0);
                }
                let s = Complex::new(0.0, TAU * frequency * cutoff.tau());
                (s / (Complex::new(1.0, 0.0) + s)).powi(*order as i32)
            }
            FilterSpec::Sampled(table) => table.interpolate(frequency),
        }
    }

    /// Checks that the model can be evaluated.
    pub fn validate(&self) -> Result<()> {
        match self {
            FilterSpec::RcLowPass { cutoff, order } | FilterSpec::RcHighPass { cutoff, order, .. } => {
                if !(cutoff.value().is_finite() && cutoff.value() > 0.0) {
                    return Err(invalid("cutoff", cutoff.value(), "must be positive"));
                }
                if *order == 0 {
                    return Err(invalid("order", 0.0, "must be at least 1"));
                }
                Ok(())
            }
            FilterSpec::Sampled(table) => {
                let n = table.frequencies.len();
                if n == 0 || table.magnitudes.len() != n || table.phases.len() != n {
                    return Err(invalid(
                        "frequencies",
                        n as f64,
                        "table columns must be non-empty and equally long",
                    ));
                }
                if table.frequencies.windows(2).any(|w| w[1] <= w[0])
                    || table.frequencies[0] < 0.0
                {
                    return Err(invalid(
                        "frequencies",
                        table.frequencies[0],
                        "must be non-negative and strictly ascending",
                    ));
                }
                Ok(())
            }
        }
    }
}

fn invalid(parameter: &str, value: f64, reason: &'static str) -> PulseError {
    ValidationError::InvalidParameter {
        parameter: parameter.to_string(),
        value,
        reason,
    }
    .into()
}

/// Pre-distorts waveforms so that, after passing through a known channel
/// response, they come out as intended.
#[derive(Clone, Copy, Debug, Derivative, PartialEq)]
#[derivative(Default)]
pub struct FilterCompensator {
    /// Floor for `|H(f)|` when dividing, so spectral nulls can't blow up.
    #[derivative(Default(value = "1.0e-6"))]
    epsilon: f64,
}
impl FilterCompensator {
    #[allow(missing_docs)]
    pub fn new_with(epsilon: f64) -> Self {
        Self {
            epsilon: epsilon.abs(),
        }
    }

    #[allow(missing_docs)]
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// The FFT length used for a signal of `n` samples. Twice the signal,
    /// rounded up to a power of two, so circular effects land in the padding.
    pub fn padded_len(n: usize) -> usize {
        (2 * n).max(1).next_power_of_two()
    }

    /// Frequency in Hertz of each FFT bin, negative above Nyquist.
    pub fn bin_frequencies(len: usize, sample_rate: SampleRate) -> Vec<f64> {
        let df = sample_rate.0 / len as f64;
        (0..len)
            .map(|k| {
                if k <= len / 2 {
                    k as f64 * df
                } else {
                    (k as f64 - len as f64) * df
                }
            })
            .collect()
    }

    /// The filter's response at each FFT bin. The response at the Nyquist
    /// bin of an even-length transform is made real, keeping its magnitude
    /// and the sign of its real part, so that a real signal stays real.
    pub fn bin_responses(
        filter: &FilterSpec,
        len: usize,
        sample_rate: SampleRate,
    ) -> Vec<Complex<f64>> {
        Self::bin_frequencies(len, sample_rate)
            .into_iter()
            .enumerate()
            .map(|(k, frequency)| {
                let h = filter.response(frequency);
                if len % 2 == 0 && k == len / 2 {
                    Complex::new(h.norm().copysign(h.re), 0.0)
                } else {
                    h
                }
            })
            .collect()
    }

    /// Deconvolves `desired` by the filter: zero-pad, transform, divide by
    /// the response (magnitude floored at epsilon), transform back, truncate.
    pub fn compensate(
        &self,
        desired: &[f64],
        filter: &FilterSpec,
        sample_rate: SampleRate,
    ) -> Result<Vec<f64>> {
        let epsilon = self.epsilon;
        self.transform(desired, filter, sample_rate, |x, h| {
            let magnitude = h.norm();
            let h = if magnitude < epsilon {
                if magnitude == 0.0 {
                    Complex::new(epsilon, 0.0)
                } else {
                    h * (epsilon / magnitude)
                }
            } else {
                h
            };
            x / h
        })
    }

    /// Passes `signal` through the filter, the forward counterpart of
    /// [compensate()](Self::compensate).
    pub fn apply(
        &self,
        signal: &[f64],
        filter: &FilterSpec,
        sample_rate: SampleRate,
    ) -> Result<Vec<f64>> {
        self.transform(signal, filter, sample_rate, |x, h| x * h)
    }

    fn transform(
        &self,
        signal: &[f64],
        filter: &FilterSpec,
        sample_rate: SampleRate,
        combine: impl Fn(Complex<f64>, Complex<f64>) -> Complex<f64>,
    ) -> Result<Vec<f64>> {
        filter.validate()?;
        if !sample_rate.is_valid() {
            return Err(ValidationError::InvalidSampleRate(sample_rate).into());
        }
        if signal.is_empty() {
            return Ok(Vec::default());
        }
        let len = Self::padded_len(signal.len());
        let mut buffer: Vec<Complex<f64>> = signal
            .iter()
            .map(|v| Complex::new(*v, 0.0))
            .chain(core::iter::repeat(Complex::new(0.0, 0.0)))
            .take(len)
            .collect();

        let mut planner = FftPlanner::<f64>::new();
        planner.plan_fft_forward(len).process(&mut buffer);
        for (bin, h) in buffer
            .iter_mut()
            .zip(Self::bin_responses(filter, len, sample_rate))
        {
            *bin = combine(*bin, h);
        }
        planner.plan_fft_inverse(len).process(&mut buffer);

        let scale = 1.0 / len as f64;
        Ok(buffer
            .iter()
            .take(signal.len())
            .map(|c| c.re * scale)
            .collect())
    }
}
