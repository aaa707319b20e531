// Copyright (c) 2024 Mike Tsao

//! Wall-clock time and the sample clock that discretizes it.

use derivative::Derivative;
use serde::{Deserialize, Serialize};
use synonym::Synonym;

/// Represents the [seconds](https://en.wikipedia.org/wiki/Second) unit of time.
#[derive(Synonym, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Seconds(pub f64);
impl Seconds {
    /// Zero seconds.
    pub const fn zero() -> Seconds {
        Seconds(0.0)
    }

    /// Returns true if the value is a finite, non-negative number.
    pub fn is_valid_duration(&self) -> bool {
        self.0.is_finite() && self.0 >= 0.0
    }
}

/// Samples per second of an AWG channel clock. Always positive.
#[derive(Synonym, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
#[synonym(skip(Default))]
#[serde(rename_all = "kebab-case")]
pub struct SampleRate(#[derivative(Default(value = "1.0e9"))] pub f64);
#[allow(missing_docs)]
impl SampleRate {
    pub const DEFAULT_SAMPLE_RATE: f64 = 1.0e9;
    pub const DEFAULT: SampleRate = SampleRate(Self::DEFAULT_SAMPLE_RATE);

    /// Returns true if this rate can drive synthesis.
    pub fn is_valid(&self) -> bool {
        self.0.is_finite() && self.0 > 0.0
    }

    /// The duration of a single sample.
    pub fn period(&self) -> Seconds {
        Seconds(1.0 / self.0)
    }

    /// How many whole samples cover the given duration. Never less than one.
    pub fn sample_count(&self, duration: Seconds) -> usize {
        ((duration.0 * self.0).round() as usize).max(1)
    }

    /// Converts a time offset into the nearest sample index.
    pub fn index_of(&self, offset: Seconds) -> usize {
        (offset.0 * self.0).round().max(0.0) as usize
    }

    /// The time at which the given sample index begins.
    pub fn time_of(&self, index: usize) -> Seconds {
        Seconds(index as f64 / self.0)
    }
}
