// Copyright (c) 2024 Mike Tsao

use super::expression::CustomExpression;
use crate::{
    error::{PulseError, Result, ValidationError},
    types::{MarkerTrack, Seconds},
};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumCount, EnumIter, EnumString, IntoStaticStr};

/// The closed set of primitive shapes.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumCount,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SegmentKind {
    #[allow(missing_docs)]
    Ramp,
    #[allow(missing_docs)]
    Sine,
    #[allow(missing_docs)]
    Gaussian,
    #[allow(missing_docs)]
    Exponential,
    /// Holds the previous value until an absolute time within the blueprint.
    HoldUntil,
    /// A user expression over `t`.
    Custom,
}
impl SegmentKind {
    /// The stem used when a blueprint has to invent a name.
    pub fn name_stem(&self) -> &'static str {
        match self {
            SegmentKind::Ramp => "ramp",
            SegmentKind::Sine => "sine",
            SegmentKind::Gaussian => "gaussian",
            SegmentKind::Exponential => "exponential",
            SegmentKind::HoldUntil => "hold_until",
            SegmentKind::Custom => "custom",
        }
    }
}

/// Whether an exponential segment charges toward its amplitude or discharges
/// from it.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ExponentialDirection {
    /// `amplitude * (1 - exp(-t / tau))`
    #[default]
    Rise,
    /// `amplitude * exp(-t / tau)`
    Decay,
}

/// The shape-specific payload of a [Segment].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum SegmentShape {
    /// Linear interpolation from `start` toward `stop`.
    Ramp {
        #[allow(missing_docs)]
        start: f64,
        #[allow(missing_docs)]
        stop: f64,
    },
    /// `amplitude * sin(2π * frequency * t + phase) + offset`
    Sine {
        /// Hertz.
        frequency: f64,
        #[allow(missing_docs)]
        amplitude: f64,
        /// Radians.
        phase: f64,
        #[allow(missing_docs)]
        offset: f64,
    },
    /// `amplitude * exp(-0.5 * ((t - center) / width)^2) + offset`
    Gaussian {
        #[allow(missing_docs)]
        amplitude: f64,
        /// Seconds; must be positive.
        width: f64,
        /// Seconds from segment start.
        center: f64,
        #[allow(missing_docs)]
        offset: f64,
    },
    #[allow(missing_docs)]
    Exponential {
        amplitude: f64,
        /// Time constant in seconds; must be positive.
        tau: f64,
        direction: ExponentialDirection,
    },
    /// Holds the previous segment's last value until `absolute_time`, measured
    /// from the start of the blueprint.
    HoldUntil {
        #[allow(missing_docs)]
        absolute_time: Seconds,
    },
    #[allow(missing_docs)]
    Custom(CustomExpression),
}
impl SegmentShape {
    #[allow(missing_docs)]
    pub fn kind(&self) -> SegmentKind {
        match self {
            SegmentShape::Ramp { .. } => SegmentKind::Ramp,
            SegmentShape::Sine { .. } => SegmentKind::Sine,
            SegmentShape::Gaussian { .. } => SegmentKind::Gaussian,
            SegmentShape::Exponential { .. } => SegmentKind::Exponential,
            SegmentShape::HoldUntil { .. } => SegmentKind::HoldUntil,
            SegmentShape::Custom(_) => SegmentKind::Custom,
        }
    }

    /// Names of the numeric parameters this shape exposes, in a stable order.
    pub fn parameter_names(&self) -> Vec<&str> {
        match self {
            SegmentShape::Ramp { .. } => vec!["start", "stop"],
            SegmentShape::Sine { .. } => vec!["frequency", "amplitude", "phase", "offset"],
            SegmentShape::Gaussian { .. } => vec!["amplitude", "width", "center", "offset"],
            SegmentShape::Exponential { .. } => vec!["amplitude", "tau"],
            SegmentShape::HoldUntil { .. } => vec!["absolute_time"],
            SegmentShape::Custom(e) => e.parameters().keys().map(|k| k.as_str()).collect(),
        }
    }

    /// Reads a numeric parameter by name.
    pub fn parameter(&self, name: &str) -> Option<f64> {
        match (self, name) {
            (SegmentShape::Ramp { start, .. }, "start") => Some(*start),
            (SegmentShape::Ramp { stop, .. }, "stop") => Some(*stop),
            (SegmentShape::Sine { frequency, .. }, "frequency") => Some(*frequency),
            (SegmentShape::Sine { amplitude, .. }, "amplitude") => Some(*amplitude),
            (SegmentShape::Sine { phase, .. }, "phase") => Some(*phase),
            (SegmentShape::Sine { offset, .. }, "offset") => Some(*offset),
            (SegmentShape::Gaussian { amplitude, .. }, "amplitude") => Some(*amplitude),
            (SegmentShape::Gaussian { width, .. }, "width") => Some(*width),
            (SegmentShape::Gaussian { center, .. }, "center") => Some(*center),
            (SegmentShape::Gaussian { offset, .. }, "offset") => Some(*offset),
            (SegmentShape::Exponential { amplitude, .. }, "amplitude") => Some(*amplitude),
            (SegmentShape::Exponential { tau, .. }, "tau") => Some(*tau),
            (SegmentShape::HoldUntil { absolute_time }, "absolute_time") => Some(absolute_time.0),
            (SegmentShape::Custom(e), _) => e.parameter(name),
            _ => None,
        }
    }

    /// Writes a numeric parameter by name. The new value is not validated
    /// here; see [validate()](Self::validate).
    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        let slot = match (&mut *self, name) {
            (SegmentShape::Ramp { start, .. }, "start") => start,
            (SegmentShape::Ramp { stop, .. }, "stop") => stop,
            (SegmentShape::Sine { frequency, .. }, "frequency") => frequency,
            (SegmentShape::Sine { amplitude, .. }, "amplitude") => amplitude,
            (SegmentShape::Sine { phase, .. }, "phase") => phase,
            (SegmentShape::Sine { offset, .. }, "offset") => offset,
            (SegmentShape::Gaussian { amplitude, .. }, "amplitude") => amplitude,
            (SegmentShape::Gaussian { width, .. }, "width") => width,
            (SegmentShape::Gaussian { center, .. }, "center") => center,
            (SegmentShape::Gaussian { offset, .. }, "offset") => offset,
            (SegmentShape::Exponential { amplitude, .. }, "amplitude") => amplitude,
            (SegmentShape::Exponential { tau, .. }, "tau") => tau,
            (SegmentShape::HoldUntil { absolute_time }, "absolute_time") => &mut absolute_time.0,
            (SegmentShape::Custom(e), _) => {
                return if e.set_parameter(name, value) {
                    Ok(())
                } else {
                    Err(self.unknown_parameter(name))
                };
            }
            _ => return Err(self.unknown_parameter(name)),
        };
        *slot = value;
        Ok(())
    }

    fn unknown_parameter(&self, name: &str) -> PulseError {
        ValidationError::UnknownParameter {
            kind: self.kind().to_string(),
            parameter: name.to_string(),
        }
        .into()
    }

    /// The amplitude, for shapes that have one.
    pub fn amplitude(&self) -> Option<f64> {
        match self {
            SegmentShape::Sine { amplitude, .. }
            | SegmentShape::Gaussian { amplitude, .. }
            | SegmentShape::Exponential { amplitude, .. } => Some(*amplitude),
            _ => None,
        }
    }

    /// Checks that every parameter can drive synthesis. Custom expressions are
    /// compiled as part of the check.
    pub fn validate(&self) -> Result<()> {
        for name in self.parameter_names() {
            if let Some(value) = self.parameter(name) {
                if !value.is_finite() {
                    return Err(invalid(name, value, "must be finite"));
                }
            }
        }
        match self {
            SegmentShape::Gaussian { width, .. } if *width <= 0.0 => {
                Err(invalid("width", *width, "must be positive"))
            }
            SegmentShape::Exponential { tau, .. } if *tau <= 0.0 => {
                Err(invalid("tau", *tau, "must be positive"))
            }
            SegmentShape::HoldUntil { absolute_time } if absolute_time.0 < 0.0 => Err(invalid(
                "absolute_time",
                absolute_time.0,
                "must not be negative",
            )),
            SegmentShape::Custom(e) => e.compile().map(|_| ()).map_err(PulseError::from),
            _ => Ok(()),
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

/// A boolean auxiliary pulse, timed relative to the start of its segment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Marker {
    #[allow(missing_docs)]
    pub delay: Seconds,
    #[allow(missing_docs)]
    pub duration: Seconds,
}
impl Marker {
    #[allow(missing_docs)]
    pub fn new(delay: f64, duration: f64) -> Self {
        Self {
            delay: Seconds(delay),
            duration: Seconds(duration),
        }
    }

    /// A marker that never goes high.
    pub fn is_off(&self) -> bool {
        self.duration.0 <= 0.0
    }

    /// Fits the marker inside a segment of the given length. Returns the
    /// original when it already fits.
    pub fn clamped_to(&self, segment_duration: Seconds) -> Marker {
        let delay = self.delay.0.clamp(0.0, segment_duration.0);
        let duration = self.duration.0.max(0.0).min(segment_duration.0 - delay);
        Marker::new(delay, duration)
    }
}

/// One primitive waveform piece with a fixed duration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Segment {
    pub(crate) name: String,
    pub(crate) shape: SegmentShape,
    /// Ignored by hold-until segments, whose duration depends on their
    /// position in the blueprint.
    pub(crate) duration: Seconds,
    pub(crate) marker1: Marker,
    pub(crate) marker2: Marker,
}
impl Segment {
    /// Creates an unnamed segment. The owning blueprint names it.
    pub fn new(shape: SegmentShape, duration: f64) -> Self {
        Self {
            name: String::default(),
            shape,
            duration: Seconds(duration),
            marker1: Marker::default(),
            marker2: Marker::default(),
        }
    }

    #[allow(missing_docs)]
    pub fn ramp(start: f64, stop: f64, duration: f64) -> Self {
        Self::new(SegmentShape::Ramp { start, stop }, duration)
    }

    #[allow(missing_docs)]
    pub fn sine(frequency: f64, amplitude: f64, phase: f64, offset: f64, duration: f64) -> Self {
        Self::new(
            SegmentShape::Sine {
                frequency,
                amplitude,
                phase,
                offset,
            },
            duration,
        )
    }

    #[allow(missing_docs)]
    pub fn gaussian(amplitude: f64, width: f64, center: f64, offset: f64, duration: f64) -> Self {
        Self::new(
            SegmentShape::Gaussian {
                amplitude,
                width,
                center,
                offset,
            },
            duration,
        )
    }

    #[allow(missing_docs)]
    pub fn exponential(
        amplitude: f64,
        tau: f64,
        direction: ExponentialDirection,
        duration: f64,
    ) -> Self {
        Self::new(
            SegmentShape::Exponential {
                amplitude,
                tau,
                direction,
            },
            duration,
        )
    }

    #[allow(missing_docs)]
    pub fn hold_until(absolute_time: f64) -> Self {
        Self::new(
            SegmentShape::HoldUntil {
                absolute_time: Seconds(absolute_time),
            },
            0.0,
        )
    }

    #[allow(missing_docs)]
    pub fn custom(expression: CustomExpression, duration: f64) -> Self {
        Self::new(SegmentShape::Custom(expression), duration)
    }

    /// Requests a name. The blueprint may add a suffix to keep names unique.
    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    #[allow(missing_docs)]
    pub fn with_marker(mut self, track: MarkerTrack, marker: Marker) -> Self {
        *self.marker_mut(track) = marker;
        self
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[allow(missing_docs)]
    pub fn kind(&self) -> SegmentKind {
        self.shape.kind()
    }

    #[allow(missing_docs)]
    pub fn shape(&self) -> &SegmentShape {
        &self.shape
    }

    /// The requested duration. Hold-until segments report zero here; their
    /// effective duration comes out of synthesis.
    pub fn duration(&self) -> Seconds {
        self.duration
    }

    #[allow(missing_docs)]
    pub fn amplitude(&self) -> Option<f64> {
        self.shape.amplitude()
    }

    #[allow(missing_docs)]
    pub fn marker(&self, track: MarkerTrack) -> &Marker {
        match track {
            MarkerTrack::Marker1 => &self.marker1,
            MarkerTrack::Marker2 => &self.marker2,
        }
    }

    pub(crate) fn marker_mut(&mut self, track: MarkerTrack) -> &mut Marker {
        match track {
            MarkerTrack::Marker1 => &mut self.marker1,
            MarkerTrack::Marker2 => &mut self.marker2,
        }
    }

    /// Reads a parameter by name. `duration` is accepted for every kind
    /// except hold-until.
    pub fn parameter(&self, name: &str) -> Option<f64> {
        if name == "duration" && self.kind() != SegmentKind::HoldUntil {
            Some(self.duration.0)
        } else {
            self.shape.parameter(name)
        }
    }

    /// Writes a parameter by name, then revalidates the segment. On failure
    /// the segment is left unchanged.
    pub fn set_parameter(&mut self, name: &str, value: f64) -> Result<()> {
        let mut candidate = self.clone();
        if name == "duration" && self.kind() != SegmentKind::HoldUntil {
            candidate.duration = Seconds(value);
        } else {
            candidate.shape.set_parameter(name, value)?;
        }
        candidate.validate()?;
        *self = candidate;
        Ok(())
    }

    /// Checks everything that can be checked without knowing the sample rate
    /// or the segment's position.
    pub fn validate(&self) -> Result<()> {
        if self.kind() != SegmentKind::HoldUntil && !self.duration.is_valid_duration() {
            return Err(ValidationError::InvalidDuration(self.duration).into());
        }
        for marker in [&self.marker1, &self.marker2] {
            if !marker.delay.is_valid_duration() {
                return Err(invalid("marker delay", marker.delay.0, "must not be negative"));
            }
            if !marker.duration.is_valid_duration() {
                return Err(invalid(
                    "marker duration",
                    marker.duration.0,
                    "must not be negative",
                ));
            }
        }
        self.shape.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use strum::{EnumCount, IntoEnumIterator};

    #[test]
    fn kinds_use_kebab_case_names() {
        assert_eq!(SegmentKind::iter().count(), SegmentKind::COUNT);
        for kind in SegmentKind::iter() {
            assert_eq!(kind.name_stem().replace('_', "-"), kind.to_string());
        }
        assert_eq!(SegmentKind::HoldUntil.to_string(), "hold-until");
        assert_eq!("gaussian".parse::<SegmentKind>(), Ok(SegmentKind::Gaussian));
        assert!("square".parse::<SegmentKind>().is_err());
        assert_eq!(SegmentKind::HoldUntil.name_stem(), "hold_until");
    }

    #[test]
    fn parameters_are_reachable_by_name() {
        let mut s = Segment::sine(1.0e6, 0.5, 0.0, 0.1, 1.0e-6);
        assert_eq!(s.parameter("frequency"), Some(1.0e6));
        assert_eq!(s.parameter("duration"), Some(1.0e-6));
        assert_eq!(s.amplitude(), Some(0.5));
        assert!(s.set_parameter("phase", 1.0).is_ok());
        assert_eq!(s.parameter("phase"), Some(1.0));
        assert!(s.set_parameter("duration", 2.0e-6).is_ok());
        assert_eq!(s.duration().0, 2.0e-6);
        assert!(matches!(
            s.set_parameter("width", 1.0),
            Err(PulseError::Validation(ValidationError::UnknownParameter { .. }))
        ));
        assert_eq!(Segment::ramp(0.0, 1.0, 1.0).amplitude(), None);
    }

    #[test]
    fn failed_edits_leave_segment_untouched() {
        let mut s = Segment::gaussian(1.0, 1.0e-8, 5.0e-8, 0.0, 1.0e-7);
        assert!(s.set_parameter("width", -1.0).is_err());
        assert_eq!(s.parameter("width"), Some(1.0e-8));
        assert!(s.set_parameter("duration", -1.0).is_err());
        assert_eq!(s.duration().0, 1.0e-7);
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        assert!(Segment::exponential(1.0, 0.0, ExponentialDirection::Rise, 1.0)
            .validate()
            .is_err());
        assert!(Segment::ramp(0.0, f64::NAN, 1.0).validate().is_err());
        assert!(Segment::hold_until(-1.0).validate().is_err());
        assert!(Segment::custom(CustomExpression::new("x: x", BTreeMap::default()), 1.0)
            .validate()
            .is_err());
        assert!(Segment::ramp(0.0, 1.0, 1.0)
            .with_marker(MarkerTrack::Marker1, Marker::new(-0.1, 0.1))
            .validate()
            .is_err());
        assert!(Segment::ramp(0.0, 1.0, 1.0).validate().is_ok());
    }

    #[test]
    fn markers_clamp_inside_their_segment() {
        let m = Marker::new(0.9, 0.3).clamped_to(Seconds(1.0));
        assert_eq!(m.delay.0, 0.9);
        assert!((m.delay.0 + m.duration.0 - 1.0).abs() < 1e-12);

        let m = Marker::new(2.0, 0.3).clamped_to(Seconds(1.0));
        assert_eq!(m, Marker::new(1.0, 0.0));

        let fits = Marker::new(0.1, 0.2);
        assert_eq!(fits.clamped_to(Seconds(1.0)), fits);
    }
}
