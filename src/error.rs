// Copyright (c) 2024 Mike Tsao

//! The error taxonomy. Every failure carries enough structure (names, indices,
//! counts) to render a precise diagnostic without re-deriving anything.

use crate::types::{ChannelId, SampleRate, Seconds};
use std::collections::BTreeMap;
use thiserror::Error;

/// Shorthand for results produced by this crate.
pub type Result<T> = core::result::Result<T, PulseError>;

/// Any failure reported by the pulse-program pipeline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PulseError {
    #[allow(missing_docs)]
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A hold-until segment asked to end before the time already elapsed in
    /// its blueprint.
    #[error(
        "segment '{segment}' holds until {}s but {}s have already elapsed (gap {}s)",
        .absolute_time.0, .elapsed.0, .gap.0
    )]
    Scheduling {
        #[allow(missing_docs)]
        segment: String,
        #[allow(missing_docs)]
        absolute_time: Seconds,
        #[allow(missing_docs)]
        elapsed: Seconds,
        /// Always negative.
        gap: Seconds,
    },

    /// Channels of one element synthesized to different lengths.
    #[error("channels have different sample counts: {}", format_counts(.counts))]
    DurationMismatch {
        /// Sample count of every channel, including the ones that agree.
        counts: BTreeMap<ChannelId, usize>,
    },

    #[allow(missing_docs)]
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// A goto or event jump pointed outside the sequence.
    #[error("position {position} jumps to {target}, but the sequence has {position_count} positions")]
    GotoTarget {
        #[allow(missing_docs)]
        position: usize,
        #[allow(missing_docs)]
        target: usize,
        #[allow(missing_docs)]
        position_count: usize,
    },

    #[allow(missing_docs)]
    #[error(transparent)]
    Format(#[from] FormatError),

    /// A caller raised the cancellation flag between elements.
    #[error("interrupted after {completed} of {total} steps")]
    Interrupted {
        #[allow(missing_docs)]
        completed: usize,
        #[allow(missing_docs)]
        total: usize,
    },
}

fn format_counts(counts: &BTreeMap<ChannelId, usize>) -> String {
    counts
        .iter()
        .map(|(channel, count)| format!("channel {} = {count}", channel.0))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Malformed input caught before any synthesis happens.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[allow(missing_docs)]
    #[error("unknown segment kind '{0}'")]
    UnknownKind(String),
    #[allow(missing_docs)]
    #[error("segment kind '{kind}' has no parameter named '{parameter}'")]
    UnknownParameter { kind: String, parameter: String },
    #[allow(missing_docs)]
    #[error("segment kind '{kind}' requires parameter '{parameter}'")]
    MissingParameter { kind: String, parameter: String },
    #[allow(missing_docs)]
    #[error("parameter '{parameter}' = {value} is invalid: {reason}")]
    InvalidParameter {
        parameter: String,
        value: f64,
        reason: &'static str,
    },
    #[allow(missing_docs)]
    #[error("duration {0:?} is invalid")]
    InvalidDuration(Seconds),
    #[allow(missing_docs)]
    #[error("sample rate {0:?} is invalid")]
    InvalidSampleRate(SampleRate),
    #[allow(missing_docs)]
    #[error("no segment named '{0}'")]
    UnknownSegment(String),
    #[allow(missing_docs)]
    #[error("index {index} is out of range for {len} items")]
    IndexOutOfRange { index: usize, len: usize },
    #[allow(missing_docs)]
    #[error("repetitions must be within 1..=65536, got {0}")]
    Repetitions(u32),
    #[allow(missing_docs)]
    #[error("{0:?} is not part of this element")]
    UnknownChannel(ChannelId),
    #[allow(missing_docs)]
    #[error("an element needs at least one channel")]
    NoChannels,
    #[allow(missing_docs)]
    #[error("a blueprint needs at least one segment")]
    EmptyBlueprint,
    #[allow(missing_docs)]
    #[error("element at position {position} does not match the sequence: {reason}")]
    InconsistentElement { position: usize, reason: String },
    #[allow(missing_docs)]
    #[error("position {position} cannot hold this subsequence: {reason}")]
    InvalidSubsequence { position: usize, reason: String },
    #[allow(missing_docs)]
    #[error("sweep loop {loop_index} is not part of a plan with {loop_count} loops")]
    UnknownLoop { loop_index: usize, loop_count: usize },
    #[allow(missing_docs)]
    #[error("sweep loop {0} has zero iterations")]
    EmptyLoop(usize),
    #[allow(missing_docs)]
    #[error("incomplete settings: {0}")]
    Builder(String),
    #[allow(missing_docs)]
    #[error("logarithmic sweep needs positive endpoints, got {start} and {stop}")]
    NonPositiveLogSweep { start: f64, stop: f64 },
}

/// A custom segment expression that cannot be compiled.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExpressionError {
    #[allow(missing_docs)]
    #[error("expression must look like 't, a, b: body'; no ':' found")]
    MissingSignature,
    #[allow(missing_docs)]
    #[error("the first parameter must be 't', found '{0}'")]
    MissingTimeParameter(String),
    /// Declared in the signature but no value was supplied.
    #[error("parameter '{0}' is declared but has no value")]
    UndeclaredParameter(String),
    /// Used in the body but absent from the signature.
    #[error("'{name}' at position {position} is not a declared parameter")]
    UnknownIdentifier { name: String, position: usize },
    #[allow(missing_docs)]
    #[error(
        "unknown function '{name}' at position {position}; expected one of {}",
        crate::synthesis::Function::names().join(", ")
    )]
    UnknownFunction { name: String, position: usize },
    #[allow(missing_docs)]
    #[error("parse error at position {position}: {message}")]
    Parse { position: usize, message: String },
}

/// An export-time constraint violation. Raised before any byte is returned.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FormatError {
    #[allow(missing_docs)]
    #[error("cannot export an empty sequence")]
    EmptySequence,
    #[allow(missing_docs)]
    #[error("position {position} references element {element}, which does not exist")]
    MissingElement { position: usize, element: usize },
    #[allow(missing_docs)]
    #[error("position {position} references subsequence {subsequence}, which does not exist")]
    MissingSubsequence { position: usize, subsequence: usize },
    #[allow(missing_docs)]
    #[error("element at position {position} has no data for channel {}", .channel.0)]
    MissingChannel { position: usize, channel: ChannelId },
    #[allow(missing_docs)]
    #[error("sample rate {} at position {position} differs from {}", .found.0, .expected.0)]
    SampleRateMismatch {
        position: usize,
        expected: SampleRate,
        found: SampleRate,
    },
    #[allow(missing_docs)]
    #[error("channel {} resolution of {resolution_bits} bits leaves no room for {marker_count} markers", .channel.0)]
    ResolutionTooSmall {
        channel: ChannelId,
        resolution_bits: u8,
        marker_count: u8,
    },
    #[allow(missing_docs)]
    #[error("channel {} value {value} at sample {index} exceeds the range {}..{}", .channel.0, .min, .max)]
    VoltageOutOfRange {
        channel: ChannelId,
        index: usize,
        value: f64,
        min: f64,
        max: f64,
    },
    #[allow(missing_docs)]
    #[error("name '{name}' is longer than {max} bytes")]
    NameTooLong { name: String, max: usize },
    #[allow(missing_docs)]
    #[error("malformed container: {0}")]
    Malformed(String),
    #[allow(missing_docs)]
    #[error("container I/O failed: {0}")]
    Io(String),
}
impl From<std::io::Error> for FormatError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}
impl From<zip::result::ZipError> for FormatError {
    fn from(value: zip::result::ZipError) -> Self {
        Self::Io(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_mismatch_names_every_channel() {
        let mut counts = BTreeMap::default();
        counts.insert(ChannelId(1), 1000);
        counts.insert(ChannelId(2), 999);
        let e = PulseError::DurationMismatch { counts };
        assert_eq!(
            e.to_string(),
            "channels have different sample counts: channel 1 = 1000, channel 2 = 999"
        );
    }

    #[test]
    fn nested_errors_convert() {
        let e: PulseError = ExpressionError::MissingSignature.into();
        assert!(matches!(e, PulseError::Expression(_)));
        let e: PulseError = FormatError::EmptySequence.into();
        assert_eq!(e.to_string(), "cannot export an empty sequence");
    }
}
