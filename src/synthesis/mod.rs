// Copyright (c) 2024 Mike Tsao

//! Primitive waveform segments and the synthesizer that turns them into
//! samples and marker bits.

/// The most commonly used imports.
pub mod prelude {
    pub use super::{
        CustomExpression, ExponentialDirection, Marker, Segment, SegmentKind, SegmentSamples,
        SegmentShape, SegmentSynthesizer, SynthesisContext, SynthesisWarning,
    };
}

pub use {
    expression::{CompiledExpression, CustomExpression, Function},
    segment::{ExponentialDirection, Marker, Segment, SegmentKind, SegmentShape},
    synthesizer::{
        SegmentSamples, SegmentSynthesizer, SynthesisContext, SynthesisWarning,
        SynthesizedSegment,
    },
};

mod expression;
mod segment;
mod synthesizer;
