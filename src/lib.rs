// Copyright (c) 2024 Mike Tsao

#![warn(missing_docs, unused_imports, unused_variables)]
#![allow(rustdoc::private_intra_doc_links)]

//! Pulseforge composes pulse programs for arbitrary waveform generators.
//!
//! The pipeline runs in one direction:
//!
//! * A [Segment](synthesis::Segment) is a primitive shape with a duration,
//! and the [SegmentSynthesizer](synthesis::SegmentSynthesizer) turns it into
//! samples and marker bits.
//! * A [BluePrint](composition::BluePrint) is one channel's ordered list of
//! segments. An [Element](composition::Element) synthesizes one blueprint per
//! channel and insists that they all come out the same length.
//! * A [Sequence](sequencing::Sequence) orders shared elements into positions
//! with triggers, repetitions, and gotos, as hardware sequencers expect.
//! [Sequence::forge()](sequencing::Sequence::forge) resolves it into a
//! [ForgedSequence](sequencing::ForgedSequence).
//! * A [Forger](forging::Forger) serializes that into bytes:
//! [ContainerA](forging::ContainerA) (zip) or
//! [ContainerB](forging::ContainerB) (flat binary).
//!
//! Along the way, [compensation] pre-distorts channels with a known filter
//! response, [sweep] generates one position per parameter combination, and
//! [description] moves everything in and out of JSON.

/// A collection of imports that are useful to users of this crate. `use
/// pulseforge::prelude::*;` for easier onboarding.
pub mod prelude {
    pub use super::{
        compensation::prelude::*, composition::prelude::*, error::PulseError,
        forging::prelude::*, sequencing::prelude::*, settings::prelude::*, sweep::prelude::*,
        synthesis::prelude::*, types::prelude::*,
    };
}

pub use {
    composition::{BluePrint, Element},
    error::{PulseError, Result},
    sequencing::Sequence,
};

pub mod compensation;
pub mod composition;
pub mod description;
pub mod error;
pub mod forging;
pub mod sequencing;
pub mod settings;
pub mod sweep;
pub mod synthesis;
pub mod types;
