// Copyright (c) 2024 Mike Tsao

//! Orders [Element](crate::composition::Element)s into the position table that
//! AWG hardware steps through, and resolves that table for export.

/// The most commonly used imports.
pub mod prelude {
    pub use super::{
        EventInput, Flag, FlagSet, ForgedSequence, Goto, PositionContent, PositionSettings,
        PositionSettingsBuilder, Preview, Sequence, TriggerInput,
    };
}

pub use {
    forged::{ForgedContent, ForgedElement, ForgedPosition, ForgedSequence, ForgedSubsequence},
    position::{
        EventInput, Flag, FlagSet, Goto, PositionSettings, PositionSettingsBuilder, TriggerInput,
        MAX_REPETITIONS, MIN_REPETITIONS,
    },
    preview::{Preview, PreviewChannel, PreviewStats},
    sequence::{PositionContent, Sequence, SequencePosition},
};

mod forged;
mod position;
mod preview;
mod sequence;
