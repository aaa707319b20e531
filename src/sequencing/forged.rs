// Copyright (c) 2024 Mike Tsao

use super::position::{EventInput, FlagSet, TriggerInput};
use crate::{
    composition::ElementChannel,
    settings::ChannelSettings,
    types::{ChannelId, SampleRate},
};
use std::collections::BTreeMap;

/// One distinct element after channel delays and filter compensation.
#[derive(Clone, Debug, PartialEq)]
pub struct ForgedElement {
    /// Unique within the forged sequence.
    pub name: String,
    #[allow(missing_docs)]
    pub sample_count: usize,
    #[allow(missing_docs)]
    pub channels: BTreeMap<ChannelId, ElementChannel>,
}

/// What a forged position plays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForgedContent {
    /// Index into [ForgedSequence::elements].
    Element(usize),
    /// Index into [ForgedSequence::subsequences].
    Subsequence(usize),
}

/// One sequence position, fully resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct ForgedPosition {
    /// 1-based.
    pub index: usize,
    #[allow(missing_docs)]
    pub content: ForgedContent,
    #[allow(missing_docs)]
    pub trigger: TriggerInput,
    #[allow(missing_docs)]
    pub repetitions: u32,
    /// 1-based, already resolved from default chaining.
    pub goto: usize,
    #[allow(missing_docs)]
    pub event_input: EventInput,
    /// 1-based.
    pub event_jump: Option<usize>,
    /// One entry per exported channel.
    pub flags: BTreeMap<ChannelId, FlagSet>,
}
impl ForgedPosition {
    /// The flags of one channel; [FlagSet::NONE] if the channel isn't
    /// exported.
    pub fn flags_for(&self, channel: ChannelId) -> FlagSet {
        self.flags.get(&channel).copied().unwrap_or_default()
    }
}

/// A subsequence's own position table. Its positions play elements only, and
/// their gotos and event jumps count within the subsequence.
#[derive(Clone, Debug, PartialEq)]
pub struct ForgedSubsequence {
    /// Unique among subsequences and distinct from the sequence name.
    pub name: String,
    #[allow(missing_docs)]
    pub positions: Vec<ForgedPosition>,
}

/// Everything a forger needs, checked and resolved. Sample storage is shared
/// with the elements it came from wherever no processing was applied.
#[derive(Clone, Debug, PartialEq)]
pub struct ForgedSequence {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub sample_rate: SampleRate,
    #[allow(missing_docs)]
    pub with_flags: bool,
    /// Exported channels, ascending, with their output settings.
    pub channels: BTreeMap<ChannelId, ChannelSettings>,
    /// Distinct elements in order of first reference, subsequences included.
    pub elements: Vec<ForgedElement>,
    /// Distinct subsequences in order of first reference.
    pub subsequences: Vec<ForgedSubsequence>,
    #[allow(missing_docs)]
    pub positions: Vec<ForgedPosition>,
}
impl ForgedSequence {
    /// The element a position plays, if it plays one.
    pub fn element_at(&self, position: &ForgedPosition) -> Option<&ForgedElement> {
        match position.content {
            ForgedContent::Element(i) => self.elements.get(i),
            ForgedContent::Subsequence(_) => None,
        }
    }

    /// The subsequence a position plays, if it plays one.
    pub fn subsequence_at(&self, position: &ForgedPosition) -> Option<&ForgedSubsequence> {
        match position.content {
            ForgedContent::Subsequence(i) => self.subsequences.get(i),
            ForgedContent::Element(_) => None,
        }
    }

    fn element_points(&self, position: &ForgedPosition) -> usize {
        self.element_at(position)
            .map_or(0, |e| e.sample_count * position.repetitions as usize)
    }

    /// Total samples per channel played by one pass through the positions,
    /// counting repetitions at both levels.
    pub fn total_points(&self) -> usize {
        self.positions
            .iter()
            .map(|p| match self.subsequence_at(p) {
                Some(s) => {
                    let once: usize = s.positions.iter().map(|q| self.element_points(q)).sum();
                    once * p.repetitions as usize
                }
                None => self.element_points(p),
            })
            .sum()
    }
}
