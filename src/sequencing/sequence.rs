// Copyright (c) 2024 Mike Tsao

use super::{
    forged::{ForgedContent, ForgedElement, ForgedPosition, ForgedSequence, ForgedSubsequence},
    position::{
        validate_repetitions, EventInput, FlagSet, Goto, PositionSettings, TriggerInput,
    },
};
use crate::{
    composition::{unique_name, Element, ElementChannel},
    error::{FormatError, PulseError, Result, ValidationError},
    settings::{ChannelSettings, ForgeSettings},
    types::{ChannelId, SampleRate, Seconds},
};
use bit_vec::BitVec;
use delegate::delegate;
use rustc_hash::{FxHashMap, FxHashSet};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, info, warn};

/// Identifies a position independently of where it currently sits, so that
/// explicit gotos and event jumps survive reordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct PositionId(usize);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GotoLink {
    Next,
    Explicit(PositionId),
}

/// What a position plays.
#[derive(Clone, Debug)]
pub enum PositionContent {
    #[allow(missing_docs)]
    Element(Arc<Element>),
    /// A sequence of elements played through in list order, then repeated as
    /// a block. It can't hold subsequences itself.
    Subsequence(Arc<Sequence>),
}
impl PositionContent {
    #[allow(missing_docs)]
    pub fn sample_rate(&self) -> Option<SampleRate> {
        match self {
            Self::Element(e) => Some(e.sample_rate()),
            Self::Subsequence(s) => s.sample_rate(),
        }
    }

    #[allow(missing_docs)]
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        match self {
            Self::Element(e) => e.channel_ids().collect(),
            Self::Subsequence(s) => s.channel_ids(),
        }
    }

    /// Samples per channel of a single play. A subsequence counts its own
    /// repetitions.
    pub fn sample_count(&self) -> usize {
        match self {
            Self::Element(e) => e.sample_count(),
            Self::Subsequence(s) => s.total_points(),
        }
    }

    #[allow(missing_docs)]
    pub fn duration(&self) -> Seconds {
        match self {
            Self::Element(e) => Seconds(e.sample_count() as f64 / e.sample_rate().0),
            Self::Subsequence(s) => s.duration(),
        }
    }

    /// Every element this content plays, in order, with repeats.
    fn elements(&self) -> Vec<&Arc<Element>> {
        match self {
            Self::Element(e) => vec![e],
            Self::Subsequence(s) => s
                .positions
                .iter()
                .filter_map(|p| p.content.element())
                .collect(),
        }
    }

    fn element(&self) -> Option<&Arc<Element>> {
        match self {
            Self::Element(e) => Some(e),
            Self::Subsequence(_) => None,
        }
    }
}

/// One step of a [Sequence]: an element or subsequence plus the metadata
/// hardware uses to decide when to play it, how often, and what comes next.
#[derive(Clone, Debug)]
pub struct SequencePosition {
    id: PositionId,
    content: PositionContent,
    trigger: TriggerInput,
    repetitions: u32,
    goto: GotoLink,
    event_input: EventInput,
    event_jump: Option<PositionId>,
    flags: BTreeMap<ChannelId, FlagSet>,
}
impl SequencePosition {
    #[allow(missing_docs)]
    pub fn content(&self) -> &PositionContent {
        &self.content
    }

    /// The element, unless this position plays a subsequence.
    pub fn element(&self) -> Option<&Arc<Element>> {
        self.content.element()
    }

    /// The subsequence, unless this position plays an element.
    pub fn subsequence(&self) -> Option<&Arc<Sequence>> {
        match &self.content {
            PositionContent::Subsequence(s) => Some(s),
            PositionContent::Element(_) => None,
        }
    }

    #[allow(missing_docs)]
    pub fn trigger(&self) -> TriggerInput {
        self.trigger
    }

    #[allow(missing_docs)]
    pub fn repetitions(&self) -> u32 {
        self.repetitions
    }

    #[allow(missing_docs)]
    pub fn event_input(&self) -> EventInput {
        self.event_input
    }

    /// The flags of one channel; [FlagSet::NONE] unless set.
    pub fn flags_for(&self, channel: ChannelId) -> FlagSet {
        self.flags.get(&channel).copied().unwrap_or_default()
    }

    #[allow(missing_docs)]
    pub fn flags(&self) -> &BTreeMap<ChannelId, FlagSet> {
        &self.flags
    }

    /// True if the goto was set explicitly rather than derived.
    pub fn has_explicit_goto(&self) -> bool {
        matches!(self.goto, GotoLink::Explicit(_))
    }
}

/// An ordered list of positions linked into a control-flow graph by their
/// gotos. Positions are numbered from 1 in list order and renumbered on every
/// structural change.
///
/// Positions hold shared references to their elements and subsequences, so
/// one element can back any number of positions without copying samples.
#[derive(Clone, Debug, Default)]
pub struct Sequence {
    name: Option<String>,
    positions: Vec<SequencePosition>,
    next_id: usize,
}
impl Sequence {
    /// Names the sequence. Forging uses the name for subsequences; a top-level
    /// sequence takes its name from [ForgeSettings].
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Appends a position and returns its 1-based index.
    pub fn add_position(
        &mut self,
        element: Arc<Element>,
        settings: PositionSettings,
    ) -> Result<usize> {
        self.insert_position(self.positions.len() + 1, element, settings)
    }

    /// Inserts a position so that it ends up at `index` (1-based, up to one
    /// past the end) and returns that index.
    pub fn insert_position(
        &mut self,
        index: usize,
        element: Arc<Element>,
        settings: PositionSettings,
    ) -> Result<usize> {
        self.insert_content(index, PositionContent::Element(element), settings)
    }

    /// Appends a position that plays `subsequence` and returns its index.
    pub fn add_subsequence(
        &mut self,
        subsequence: Arc<Sequence>,
        settings: PositionSettings,
    ) -> Result<usize> {
        self.insert_subsequence(self.positions.len() + 1, subsequence, settings)
    }

    /// Inserts a position that plays `subsequence`. The subsequence must be
    /// valid, non-empty, free of subsequences, and at this sequence's sample
    /// rate.
    pub fn insert_subsequence(
        &mut self,
        index: usize,
        subsequence: Arc<Sequence>,
        settings: PositionSettings,
    ) -> Result<usize> {
        let invalid = |reason: String| {
            PulseError::from(ValidationError::InvalidSubsequence {
                position: index,
                reason,
            })
        };
        if subsequence.is_empty() {
            return Err(invalid("it has no positions".to_string()));
        }
        if subsequence.positions.iter().any(|p| p.subsequence().is_some()) {
            return Err(invalid("subsequences can't contain subsequences".to_string()));
        }
        if let (Some(ours), Some(theirs)) = (self.sample_rate(), subsequence.sample_rate()) {
            if ours != theirs {
                return Err(invalid(format!(
                    "its sample rate {} Sa/s differs from {} Sa/s",
                    theirs.0, ours.0
                )));
            }
        }
        subsequence.validate()?;
        self.insert_content(index, PositionContent::Subsequence(subsequence), settings)
    }

    fn insert_content(
        &mut self,
        index: usize,
        content: PositionContent,
        settings: PositionSettings,
    ) -> Result<usize> {
        if index == 0 || index > self.positions.len() + 1 {
            return Err(ValidationError::IndexOutOfRange {
                index,
                len: self.positions.len(),
            }
            .into());
        }
        settings.validate()?;
        let position_count = self.positions.len() + 1;
        for target in [settings.goto.target(), settings.event_jump]
            .into_iter()
            .flatten()
        {
            if target > position_count {
                return Err(PulseError::GotoTarget {
                    position: index,
                    target,
                    position_count,
                });
            }
        }
        let id = PositionId(self.next_id);
        self.next_id += 1;
        self.positions.insert(
            index - 1,
            SequencePosition {
                id,
                content,
                trigger: settings.trigger,
                repetitions: settings.repetitions,
                goto: GotoLink::Next,
                event_input: settings.event_input,
                event_jump: None,
                flags: settings.flags,
            },
        );
        if let Some(target) = settings.goto.target() {
            self.set_goto(index, target)?;
        }
        if settings.event_jump.is_some() {
            self.set_event_jump(index, settings.event_jump)?;
        }
        debug!(index, positions = self.positions.len(), "added position");
        Ok(index)
    }

    /// Removes a position and returns what it played. Later positions move up
    /// by one. Explicit gotos that pointed at the removed position fall back
    /// to default chaining, and event jumps to it are cleared.
    pub fn remove_position(&mut self, index: usize) -> Result<PositionContent> {
        let i = self.require(index)?;
        let removed = self.positions.remove(i);
        for (n, position) in self.positions.iter_mut().enumerate() {
            if position.goto == GotoLink::Explicit(removed.id) {
                warn!(
                    position = n + 1,
                    removed = index,
                    "goto target was removed; reverting to default chaining"
                );
                position.goto = GotoLink::Next;
            }
            if position.event_jump == Some(removed.id) {
                warn!(
                    position = n + 1,
                    removed = index,
                    "event jump target was removed; clearing it"
                );
                position.event_jump = None;
            }
        }
        Ok(removed.content)
    }

    /// Moves the position at `from` so that it ends up at `to`. Explicit gotos
    /// and event jumps keep pointing at the same positions.
    pub fn move_position(&mut self, from: usize, to: usize) -> Result<()> {
        let i = self.require(from)?;
        let j = self.require(to)?;
        let position = self.positions.remove(i);
        self.positions.insert(j, position);
        Ok(())
    }

    fn require_target(&self, position: usize, target: usize) -> Result<PositionId> {
        if target == 0 || target > self.positions.len() {
            return Err(PulseError::GotoTarget {
                position,
                target,
                position_count: self.positions.len(),
            });
        }
        Ok(self.positions[target - 1].id)
    }

    /// Makes `position` continue at `target` (both 1-based).
    pub fn set_goto(&mut self, position: usize, target: usize) -> Result<()> {
        let i = self.require(position)?;
        let id = self.require_target(position, target)?;
        self.positions[i].goto = GotoLink::Explicit(id);
        Ok(())
    }

    /// Returns `position` to default chaining.
    pub fn clear_goto(&mut self, position: usize) -> Result<()> {
        let i = self.require(position)?;
        self.positions[i].goto = GotoLink::Next;
        Ok(())
    }

    /// Selects the input whose events interrupt `position`.
    pub fn set_event_input(&mut self, position: usize, input: EventInput) -> Result<()> {
        let i = self.require(position)?;
        self.positions[i].event_input = input;
        Ok(())
    }

    /// Makes an event during `position` jump to `target`, or clears the
    /// jump with `None`.
    pub fn set_event_jump(&mut self, position: usize, target: Option<usize>) -> Result<()> {
        let i = self.require(position)?;
        self.positions[i].event_jump = match target {
            Some(target) => Some(self.require_target(position, target)?),
            None => None,
        };
        Ok(())
    }

    /// The current 1-based index of the event jump target of `index`.
    pub fn event_jump_of(&self, index: usize) -> Option<usize> {
        let i = self.require(index).ok()?;
        self.positions[i]
            .event_jump
            .and_then(|id| self.index_of_id(id))
    }

    #[allow(missing_docs)]
    pub fn set_trigger(&mut self, position: usize, trigger: TriggerInput) -> Result<()> {
        let i = self.require(position)?;
        self.positions[i].trigger = trigger;
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn set_repetitions(&mut self, position: usize, repetitions: u32) -> Result<()> {
        let i = self.require(position)?;
        validate_repetitions(repetitions)?;
        self.positions[i].repetitions = repetitions;
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn set_flags(&mut self, position: usize, channel: ChannelId, flags: FlagSet) -> Result<()> {
        let i = self.require(position)?;
        self.positions[i].flags.insert(channel, flags);
        Ok(())
    }

    /// The settings of a position, with gotos and event jumps as current
    /// indexes.
    pub fn position_settings(&self, index: usize) -> Option<PositionSettings> {
        let position = self.position(index)?;
        Some(PositionSettings {
            trigger: position.trigger,
            repetitions: position.repetitions,
            goto: self.goto(index)?,
            flags: position.flags.clone(),
            event_input: position.event_input,
            event_jump: self.event_jump_of(index),
        })
    }

    fn require(&self, index: usize) -> Result<usize> {
        if index == 0 || index > self.positions.len() {
            Err(ValidationError::IndexOutOfRange {
                index,
                len: self.positions.len(),
            }
            .into())
        } else {
            Ok(index - 1)
        }
    }

    delegate! {
        to self.positions {
            /// The number of positions.
            pub fn len(&self) -> usize;
            #[allow(missing_docs)]
            pub fn is_empty(&self) -> bool;
        }
    }

    /// The position at a 1-based index.
    pub fn position(&self, index: usize) -> Option<&SequencePosition> {
        index.checked_sub(1).and_then(|i| self.positions.get(i))
    }

    /// Positions in order, with their 1-based indexes.
    pub fn positions(&self) -> impl Iterator<Item = (usize, &SequencePosition)> {
        self.positions.iter().enumerate().map(|(i, p)| (i + 1, p))
    }

    fn index_of_id(&self, id: PositionId) -> Option<usize> {
        self.positions.iter().position(|p| p.id == id).map(|i| i + 1)
    }

    fn resolve(&self, i: usize) -> usize {
        match self.positions[i].goto {
            GotoLink::Explicit(id) => self.index_of_id(id).unwrap_or(1),
            GotoLink::Next if i + 1 == self.positions.len() => 1,
            GotoLink::Next => i + 2,
        }
    }

    /// The position that follows `index`, after default chaining.
    pub fn goto_of(&self, index: usize) -> Option<usize> {
        self.require(index).ok().map(|i| self.resolve(i))
    }

    /// The goto as configured: default chaining, or an explicit target.
    pub fn goto(&self, index: usize) -> Option<Goto> {
        let i = self.require(index).ok()?;
        Some(match self.positions[i].goto {
            GotoLink::Next => Goto::Next,
            GotoLink::Explicit(_) => Goto::Position(self.resolve(i)),
        })
    }

    /// Every goto edge as `(from, to)`.
    pub fn edges(&self) -> Vec<(usize, usize)> {
        (0..self.positions.len())
            .map(|i| (i + 1, self.resolve(i)))
            .collect()
    }

    /// Positions that playback starting at position 1 never reaches by
    /// following gotos. They are legal; hardware can still jump to them.
    pub fn unreachable_positions(&self) -> Vec<usize> {
        if self.positions.is_empty() {
            return Vec::default();
        }
        let mut seen = FxHashSet::default();
        let mut current = 1;
        while seen.insert(current) {
            current = self.resolve(current - 1);
        }
        (1..=self.positions.len())
            .filter(|i| !seen.contains(i))
            .collect()
    }

    /// Re-checks everything hardware will rely on: goto and event jump
    /// targets, repetition counts, and that every position matches the first
    /// one's rate and channels. Unreachable positions are permitted and only
    /// logged.
    pub fn validate(&self) -> Result<()> {
        let position_count = self.positions.len();
        for (i, position) in self.positions.iter().enumerate() {
            validate_repetitions(position.repetitions)?;
            let targets = [
                match position.goto {
                    GotoLink::Explicit(id) => Some(id),
                    GotoLink::Next => None,
                },
                position.event_jump,
            ];
            for id in targets.into_iter().flatten() {
                if self.index_of_id(id).is_none() {
                    return Err(PulseError::GotoTarget {
                        position: i + 1,
                        target: 0,
                        position_count,
                    });
                }
            }
        }
        if let Some(first) = self.positions.first() {
            let rate = first.content.sample_rate();
            let channels = first.content.channel_ids();
            for (i, position) in self.positions.iter().enumerate().skip(1) {
                let other_rate = position.content.sample_rate();
                let other_channels = position.content.channel_ids();
                if other_rate != rate || other_channels != channels {
                    return Err(ValidationError::InconsistentElement {
                        position: i + 1,
                        reason: format!(
                            "expected {:?} at {} Sa/s, found {:?} at {} Sa/s",
                            channels.iter().map(|c| c.0).collect::<Vec<_>>(),
                            rate.map_or(0.0, |r| r.0),
                            other_channels.iter().map(|c| c.0).collect::<Vec<_>>(),
                            other_rate.map_or(0.0, |r| r.0),
                        ),
                    }
                    .into());
                }
            }
        }
        let unreachable = self.unreachable_positions();
        if !unreachable.is_empty() {
            warn!(?unreachable, "positions unreachable from position 1");
        }
        Ok(())
    }

    /// The first position's sample rate.
    pub fn sample_rate(&self) -> Option<SampleRate> {
        self.positions.first().and_then(|p| p.content.sample_rate())
    }

    /// The first position's channels.
    pub fn channel_ids(&self) -> Vec<ChannelId> {
        self.positions
            .first()
            .map(|p| p.content.channel_ids())
            .unwrap_or_default()
    }

    /// Distinct elements in order of first reference, by identity. Elements
    /// inside subsequences are included.
    pub fn elements(&self) -> Vec<Arc<Element>> {
        let mut seen = FxHashSet::default();
        self.positions
            .iter()
            .flat_map(|p| p.content.elements())
            .filter(|e| seen.insert(Arc::as_ptr(e)))
            .map(Arc::clone)
            .collect()
    }

    /// Distinct subsequences in order of first reference, by identity.
    pub fn subsequences(&self) -> Vec<Arc<Sequence>> {
        let mut seen = FxHashSet::default();
        self.positions
            .iter()
            .filter_map(|p| p.subsequence())
            .filter(|s| seen.insert(Arc::as_ptr(s)))
            .map(Arc::clone)
            .collect()
    }

    /// Samples per channel in one pass through every position, counting
    /// repetitions.
    pub fn total_points(&self) -> usize {
        self.positions
            .iter()
            .map(|p| p.content.sample_count() * p.repetitions as usize)
            .sum()
    }

    /// Playing time of one pass through every position, counting
    /// repetitions.
    pub fn duration(&self) -> Seconds {
        Seconds(
            self.positions
                .iter()
                .map(|p| p.content.duration().0 * p.repetitions as f64)
                .sum(),
        )
    }

    /// Appends every position of `other`. Explicit gotos and event jumps
    /// inside `other` keep pointing at the same (now renumbered) positions.
    pub fn append_sequence(&mut self, other: &Sequence) {
        let mut id_map = FxHashMap::default();
        for position in other.positions.iter() {
            id_map.insert(position.id, PositionId(self.next_id));
            self.next_id += 1;
        }
        for position in other.positions.iter() {
            let mut copy = position.clone();
            copy.id = id_map[&position.id];
            if let GotoLink::Explicit(target) = position.goto {
                copy.goto = id_map
                    .get(&target)
                    .map_or(GotoLink::Next, |id| GotoLink::Explicit(*id));
            }
            copy.event_jump = position
                .event_jump
                .and_then(|target| id_map.get(&target).copied());
            self.positions.push(copy);
        }
    }

    /// Resolves the sequence into what the forgers serialize: default gotos
    /// made explicit, channel delays and filter compensation applied, flags
    /// attached to each position.
    pub fn forge(&self, settings: &ForgeSettings) -> Result<ForgedSequence> {
        self.forge_with_cancel(settings, &AtomicBool::new(false))
    }

    /// Like [forge()](Self::forge), but gives up between elements once
    /// `cancel` is set.
    pub fn forge_with_cancel(
        &self,
        settings: &ForgeSettings,
        cancel: &AtomicBool,
    ) -> Result<ForgedSequence> {
        let sample_rate = self.sample_rate().ok_or(FormatError::EmptySequence)?;

        let channel_ids: Vec<ChannelId> = if settings.configured_channels().next().is_some() {
            settings.configured_channels().collect()
        } else {
            self.channel_ids()
        };
        let mut channels = BTreeMap::default();
        for channel in channel_ids.iter() {
            let channel_settings = settings.channel(*channel);
            channel_settings.validate(*channel)?;
            channels.insert(*channel, channel_settings);
        }

        for (index, position) in self.positions() {
            for element in position.content.elements() {
                if element.sample_rate() != sample_rate {
                    return Err(FormatError::SampleRateMismatch {
                        position: index,
                        expected: sample_rate,
                        found: element.sample_rate(),
                    }
                    .into());
                }
                if let Some(channel) = channel_ids.iter().find(|c| element.channel(**c).is_none()) {
                    return Err(FormatError::MissingChannel {
                        position: index,
                        channel: *channel,
                    }
                    .into());
                }
            }
        }

        let distinct = self.elements();
        let mut element_index = FxHashMap::default();
        let mut elements: Vec<ForgedElement> = Vec::with_capacity(distinct.len());
        for (k, element) in distinct.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                return Err(PulseError::Interrupted {
                    completed: k,
                    total: distinct.len(),
                });
            }
            let stem = format!("element_{}", k + 1);
            let name = unique_name(element.name().unwrap_or(&stem), &stem, |n| {
                elements.iter().any(|e| e.name == n)
            });
            let forged = forge_element(name, element, &channels, sample_rate, settings)?;
            element_index.insert(Arc::as_ptr(element), k);
            elements.push(forged);
        }

        let distinct = self.subsequences();
        let indexes = ContentIndexes {
            elements: element_index,
            subsequences: distinct
                .iter()
                .enumerate()
                .map(|(k, s)| (Arc::as_ptr(s), k))
                .collect(),
            channels: &channel_ids,
        };
        let mut subsequences: Vec<ForgedSubsequence> = Vec::default();
        for (k, subsequence) in distinct.iter().enumerate() {
            let stem = format!("subsequence_{}", k + 1);
            let name = unique_name(subsequence.name().unwrap_or(&stem), &stem, |n| {
                n == settings.sequence_name() || subsequences.iter().any(|s| s.name == n)
            });
            let positions = subsequence.forged_positions(&indexes)?;
            subsequences.push(ForgedSubsequence { name, positions });
        }
        let positions = self.forged_positions(&indexes)?;

        info!(
            elements = elements.len(),
            subsequences = subsequences.len(),
            positions = self.positions.len(),
            "forged sequence"
        );
        Ok(ForgedSequence {
            name: settings.sequence_name().to_string(),
            sample_rate,
            with_flags: settings.with_flags(),
            channels,
            elements,
            subsequences,
            positions,
        })
    }

    fn forged_positions(&self, indexes: &ContentIndexes) -> Result<Vec<ForgedPosition>> {
        self.positions()
            .map(|(index, position)| {
                let content = match &position.content {
                    PositionContent::Element(e) => indexes
                        .elements
                        .get(&Arc::as_ptr(e))
                        .copied()
                        .map(ForgedContent::Element),
                    PositionContent::Subsequence(s) => indexes
                        .subsequences
                        .get(&Arc::as_ptr(s))
                        .copied()
                        .map(ForgedContent::Subsequence),
                };
                let content = content.ok_or(ValidationError::InvalidSubsequence {
                    position: index,
                    reason: "subsequences can't contain subsequences".to_string(),
                })?;
                Ok(ForgedPosition {
                    index,
                    content,
                    trigger: position.trigger,
                    repetitions: position.repetitions,
                    goto: self.resolve(index - 1),
                    event_input: position.event_input,
                    event_jump: self.event_jump_of(index),
                    flags: indexes
                        .channels
                        .iter()
                        .map(|c| (*c, position.flags_for(*c)))
                        .collect(),
                })
            })
            .collect()
    }
}

/// Where each element and subsequence landed in a [ForgedSequence].
struct ContentIndexes<'a> {
    elements: FxHashMap<*const Element, usize>,
    subsequences: FxHashMap<*const Sequence, usize>,
    channels: &'a [ChannelId],
}

fn forge_element(
    name: String,
    element: &Element,
    channels: &BTreeMap<ChannelId, ChannelSettings>,
    sample_rate: SampleRate,
    settings: &ForgeSettings,
) -> Result<ForgedElement> {
    let delays: BTreeMap<ChannelId, usize> = channels
        .iter()
        .map(|(c, s)| (*c, sample_rate.index_of(s.delay)))
        .collect();
    let max_delay = delays.values().copied().max().unwrap_or_default();
    let mut forged = BTreeMap::default();
    for (channel, channel_settings) in channels.iter() {
        let data = element
            .channel(*channel)
            .ok_or(FormatError::MissingChannel {
                position: 0,
                channel: *channel,
            })?;
        let pre = delays.get(channel).copied().unwrap_or_default();
        let post = max_delay - pre;
        let forged_channel = if pre == 0 && post == 0 && channel_settings.filter_compensation.is_none() {
            data.clone()
        } else {
            let samples = match &channel_settings.filter_compensation {
                Some(filter) => {
                    settings
                        .compensator()
                        .compensate(data.samples(), filter, sample_rate)?
                }
                None => data.samples().to_vec(),
            };
            let padded: Vec<f64> = core::iter::repeat(0.0)
                .take(pre)
                .chain(samples)
                .chain(core::iter::repeat(0.0).take(post))
                .collect();
            ElementChannel::new(
                padded,
                pad_bits(data.marker1(), pre, post),
                pad_bits(data.marker2(), pre, post),
            )
        };
        forged.insert(*channel, forged_channel);
    }
    Ok(ForgedElement {
        name,
        sample_count: element.sample_count() + max_delay,
        channels: forged,
    })
}

fn pad_bits(bits: &BitVec, pre: usize, post: usize) -> BitVec {
    let mut r = BitVec::from_elem(pre, false);
    r.extend(bits.iter());
    r.extend(core::iter::repeat(false).take(post));
    r
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        composition::BluePrint,
        sequencing::{Flag, PositionSettingsBuilder},
        settings::ChannelSettingsBuilder,
        synthesis::Segment,
    };

    fn element(level: f64, samples: usize) -> Arc<Element> {
        let mut blueprints = BTreeMap::default();
        blueprints.insert(
            ChannelId(1),
            BluePrint::with_segments([Segment::ramp(level, level, samples as f64 * 1.0e-9)])
                .unwrap(),
        );
        Arc::new(Element::build(blueprints, SampleRate(1.0e9)).unwrap())
    }

    fn sequence_of(count: usize) -> Sequence {
        let mut s = Sequence::default();
        for i in 0..count {
            s.add_position(element(i as f64 / 10.0, 10), PositionSettings::default())
                .unwrap();
        }
        s
    }

    #[test]
    fn default_gotos_chain_and_wrap() {
        let s = sequence_of(3);
        assert_eq!(s.edges(), vec![(1, 2), (2, 3), (3, 1)]);
        assert_eq!(s.goto(3), Some(Goto::Next));
        assert!(s.unreachable_positions().is_empty());
        assert!(s.validate().is_ok());
    }

    #[test]
    fn defaults_rederive_after_structural_changes() {
        let mut s = sequence_of(3);
        s.remove_position(3).unwrap();
        assert_eq!(s.edges(), vec![(1, 2), (2, 1)]);
        s.add_position(element(0.9, 10), PositionSettings::default())
            .unwrap();
        assert_eq!(s.edges(), vec![(1, 2), (2, 3), (3, 1)]);
    }

    #[test]
    fn explicit_gotos_follow_their_target() {
        let mut s = sequence_of(4);
        s.set_goto(4, 2).unwrap();
        let target = Arc::clone(s.position(2).unwrap().element().unwrap());

        s.move_position(2, 3).unwrap();
        assert!(Arc::ptr_eq(s.position(3).unwrap().element().unwrap(), &target));
        assert_eq!(s.goto_of(4), Some(3));

        s.remove_position(1).unwrap();
        assert_eq!(s.goto_of(3), Some(2));
        assert_eq!(s.goto(3), Some(Goto::Position(2)));
    }

    #[test]
    fn removing_a_goto_target_reverts_to_default() {
        let mut s = sequence_of(3);
        s.set_goto(1, 3).unwrap();
        assert_eq!(s.unreachable_positions(), vec![2]);
        s.remove_position(3).unwrap();
        assert!(!s.position(1).unwrap().has_explicit_goto());
        assert_eq!(s.edges(), vec![(1, 2), (2, 1)]);
    }

    #[test]
    fn gotos_are_validated_eagerly() {
        let mut s = sequence_of(2);
        assert_eq!(
            s.set_goto(1, 3),
            Err(PulseError::GotoTarget {
                position: 1,
                target: 3,
                position_count: 2
            })
        );
        assert!(s.set_goto(1, 0).is_err());
        assert!(s.set_goto(3, 1).is_err());
        assert!(s.set_goto(2, 2).is_ok(), "self-loops are fine");
        assert_eq!(s.edges(), vec![(1, 2), (2, 2)]);

        let with_goto = PositionSettingsBuilder::default()
            .goto(Goto::Position(9))
            .build()
            .unwrap();
        assert!(s.add_position(element(0.0, 10), with_goto).is_err());
        assert_eq!(s.len(), 2, "failed add leaves the sequence alone");
    }

    #[test]
    fn add_position_honors_explicit_goto() {
        let mut s = sequence_of(2);
        let settings = PositionSettingsBuilder::default()
            .goto(Goto::Position(3))
            .repetitions(5)
            .build()
            .unwrap();
        assert_eq!(s.add_position(element(0.0, 10), settings).unwrap(), 3);
        assert_eq!(s.goto_of(3), Some(3));
        assert_eq!(s.position(3).unwrap().repetitions(), 5);
        assert_eq!(s.total_points(), 10 + 10 + 50);
    }

    #[test]
    fn repetitions_are_bounded() {
        let mut s = sequence_of(1);
        assert!(s.set_repetitions(1, 65536).is_ok());
        assert!(s.set_repetitions(1, 65537).is_err());
        assert!(s.set_repetitions(1, 0).is_err());
        assert!(s.set_repetitions(2, 1).is_err());
    }

    #[test]
    fn shared_elements_are_not_duplicated() {
        let mut s = Sequence::default();
        let e = element(0.5, 10);
        for _ in 0..5 {
            s.add_position(Arc::clone(&e), PositionSettings::default())
                .unwrap();
        }
        assert_eq!(Arc::strong_count(&e), 6);
        assert_eq!(s.elements().len(), 1);
        let forged = s.forge(&ForgeSettings::default()).unwrap();
        assert_eq!(forged.elements.len(), 1);
        assert!(forged
            .positions
            .iter()
            .all(|p| p.content == ForgedContent::Element(0)));
    }

    #[test]
    fn validate_reports_mismatched_elements() {
        let mut s = sequence_of(1);
        let mut blueprints = BTreeMap::default();
        blueprints.insert(
            ChannelId(2),
            BluePrint::with_segments([Segment::ramp(0.0, 1.0, 1.0e-8)]).unwrap(),
        );
        s.add_position(
            Arc::new(Element::build(blueprints, SampleRate(1.0e9)).unwrap()),
            PositionSettings::default(),
        )
        .unwrap();
        assert!(matches!(
            s.validate(),
            Err(PulseError::Validation(ValidationError::InconsistentElement {
                position: 2,
                ..
            }))
        ));
        assert!(matches!(
            s.forge(&ForgeSettings::default()),
            Err(PulseError::Format(FormatError::MissingChannel {
                position: 2,
                channel: ChannelId(1)
            }))
        ));
    }

    #[test]
    fn forging_checks_rates_and_emptiness() {
        assert_eq!(
            Sequence::default().forge(&ForgeSettings::default()),
            Err(PulseError::Format(FormatError::EmptySequence))
        );

        let mut s = sequence_of(1);
        let slow = element(0.0, 10).with_sample_rate(SampleRate(5.0e8)).unwrap();
        s.add_position(Arc::new(slow), PositionSettings::default())
            .unwrap();
        assert!(matches!(
            s.forge(&ForgeSettings::default()),
            Err(PulseError::Format(FormatError::SampleRateMismatch {
                position: 2,
                ..
            }))
        ));
    }

    #[test]
    fn forging_attaches_flags_and_resolves_gotos() {
        let mut s = sequence_of(2);
        s.set_flags(2, ChannelId(1), FlagSet([Flag::High, Flag::Low, Flag::None, Flag::Pulse]))
            .unwrap();
        let forged = s.forge(&ForgeSettings::default()).unwrap();
        assert_eq!(forged.positions[0].goto, 2);
        assert_eq!(forged.positions[1].goto, 1);
        assert_eq!(forged.positions[0].flags[&ChannelId(1)], FlagSet::NONE);
        assert_eq!(
            forged.positions[1].flags_for(ChannelId(1)),
            FlagSet([Flag::High, Flag::Low, Flag::None, Flag::Pulse])
        );
        assert_eq!(forged.positions[1].flags_for(ChannelId(3)), FlagSet::NONE);
        assert_eq!(forged.elements[0].name, "element_1");
        assert_eq!(forged.total_points(), 20);
    }

    #[test]
    fn channel_delays_pad_every_channel_equally() {
        let mut blueprints = BTreeMap::default();
        for channel in [ChannelId(1), ChannelId(2)] {
            blueprints.insert(
                channel,
                BluePrint::with_segments([Segment::ramp(1.0, 1.0, 4.0e-9)]).unwrap(),
            );
        }
        let mut s = Sequence::default();
        s.add_position(
            Arc::new(Element::build(blueprints, SampleRate(1.0e9)).unwrap()),
            PositionSettings::default(),
        )
        .unwrap();

        let mut settings = ForgeSettings::default();
        settings.set_channel(ChannelId(1), ChannelSettings::default());
        settings.set_channel(
            ChannelId(2),
            ChannelSettingsBuilder::default()
                .delay(Seconds(2.0e-9))
                .build()
                .unwrap(),
        );
        let forged = s.forge(&settings).unwrap();
        let e = &forged.elements[0];
        assert_eq!(e.sample_count, 6);
        assert_eq!(
            e.channels[&ChannelId(1)].samples(),
            &[1.0, 1.0, 1.0, 1.0, 0.0, 0.0]
        );
        assert_eq!(
            e.channels[&ChannelId(2)].samples(),
            &[0.0, 0.0, 1.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(e.channels[&ChannelId(2)].marker1().len(), 6);
    }

    #[test]
    fn cancellation_stops_between_elements() {
        let s = sequence_of(3);
        let cancel = AtomicBool::new(true);
        assert_eq!(
            s.forge_with_cancel(&ForgeSettings::default(), &cancel),
            Err(PulseError::Interrupted {
                completed: 0,
                total: 3
            })
        );
    }

    #[test]
    fn concatenation_keeps_goto_targets() {
        let mut a = sequence_of(2);
        let mut b = sequence_of(3);
        b.set_goto(3, 2).unwrap();
        a.append_sequence(&b);
        assert_eq!(a.len(), 5);
        assert_eq!(a.goto_of(5), Some(4));
        assert_eq!(a.goto_of(2), Some(3));
        assert!(a.duration().0 > 0.0);
    }

    #[test]
    fn event_jumps_follow_their_target() {
        let mut s = sequence_of(4);
        s.set_event_input(1, EventInput::ExternalB).unwrap();
        s.set_event_jump(1, Some(4)).unwrap();
        assert_eq!(s.position(1).unwrap().event_input(), EventInput::ExternalB);
        assert_eq!(s.event_jump_of(1), Some(4));

        s.move_position(4, 2).unwrap();
        assert_eq!(s.event_jump_of(1), Some(2));
        assert_eq!(s.edges(), vec![(1, 2), (2, 3), (3, 4), (4, 1)]);

        s.remove_position(2).unwrap();
        assert_eq!(s.event_jump_of(1), None);
        assert!(s.validate().is_ok());

        assert_eq!(
            s.set_event_jump(1, Some(4)),
            Err(PulseError::GotoTarget {
                position: 1,
                target: 4,
                position_count: 3
            })
        );
        assert!(s.set_event_jump(1, Some(0)).is_err());
        s.set_event_jump(1, Some(3)).unwrap();
        s.set_event_jump(1, None).unwrap();
        assert_eq!(s.event_jump_of(1), None);
    }

    #[test]
    fn event_jumps_from_settings_survive_append() {
        let mut b = sequence_of(2);
        let settings = PositionSettingsBuilder::default()
            .event_input(EventInput::Internal)
            .event_jump(Some(1))
            .goto(Goto::Position(2))
            .build()
            .unwrap();
        b.add_position(element(0.7, 10), settings).unwrap();
        assert!(b
            .add_position(
                element(0.7, 10),
                PositionSettingsBuilder::default()
                    .event_jump(Some(9))
                    .build()
                    .unwrap()
            )
            .is_err());

        let mut a = sequence_of(2);
        a.append_sequence(&b);
        assert_eq!(a.event_jump_of(5), Some(3));
        let round_trip = a.position_settings(5).unwrap();
        assert_eq!(round_trip.event_input, EventInput::Internal);
        assert_eq!(round_trip.event_jump, Some(3));
        assert_eq!(round_trip.goto, Goto::Position(4));

        let forged = a.forge(&ForgeSettings::default()).unwrap();
        assert_eq!(forged.positions[4].event_input, EventInput::Internal);
        assert_eq!(forged.positions[4].event_jump, Some(3));
        assert_eq!(forged.positions[0].event_jump, None);
    }

    #[test]
    fn subsequences_must_be_flat_nonempty_and_rate_matched() {
        let mut s = sequence_of(1);
        let empty = Arc::new(Sequence::default());
        assert!(matches!(
            s.add_subsequence(empty, PositionSettings::default()),
            Err(PulseError::Validation(ValidationError::InvalidSubsequence {
                position: 2,
                ..
            }))
        ));

        let inner = Arc::new(sequence_of(2));
        assert_eq!(
            s.add_subsequence(Arc::clone(&inner), PositionSettings::default())
                .unwrap(),
            2
        );

        let mut nested = sequence_of(1);
        nested
            .add_subsequence(Arc::clone(&inner), PositionSettings::default())
            .unwrap();
        assert!(s
            .add_subsequence(Arc::new(nested), PositionSettings::default())
            .is_err());

        let mut slow = Sequence::default();
        slow.add_position(
            Arc::new(element(0.0, 10).with_sample_rate(SampleRate(5.0e8)).unwrap()),
            PositionSettings::default(),
        )
        .unwrap();
        assert!(s
            .add_subsequence(Arc::new(slow), PositionSettings::default())
            .is_err());
        assert_eq!(s.len(), 2);
        assert!(s.validate().is_ok());
    }

    #[test]
    fn subsequences_count_toward_totals_and_forge_as_tables() {
        let mut inner = sequence_of(2).named("inner");
        inner.set_repetitions(2, 3).unwrap();
        let inner = Arc::new(inner);
        let mut s = sequence_of(1);
        let settings = PositionSettingsBuilder::default()
            .repetitions(2)
            .build()
            .unwrap();
        s.add_subsequence(Arc::clone(&inner), settings).unwrap();
        s.add_subsequence(Arc::clone(&inner), PositionSettings::default())
            .unwrap();

        assert_eq!(inner.total_points(), 10 + 30);
        assert_eq!(s.total_points(), 10 + 2 * 40 + 40);
        assert_eq!(s.elements().len(), 3);
        assert_eq!(s.subsequences().len(), 1);
        assert!(matches!(
            s.position(2).unwrap().content(),
            PositionContent::Subsequence(_)
        ));
        assert!(s.position(2).unwrap().element().is_none());

        let forged = s.forge(&ForgeSettings::default()).unwrap();
        assert_eq!(forged.elements.len(), 3);
        assert_eq!(forged.subsequences.len(), 1);
        assert_eq!(forged.subsequences[0].name, "inner");
        assert_eq!(
            forged.subsequences[0]
                .positions
                .iter()
                .map(|p| (p.content, p.repetitions, p.goto))
                .collect::<Vec<_>>(),
            vec![
                (ForgedContent::Element(1), 1, 2),
                (ForgedContent::Element(2), 3, 1)
            ]
        );
        assert_eq!(forged.positions[1].content, ForgedContent::Subsequence(0));
        assert_eq!(forged.positions[2].content, ForgedContent::Subsequence(0));
        assert_eq!(forged.total_points(), s.total_points());

        let removed = s.remove_position(2).unwrap();
        assert!(matches!(removed, PositionContent::Subsequence(sub) if Arc::ptr_eq(&sub, &inner)));
    }

    #[test]
    fn subsequence_names_avoid_the_sequence_name() {
        let mut s = sequence_of(1);
        s.add_subsequence(
            Arc::new(sequence_of(1).named("main")),
            PositionSettings::default(),
        )
        .unwrap();
        s.add_subsequence(Arc::new(sequence_of(1)), PositionSettings::default())
            .unwrap();
        let mut settings = ForgeSettings::default();
        settings.set_sequence_name("main");
        let forged = s.forge(&settings).unwrap();
        assert_eq!(forged.subsequences[0].name, "main_a");
        assert_eq!(forged.subsequences[1].name, "subsequence_2");
    }
}
