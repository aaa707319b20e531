// Copyright (c) 2024 Mike Tsao

use crate::{
    error::{PulseError, Result, ValidationError},
    types::ChannelId,
};
use derivative::Derivative;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumCount, EnumIter, EnumString, FromRepr, IntoStaticStr};

/// What a position waits for before it starts playing.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumCount,
    EnumIter,
    EnumString,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum TriggerInput {
    /// Starts as soon as the previous position finishes.
    #[default]
    Continuous = 0,
    #[allow(missing_docs)]
    ExternalA = 1,
    #[allow(missing_docs)]
    ExternalB = 2,
    /// The instrument's internal trigger timer.
    Internal = 3,
}

/// The input that can interrupt a position and send playback to its event
/// jump target.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumCount,
    EnumIter,
    EnumString,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum EventInput {
    /// Events are ignored.
    #[default]
    Off = 0,
    #[allow(missing_docs)]
    ExternalA = 1,
    #[allow(missing_docs)]
    ExternalB = 2,
    #[allow(missing_docs)]
    Internal = 3,
}

/// The state of one auxiliary digital line during a position.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumCount,
    EnumIter,
    EnumString,
    FromRepr,
    IntoStaticStr,
)]
#[repr(u8)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Flag {
    /// Leaves the line as it was.
    #[default]
    None = 0,
    #[allow(missing_docs)]
    High = 1,
    #[allow(missing_docs)]
    Low = 2,
    #[allow(missing_docs)]
    Toggle = 3,
    #[allow(missing_docs)]
    Pulse = 4,
}

/// The four flag lines of one channel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagSet(pub [Flag; 4]);
impl FlagSet {
    /// Every line left alone.
    pub const NONE: FlagSet = FlagSet([Flag::None; 4]);

    /// Packs the four flags three bits apiece, flag A in the lowest bits.
    pub fn packed(&self) -> u16 {
        self.0
            .iter()
            .enumerate()
            .fold(0, |word, (i, flag)| word | (*flag as u16) << (3 * i))
    }

    /// Reverses [packed()](Self::packed). Fails on codes that name no flag.
    pub fn from_packed(word: u16) -> Option<Self> {
        let mut flags = [Flag::None; 4];
        for (i, flag) in flags.iter_mut().enumerate() {
            *flag = Flag::from_repr(((word >> (3 * i)) & 0b111) as u8)?;
        }
        Some(Self(flags))
    }
}

/// Where playback continues after a position finishes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Goto {
    /// The next position, or position 1 after the last one.
    #[default]
    Next,
    /// A specific 1-based position. Follows that position if it moves.
    Position(usize),
}
impl Goto {
    /// The explicit target, if any.
    pub fn target(&self) -> Option<usize> {
        match self {
            Self::Next => None,
            Self::Position(target) => Some(*target),
        }
    }
}

/// The smallest repetition count hardware accepts.
pub const MIN_REPETITIONS: u32 = 1;
/// The largest repetition count hardware accepts.
pub const MAX_REPETITIONS: u32 = 65536;

pub(crate) fn validate_repetitions(repetitions: u32) -> Result<()> {
    if (MIN_REPETITIONS..=MAX_REPETITIONS).contains(&repetitions) {
        Ok(())
    } else {
        Err(ValidationError::Repetitions(repetitions).into())
    }
}

/// Sequencing metadata for one position. Channels missing from `flags` get
/// [FlagSet::NONE].
#[derive(Clone, Debug, Derivative, PartialEq, Builder, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case")]
#[builder(default, build_fn(private, name = "build_from_builder"))]
pub struct PositionSettings {
    #[allow(missing_docs)]
    pub trigger: TriggerInput,
    #[allow(missing_docs)]
    #[derivative(Default(value = "1"))]
    pub repetitions: u32,
    #[allow(missing_docs)]
    pub goto: Goto,
    #[allow(missing_docs)]
    pub flags: BTreeMap<ChannelId, FlagSet>,
    #[allow(missing_docs)]
    #[serde(default)]
    pub event_input: EventInput,
    /// The 1-based position an event sends playback to. `None` continues
    /// with the next position. Like a goto, it follows its target if that
    /// position moves.
    #[serde(default)]
    pub event_jump: Option<usize>,
}
impl PositionSettingsBuilder {
    /// Builds the [PositionSettings], checking the repetition count.
    pub fn build(&self) -> Result<PositionSettings> {
        let settings = self
            .build_from_builder()
            .map_err(|e| PulseError::from(ValidationError::Builder(e.to_string())))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Sets the flags of one channel.
    pub fn channel_flags(&mut self, channel: ChannelId, flags: FlagSet) -> &mut Self {
        self.flags
            .get_or_insert_with(BTreeMap::default)
            .insert(channel, flags);
        self
    }
}
impl PositionSettings {
    /// Checks the repetition count and any explicit goto or event jump for
    /// basic sanity.
    pub fn validate(&self) -> Result<()> {
        validate_repetitions(self.repetitions)?;
        if let Goto::Position(0) = self.goto {
            return Err(ValidationError::IndexOutOfRange { index: 0, len: 0 }.into());
        }
        if self.event_jump == Some(0) {
            return Err(ValidationError::IndexOutOfRange { index: 0, len: 0 }.into());
        }
        Ok(())
    }

    /// The flags for one channel.
    pub fn flags_for(&self, channel: ChannelId) -> FlagSet {
        self.flags.get(&channel).copied().unwrap_or_default()
    }
}
