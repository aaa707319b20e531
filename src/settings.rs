// Copyright (c) 2024 Mike Tsao

//! Structs that hold configuration information about how sequences are
//! exported. Intended to be serialized.

use crate::{
    compensation::{FilterCompensator, FilterSpec},
    error::{FormatError, PulseError, Result, ValidationError},
    types::{ChannelId, Seconds},
};
use derivative::Derivative;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The most commonly used imports.
pub mod prelude {
    pub use super::{ChannelSettings, ChannelSettingsBuilder, ForgeSettings, HasSettings};
}

/// Implemented by structs that can be persisted and that track whether they
/// have changed since they were last saved.
pub trait HasSettings {
    /// Whether the current state has been saved.
    fn has_been_saved(&self) -> bool;
    /// Marks the struct as changed.
    fn needs_save(&mut self);
    /// Marks the struct as saved.
    fn mark_clean(&mut self);
}

/// The width of every packed waveform word, in bits.
pub const WORD_BITS: u8 = 16;

/// Output configuration of one AWG channel.
#[derive(Clone, Debug, Derivative, PartialEq, Builder, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case")]
#[builder(default, build_fn(private, name = "build_from_builder"))]
pub struct ChannelSettings {
    /// Peak-to-peak volts. Samples may swing `amplitude / 2` around `offset`.
    #[derivative(Default(value = "1.0"))]
    pub amplitude: f64,
    /// Volts.
    pub offset: f64,
    /// DAC bits. The remaining bits of each 16-bit word carry markers.
    #[derivative(Default(value = "14"))]
    pub resolution_bits: u8,
    /// How many marker tracks to pack, 0 to 2.
    #[derivative(Default(value = "2"))]
    pub marker_count: u8,
    /// This channel is delayed by prepending zeros; the others are padded at
    /// the end so every channel keeps the same length.
    pub delay: Seconds,
    /// When set, waveforms are pre-distorted for this response before export.
    #[serde(default)]
    pub filter_compensation: Option<FilterSpec>,
}
impl ChannelSettingsBuilder {
    /// Builds the [ChannelSettings] after checking it.
    pub fn build(&self) -> Result<ChannelSettings> {
        let settings = self
            .build_from_builder()
            .map_err(|e| PulseError::from(ValidationError::Builder(e.to_string())))?;
        settings.validate(ChannelId::ONE)?;
        Ok(settings)
    }
}
impl ChannelSettings {
    /// Checks that these settings can drive an export for `channel`.
    pub fn validate(&self, channel: ChannelId) -> Result<()> {
        if !(self.amplitude.is_finite() && self.amplitude > 0.0) {
            return Err(ValidationError::InvalidParameter {
                parameter: "amplitude".to_string(),
                value: self.amplitude,
                reason: "must be positive",
            }
            .into());
        }
        if !self.offset.is_finite() {
            return Err(ValidationError::InvalidParameter {
                parameter: "offset".to_string(),
                value: self.offset,
                reason: "must be finite",
            }
            .into());
        }
        if !self.delay.is_valid_duration() {
            return Err(ValidationError::InvalidDuration(self.delay).into());
        }
        if self.resolution_bits == 0
            || self.resolution_bits > WORD_BITS
            || self.marker_count > 2
            || WORD_BITS - self.resolution_bits < self.marker_count
        {
            return Err(FormatError::ResolutionTooSmall {
                channel,
                resolution_bits: self.resolution_bits,
                marker_count: self.marker_count,
            }
            .into());
        }
        if let Some(filter) = &self.filter_compensation {
            filter.validate()?;
        }
        Ok(())
    }

    /// The lowest voltage this channel can produce.
    pub fn min_voltage(&self) -> f64 {
        self.offset - self.amplitude / 2.0
    }

    /// The highest voltage this channel can produce.
    pub fn max_voltage(&self) -> f64 {
        self.offset + self.amplitude / 2.0
    }
}

/// Contains persistent export settings.
#[derive(Clone, Debug, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(rename_all = "kebab-case")]
pub struct ForgeSettings {
    #[derivative(Default(value = "\"sequence\".to_string()"))]
    sequence_name: String,
    #[serde(default)]
    with_flags: bool,
    #[serde(default)]
    channels: BTreeMap<ChannelId, ChannelSettings>,
    #[serde(default = "ForgeSettings::default_epsilon")]
    #[derivative(Default(value = "Self::default_epsilon()"))]
    compensation_epsilon: f64,

    #[serde(skip)]
    has_been_saved: bool,
}
impl HasSettings for ForgeSettings {
    fn has_been_saved(&self) -> bool {
        self.has_been_saved
    }

    fn needs_save(&mut self) {
        self.has_been_saved = false;
    }

    fn mark_clean(&mut self) {
        self.has_been_saved = true;
    }
}
impl PartialEq for ForgeSettings {
    fn eq(&self, other: &Self) -> bool {
        self.sequence_name == other.sequence_name
            && self.with_flags == other.with_flags
            && self.channels == other.channels
            && self.compensation_epsilon == other.compensation_epsilon
    }
}
impl ForgeSettings {
    fn default_epsilon() -> f64 {
        FilterCompensator::default().epsilon()
    }

    /// Reads settings from JSON. The result counts as saved.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let mut r: Self = serde_json::from_str(json)?;
        r.mark_clean();
        Ok(r)
    }

    /// Writes settings as JSON and marks them saved.
    pub fn to_json(&mut self) -> anyhow::Result<String> {
        let json = serde_json::to_string_pretty(self)?;
        self.mark_clean();
        Ok(json)
    }

    /// The name given to the exported sequence table.
    pub fn sequence_name(&self) -> &str {
        &self.sequence_name
    }

    /// Updates the field and marks the struct eligible to save.
    pub fn set_sequence_name(&mut self, name: &str) {
        if name != self.sequence_name {
            self.sequence_name = name.to_string();
            self.needs_save();
        }
    }

    /// Whether exports carry the per-position flag track.
    pub fn with_flags(&self) -> bool {
        self.with_flags
    }

    /// Updates the field and marks the struct eligible to save.
    pub fn set_with_flags(&mut self, with_flags: bool) {
        if with_flags != self.with_flags {
            self.with_flags = with_flags;
            self.needs_save();
        }
    }

    /// The settings for one channel, falling back to defaults.
    pub fn channel(&self, channel: ChannelId) -> ChannelSettings {
        self.channels.get(&channel).cloned().unwrap_or_default()
    }

    /// Channels with explicit settings.
    pub fn configured_channels(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.keys().copied()
    }

    /// Updates a channel and marks the struct eligible to save.
    pub fn set_channel(&mut self, channel: ChannelId, settings: ChannelSettings) {
        if self.channels.get(&channel) != Some(&settings) {
            self.channels.insert(channel, settings);
            self.needs_save();
        }
    }

    #[allow(missing_docs)]
    pub fn compensation_epsilon(&self) -> f64 {
        self.compensation_epsilon
    }

    /// Updates the field and marks the struct eligible to save.
    pub fn set_compensation_epsilon(&mut self, epsilon: f64) {
        if epsilon != self.compensation_epsilon {
            self.compensation_epsilon = epsilon;
            self.needs_save();
        }
    }

    /// The compensator these settings call for.
    pub fn compensator(&self) -> FilterCompensator {
        FilterCompensator::new_with(self.compensation_epsilon)
    }
}
