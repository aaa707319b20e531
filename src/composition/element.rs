// Copyright (c) 2024 Mike Tsao

use super::blueprint::BluePrint;
use crate::{
    error::{PulseError, Result, ValidationError},
    synthesis::SynthesisWarning,
    types::{ChannelId, SampleRate, Seconds},
};
use bit_vec::BitVec;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// The synthesized output of one channel. Sample and marker storage is shared,
/// so clones are cheap.
#[derive(Clone, Debug, PartialEq)]
pub struct ElementChannel {
    samples: Arc<[f64]>,
    marker1: Arc<BitVec>,
    marker2: Arc<BitVec>,
}
impl ElementChannel {
    pub(crate) fn new(samples: Vec<f64>, marker1: BitVec, marker2: BitVec) -> Self {
        Self {
            samples: samples.into(),
            marker1: Arc::new(marker1),
            marker2: Arc::new(marker2),
        }
    }

    #[allow(missing_docs)]
    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    #[allow(missing_docs)]
    pub fn marker1(&self) -> &BitVec {
        &self.marker1
    }

    #[allow(missing_docs)]
    pub fn marker2(&self) -> &BitVec {
        &self.marker2
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Largest absolute sample value.
    pub fn peak(&self) -> f64 {
        self.samples.iter().fold(0.0, |peak, v| peak.max(v.abs()))
    }
}

/// A synchronized multi-channel waveform: one [BluePrint] per channel, all
/// synthesized at one sample rate to the same number of samples.
///
/// Elements are immutable. Edits produce a new element, so an element shared
/// by many sequence positions never changes underneath them.
#[derive(Clone, Debug, PartialEq)]
pub struct Element {
    name: Option<String>,
    sample_rate: SampleRate,
    blueprints: BTreeMap<ChannelId, BluePrint>,
    channels: BTreeMap<ChannelId, ElementChannel>,
    sample_count: usize,
    duration: Seconds,
    warnings: Vec<SynthesisWarning>,
}
impl Element {
    /// Synthesizes every blueprint and checks that all channels came out the
    /// same length.
    pub fn build(
        blueprints: BTreeMap<ChannelId, BluePrint>,
        sample_rate: SampleRate,
    ) -> Result<Self> {
        if blueprints.is_empty() {
            return Err(ValidationError::NoChannels.into());
        }
        let mut channels = BTreeMap::default();
        let mut counts = BTreeMap::default();
        let mut warnings = Vec::default();
        let mut duration = Seconds::zero();
        for (channel, blueprint) in blueprints.iter() {
            let synthesized = blueprint.synthesize(sample_rate)?;
            counts.insert(*channel, synthesized.data.len());
            warnings.extend(synthesized.warnings);
            duration = synthesized.duration;
            channels.insert(
                *channel,
                ElementChannel::new(
                    synthesized.data.samples,
                    synthesized.data.marker1,
                    synthesized.data.marker2,
                ),
            );
        }
        let mut distinct = counts.values().copied().collect::<Vec<_>>();
        distinct.dedup();
        if distinct.len() != 1 {
            return Err(PulseError::DurationMismatch { counts });
        }
        let sample_count = distinct[0];
        debug!(
            channels = channels.len(),
            sample_count, "built element"
        );
        Ok(Self {
            name: None,
            sample_rate,
            blueprints,
            channels,
            sample_count,
            duration,
            warnings,
        })
    }

    /// Attaches a name that exports use for this element.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Returns a new element with one channel's blueprint replaced (or added).
    pub fn with_blueprint(&self, channel: ChannelId, blueprint: BluePrint) -> Result<Self> {
        let mut blueprints = self.blueprints.clone();
        blueprints.insert(channel, blueprint);
        self.rebuilt(blueprints, self.sample_rate)
    }

    /// Returns a new element after applying `edit` to a copy of one channel's
    /// blueprint. The original is untouched whether or not the edit succeeds.
    pub fn modify(
        &self,
        channel: ChannelId,
        edit: impl FnOnce(&mut BluePrint) -> Result<()>,
    ) -> Result<Self> {
        let mut blueprints = self.blueprints.clone();
        let blueprint = blueprints
            .get_mut(&channel)
            .ok_or(ValidationError::UnknownChannel(channel))?;
        edit(blueprint)?;
        self.rebuilt(blueprints, self.sample_rate)
    }

    /// Returns a new element resynthesized at another rate.
    pub fn with_sample_rate(&self, sample_rate: SampleRate) -> Result<Self> {
        self.rebuilt(self.blueprints.clone(), sample_rate)
    }

    /// Returns a new element without the given channel.
    pub fn without_channel(&self, channel: ChannelId) -> Result<Self> {
        let mut blueprints = self.blueprints.clone();
        blueprints
            .remove(&channel)
            .ok_or(ValidationError::UnknownChannel(channel))?;
        self.rebuilt(blueprints, self.sample_rate)
    }

    fn rebuilt(
        &self,
        blueprints: BTreeMap<ChannelId, BluePrint>,
        sample_rate: SampleRate,
    ) -> Result<Self> {
        let mut r = Self::build(blueprints, sample_rate)?;
        r.name = self.name.clone();
        Ok(r)
    }

    #[allow(missing_docs)]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[allow(missing_docs)]
    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Samples per channel.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    #[allow(missing_docs)]
    pub fn duration(&self) -> Seconds {
        self.duration
    }

    #[allow(missing_docs)]
    pub fn channel_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.keys().copied()
    }

    #[allow(missing_docs)]
    pub fn channel(&self, channel: ChannelId) -> Option<&ElementChannel> {
        self.channels.get(&channel)
    }

    #[allow(missing_docs)]
    pub fn channels(&self) -> &BTreeMap<ChannelId, ElementChannel> {
        &self.channels
    }

    #[allow(missing_docs)]
    pub fn blueprint(&self, channel: ChannelId) -> Option<&BluePrint> {
        self.blueprints.get(&channel)
    }

    #[allow(missing_docs)]
    pub fn blueprints(&self) -> &BTreeMap<ChannelId, BluePrint> {
        &self.blueprints
    }

    /// Clamps applied during synthesis, in channel then segment order.
    pub fn warnings(&self) -> &[SynthesisWarning] {
        &self.warnings
    }
}
