// Copyright (c) 2024 Mike Tsao

use super::naming::unique_name;
use crate::{
    error::{Result, ValidationError},
    synthesis::{
        Marker, Segment, SegmentSamples, SegmentSynthesizer, SynthesisContext, SynthesisWarning,
    },
    types::{MarkerTrack, SampleRate, Seconds},
};
use kahan::KahanSum;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An ordered, gapless run of [Segment]s for one channel. Segment names are
/// unique within a blueprint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BluePrint {
    segments: Vec<Segment>,
}

/// The concatenated output of every segment in a [BluePrint].
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesizedBluePrint {
    #[allow(missing_docs)]
    pub data: SegmentSamples,
    /// Sum of the effective segment durations.
    pub duration: Seconds,
    #[allow(missing_docs)]
    pub warnings: Vec<SynthesisWarning>,
}

impl BluePrint {
    /// Builds a blueprint by appending each segment in turn.
    pub fn with_segments(segments: impl IntoIterator<Item = Segment>) -> Result<Self> {
        let mut r = Self::default();
        for segment in segments {
            r.append(segment)?;
        }
        Ok(r)
    }

    /// Adds a segment at the end and returns the name it ended up with.
    pub fn append(&mut self, segment: Segment) -> Result<String> {
        self.insert_at(self.segments.len(), segment)
    }

    /// Adds a segment before `index` and returns the name it ended up with.
    pub fn insert_at(&mut self, index: usize, mut segment: Segment) -> Result<String> {
        if index > self.segments.len() {
            return Err(ValidationError::IndexOutOfRange {
                index,
                len: self.segments.len(),
            }
            .into());
        }
        segment.validate()?;
        segment.name = unique_name(&segment.name, segment.kind().name_stem(), |n| {
            self.index_of(n).is_some()
        });
        debug!(name = %segment.name, index, "inserting segment");
        let name = segment.name.clone();
        self.segments.insert(index, segment);
        Ok(name)
    }

    /// Removes and returns the named segment.
    pub fn remove(&mut self, name: &str) -> Result<Segment> {
        let index = self.require(name)?;
        Ok(self.segments.remove(index))
    }

    /// Moves the named segment so that it ends up at `new_index`.
    pub fn reorder(&mut self, name: &str, new_index: usize) -> Result<()> {
        let index = self.require(name)?;
        if new_index >= self.segments.len() {
            return Err(ValidationError::IndexOutOfRange {
                index: new_index,
                len: self.segments.len(),
            }
            .into());
        }
        let segment = self.segments.remove(index);
        self.segments.insert(new_index, segment);
        Ok(())
    }

    /// Renames a segment. A name that is already taken gets a letter suffix,
    /// exactly as on insertion. Returns the name actually assigned.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<String> {
        let index = self.require(old)?;
        let name = unique_name(new, self.segments[index].kind().name_stem(), |n| {
            self.segments
                .iter()
                .enumerate()
                .any(|(i, s)| i != index && s.name == n)
        });
        self.segments[index].name = name.clone();
        Ok(name)
    }

    /// Changes one parameter of the named segment.
    pub fn set_parameter(&mut self, name: &str, parameter: &str, value: f64) -> Result<()> {
        let index = self.require(name)?;
        self.segments[index].set_parameter(parameter, value)
    }

    /// Replaces one marker of the named segment.
    pub fn set_marker(&mut self, name: &str, track: MarkerTrack, marker: Marker) -> Result<()> {
        let index = self.require(name)?;
        let mut candidate = self.segments[index].clone();
        *candidate.marker_mut(track) = marker;
        candidate.validate()?;
        self.segments[index] = candidate;
        Ok(())
    }

    #[allow(missing_docs)]
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.index_of(name).map(|i| &self.segments[i])
    }

    #[allow(missing_docs)]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.segments.iter().position(|s| s.name == name)
    }

    fn require(&self, name: &str) -> Result<usize> {
        self.index_of(name)
            .ok_or_else(|| ValidationError::UnknownSegment(name.to_string()).into())
    }

    #[allow(missing_docs)]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[allow(missing_docs)]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.name())
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Synthesizes every segment in order and concatenates the results.
    /// Hold-until segments see the time covered so far and the last sample
    /// before them.
    pub fn synthesize(&self, sample_rate: SampleRate) -> Result<SynthesizedBluePrint> {
        if self.segments.is_empty() {
            return Err(ValidationError::EmptyBlueprint.into());
        }
        let synthesizer = SegmentSynthesizer::new(sample_rate)?;
        let mut elapsed = KahanSum::<f64>::default();
        let mut data = SegmentSamples::default();
        let mut warnings = Vec::default();
        for segment in self.segments.iter() {
            let context = SynthesisContext {
                elapsed: Seconds(elapsed.sum()),
                carried_value: data.last_value().unwrap_or_default(),
            };
            let synthesized = synthesizer.synthesize(segment, context)?;
            elapsed += synthesized.duration.0;
            warnings.extend(synthesized.warnings);
            data.extend(synthesized.data);
        }
        Ok(SynthesizedBluePrint {
            data,
            duration: Seconds(elapsed.sum()),
            warnings,
        })
    }
}
