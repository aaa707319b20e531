// Copyright (c) 2024 Mike Tsao

//! The exchange format. Elements and sequences are described as plain data
//! that serializes to JSON, and they rebuild from that description into
//! identical samples.

use crate::{
    composition::{BluePrint, Element},
    error::{FormatError, PulseError, Result, ValidationError},
    sequencing::{Goto, PositionContent, PositionSettings, Sequence},
    synthesis::{CustomExpression, ExponentialDirection, Marker, Segment, SegmentKind, SegmentShape},
    types::{ChannelId, MarkerTrack, SampleRate, Seconds},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// A parameter is a number, except for the few that name something.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    #[allow(missing_docs)]
    Number(f64),
    #[allow(missing_docs)]
    Text(String),
}

/// One segment as plain data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SegmentDescription {
    #[allow(missing_docs)]
    pub kind: SegmentKind,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub duration: Seconds,
    /// Informational. The value that counts lives in `parameters`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amplitude: Option<f64>,
    /// Numeric parameters by name, plus `direction` for exponential segments
    /// and `expression` for custom ones.
    pub parameters: BTreeMap<String, ParameterValue>,
    #[serde(default)]
    pub marker1: Marker,
    #[serde(default)]
    pub marker2: Marker,
}

const DIRECTION: &str = "direction";
const EXPRESSION: &str = "expression";

impl From<&Segment> for SegmentDescription {
    fn from(segment: &Segment) -> Self {
        let shape = segment.shape();
        let mut parameters: BTreeMap<String, ParameterValue> = shape
            .parameter_names()
            .into_iter()
            .filter_map(|name| {
                shape
                    .parameter(name)
                    .map(|v| (name.to_string(), ParameterValue::Number(v)))
            })
            .collect();
        match shape {
            SegmentShape::Exponential { direction, .. } => {
                parameters.insert(DIRECTION.to_string(), ParameterValue::Text(direction.to_string()));
            }
            SegmentShape::Custom(e) => {
                parameters.insert(EXPRESSION.to_string(), ParameterValue::Text(e.source().to_string()));
            }
            _ => {}
        }
        Self {
            kind: segment.kind(),
            name: segment.name().to_string(),
            duration: segment.duration(),
            amplitude: segment.amplitude(),
            parameters,
            marker1: *segment.marker(MarkerTrack::Marker1),
            marker2: *segment.marker(MarkerTrack::Marker2),
        }
    }
}

impl SegmentDescription {
    fn number(&self, name: &str) -> Result<Option<f64>> {
        match self.parameters.get(name) {
            None => Ok(None),
            Some(ParameterValue::Number(v)) => Ok(Some(*v)),
            Some(ParameterValue::Text(_)) => Err(self.unknown(name)),
        }
    }

    fn required(&self, name: &str) -> Result<f64> {
        self.number(name)?.ok_or_else(|| {
            ValidationError::MissingParameter {
                kind: self.kind.to_string(),
                parameter: name.to_string(),
            }
            .into()
        })
    }

    fn optional(&self, name: &str) -> Result<f64> {
        Ok(self.number(name)?.unwrap_or_default())
    }

    fn unknown(&self, name: &str) -> PulseError {
        ValidationError::UnknownParameter {
            kind: self.kind.to_string(),
            parameter: name.to_string(),
        }
        .into()
    }

    fn text(&self, name: &str) -> Result<Option<&str>> {
        match self.parameters.get(name) {
            None => Ok(None),
            Some(ParameterValue::Text(s)) => Ok(Some(s)),
            Some(ParameterValue::Number(_)) => Err(self.unknown(name)),
        }
    }

    /// Rebuilds the segment. Missing required parameters and names the kind
    /// doesn't know are both errors.
    pub fn to_segment(&self) -> Result<Segment> {
        let known: &[&str] = match self.kind {
            SegmentKind::Ramp => &["start", "stop"],
            SegmentKind::Sine => &["frequency", "amplitude", "phase", "offset"],
            SegmentKind::Gaussian => &["amplitude", "width", "center", "offset"],
            SegmentKind::Exponential => &["amplitude", "tau", DIRECTION],
            SegmentKind::HoldUntil => &["absolute_time"],
            SegmentKind::Custom => &[],
        };
        if self.kind != SegmentKind::Custom {
            if let Some(name) = self.parameters.keys().find(|k| !known.contains(&k.as_str())) {
                return Err(self.unknown(name));
            }
        }
        let shape = match self.kind {
            SegmentKind::Ramp => SegmentShape::Ramp {
                start: self.required("start")?,
                stop: self.required("stop")?,
            },
            SegmentKind::Sine => SegmentShape::Sine {
                frequency: self.required("frequency")?,
                amplitude: self.required("amplitude")?,
                phase: self.optional("phase")?,
                offset: self.optional("offset")?,
            },
            SegmentKind::Gaussian => SegmentShape::Gaussian {
                amplitude: self.required("amplitude")?,
                width: self.required("width")?,
                center: self.required("center")?,
                offset: self.optional("offset")?,
            },
            SegmentKind::Exponential => SegmentShape::Exponential {
                amplitude: self.required("amplitude")?,
                tau: self.required("tau")?,
                direction: match self.text(DIRECTION)? {
                    Some(s) => s
                        .parse::<ExponentialDirection>()
                        .map_err(|_| self.unknown(DIRECTION))?,
                    None => ExponentialDirection::default(),
                },
            },
            SegmentKind::HoldUntil => SegmentShape::HoldUntil {
                absolute_time: Seconds(self.required("absolute_time")?),
            },
            SegmentKind::Custom => {
                let source = self.text(EXPRESSION)?.ok_or_else(|| {
                    PulseError::from(ValidationError::MissingParameter {
                        kind: self.kind.to_string(),
                        parameter: EXPRESSION.to_string(),
                    })
                })?;
                let mut values = BTreeMap::default();
                for (name, value) in self.parameters.iter() {
                    match value {
                        ParameterValue::Number(v) => {
                            values.insert(name.clone(), *v);
                        }
                        ParameterValue::Text(_) if name == EXPRESSION => {}
                        ParameterValue::Text(_) => return Err(self.unknown(name)),
                    }
                }
                SegmentShape::Custom(CustomExpression::new(source, values))
            }
        };
        let segment = Segment::new(shape, self.duration.0)
            .named(&self.name)
            .with_marker(MarkerTrack::Marker1, self.marker1)
            .with_marker(MarkerTrack::Marker2, self.marker2);
        segment.validate()?;
        Ok(segment)
    }
}

/// One channel's blueprint as plain data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelDescription {
    #[allow(missing_docs)]
    pub segments: Vec<SegmentDescription>,
}
impl From<&BluePrint> for ChannelDescription {
    fn from(blueprint: &BluePrint) -> Self {
        Self {
            segments: blueprint.segments().iter().map(SegmentDescription::from).collect(),
        }
    }
}
impl ChannelDescription {
    #[allow(missing_docs)]
    pub fn to_blueprint(&self) -> Result<BluePrint> {
        BluePrint::with_segments(
            self.segments
                .iter()
                .map(SegmentDescription::to_segment)
                .collect::<Result<Vec<_>>>()?,
        )
    }
}

/// An element as plain data: a sample rate and every channel's segments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ElementDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub name: Option<String>,
    #[allow(missing_docs)]
    pub sample_rate: SampleRate,
    #[allow(missing_docs)]
    pub channels: BTreeMap<ChannelId, ChannelDescription>,
}
impl From<&Element> for ElementDescription {
    fn from(element: &Element) -> Self {
        Self {
            name: element.name().map(str::to_string),
            sample_rate: element.sample_rate(),
            channels: element
                .blueprints()
                .iter()
                .map(|(c, bp)| (*c, ChannelDescription::from(bp)))
                .collect(),
        }
    }
}
impl ElementDescription {
    /// Rebuilds and synthesizes the element.
    pub fn to_element(&self) -> Result<Element> {
        let blueprints = self
            .channels
            .iter()
            .map(|(c, d)| d.to_blueprint().map(|bp| (*c, bp)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        let element = Element::build(blueprints, self.sample_rate)?;
        Ok(match &self.name {
            Some(name) => element.named(name),
            None => element,
        })
    }

    #[allow(missing_docs)]
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[allow(missing_docs)]
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// What a described position plays, by index into
/// [SequenceDescription::elements] or [SequenceDescription::subsequences].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentReference {
    #[allow(missing_docs)]
    Element(usize),
    #[allow(missing_docs)]
    Subsequence(usize),
}

/// One position as plain data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PositionDescription {
    #[allow(missing_docs)]
    pub content: ContentReference,
    #[allow(missing_docs)]
    pub settings: PositionSettings,
}

/// A subsequence as plain data. Its positions may only reference elements.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SubsequenceDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[allow(missing_docs)]
    pub name: Option<String>,
    #[allow(missing_docs)]
    pub positions: Vec<PositionDescription>,
}

/// A sequence as plain data. Elements and subsequences shared by several
/// positions appear once.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SequenceDescription {
    /// Every distinct element, including those only subsequences play.
    pub elements: Vec<ElementDescription>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[allow(missing_docs)]
    pub subsequences: Vec<SubsequenceDescription>,
    #[allow(missing_docs)]
    pub positions: Vec<PositionDescription>,
}

fn describe_positions(
    sequence: &Sequence,
    elements: &[Arc<Element>],
    subsequences: &[Arc<Sequence>],
) -> Vec<PositionDescription> {
    sequence
        .positions()
        .map(|(index, position)| PositionDescription {
            content: match position.content() {
                PositionContent::Element(e) => ContentReference::Element(
                    elements
                        .iter()
                        .position(|x| Arc::ptr_eq(x, e))
                        .unwrap_or_default(),
                ),
                PositionContent::Subsequence(s) => ContentReference::Subsequence(
                    subsequences
                        .iter()
                        .position(|x| Arc::ptr_eq(x, s))
                        .unwrap_or_default(),
                ),
            },
            settings: sequence.position_settings(index).unwrap_or_default(),
        })
        .collect()
}

/// Adds the positions in order, then points their gotos and event jumps,
/// which may refer forward.
fn build_positions(
    mut sequence: Sequence,
    positions: &[PositionDescription],
    elements: &[Arc<Element>],
    subsequences: &[Arc<Sequence>],
) -> Result<Sequence> {
    let mut jumps = Vec::default();
    for (i, position) in positions.iter().enumerate() {
        let settings = PositionSettings {
            goto: Goto::Next,
            event_jump: None,
            ..position.settings.clone()
        };
        let index = match position.content {
            ContentReference::Element(element) => {
                let element = elements.get(element).ok_or(FormatError::MissingElement {
                    position: i + 1,
                    element,
                })?;
                sequence.add_position(Arc::clone(element), settings)?
            }
            ContentReference::Subsequence(subsequence) => {
                let subsequence =
                    subsequences
                        .get(subsequence)
                        .ok_or(FormatError::MissingSubsequence {
                            position: i + 1,
                            subsequence,
                        })?;
                sequence.add_subsequence(Arc::clone(subsequence), settings)?
            }
        };
        jumps.push((index, position.settings.goto, position.settings.event_jump));
    }
    for (index, goto, event_jump) in jumps {
        if let Goto::Position(target) = goto {
            sequence.set_goto(index, target)?;
        }
        if event_jump.is_some() {
            sequence.set_event_jump(index, event_jump)?;
        }
    }
    Ok(sequence)
}

impl From<&Sequence> for SequenceDescription {
    fn from(sequence: &Sequence) -> Self {
        let elements = sequence.elements();
        let subsequences = sequence.subsequences();
        Self {
            elements: elements.iter().map(|e| ElementDescription::from(e.as_ref())).collect(),
            subsequences: subsequences
                .iter()
                .map(|s| SubsequenceDescription {
                    name: s.name().map(str::to_string),
                    positions: describe_positions(s, &elements, &[]),
                })
                .collect(),
            positions: describe_positions(sequence, &elements, &subsequences),
        }
    }
}
impl SequenceDescription {
    /// Rebuilds every element and subsequence once and the positions that
    /// share them.
    pub fn to_sequence(&self) -> Result<Sequence> {
        let elements = self
            .elements
            .iter()
            .map(|d| d.to_element().map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let subsequences = self
            .subsequences
            .iter()
            .map(|d| {
                let base = match &d.name {
                    Some(name) => Sequence::default().named(name),
                    None => Sequence::default(),
                };
                build_positions(base, &d.positions, &elements, &[]).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;
        build_positions(
            Sequence::default(),
            &self.positions,
            &elements,
            &subsequences,
        )
    }

    /// Channels used by any element.
    pub fn channel_ids(&self) -> BTreeSet<ChannelId> {
        self.elements
            .iter()
            .flat_map(|e| e.channels.keys().copied())
            .collect()
    }

    #[allow(missing_docs)]
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    #[allow(missing_docs)]
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
