// Copyright (c) 2024 Mike Tsao

use super::sequence::{PositionContent, Sequence};
use crate::{
    composition::Element,
    error::{Result, ValidationError},
    types::{ChannelId, Seconds},
};
use std::collections::BTreeMap;

/// One channel of a [Preview]: a time axis and everything that plays along it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreviewChannel {
    /// Seconds since playback started, one entry per sample.
    pub time: Vec<f64>,
    #[allow(missing_docs)]
    pub samples: Vec<f64>,
    #[allow(missing_docs)]
    pub marker1: Vec<bool>,
    #[allow(missing_docs)]
    pub marker2: Vec<bool>,
}

/// Aggregate figures for a [Preview].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PreviewStats {
    #[allow(missing_docs)]
    pub total_duration: Seconds,
    /// Samples per channel.
    pub point_count: usize,
    /// Largest absolute sample value on any channel.
    pub peak_amplitude: f64,
}

/// A finite rendering of a sequence, meant for plotting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Preview {
    #[allow(missing_docs)]
    pub channels: BTreeMap<ChannelId, PreviewChannel>,
    #[allow(missing_docs)]
    pub stats: PreviewStats,
}

impl Sequence {
    /// Plays the sequence on paper: starting at position 1, follows gotos and
    /// appends each visited position's content `repetitions` times, stopping
    /// after `max_subsequences` positions. A subsequence plays its positions
    /// in list order, each with its own repetitions. Triggers and events are
    /// ignored, so the result is one gap-free buffer per channel.
    ///
    /// This is for visualization only. Hardware may loop forever where this
    /// stops.
    pub fn preview(&self, max_subsequences: usize) -> Result<Preview> {
        let Some(sample_rate) = self.sample_rate() else {
            return Ok(Preview::default());
        };
        let mut channels: BTreeMap<ChannelId, PreviewChannel> = self
            .channel_ids()
            .into_iter()
            .map(|c| (c, PreviewChannel::default()))
            .collect();

        let mut current = 1;
        for _ in 0..max_subsequences {
            let Some(position) = self.position(current) else {
                break;
            };
            let block: Vec<(&Element, u32)> = match position.content() {
                PositionContent::Element(e) => vec![(e.as_ref(), 1)],
                PositionContent::Subsequence(s) => s
                    .positions()
                    .filter_map(|(_, p)| p.element().map(|e| (e.as_ref(), p.repetitions())))
                    .collect(),
            };
            for (element, _) in block.iter() {
                if element.sample_rate() != sample_rate {
                    return Err(ValidationError::InconsistentElement {
                        position: current,
                        reason: format!(
                            "sample rate {} differs from {}",
                            element.sample_rate().0,
                            sample_rate.0
                        ),
                    }
                    .into());
                }
            }
            for (channel, out) in channels.iter_mut() {
                for _ in 0..position.repetitions() {
                    for (element, repetitions) in block.iter() {
                        let data = element.channel(*channel).ok_or_else(|| {
                            ValidationError::InconsistentElement {
                                position: current,
                                reason: format!("no data for channel {}", channel.0),
                            }
                        })?;
                        for _ in 0..*repetitions {
                            out.samples.extend_from_slice(data.samples());
                            out.marker1.extend(data.marker1().iter());
                            out.marker2.extend(data.marker2().iter());
                        }
                    }
                }
            }
            match self.goto_of(current) {
                Some(next) => current = next,
                None => break,
            }
        }

        let point_count = channels
            .values()
            .map(|c| c.samples.len())
            .max()
            .unwrap_or_default();
        let mut peak_amplitude: f64 = 0.0;
        for channel in channels.values_mut() {
            channel.time = (0..channel.samples.len())
                .map(|i| sample_rate.time_of(i).0)
                .collect();
            peak_amplitude = channel
                .samples
                .iter()
                .fold(peak_amplitude, |peak, v| peak.max(v.abs()));
        }
        Ok(Preview {
            channels,
            stats: PreviewStats {
                total_duration: sample_rate.time_of(point_count),
                point_count,
                peak_amplitude,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        composition::BluePrint,
        sequencing::{PositionSettings, PositionSettingsBuilder},
        synthesis::Segment,
        types::SampleRate,
    };
    use float_cmp::approx_eq;
    use std::sync::Arc;

    fn flat(level: f64, samples: usize) -> Arc<Element> {
        let mut blueprints = BTreeMap::default();
        blueprints.insert(
            ChannelId(1),
            BluePrint::with_segments([Segment::ramp(level, level, samples as f64 * 1.0e-9)])
                .unwrap(),
        );
        Arc::new(Element::build(blueprints, SampleRate(1.0e9)).unwrap())
    }

    #[test]
    fn repetitions_and_gotos_shape_the_buffer() {
        let mut s = Sequence::default();
        s.add_position(
            flat(1.0, 2),
            PositionSettingsBuilder::default()
                .repetitions(2)
                .build()
                .unwrap(),
        )
        .unwrap();
        s.add_position(flat(-3.0, 3), PositionSettings::default())
            .unwrap();

        let p = s.preview(3).unwrap();
        let ch = &p.channels[&ChannelId(1)];
        assert_eq!(
            ch.samples,
            vec![1.0, 1.0, 1.0, 1.0, -3.0, -3.0, -3.0, 1.0, 1.0, 1.0, 1.0]
        );
        assert_eq!(ch.time.len(), 11);
        assert!(approx_eq!(f64, ch.time[10], 10.0e-9, epsilon = 1.0e-18));
        assert_eq!(ch.marker1.len(), 11);
        assert_eq!(p.stats.point_count, 11);
        assert!(approx_eq!(f64, p.stats.total_duration.0, 11.0e-9, epsilon = 1.0e-18));
        assert_eq!(p.stats.peak_amplitude, 3.0);
    }

    #[test]
    fn self_loops_stop_at_the_cap() {
        let mut s = Sequence::default();
        s.add_position(flat(0.5, 4), PositionSettings::default())
            .unwrap();
        s.add_position(flat(0.25, 4), PositionSettings::default())
            .unwrap();
        s.set_goto(1, 1).unwrap();
        let p = s.preview(5).unwrap();
        assert_eq!(p.stats.point_count, 20);
        assert!(p.channels[&ChannelId(1)].samples.iter().all(|v| *v == 0.5));
    }

    #[test]
    fn empty_inputs_give_empty_previews() {
        assert_eq!(Sequence::default().preview(10).unwrap(), Preview::default());
        let mut s = Sequence::default();
        s.add_position(flat(0.5, 4), PositionSettings::default())
            .unwrap();
        let p = s.preview(0).unwrap();
        assert_eq!(p.stats.point_count, 0);
        assert!(p.channels[&ChannelId(1)].samples.is_empty());
    }

    #[test]
    fn subsequences_play_inline_as_a_block() {
        let mut inner = Sequence::default();
        inner
            .add_position(flat(2.0, 1), PositionSettings::default())
            .unwrap();
        inner
            .add_position(
                flat(3.0, 1),
                PositionSettingsBuilder::default()
                    .repetitions(2)
                    .build()
                    .unwrap(),
            )
            .unwrap();

        let mut s = Sequence::default();
        s.add_position(flat(1.0, 1), PositionSettings::default())
            .unwrap();
        s.add_subsequence(
            Arc::new(inner),
            PositionSettingsBuilder::default()
                .repetitions(2)
                .build()
                .unwrap(),
        )
        .unwrap();

        let p = s.preview(2).unwrap();
        assert_eq!(
            p.channels[&ChannelId(1)].samples,
            vec![1.0, 2.0, 3.0, 3.0, 2.0, 3.0, 3.0]
        );
        assert_eq!(p.stats.point_count, s.total_points());
    }
}
