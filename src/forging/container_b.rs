// Copyright (c) 2024 Mike Tsao

use super::{check_consistency, quantize::Quantizer, Forger};
use crate::{
    error::{FormatError, PulseError, Result},
    sequencing::{
        EventInput, FlagSet, ForgedContent, ForgedPosition, ForgedSequence, TriggerInput,
    },
    types::{ChannelId, SampleRate},
};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::BTreeMap,
    io::{self, Cursor, Read},
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::debug;

/// Identifies a flat binary container.
pub const MAGIC: [u8; 8] = *b"PFAWG\0\0\0";
/// The layout version this crate writes.
pub const VERSION: u16 = 2;
/// Element and subsequence names occupy this many bytes, NUL padded.
pub const NAME_LEN: usize = 32;

/// The flat little-endian container: a fixed header, a channel table,
/// element records of packed words, one position table per subsequence, and
/// the main sequencing table.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ContainerB;
impl Forger for ContainerB {
    fn forge_with_cancel(&self, sequence: &ForgedSequence, cancel: &AtomicBool) -> Result<Vec<u8>> {
        check_consistency(sequence)?;
        let quantizers = sequence
            .channels
            .iter()
            .map(|(c, s)| Quantizer::new(*c, s).map(|q| (*c, q)))
            .collect::<core::result::Result<BTreeMap<_, _>, _>>()?;
        let names = sequence
            .elements
            .iter()
            .map(|e| &e.name)
            .chain(sequence.subsequences.iter().map(|s| &s.name));
        for name in names {
            if name.len() > NAME_LEN {
                return Err(FormatError::NameTooLong {
                    name: name.clone(),
                    max: NAME_LEN,
                }
                .into());
            }
        }

        let mut w = Vec::default();
        write_header(&mut w, sequence).map_err(FormatError::from)?;
        for (channel, settings) in sequence.channels.iter() {
            write_channel(
                &mut w,
                &BinaryChannel {
                    id: *channel,
                    resolution_bits: settings.resolution_bits,
                    marker_count: settings.marker_count,
                    amplitude: settings.amplitude as f32,
                    offset: settings.offset as f32,
                },
            )
            .map_err(FormatError::from)?;
        }
        for (k, element) in sequence.elements.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                return Err(PulseError::Interrupted {
                    completed: k,
                    total: sequence.elements.len(),
                });
            }
            let mut words = BTreeMap::default();
            for (channel, quantizer) in quantizers.iter() {
                let data = element
                    .channels
                    .get(channel)
                    .ok_or(FormatError::MissingChannel {
                        position: 0,
                        channel: *channel,
                    })?;
                words.insert(*channel, quantizer.words(data)?);
            }
            write_element(
                &mut w,
                &BinaryElement {
                    name: element.name.clone(),
                    words,
                },
            )
            .map_err(FormatError::from)?;
        }
        for subsequence in sequence.subsequences.iter() {
            write_name(&mut w, &subsequence.name);
            w.write_u32::<LittleEndian>(subsequence.positions.len() as u32)
                .map_err(FormatError::from)?;
            for position in subsequence.positions.iter() {
                write_position(&mut w, &binary_position(sequence, position))
                    .map_err(FormatError::from)?;
            }
        }
        for position in sequence.positions.iter() {
            write_position(&mut w, &binary_position(sequence, position))
                .map_err(FormatError::from)?;
        }
        debug!(bytes = w.len(), "forged binary container");
        Ok(w)
    }
}

/// The fixed-size header at the start of a binary container.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryHeader {
    #[allow(missing_docs)]
    pub version: u16,
    #[allow(missing_docs)]
    pub channel_count: u16,
    /// The largest resolution of any channel.
    pub resolution_bits: u16,
    /// The largest marker count of any channel.
    pub marker_count: u16,
    #[allow(missing_docs)]
    pub sample_rate: SampleRate,
    #[allow(missing_docs)]
    pub element_count: u32,
    #[allow(missing_docs)]
    pub subsequence_count: u32,
    /// Positions in the main table.
    pub position_count: u32,
}

/// One entry of the channel table.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryChannel {
    #[allow(missing_docs)]
    pub id: ChannelId,
    #[allow(missing_docs)]
    pub resolution_bits: u8,
    #[allow(missing_docs)]
    pub marker_count: u8,
    #[allow(missing_docs)]
    pub amplitude: f32,
    #[allow(missing_docs)]
    pub offset: f32,
}

/// One element record.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryElement {
    #[allow(missing_docs)]
    pub name: String,
    /// Packed words per channel, in channel-table order.
    pub words: BTreeMap<ChannelId, Vec<u16>>,
}

/// One row of a sequencing table.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryPosition {
    /// A 0-based index into the element records or the subsequence tables.
    pub content: ForgedContent,
    #[allow(missing_docs)]
    pub repetitions: u32,
    /// 1-based.
    pub goto: u32,
    #[allow(missing_docs)]
    pub trigger: TriggerInput,
    #[allow(missing_docs)]
    pub event_input: EventInput,
    /// 1-based. Stored as 0 when absent.
    pub event_jump: Option<u32>,
    #[allow(missing_docs)]
    pub flags: BTreeMap<ChannelId, FlagSet>,
}

/// One subsequence table.
#[derive(Clone, Debug, PartialEq)]
pub struct BinarySubsequence {
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub positions: Vec<BinaryPosition>,
}

/// A binary container parsed back into its parts.
#[derive(Clone, Debug, PartialEq)]
pub struct BinaryImage {
    #[allow(missing_docs)]
    pub header: BinaryHeader,
    #[allow(missing_docs)]
    pub channels: Vec<BinaryChannel>,
    #[allow(missing_docs)]
    pub elements: Vec<BinaryElement>,
    #[allow(missing_docs)]
    pub subsequences: Vec<BinarySubsequence>,
    #[allow(missing_docs)]
    pub positions: Vec<BinaryPosition>,
}

const CONTENT_ELEMENT: u8 = 0;
const CONTENT_SUBSEQUENCE: u8 = 1;

fn binary_position(sequence: &ForgedSequence, position: &ForgedPosition) -> BinaryPosition {
    BinaryPosition {
        content: position.content,
        repetitions: position.repetitions,
        goto: position.goto as u32,
        trigger: position.trigger,
        event_input: position.event_input,
        event_jump: position.event_jump.map(|j| j as u32),
        flags: sequence
            .channels
            .keys()
            .map(|c| {
                let flags = if sequence.with_flags {
                    position.flags_for(*c)
                } else {
                    FlagSet::NONE
                };
                (*c, flags)
            })
            .collect(),
    }
}

fn write_header(w: &mut Vec<u8>, sequence: &ForgedSequence) -> io::Result<()> {
    let settings = sequence.channels.values();
    w.extend_from_slice(&MAGIC);
    w.write_u16::<LittleEndian>(VERSION)?;
    w.write_u16::<LittleEndian>(sequence.channels.len() as u16)?;
    w.write_u16::<LittleEndian>(
        settings.clone().map(|s| s.resolution_bits as u16).max().unwrap_or_default(),
    )?;
    w.write_u16::<LittleEndian>(
        settings.map(|s| s.marker_count as u16).max().unwrap_or_default(),
    )?;
    w.write_f64::<LittleEndian>(sequence.sample_rate.0)?;
    w.write_u32::<LittleEndian>(sequence.elements.len() as u32)?;
    w.write_u32::<LittleEndian>(sequence.subsequences.len() as u32)?;
    w.write_u32::<LittleEndian>(sequence.positions.len() as u32)
}

fn write_channel(w: &mut Vec<u8>, channel: &BinaryChannel) -> io::Result<()> {
    w.write_u8(channel.id.0)?;
    w.write_u8(channel.resolution_bits)?;
    w.write_u8(channel.marker_count)?;
    w.write_u8(0)?;
    w.write_f32::<LittleEndian>(channel.amplitude)?;
    w.write_f32::<LittleEndian>(channel.offset)?;
    w.write_u32::<LittleEndian>(0)
}

fn write_name(w: &mut Vec<u8>, name: &str) {
    let mut field = [0u8; NAME_LEN];
    field[..name.len()].copy_from_slice(name.as_bytes());
    w.extend_from_slice(&field);
}

fn write_element(w: &mut Vec<u8>, element: &BinaryElement) -> io::Result<()> {
    write_name(w, &element.name);
    let sample_count = element.words.values().map(Vec::len).max().unwrap_or_default();
    w.write_u32::<LittleEndian>(sample_count as u32)?;
    for words in element.words.values() {
        for word in words {
            w.write_u16::<LittleEndian>(*word)?;
        }
    }
    Ok(())
}

fn write_position(w: &mut Vec<u8>, position: &BinaryPosition) -> io::Result<()> {
    let (kind, index) = match position.content {
        ForgedContent::Element(i) => (CONTENT_ELEMENT, i),
        ForgedContent::Subsequence(i) => (CONTENT_SUBSEQUENCE, i),
    };
    w.write_u32::<LittleEndian>(index as u32)?;
    w.write_u32::<LittleEndian>(position.repetitions)?;
    w.write_u32::<LittleEndian>(position.goto)?;
    w.write_u32::<LittleEndian>(position.event_jump.unwrap_or_default())?;
    w.write_u8(position.trigger as u8)?;
    w.write_u8(position.event_input as u8)?;
    w.write_u8(kind)?;
    w.write_u8(0)?;
    for flags in position.flags.values() {
        w.write_u16::<LittleEndian>(flags.packed())?;
    }
    Ok(())
}

fn malformed(e: io::Error) -> FormatError {
    FormatError::Malformed(e.to_string())
}

/// Parses a binary container. Meant for verifying exports, so it rejects
/// anything that isn't exactly what [ContainerB] writes.
pub fn read_container_b(bytes: &[u8]) -> core::result::Result<BinaryImage, FormatError> {
    let mut r = Cursor::new(bytes);
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(malformed)?;
    if magic != MAGIC {
        return Err(FormatError::Malformed("bad magic".to_string()));
    }
    let header = BinaryHeader {
        version: r.read_u16::<LittleEndian>().map_err(malformed)?,
        channel_count: r.read_u16::<LittleEndian>().map_err(malformed)?,
        resolution_bits: r.read_u16::<LittleEndian>().map_err(malformed)?,
        marker_count: r.read_u16::<LittleEndian>().map_err(malformed)?,
        sample_rate: SampleRate(r.read_f64::<LittleEndian>().map_err(malformed)?),
        element_count: r.read_u32::<LittleEndian>().map_err(malformed)?,
        subsequence_count: r.read_u32::<LittleEndian>().map_err(malformed)?,
        position_count: r.read_u32::<LittleEndian>().map_err(malformed)?,
    };
    if header.version != VERSION {
        return Err(FormatError::Malformed(format!(
            "unsupported version {}",
            header.version
        )));
    }

    let mut channels = Vec::with_capacity(header.channel_count as usize);
    for _ in 0..header.channel_count {
        let id = ChannelId(r.read_u8().map_err(malformed)?);
        let resolution_bits = r.read_u8().map_err(malformed)?;
        let marker_count = r.read_u8().map_err(malformed)?;
        r.read_u8().map_err(malformed)?;
        let amplitude = r.read_f32::<LittleEndian>().map_err(malformed)?;
        let offset = r.read_f32::<LittleEndian>().map_err(malformed)?;
        r.read_u32::<LittleEndian>().map_err(malformed)?;
        channels.push(BinaryChannel {
            id,
            resolution_bits,
            marker_count,
            amplitude,
            offset,
        });
    }

    let mut elements = Vec::default();
    for _ in 0..header.element_count {
        let name = read_name(&mut r)?;
        let sample_count = r.read_u32::<LittleEndian>().map_err(malformed)? as usize;
        let remaining = bytes.len() - r.position() as usize;
        let needed = sample_count
            .checked_mul(2)
            .and_then(|n| n.checked_mul(channels.len()));
        if needed.map_or(true, |n| n > remaining) {
            return Err(FormatError::Malformed(format!(
                "element '{name}' claims {sample_count} samples, but only {remaining} bytes remain"
            )));
        }
        let mut words = BTreeMap::default();
        for channel in channels.iter() {
            let mut data = vec![0u16; sample_count];
            r.read_u16_into::<LittleEndian>(&mut data).map_err(malformed)?;
            words.insert(channel.id, data);
        }
        elements.push(BinaryElement { name, words });
    }

    let mut subsequences = Vec::default();
    for _ in 0..header.subsequence_count {
        let name = read_name(&mut r)?;
        let count = r.read_u32::<LittleEndian>().map_err(malformed)?;
        let mut positions = Vec::default();
        for _ in 0..count {
            positions.push(read_position(&mut r, &channels)?);
        }
        subsequences.push(BinarySubsequence { name, positions });
    }

    let mut positions = Vec::default();
    for _ in 0..header.position_count {
        positions.push(read_position(&mut r, &channels)?);
    }

    if (r.position() as usize) != bytes.len() {
        return Err(FormatError::Malformed(format!(
            "{} trailing bytes",
            bytes.len() - r.position() as usize
        )));
    }
    Ok(BinaryImage {
        header,
        channels,
        elements,
        subsequences,
        positions,
    })
}

fn read_name(r: &mut Cursor<&[u8]>) -> core::result::Result<String, FormatError> {
    let mut name = [0u8; NAME_LEN];
    r.read_exact(&mut name).map_err(malformed)?;
    let end = name.iter().position(|b| *b == 0).unwrap_or(NAME_LEN);
    String::from_utf8(name[..end].to_vec()).map_err(|e| FormatError::Malformed(e.to_string()))
}

fn read_position(
    r: &mut Cursor<&[u8]>,
    channels: &[BinaryChannel],
) -> core::result::Result<BinaryPosition, FormatError> {
    let index = r.read_u32::<LittleEndian>().map_err(malformed)? as usize;
    let repetitions = r.read_u32::<LittleEndian>().map_err(malformed)?;
    let goto = r.read_u32::<LittleEndian>().map_err(malformed)?;
    let event_jump = r.read_u32::<LittleEndian>().map_err(malformed)?;
    let code = r.read_u8().map_err(malformed)?;
    let trigger = TriggerInput::from_repr(code)
        .ok_or_else(|| FormatError::Malformed(format!("unknown trigger code {code}")))?;
    let code = r.read_u8().map_err(malformed)?;
    let event_input = EventInput::from_repr(code)
        .ok_or_else(|| FormatError::Malformed(format!("unknown event input code {code}")))?;
    let content = match r.read_u8().map_err(malformed)? {
        CONTENT_ELEMENT => ForgedContent::Element(index),
        CONTENT_SUBSEQUENCE => ForgedContent::Subsequence(index),
        kind => return Err(FormatError::Malformed(format!("unknown content kind {kind}"))),
    };
    r.read_u8().map_err(malformed)?;
    let mut flags = BTreeMap::default();
    for channel in channels.iter() {
        let word = r.read_u16::<LittleEndian>().map_err(malformed)?;
        let set = FlagSet::from_packed(word)
            .ok_or_else(|| FormatError::Malformed(format!("bad flag word {word:#06x}")))?;
        flags.insert(channel.id, set);
    }
    Ok(BinaryPosition {
        content,
        repetitions,
        goto,
        trigger,
        event_input,
        event_jump: (event_jump != 0).then_some(event_jump),
        flags,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        composition::{BluePrint, Element},
        sequencing::{Flag, ForgedSubsequence, PositionSettings, PositionSettingsBuilder, Sequence},
        settings::{ChannelSettingsBuilder, ForgeSettings},
        synthesis::Segment,
    };
    use std::sync::Arc;

    fn element(name: &str, level: f64) -> Arc<Element> {
        let mut blueprints = BTreeMap::default();
        for channel in [ChannelId(1), ChannelId(2)] {
            blueprints.insert(
                channel,
                BluePrint::with_segments([Segment::ramp(level, level, 3.0e-9)]).unwrap(),
            );
        }
        Arc::new(
            Element::build(blueprints, SampleRate(1.0e9))
                .unwrap()
                .named(name),
        )
    }

    fn forged(with_flags: bool) -> ForgedSequence {
        let mut s = Sequence::default();
        s.add_position(element("low", -0.5), PositionSettingsBuilder::default().repetitions(4).build().unwrap())
            .unwrap();
        s.add_position(
            element("high", 0.5),
            PositionSettingsBuilder::default()
                .trigger(TriggerInput::ExternalB)
                .channel_flags(ChannelId(2), FlagSet([Flag::Pulse, Flag::None, Flag::None, Flag::None]))
                .build()
                .unwrap(),
        )
        .unwrap();
        s.set_goto(2, 2).unwrap();
        let mut settings = ForgeSettings::default();
        settings.set_with_flags(with_flags);
        settings.set_channel(ChannelId(1), Default::default());
        settings.set_channel(
            ChannelId(2),
            ChannelSettingsBuilder::default()
                .resolution_bits(16)
                .marker_count(0)
                .build()
                .unwrap(),
        );
        s.forge(&settings).unwrap()
    }

    #[test]
    fn header_is_36_bytes_and_exact() {
        let bytes = ContainerB.forge(&forged(false)).unwrap();
        assert_eq!(&bytes[0..8], b"PFAWG\0\0\0");
        assert_eq!(&bytes[8..10], &[2, 0]);
        assert_eq!(&bytes[10..12], &[2, 0]);
        assert_eq!(&bytes[12..14], &[16, 0]);
        assert_eq!(&bytes[14..16], &[2, 0]);
        assert_eq!(&bytes[16..24], &1.0e9f64.to_le_bytes());
        assert_eq!(&bytes[24..28], &[2, 0, 0, 0]);
        assert_eq!(&bytes[28..32], &[0, 0, 0, 0]);
        assert_eq!(&bytes[32..36], &[2, 0, 0, 0]);
        assert_eq!(&bytes[36..40], &[1, 14, 2, 0]);
        assert_eq!(&bytes[40..44], &1.0f32.to_le_bytes());

        let element_bytes = NAME_LEN + 4 + 2 * 3 * 2;
        let position_bytes = 4 * 4 + 4 + 2 * 2;
        assert_eq!(bytes.len(), 36 + 2 * 16 + 2 * element_bytes + 2 * position_bytes);
    }

    #[test]
    fn reads_back_what_it_wrote() {
        let image = read_container_b(&ContainerB.forge(&forged(true)).unwrap()).unwrap();
        assert_eq!(image.header.element_count, 2);
        assert_eq!(image.channels[1].resolution_bits, 16);
        assert_eq!(image.elements[0].name, "low");
        assert_eq!(image.elements[0].words[&ChannelId(1)], vec![0, 0, 0]);
        assert_eq!(image.elements[1].words[&ChannelId(1)], vec![0xfffc; 3]);
        assert_eq!(image.elements[1].words[&ChannelId(2)], vec![0xffff; 3]);

        assert_eq!(image.positions[0].content, ForgedContent::Element(0));
        assert_eq!(image.positions[0].event_input, EventInput::Off);
        assert_eq!(image.positions[0].event_jump, None);
        assert_eq!(image.positions[0].repetitions, 4);
        assert_eq!(image.positions[0].goto, 2);
        assert_eq!(image.positions[1].goto, 2);
        assert_eq!(image.positions[1].trigger, TriggerInput::ExternalB);
        assert_eq!(
            image.positions[1].flags[&ChannelId(2)],
            FlagSet([Flag::Pulse, Flag::None, Flag::None, Flag::None])
        );
    }

    #[test]
    fn flags_are_zero_without_the_flag_variant() {
        let image = read_container_b(&ContainerB.forge(&forged(false)).unwrap()).unwrap();
        assert!(image
            .positions
            .iter()
            .all(|p| p.flags.values().all(|f| *f == FlagSet::NONE)));
    }

    #[test]
    fn long_names_are_rejected() {
        let mut s = forged(false);
        s.elements[0].name = "x".repeat(NAME_LEN + 1);
        assert_eq!(
            ContainerB.forge(&s),
            Err(PulseError::Format(FormatError::NameTooLong {
                name: "x".repeat(NAME_LEN + 1),
                max: NAME_LEN
            }))
        );
        s.elements[0].name = "x".repeat(NAME_LEN);
        assert!(ContainerB.forge(&s).is_ok());
    }

    #[test]
    fn missing_elements_are_rejected() {
        let mut s = forged(false);
        s.positions[1].content = ForgedContent::Element(7);
        assert_eq!(
            ContainerB.forge(&s),
            Err(PulseError::Format(FormatError::MissingElement {
                position: 2,
                element: 7
            }))
        );
    }

    #[test]
    fn truncated_input_is_malformed() {
        let bytes = ContainerB.forge(&forged(false)).unwrap();
        assert!(matches!(
            read_container_b(&bytes[..bytes.len() - 1]),
            Err(FormatError::Malformed(_))
        ));
        assert!(matches!(
            read_container_b(b"not a container"),
            Err(FormatError::Malformed(_))
        ));
    }

    #[test]
    fn inflated_sample_counts_are_malformed() {
        let mut bytes = ContainerB.forge(&forged(false)).unwrap();
        let count_at = 36 + 2 * 16 + NAME_LEN;
        bytes[count_at..count_at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            read_container_b(&bytes),
            Err(FormatError::Malformed(message)) if message.contains("claims")
        ));

        let mut header = bytes[..36 + 16].to_vec();
        header[10..12].copy_from_slice(&[1, 0]);
        header[24..28].copy_from_slice(&[1, 0, 0, 0]);
        header.extend_from_slice(&[0u8; NAME_LEN]);
        header.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            read_container_b(&header),
            Err(FormatError::Malformed(message)) if message.contains("claims")
        ));
    }

    #[test]
    fn subsequences_and_event_jumps_read_back() {
        let mut inner = Sequence::default().named("burst");
        inner
            .add_position(
                element("a", 0.25),
                PositionSettingsBuilder::default().repetitions(3).build().unwrap(),
            )
            .unwrap();
        inner
            .add_position(element("b", -0.25), PositionSettings::default())
            .unwrap();
        let mut s = Sequence::default();
        s.add_position(element("lead", 0.0), PositionSettings::default())
            .unwrap();
        s.add_subsequence(
            Arc::new(inner),
            PositionSettingsBuilder::default()
                .event_input(EventInput::Internal)
                .event_jump(Some(1))
                .build()
                .unwrap(),
        )
        .unwrap();
        let forged = s.forge(&ForgeSettings::default()).unwrap();
        let bytes = ContainerB.forge(&forged).unwrap();
        let image = read_container_b(&bytes).unwrap();

        assert_eq!(image.header.subsequence_count, 1);
        assert_eq!(image.elements.len(), 3);
        assert_eq!(image.subsequences[0].name, "burst");
        assert_eq!(
            image.subsequences[0]
                .positions
                .iter()
                .map(|p| (p.content, p.repetitions, p.goto))
                .collect::<Vec<_>>(),
            vec![
                (ForgedContent::Element(1), 3, 2),
                (ForgedContent::Element(2), 1, 1)
            ]
        );
        let position = &image.positions[1];
        assert_eq!(position.content, ForgedContent::Subsequence(0));
        assert_eq!(position.event_input, EventInput::Internal);
        assert_eq!(position.event_jump, Some(1));
        assert_eq!(image.positions[0].event_jump, None);

        let mut bad = bytes.clone();
        let kind_at = bytes.len() - (4 * 4 + 4 + 2 * 2) + 4 * 4 + 2;
        bad[kind_at] = 9;
        assert!(matches!(
            read_container_b(&bad),
            Err(FormatError::Malformed(_))
        ));
    }

    #[test]
    fn long_subsequence_names_are_rejected() {
        let mut s = forged(false);
        let positions = s.positions.clone();
        s.subsequences.push(ForgedSubsequence {
            name: "y".repeat(NAME_LEN + 1),
            positions,
        });
        assert!(matches!(
            ContainerB.forge(&s),
            Err(PulseError::Format(FormatError::NameTooLong { .. }))
        ));
    }
}
