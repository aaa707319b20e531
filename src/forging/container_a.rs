// Copyright (c) 2024 Mike Tsao

use super::{check_consistency, quantize::Quantizer, Forger};
use crate::{
    error::{FormatError, PulseError, Result},
    sequencing::{ForgedElement, ForgedPosition, ForgedSequence},
    types::ChannelId,
};
use std::{
    collections::BTreeMap,
    fmt::Write as _,
    io::{Cursor, Write},
    sync::atomic::{AtomicBool, Ordering},
};
use tracing::debug;
use zip::{write::FileOptions, CompressionMethod, DateTime, ZipWriter};

const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// The zip container: one waveform file per distinct element, one table per
/// subsequence, the main sequence table, and a setup file, stored uncompressed with fixed timestamps so
/// identical input always yields identical bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ContainerA;
impl ContainerA {
    /// The archive path of an element's waveform file.
    pub fn waveform_path(element: &str) -> String {
        format!("Waveforms/{element}.wfmx")
    }

    /// The archive path of the sequence table.
    pub fn sequence_path(sequence: &str) -> String {
        format!("Sequences/{sequence}.sml")
    }

    /// The archive path of the setup file.
    pub const SETUP_PATH: &'static str = "setup.xml";

    fn waveform(
        element: &ForgedElement,
        quantizers: &BTreeMap<ChannelId, Quantizer>,
        sequence: &ForgedSequence,
    ) -> core::result::Result<Vec<u8>, FormatError> {
        let mut payload = Vec::default();
        let mut description = String::default();
        for (channel, quantizer) in quantizers.iter() {
            let data = element
                .channels
                .get(channel)
                .ok_or(FormatError::MissingChannel {
                    position: 0,
                    channel: *channel,
                })?;
            let words = quantizer.words(data)?;
            for sample in data.samples() {
                payload.extend_from_slice(&sample.to_le_bytes());
            }
            for word in words {
                payload.extend_from_slice(&word.to_le_bytes());
            }
            let settings = &sequence.channels[channel];
            let _ = write!(
                description,
                "<Channel id=\"{}\" resolution=\"{}\" markers=\"{}\"/>",
                channel.0, settings.resolution_bits, settings.marker_count
            );
        }
        let body = format!(
            "<DataDescription><Name>{}</Name><NumberSamples>{}</NumberSamples>\
             <SampleRate>{}</SampleRate>{description}</DataDescription></DataFile>\n",
            escape(&element.name),
            element.sample_count,
            sequence.sample_rate.0,
        );
        let mut header = descriptor_with_offset(0, &body);
        header = descriptor_with_offset(header.len(), &body);

        let mut bytes = header.into_bytes();
        bytes.extend(payload);
        Ok(bytes)
    }

    fn sequence_table(
        sequence: &ForgedSequence,
        name: &str,
        positions: &[ForgedPosition],
    ) -> String {
        let mut xml = String::from(XML_DECLARATION);
        let _ = writeln!(
            xml,
            "<Sequence name=\"{}\" steps=\"{}\" tracks=\"{}\">",
            escape(name),
            positions.len(),
            sequence.channels.len()
        );
        for position in positions.iter() {
            let _ = writeln!(xml, "  <Step>");
            let _ = writeln!(xml, "    <StepNumber>{}</StepNumber>", position.index);
            match sequence.subsequence_at(position) {
                Some(subsequence) => {
                    let _ = writeln!(
                        xml,
                        "    <SubsequenceName>{}</SubsequenceName>",
                        escape(&subsequence.name)
                    );
                }
                None => {
                    let asset = sequence
                        .element_at(position)
                        .map(|e| e.name.as_str())
                        .unwrap_or_default();
                    let _ = writeln!(
                        xml,
                        "    <WaveformAssetName>{}</WaveformAssetName>",
                        escape(asset)
                    );
                }
            }
            let _ = writeln!(xml, "    <Trigger>{}</Trigger>", position.trigger);
            let _ = writeln!(xml, "    <Repeat>{}</Repeat>", position.repetitions);
            let _ = writeln!(xml, "    <GotoTarget>{}</GotoTarget>", position.goto);
            let _ = writeln!(xml, "    <EventInput>{}</EventInput>", position.event_input);
            match position.event_jump {
                Some(target) => {
                    let _ = writeln!(xml, "    <EventJumpTarget>{target}</EventJumpTarget>");
                }
                None => {
                    let _ = writeln!(xml, "    <EventJumpTarget>next</EventJumpTarget>");
                }
            }
            if sequence.with_flags {
                for channel in sequence.channels.keys() {
                    let flags = position.flags_for(*channel);
                    let _ = writeln!(
                        xml,
                        "    <Flags channel=\"{}\">{} {} {} {}</Flags>",
                        channel.0, flags.0[0], flags.0[1], flags.0[2], flags.0[3]
                    );
                }
            }
            let _ = writeln!(xml, "  </Step>");
        }
        xml.push_str("</Sequence>\n");
        xml
    }

    fn setup(sequence: &ForgedSequence) -> String {
        let mut xml = String::from(XML_DECLARATION);
        let _ = writeln!(xml, "<Setup>");
        let _ = writeln!(xml, "  <SampleRate>{}</SampleRate>", sequence.sample_rate.0);
        for (channel, settings) in sequence.channels.iter() {
            let _ = writeln!(
                xml,
                "  <Channel id=\"{}\"><Amplitude>{}</Amplitude><Offset>{}</Offset>\
                 <Resolution>{}</Resolution><Markers>{}</Markers></Channel>",
                channel.0,
                settings.amplitude,
                settings.offset,
                settings.resolution_bits,
                settings.marker_count
            );
        }
        let _ = writeln!(xml, "</Setup>");
        xml
    }
}
impl Forger for ContainerA {
    fn forge_with_cancel(&self, sequence: &ForgedSequence, cancel: &AtomicBool) -> Result<Vec<u8>> {
        check_consistency(sequence)?;
        let quantizers = sequence
            .channels
            .iter()
            .map(|(c, s)| Quantizer::new(*c, s).map(|q| (*c, q)))
            .collect::<core::result::Result<BTreeMap<_, _>, _>>()?;

        let mut files: Vec<(String, Vec<u8>)> = Vec::default();
        for (k, element) in sequence.elements.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                return Err(PulseError::Interrupted {
                    completed: k,
                    total: sequence.elements.len(),
                });
            }
            files.push((
                Self::waveform_path(&element.name),
                Self::waveform(element, &quantizers, sequence)?,
            ));
        }
        for subsequence in sequence.subsequences.iter() {
            files.push((
                Self::sequence_path(&subsequence.name),
                Self::sequence_table(sequence, &subsequence.name, &subsequence.positions)
                    .into_bytes(),
            ));
        }
        files.push((
            Self::sequence_path(&sequence.name),
            Self::sequence_table(sequence, &sequence.name, &sequence.positions).into_bytes(),
        ));
        files.push((Self::SETUP_PATH.to_string(), Self::setup(sequence).into_bytes()));

        let bytes = zip_stored(files).map_err(PulseError::from)?;
        debug!(bytes = bytes.len(), "forged zip container");
        Ok(bytes)
    }
}

fn zip_stored(files: Vec<(String, Vec<u8>)>) -> core::result::Result<Vec<u8>, FormatError> {
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(DateTime::default());
    let mut zip = ZipWriter::new(Cursor::new(Vec::default()));
    for (path, contents) in files {
        zip.start_file(path, options)?;
        zip.write_all(&contents)?;
    }
    Ok(zip.finish()?.into_inner())
}

/// The descriptor ends where the payload begins; `offset` records that
/// length, zero-padded to a fixed width so it can describe itself.
fn descriptor_with_offset(offset: usize, body: &str) -> String {
    format!("{XML_DECLARATION}<DataFile offset=\"{offset:09}\" version=\"0.1\">{body}")
}

fn escape(s: &str) -> String {
    let mut r = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => r.push_str("&amp;"),
            '<' => r.push_str("&lt;"),
            '>' => r.push_str("&gt;"),
            '"' => r.push_str("&quot;"),
            '\'' => r.push_str("&apos;"),
            c => r.push(c),
        }
    }
    r
}
