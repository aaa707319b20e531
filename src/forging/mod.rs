// Copyright (c) 2024 Mike Tsao

//! Serializes a [ForgedSequence] into the bytes an AWG loads. Both formats
//! build the whole output in memory and return nothing at all on failure.

use crate::{
    error::{FormatError, PulseError, Result},
    sequencing::{ForgedContent, ForgedPosition, ForgedSequence},
};
use std::{io::Write, sync::atomic::AtomicBool};

/// The most commonly used imports.
pub mod prelude {
    pub use super::{read_container_b, ContainerA, ContainerB, Forger, Quantizer};
}

pub use {
    container_a::ContainerA,
    container_b::{
        read_container_b, BinaryChannel, BinaryElement, BinaryHeader, BinaryImage,
        BinaryPosition, BinarySubsequence, ContainerB, MAGIC, NAME_LEN, VERSION,
    },
    quantize::Quantizer,
};

mod container_a;
mod container_b;
mod quantize;

/// A bit-exact container format.
pub trait Forger {
    /// Serializes the sequence, giving up between elements once `cancel` is
    /// set.
    fn forge_with_cancel(&self, sequence: &ForgedSequence, cancel: &AtomicBool) -> Result<Vec<u8>>;

    /// Serializes the sequence.
    fn forge(&self, sequence: &ForgedSequence) -> Result<Vec<u8>> {
        self.forge_with_cancel(sequence, &AtomicBool::new(false))
    }

    /// Serializes the sequence and writes it out. Nothing is written unless
    /// serialization succeeds.
    fn write(&self, sequence: &ForgedSequence, writer: &mut dyn Write) -> Result<()> {
        let bytes = self.forge(sequence)?;
        writer
            .write_all(&bytes)
            .map_err(|e| PulseError::from(FormatError::from(e)))
    }
}

/// Checks what both formats rely on: at least one position, element and
/// subsequence indexes in range, subsequences holding elements only, and every
/// element carrying every exported channel at full length.
fn check_consistency(sequence: &ForgedSequence) -> core::result::Result<(), FormatError> {
    if sequence.positions.is_empty() {
        return Err(FormatError::EmptySequence);
    }
    for position in sequence.positions.iter() {
        match position.content {
            ForgedContent::Element(_) => check_element(sequence, position)?,
            ForgedContent::Subsequence(subsequence) => {
                let table = sequence.subsequence_at(position).ok_or(
                    FormatError::MissingSubsequence {
                        position: position.index,
                        subsequence,
                    },
                )?;
                for inner in table.positions.iter() {
                    if let ForgedContent::Subsequence(_) = inner.content {
                        return Err(FormatError::Malformed(format!(
                            "subsequence '{}' position {} holds a subsequence",
                            table.name, inner.index
                        )));
                    }
                    check_element(sequence, inner)?;
                }
            }
        }
    }
    Ok(())
}

fn check_element(
    sequence: &ForgedSequence,
    position: &ForgedPosition,
) -> core::result::Result<(), FormatError> {
    let ForgedContent::Element(index) = position.content else {
        return Ok(());
    };
    let element = sequence
        .element_at(position)
        .ok_or(FormatError::MissingElement {
            position: position.index,
            element: index,
        })?;
    for channel in sequence.channels.keys() {
        match element.channels.get(channel) {
            Some(data) if data.len() == element.sample_count => {}
            Some(data) => {
                return Err(FormatError::Malformed(format!(
                    "element '{}' channel {} has {} samples, expected {}",
                    element.name,
                    channel.0,
                    data.len(),
                    element.sample_count
                )))
            }
            None => {
                return Err(FormatError::MissingChannel {
                    position: position.index,
                    channel: *channel,
                })
            }
        }
    }
    Ok(())
}
