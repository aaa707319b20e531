// Copyright (c) 2024 Mike Tsao

use crate::{
    composition::ElementChannel,
    error::FormatError,
    settings::{ChannelSettings, WORD_BITS},
    types::ChannelId,
};

/// How far past full scale a sample may stray before it counts as out of
/// range rather than rounding noise.
const RANGE_TOLERANCE: f64 = 1.0e-9;

/// Packs voltages and marker bits into the 16-bit words AWG hardware stores.
///
/// The top `resolution_bits` of each word hold the DAC code. Marker 1 sits in
/// bit 0 and marker 2 in bit 1, when the channel carries them.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Quantizer {
    channel: ChannelId,
    amplitude: f64,
    offset: f64,
    resolution_bits: u8,
    marker_count: u8,
}
impl Quantizer {
    /// Fails if the resolution leaves no room for the requested markers.
    pub fn new(channel: ChannelId, settings: &ChannelSettings) -> Result<Self, FormatError> {
        let r = settings.resolution_bits;
        let m = settings.marker_count;
        if r == 0 || r > WORD_BITS || m > 2 || WORD_BITS - r < m {
            return Err(FormatError::ResolutionTooSmall {
                channel,
                resolution_bits: r,
                marker_count: m,
            });
        }
        Ok(Self {
            channel,
            amplitude: settings.amplitude,
            offset: settings.offset,
            resolution_bits: r,
            marker_count: m,
        })
    }

    fn shift(&self) -> u32 {
        (WORD_BITS - self.resolution_bits) as u32
    }

    fn levels(&self) -> f64 {
        ((1u32 << self.resolution_bits) - 1) as f64
    }

    /// Packs one sample. `index` only decorates the error.
    pub fn word(&self, index: usize, value: f64, marker1: bool, marker2: bool) -> Result<u16, FormatError> {
        let x = (value - self.offset) / (self.amplitude / 2.0);
        if !x.is_finite() || x.abs() > 1.0 + RANGE_TOLERANCE {
            return Err(FormatError::VoltageOutOfRange {
                channel: self.channel,
                index,
                value,
                min: self.offset - self.amplitude / 2.0,
                max: self.offset + self.amplitude / 2.0,
            });
        }
        let code = ((x.clamp(-1.0, 1.0) + 1.0) / 2.0 * self.levels()).round() as u32;
        let mut word = code << self.shift();
        if self.marker_count >= 1 && marker1 {
            word |= 0b01;
        }
        if self.marker_count >= 2 && marker2 {
            word |= 0b10;
        }
        Ok(word as u16)
    }

    /// Packs a whole channel, failing on the first out-of-range sample.
    pub fn words(&self, data: &ElementChannel) -> Result<Vec<u16>, FormatError> {
        let (marker1, marker2) = (data.marker1(), data.marker2());
        data.samples()
            .iter()
            .enumerate()
            .map(|(i, v)| {
                self.word(
                    i,
                    *v,
                    marker1.get(i).unwrap_or_default(),
                    marker2.get(i).unwrap_or_default(),
                )
            })
            .collect()
    }

    /// The voltage a word's DAC code stands for.
    pub fn value_of(&self, word: u16) -> f64 {
        let code = (word as u32) >> self.shift();
        let x = code as f64 / self.levels() * 2.0 - 1.0;
        self.offset + x * self.amplitude / 2.0
    }

    /// The marker bits of a word, `false` for tracks this channel lacks.
    pub fn markers_of(&self, word: u16) -> (bool, bool) {
        (
            self.marker_count >= 1 && word & 0b01 != 0,
            self.marker_count >= 2 && word & 0b10 != 0,
        )
    }
}
