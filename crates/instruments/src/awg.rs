// Copyright (c) 2024 Mike Tsao

use anyhow::anyhow;
use delegate::delegate;
use pulseforge::{forging::Forger, sequencing::ForgedSequence};
use tracing::info;

/// Everything the pulse-program pipeline needs from an instrument.
pub trait Awg: core::fmt::Debug + Send {
    /// Replaces the instrument's waveforms and sequence table with a forged
    /// container.
    fn upload(&mut self, bytes: &[u8]) -> anyhow::Result<()>;

    /// Starts playback, or fires the trigger the current position waits on.
    fn trigger(&mut self) -> anyhow::Result<()>;

    /// Continues playback at a 1-based sequence position.
    fn jump_to(&mut self, position: usize) -> anyhow::Result<()>;

    /// Releases the instrument. Later calls fail.
    fn disconnect(&mut self) -> anyhow::Result<()>;
}

/// A driver plus what was last loaded onto it, so that jumps can be checked
/// before they reach the device.
#[derive(Debug)]
pub struct AwgSession {
    driver: Box<dyn Awg>,
    position_count: usize,
}
impl AwgSession {
    #[allow(missing_docs)]
    pub fn new(driver: Box<dyn Awg>) -> Self {
        Self {
            driver,
            position_count: 0,
        }
    }

    /// Forges `sequence` with `forger` and uploads the result. Nothing reaches
    /// the driver if forging fails.
    pub fn load(&mut self, sequence: &ForgedSequence, forger: &dyn Forger) -> anyhow::Result<()> {
        let bytes = forger.forge(sequence)?;
        self.driver.upload(&bytes)?;
        self.position_count = sequence.positions.len();
        info!(
            bytes = bytes.len(),
            positions = self.position_count,
            "uploaded sequence"
        );
        Ok(())
    }

    /// Jumps to a position of the loaded sequence.
    pub fn jump_to(&mut self, position: usize) -> anyhow::Result<()> {
        if position == 0 || position > self.position_count {
            return Err(anyhow!(
                "position {position} is outside the loaded sequence of {} positions",
                self.position_count
            ));
        }
        self.driver.jump_to(position)
    }

    /// How many positions the loaded sequence has; zero before a load.
    pub fn position_count(&self) -> usize {
        self.position_count
    }

    delegate! {
        to self.driver {
            #[allow(missing_docs)]
            pub fn trigger(&mut self) -> anyhow::Result<()>;
            #[allow(missing_docs)]
            pub fn disconnect(&mut self) -> anyhow::Result<()>;
        }
    }
}
