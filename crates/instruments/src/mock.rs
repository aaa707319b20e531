// Copyright (c) 2024 Mike Tsao

use crate::awg::Awg;
use anyhow::anyhow;
use std::sync::{Arc, Mutex};

/// One call a [MockAwg] received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AwgCall {
    /// Carries the uploaded bytes.
    Upload(Vec<u8>),
    #[allow(missing_docs)]
    Trigger,
    #[allow(missing_docs)]
    JumpTo(usize),
    #[allow(missing_docs)]
    Disconnect,
}

/// An [Awg] that records every call instead of talking to hardware. Clones
/// share one call log, so a test can keep a handle after boxing the driver.
#[derive(Clone, Debug, Default)]
pub struct MockAwg {
    calls: Arc<Mutex<Vec<AwgCall>>>,
}
impl MockAwg {
    /// Matches [DriverFactoryFn](crate::DriverFactoryFn). The address is
    /// ignored.
    pub fn open(_address: &str) -> anyhow::Result<Box<dyn Awg>> {
        Ok(Box::new(Self::default()))
    }

    /// Every call so far, oldest first.
    pub fn calls(&self) -> Vec<AwgCall> {
        self.calls
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_default()
    }

    fn is_connected(&self) -> bool {
        !self.calls().contains(&AwgCall::Disconnect)
    }

    fn record(&mut self, call: AwgCall) -> anyhow::Result<()> {
        if !self.is_connected() {
            return Err(anyhow!("mock AWG is disconnected"));
        }
        self.calls
            .lock()
            .map_err(|_| anyhow!("mock AWG call log is poisoned"))?
            .push(call);
        Ok(())
    }
}
impl Awg for MockAwg {
    fn upload(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.record(AwgCall::Upload(bytes.to_vec()))
    }

    fn trigger(&mut self) -> anyhow::Result<()> {
        self.record(AwgCall::Trigger)
    }

    fn jump_to(&mut self, position: usize) -> anyhow::Result<()> {
        if position == 0 {
            return Err(anyhow!("positions are numbered from 1"));
        }
        self.record(AwgCall::JumpTo(position))
    }

    fn disconnect(&mut self) -> anyhow::Result<()> {
        self.record(AwgCall::Disconnect)
    }
}
