// Copyright (c) 2024 Mike Tsao

use crate::{awg::Awg, mock::MockAwg};
use anyhow::anyhow;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use synonym::Synonym;

/// Names a kind of instrument driver, such as `mock`.
#[derive(Synonym, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DriverKey(String);

/// Opens a driver for the instrument at the given address.
pub type DriverFactoryFn = fn(&str) -> anyhow::Result<Box<dyn Awg>>;

/// [DriverFactory] maps [DriverKey]s to driver constructors. Callers build
/// one, register what they have, and call [finalize()](Self::finalize).
#[derive(Debug, Default)]
pub struct DriverFactory {
    drivers: FxHashMap<DriverKey, DriverFactoryFn>,

    is_registration_complete: bool,
    sorted_keys: Vec<DriverKey>,
}
impl DriverFactory {
    /// A factory with the drivers this crate ships already registered.
    pub fn with_builtins() -> anyhow::Result<Self> {
        let mut r = Self::default();
        r.register(DriverKey::from("mock"), MockAwg::open)?;
        Ok(r)
    }

    /// Registers a constructor. Fails on duplicate keys and after
    /// [finalize()](Self::finalize).
    pub fn register(&mut self, key: DriverKey, f: DriverFactoryFn) -> anyhow::Result<()> {
        if self.is_registration_complete {
            return Err(anyhow!("attempt to register {key} after registration completed"));
        }
        if self.drivers.contains_key(&key) {
            return Err(anyhow!("register({key}): duplicate key"));
        }
        self.drivers.insert(key, f);
        Ok(())
    }

    /// Tells the factory that no more drivers are coming.
    pub fn finalize(mut self) -> Self {
        self.is_registration_complete = true;
        self.sorted_keys = self.drivers.keys().cloned().collect();
        self.sorted_keys.sort();
        self
    }

    /// All keys in sorted order. Empty until [finalize()](Self::finalize).
    pub fn sorted_keys(&self) -> &[DriverKey] {
        &self.sorted_keys
    }

    /// Opens a driver of the given kind.
    pub fn new_driver(&self, key: &DriverKey, address: &str) -> anyhow::Result<Box<dyn Awg>> {
        let f = self
            .drivers
            .get(key)
            .ok_or_else(|| anyhow!("no driver registered for {key}"))?;
        f(address)
    }
}
