// Copyright (c) 2024 Mike Tsao

//! Drivers that move forged pulse programs onto AWG hardware. The core
//! `pulseforge` crate never touches a device; everything here sits behind
//! the [Awg] trait.

#![deny(missing_docs)]

/// The most commonly used imports.
pub mod prelude {
    pub use super::{Awg, AwgCall, AwgSession, DriverFactory, DriverKey, MockAwg};
}

pub use {
    awg::{Awg, AwgSession},
    factory::{DriverFactory, DriverFactoryFn, DriverKey},
    mock::{AwgCall, MockAwg},
};

mod awg;
mod factory;
mod mock;
