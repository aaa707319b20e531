// Copyright (c) 2024 Mike Tsao

//! Arranges segments into per-channel [BluePrint]s and combines blueprints
//! into multi-channel [Element]s.

/// The most commonly used imports.
pub mod prelude {
    pub use super::{BluePrint, Element, ElementChannel};
}

pub use {
    blueprint::{BluePrint, SynthesizedBluePrint},
    element::{Element, ElementChannel},
    naming::{letters, unique_name},
};

mod blueprint;
mod element;
mod naming;
