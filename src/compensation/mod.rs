// Copyright (c) 2024 Mike Tsao

//! Frequency-domain pre-distortion for channels with a known response.

/// The most commonly used imports.
pub mod prelude {
    pub use super::{Cutoff, FilterCompensator, FilterSpec, SampledResponse};
}

pub use filter::{Cutoff, FilterCompensator, FilterSpec, SampledResponse};

mod filter;
