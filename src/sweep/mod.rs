// Copyright (c) 2024 Mike Tsao

//! Parametric sweeps: one element, many variations, one position each.

/// The most commonly used imports.
pub mod prelude {
    pub use super::{Interpolation, LoopPlan, SweepExpander, SweepTarget};
}

pub use expander::{Interpolation, LoopPlan, SweepExpander, SweepTarget};

mod expander;
