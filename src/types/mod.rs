// Copyright (c) 2024 Mike Tsao

//! Common data types used throughout the system.

/// The most commonly used imports.
pub mod prelude {
    pub use super::{ChannelId, MarkerTrack, SampleRate, Seconds};
}

pub use {
    channels::{ChannelId, MarkerTrack},
    time::{SampleRate, Seconds},
};

mod channels;
mod time;
