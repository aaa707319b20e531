// Copyright (c) 2024 Mike Tsao

use serde::{Deserialize, Serialize};
use synonym::Synonym;

/// Identifies one analog output of an AWG. Channels are numbered from 1, as
/// they are on the front panel.
#[derive(Synonym, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChannelId(pub u8);
impl ChannelId {
    #[allow(missing_docs)]
    pub const ONE: ChannelId = ChannelId(1);
    #[allow(missing_docs)]
    pub const TWO: ChannelId = ChannelId(2);
    #[allow(missing_docs)]
    pub const THREE: ChannelId = ChannelId(3);
    #[allow(missing_docs)]
    pub const FOUR: ChannelId = ChannelId(4);
}

/// Selects one of the two marker tracks that ride along with every channel.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumIter,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum MarkerTrack {
    #[allow(missing_docs)]
    Marker1,
    #[allow(missing_docs)]
    Marker2,
}
