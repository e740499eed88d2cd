use serde::{Deserialize, Serialize};

use crate::track::Platform;

/// A search or lookup hit. Its `url` is the id to resolve with
/// `get_track` into a full [`TrackInfo`](crate::track::TrackInfo).
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct MusicTrack {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub year: String,
    #[serde(default)]
    pub cover: String,
    #[serde(default)]
    pub cover_small: String,
    #[serde(default)]
    pub duration: u64,
    #[serde(default)]
    pub platform: Platform,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct PlatformTracks {
    #[serde(default)]
    pub results: Vec<MusicTrack>,
}
