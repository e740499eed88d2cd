use std::{
    fmt,
    path::{Path, PathBuf},
    sync::LazyLock,
};

use regex_lite::Regex;
use serde::{de, Deserialize, Deserializer, Serialize};

use crate::error::{self, Error};

/// Source platform of a track, as reported by the metadata API.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Spotify,
    Youtube,
    YoutubeMusic,
    Soundcloud,
    AppleMusic,
    #[default]
    #[serde(other)]
    Unknown,
}

impl Platform {
    /// Whether the platform serves a playable container as-is.
    ///
    /// Everything else is delivered encrypted and needs decryption and
    /// container repair.
    #[must_use]
    pub fn is_direct(self) -> bool {
        matches!(self, Self::Youtube | Self::Soundcloud)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Spotify => "spotify",
            Self::Youtube => "youtube",
            Self::YoutubeMusic => "youtube_music",
            Self::Soundcloud => "soundcloud",
            Self::AppleMusic => "apple_music",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Track record returned by the metadata API.
///
/// Read-only once fetched. The `stable_id` names the track's canonical audio
/// content and determines its file names on disk.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrackInfo {
    #[serde(rename = "cdnurl", default, deserialize_with = "non_empty")]
    pub cdn_url: Option<String>,

    /// Hex encoded per-track decryption key.
    #[serde(rename = "key", default, deserialize_with = "non_empty")]
    pub key_hex: Option<String>,

    #[serde(rename = "tc")]
    pub stable_id: String,

    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub lyrics: String,

    #[serde(rename = "cover", default, deserialize_with = "non_empty")]
    pub cover_url: Option<String>,

    #[serde(default, deserialize_with = "year")]
    pub year: i32,

    #[serde(rename = "duration", default)]
    pub duration_secs: u64,

    #[serde(default)]
    pub platform: Platform,
}

/// Treats empty strings in the API response as absent.
fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Accepts the release year both as a number and as a string.
fn year<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Year {
        Number(i32),
        Text(String),
    }

    match Option::<Year>::deserialize(deserializer)? {
        Some(Year::Number(year)) => Ok(year),
        Some(Year::Text(text)) if !text.trim().is_empty() => {
            text.trim().parse().map_err(<D::Error as de::Error>::custom)
        }
        _ => Ok(0),
    }
}

static MESSAGE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://t\.me/([a-zA-Z0-9_]{5,})/(\d+)$").expect("message link pattern")
});

impl TrackInfo {
    /// Extension used for decrypted and repaired containers.
    pub const REPAIRED_EXTENSION: &'static str = "ogg";

    /// Extension used for direct downloads whose URL does not carry one.
    pub const DEFAULT_DIRECT_EXTENSION: &'static str = "mp3";

    /// The stable id as the stem of this track's file names.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the stable id is empty, starts with a
    /// dot, or holds characters other than ASCII alphanumerics, `_`, `-`
    /// and `.`. Such ids are rejected rather than rewritten, so that two
    /// ids never share a file.
    pub fn file_stem(&self) -> error::Result<&str> {
        let id = self.stable_id.as_str();
        if id.is_empty() {
            return Err(Error::invalid_argument(format!("{self} has no stable id")));
        }

        let safe = |c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.');
        if id.starts_with('.') || !id.chars().all(safe) {
            return Err(Error::invalid_argument(format!(
                "stable id {id:?} is not usable as a file name"
            )));
        }

        Ok(id)
    }

    /// File extension of the final audio file.
    #[must_use]
    pub fn extension(&self) -> String {
        if !self.platform.is_direct() {
            return Self::REPAIRED_EXTENSION.to_owned();
        }

        self.cdn_url
            .as_deref()
            .and_then(|url| url::Url::parse(url).ok())
            .and_then(|url| {
                let path = url.path().to_owned();
                Path::new(&path)
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(str::to_ascii_lowercase)
            })
            .filter(|ext| {
                !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .unwrap_or_else(|| Self::DEFAULT_DIRECT_EXTENSION.to_owned())
    }

    /// Final audio path for this track inside `dir`.
    ///
    /// # Errors
    ///
    /// See [`file_stem`](Self::file_stem).
    pub fn audio_path(&self, dir: &Path) -> error::Result<PathBuf> {
        Ok(dir.join(format!("{}.{}", self.file_stem()?, self.extension())))
    }

    /// Cover image path for this track inside `dir`.
    ///
    /// # Errors
    ///
    /// See [`file_stem`](Self::file_stem).
    pub fn cover_path(&self, dir: &Path) -> error::Result<PathBuf> {
        Ok(dir.join(format!("{}_cover.jpg", self.file_stem()?)))
    }

    /// Whether the delivery URL points at a message in the chat network
    /// rather than at downloadable content.
    #[must_use]
    pub fn is_message_link(&self) -> bool {
        self.cdn_url
            .as_deref()
            .is_some_and(|url| MESSAGE_LINK.is_match(url))
    }
}

impl fmt::Display for TrackInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.artist.is_empty() {
            write!(f, "{} ({})", self.stable_id, self.platform)
        } else {
            write!(f, "{}: {} - {} ({})", self.stable_id, self.artist, self.name, self.platform)
        }
    }
}

/// Where the audio of an acquired track can be found.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum AudioSource {
    /// A playable file in the download directory.
    File(PathBuf),

    /// A message in the chat network that already holds the audio. The
    /// delivery layer resolves it.
    MessageLink(String),
}

impl AudioSource {
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::File(path) => Some(path),
            Self::MessageLink(_) => None,
        }
    }
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::MessageLink(link) => f.write_str(link),
        }
    }
}

/// Result of a successful acquisition, owned by the caller.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LocalAsset {
    pub audio: AudioSource,
    pub cover: Option<PathBuf>,
}
