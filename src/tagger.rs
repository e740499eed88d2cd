//! Vorbis comment tagging of repaired files.
//!
//! Tags are written by `vorbiscomment` from a comment file with one
//! `KEY=VALUE` pair per line. Tagging is best effort: a missing or failing
//! tool leaves the file untagged, which is still a valid deliverable.

use std::{ffi::OsString, path::Path};

use tokio_util::sync::CancellationToken;

use crate::{
    cover,
    error::{ErrorKind, Result},
    scratch,
    tool::CommandRunner,
    track::TrackInfo,
};

/// Constant genre written to every tagged file.
pub const GENRE: &str = "Spotify @FallenProjects";

/// Constant comment written to every tagged file.
pub const COMMENT: &str = "By @FallenProjects";

/// Outcome of a tagging attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Tagged {
    Yes,
    /// The tagging tool is not installed.
    Skipped,
    /// The tagging tool ran but failed; the file is unchanged.
    Failed,
}

pub struct Tagger<'a> {
    runner: &'a dyn CommandRunner,
    program: &'a Path,
    cover_encoder: &'a Path,
}

impl<'a> Tagger<'a> {
    #[must_use]
    pub fn new(runner: &'a dyn CommandRunner, program: &'a Path, cover_encoder: &'a Path) -> Self {
        Self {
            runner,
            program,
            cover_encoder,
        }
    }

    /// Writes the descriptive comments of `track` into `file`, embedding
    /// `cover` as a picture block when it can be encoded.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fires, and an error if the comment
    /// file cannot be written. Tool failures are not errors.
    pub async fn tag(
        &self,
        file: &Path,
        track: &TrackInfo,
        cover: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Tagged> {
        if !self.runner.is_available(self.program) {
            warn!("{} not found, skipping tags", self.program.display());
            return Ok(Tagged::Skipped);
        }

        let picture = match cover {
            Some(image) => {
                cover::picture_block(self.runner, self.cover_encoder, image, cancel).await?
            }
            None => None,
        };

        let dir = file.parent().unwrap_or_else(|| Path::new("."));
        let comments = scratch::file_in(dir, ".txt")?;
        tokio::fs::write(&comments, comment_lines(track, picture.as_deref()).join("\n"))
            .await?;

        let args = [
            OsString::from("-a"),
            file.as_os_str().to_owned(),
            OsString::from("-c"),
            comments.as_os_str().to_owned(),
        ];

        let result = self
            .runner
            .run(self.program, &args, cancel)
            .await
            .and_then(|output| output.ensure_success(self.program));

        match result {
            Ok(()) => {
                trace!("tagged {}", file.display());
                Ok(Tagged::Yes)
            }
            Err(e) if e.kind == ErrorKind::Cancelled => Err(e),
            Err(e) => {
                warn!("delivering {} untagged: {e}", file.display());
                Ok(Tagged::Failed)
            }
        }
    }
}

/// Comment lines for `track`, in the order they are written.
///
/// The picture block comes first and is left out when absent. Line breaks
/// inside values are flattened so that every pair stays on one line.
#[must_use]
pub fn comment_lines(track: &TrackInfo, picture: Option<&str>) -> Vec<String> {
    let mut lines = Vec::with_capacity(10);
    if let Some(picture) = picture.filter(|p| !p.is_empty()) {
        lines.push(format!("METADATA_BLOCK_PICTURE={picture}"));
    }

    let year = track.year.to_string();
    let duration = track.duration_secs.to_string();
    let pairs: [(&str, &str); 9] = [
        ("ALBUM", track.album.as_str()),
        ("ARTIST", &track.artist),
        ("TITLE", &track.name),
        ("GENRE", GENRE),
        ("YEAR", &year),
        ("TRACKNUMBER", &track.stable_id),
        ("COMMENT", COMMENT),
        ("PUBLISHER", &track.artist),
        ("DURATION", &duration),
    ];

    lines.extend(
        pairs
            .iter()
            .map(|(key, value)| format!("{key}={}", value.replace(['\r', '\n'], " "))),
    );
    lines
}
