//! Playlist downloads packaged as a single archive.
//!
//! Tracks are acquired with bounded concurrency. Failed tracks are logged
//! and left out; the archive holds whatever succeeded. Acquired files stay
//! in the download directory where later requests can reuse them, so the
//! archive is built from copies.

use std::{
    collections::HashSet,
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use futures_util::{future, stream, StreamExt};
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;
use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::{
    api::TrackSource,
    error::{Error, Result},
    pipeline::Pipeline,
    protocol::catalog::PlatformTracks,
    scratch,
    track::{AudioSource, TrackInfo},
};

pub struct PlaylistBatcher {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
}

impl PlaylistBatcher {
    #[must_use]
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        let concurrency = pipeline.config().batch_concurrency.max(1);
        Self {
            pipeline,
            concurrency,
        }
    }

    /// Acquires every track and archives the files that succeeded.
    ///
    /// Returns `None` if no track succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the archive cannot be built. Failures of single
    /// tracks are not errors.
    pub async fn acquire_all(&self, tracks: &[TrackInfo]) -> Result<Option<PathBuf>> {
        self.acquire_all_with(tracks, &CancellationToken::new()).await
    }

    /// Like [`acquire_all`](Self::acquire_all), but stops early when
    /// `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `Cancelled` if `cancel` fired, or an error if the archive
    /// cannot be built.
    pub async fn acquire_all_with(
        &self,
        tracks: &[TrackInfo],
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let files: Vec<PathBuf> = stream::iter(tracks)
            .map(move |track| async move {
                match self.pipeline.acquire_with(track, cancel).await {
                    Ok(asset) => match asset.audio {
                        AudioSource::File(path) => Some(path),
                        AudioSource::MessageLink(link) => {
                            warn!("leaving {track} out of the archive: {link} is not a local file");
                            None
                        }
                    },
                    Err(e) => {
                        warn!("leaving {track} out of the archive: {e}");
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(future::ready)
            .collect()
            .await;

        if cancel.is_cancelled() {
            return Err(Error::cancelled("playlist download was cancelled"));
        }

        info!("{} of {} tracks acquired", files.len(), tracks.len());
        if files.is_empty() {
            return Ok(None);
        }

        self.archive(&files).await.map(Some)
    }

    /// Resolves every entry of `playlist` and acquires the resulting tracks.
    ///
    /// Entries that cannot be resolved are logged and left out.
    ///
    /// # Errors
    ///
    /// See [`acquire_all_with`](Self::acquire_all_with).
    pub async fn acquire_playlist(
        &self,
        source: &dyn TrackSource,
        playlist: &PlatformTracks,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let tracks: Vec<TrackInfo> = stream::iter(&playlist.results)
            .map(move |entry| async move {
                match source.get_track(&entry.url).await {
                    Ok(track) => Some(track),
                    Err(e) => {
                        warn!("cannot resolve {}: {e}", entry.url);
                        None
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter_map(future::ready)
            .collect()
            .await;

        self.acquire_all_with(&tracks, cancel).await
    }

    async fn archive(&self, files: &[PathBuf]) -> Result<PathBuf> {
        let dir = self.pipeline.config().download_dir.as_path();
        let staging = scratch::dir_in(dir, "tmp_")?;

        let mut names = HashSet::new();
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            if names.insert(name.to_owned()) {
                tokio::fs::copy(file, staging.path().join(name)).await?;
            } else {
                debug!("{} is already in the archive", file.display());
            }
        }

        let archive = TempPath::from_path(staging.path().with_extension("zip"));
        let (from, to) = (staging.path().to_path_buf(), archive.to_path_buf());
        tokio::task::spawn_blocking(move || write_zip(&from, &to)).await??;
        drop(staging);

        let unix_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let dest = dir.join(format!("playlist_{unix_secs}_{:08x}.zip", fastrand::u32(..)));

        scratch::restrict_permissions(&archive).await?;
        scratch::persist(archive, &dest)?;
        debug!("archived {} files into {}", names.len(), dest.display());
        Ok(dest)
    }
}

/// Writes every file in `dir` into a deflated zip archive at `dest`.
fn write_zip(dir: &Path, dest: &Path) -> Result<()> {
    let mut entries = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut zip = ZipWriter::new(File::create(dest)?);
    for entry in entries {
        zip.start_file(entry.file_name().to_string_lossy(), options)?;
        io::copy(&mut File::open(entry.path())?, &mut zip)?;
    }
    zip.finish()?;

    Ok(())
}
