//! Track acquisition.
//!
//! [`Pipeline::acquire`] turns a [`TrackInfo`] into local files:
//!
//! 1. Tracks without a delivery URL are rejected
//! 2. Files produced earlier for the same stable id are returned as they are
//! 3. Direct platforms are downloaded verbatim, unless the URL refers to a
//!    chat message, which is handed back unresolved
//! 4. Encrypted platforms are downloaded, decrypted, repaired, remuxed and
//!    tagged
//!
//! # Files
//!
//! Every intermediate file has a random name in the download directory and
//! is removed on every exit path. The final output is written under a
//! scratch name and renamed into place, so a file at the final path is
//! always complete.
//!
//! # Concurrency
//!
//! Acquisitions of different tracks never share files. Concurrent calls for
//! the same stable id are serialized: later callers wait for the first one
//! and then reuse its output.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use reqwest::Url;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    cover,
    decrypt::{Decryptor, Key},
    error::{Error, Result},
    http::Transport,
    repair,
    scratch,
    tagger::{Tagged, Tagger},
    tool::CommandRunner,
    track::{AudioSource, LocalAsset, TrackInfo},
};

type InFlightMap = Mutex<HashMap<String, Arc<AsyncMutex<()>>>>;

pub struct Pipeline {
    config: Arc<Config>,
    transport: Arc<dyn Transport>,
    runner: Arc<dyn CommandRunner>,
    decryptor: Decryptor,
    in_flight: InFlightMap,
}

/// Exclusive claim on a stable id. Releasing the last claim removes the
/// id's lock from the map.
struct InFlight<'a> {
    map: &'a InFlightMap,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.guard.take());
        if map
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.key);
        }
    }
}

impl Pipeline {
    #[must_use]
    pub fn new(
        config: Arc<Config>,
        transport: Arc<dyn Transport>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let decryptor = Decryptor::new(config.decrypt_workers);
        Self {
            config,
            transport,
            runner,
            decryptor,
            in_flight: Mutex::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Acquires the audio and cover of `track`.
    ///
    /// # Errors
    ///
    /// * `MissingSource` if the track has no delivery URL
    /// * `MissingKey` or `InvalidKey` for encrypted tracks without a usable key
    /// * `Network` if the download fails
    /// * `ExternalTool` if the stream copy fails
    /// * `ProcessingFailed` for anything else
    pub async fn acquire(&self, track: &TrackInfo) -> Result<LocalAsset> {
        self.acquire_with(track, &CancellationToken::new()).await
    }

    /// Like [`acquire`](Self::acquire), but stops early when `cancel` fires.
    /// Running tools are killed and scratch files removed before returning
    /// `Cancelled`.
    ///
    /// # Errors
    ///
    /// See [`acquire`](Self::acquire).
    pub async fn acquire_with(
        &self,
        track: &TrackInfo,
        cancel: &CancellationToken,
    ) -> Result<LocalAsset> {
        let start = Instant::now();
        let result = self
            .process(track, cancel)
            .await
            .map_err(Error::into_processing_failed);

        match &result {
            Ok(asset) => info!(
                "acquired {track} as {} in {:.2}s",
                asset.audio,
                start.elapsed().as_secs_f32()
            ),
            Err(e) => debug!("acquiring {track} failed: {e}"),
        }

        result
    }

    async fn process(&self, track: &TrackInfo, cancel: &CancellationToken) -> Result<LocalAsset> {
        let url = track
            .cdn_url
            .as_deref()
            .ok_or_else(|| Error::missing_source(format!("{track} has no delivery url")))?;

        let stem = track.file_stem()?;
        let dir = &self.config.download_dir;
        let audio = track.audio_path(dir)?;
        let cover = track.cover_path(dir)?;

        if let Some(asset) = Self::existing(&audio, &cover).await {
            debug!("reusing {}", audio.display());
            return Ok(asset);
        }

        let _claim = self.claim(stem, cancel).await?;
        if let Some(asset) = Self::existing(&audio, &cover).await {
            debug!("reusing {} produced by a concurrent request", audio.display());
            return Ok(asset);
        }

        if track.platform.is_direct() {
            self.direct(track, url, &audio, &cover, cancel).await
        } else {
            self.encrypted(track, url, &audio, &cover, cancel).await
        }
    }

    /// Returns the outputs of an earlier acquisition, if there are any.
    async fn existing(audio: &Path, cover: &Path) -> Option<LocalAsset> {
        if !tokio::fs::try_exists(audio).await.unwrap_or(false) {
            return None;
        }

        let cover = tokio::fs::try_exists(cover)
            .await
            .unwrap_or(false)
            .then(|| cover.to_path_buf());

        Some(LocalAsset {
            audio: AudioSource::File(audio.to_path_buf()),
            cover,
        })
    }

    /// Waits until no other acquisition of `key` is running.
    async fn claim(&self, key: &str, cancel: &CancellationToken) -> Result<InFlight<'_>> {
        let lock = Arc::clone(self.lock_in_flight().entry(key.to_owned()).or_default());
        let mut claim = InFlight {
            map: &self.in_flight,
            key: key.to_owned(),
            guard: None,
        };

        claim.guard = Some(tokio::select! {
            biased;

            () = cancel.cancelled() => return Err(Error::cancelled("acquisition was cancelled")),
            guard = lock.lock_owned() => guard,
        });

        Ok(claim)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn direct(
        &self,
        track: &TrackInfo,
        url: &str,
        audio: &Path,
        cover: &Path,
        cancel: &CancellationToken,
    ) -> Result<LocalAsset> {
        if track.is_message_link() {
            let cover = self.cover(track, cover, cancel).await?;
            return Ok(LocalAsset {
                audio: AudioSource::MessageLink(url.to_owned()),
                cover,
            });
        }

        let url = Url::parse(url)?;
        let dir = self.download_dir().await?;

        let part = scratch::file_in(dir, ".part")?;
        let bytes = cancellable(cancel, self.transport.download(&url, &part)).await?;
        scratch::restrict_permissions(&part).await?;
        scratch::persist(part, audio)?;
        trace!("downloaded {bytes} bytes into {}", audio.display());

        let cover = self.cover(track, cover, cancel).await?;
        Ok(LocalAsset {
            audio: AudioSource::File(audio.to_path_buf()),
            cover,
        })
    }

    async fn encrypted(
        &self,
        track: &TrackInfo,
        url: &str,
        audio: &Path,
        cover: &Path,
        cancel: &CancellationToken,
    ) -> Result<LocalAsset> {
        let key: Key = track
            .key_hex
            .as_deref()
            .ok_or_else(|| Error::missing_key(format!("{track} has no decryption key")))?
            .parse()?;

        let url = Url::parse(url)?;
        let dir = self.download_dir().await?;

        let encrypted = scratch::file_in(dir, ".enc")?;
        cancellable(cancel, self.transport.download(&url, &encrypted)).await?;
        let ciphertext = tokio::fs::read(&encrypted).await?;
        drop(encrypted);

        let mut data = cancellable(cancel, self.decryptor.decrypt(&key, ciphertext)).await?;
        repair::patch(&mut data)?;

        let patched = scratch::file_in(dir, ".tmp")?;
        tokio::fs::write(&patched, &data).await?;
        drop(data);

        let cover = self.cover(track, cover, cancel).await?;

        let output = scratch::file_in(dir, &format!(".{}", TrackInfo::REPAIRED_EXTENSION))?;
        repair::remux(
            &*self.runner,
            &self.config.ffmpeg,
            &patched,
            &output,
            &track.lyrics,
            cancel,
        )
        .await?;
        drop(patched);

        let tagger = Tagger::new(
            &*self.runner,
            &self.config.vorbiscomment,
            &self.config.cover_encoder,
        );
        if tagger
            .tag(&output, track, cover.as_deref(), cancel)
            .await?
            != Tagged::Yes
        {
            debug!("{track} is delivered without tags");
        }

        scratch::restrict_permissions(&output).await?;
        if cancel.is_cancelled() {
            return Err(Error::cancelled("acquisition was cancelled"));
        }
        scratch::persist(output, audio)?;

        Ok(LocalAsset {
            audio: AudioSource::File(audio.to_path_buf()),
            cover,
        })
    }

    async fn cover(
        &self,
        track: &TrackInfo,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        let save = cover::save_cover(
            &*self.transport,
            track.cover_url.as_deref(),
            dest,
            self.config.max_cover_size,
        );
        cancellable(cancel, async { Ok(save.await) }).await
    }

    async fn download_dir(&self) -> Result<&Path> {
        let dir = self.config.download_dir.as_path();
        tokio::fs::create_dir_all(dir).await?;
        Ok(dir)
    }
}

/// Runs `future` unless `cancel` fires first.
async fn cancellable<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;

        () = cancel.cancelled() => Err(Error::cancelled("acquisition was cancelled")),
        result = future => result,
    }
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsString, sync::atomic::Ordering};

    use super::*;
    use crate::{
        error::ErrorKind,
        http::stub::TransportStub,
        tool::{
            stub::{ok, RunnerStub},
            ToolOutput,
        },
        track::Platform,
    };

    const CDN: &str = "https://cdn.example.com/audio/abc";
    const COVER: &str = "https://img.example.com/abc.jpg";
    const KEY: &str = "000102030405060708090a0b0c0d0e0f";

    fn plaintext() -> Vec<u8> {
        (0..256u32).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn ciphertext() -> Vec<u8> {
        let mut data = plaintext();
        Decryptor::decrypt_in_place(&KEY.parse().unwrap(), &mut data).unwrap();
        data
    }

    fn repaired() -> Vec<u8> {
        let mut data = plaintext();
        repair::patch(&mut data).unwrap();
        data
    }

    fn encrypted_track() -> TrackInfo {
        TrackInfo {
            cdn_url: Some(CDN.to_owned()),
            key_hex: Some(KEY.to_owned()),
            stable_id: "abc".to_owned(),
            name: "Song".to_owned(),
            artist: "Band".to_owned(),
            lyrics: "la la".to_owned(),
            platform: Platform::Spotify,
            ..TrackInfo::default()
        }
    }

    /// ffmpeg that copies its input to its output.
    fn copying_ffmpeg(args: &[OsString]) -> Result<ToolOutput> {
        std::fs::copy(&args[2], &args[7]).unwrap();
        ok()
    }

    fn runner() -> RunnerStub {
        RunnerStub::default()
            .with("ffmpeg", copying_ffmpeg)
            .with("vorbiscomment", |_| ok())
            .with("./cover_gen.sh", |args: &[OsString]| {
                let block = Path::new(&args[0]).with_extension("base64");
                std::fs::write(block, "UElDVFVSRQ==").unwrap();
                ok()
            })
    }

    fn pipeline(
        dir: &Path,
        transport: Arc<TransportStub>,
        runner: Arc<RunnerStub>,
    ) -> Pipeline {
        let mut config = Config::new(dir);
        config.decrypt_workers = 2;
        Pipeline::new(Arc::new(config), transport, runner)
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn decrypts_repairs_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(
            TransportStub::default()
                .with(CDN, ciphertext())
                .with(COVER, b"jpeg".to_vec()),
        );
        let runner = Arc::new(runner());
        let pipeline = pipeline(dir.path(), transport.clone(), runner.clone());

        let mut track = encrypted_track();
        track.cover_url = Some(COVER.to_owned());
        let asset = pipeline.acquire(&track).await.unwrap();

        let audio = dir.path().join("abc.ogg");
        assert_eq!(asset.audio, AudioSource::File(audio.clone()));
        assert_eq!(asset.cover, Some(dir.path().join("abc_cover.jpg")));
        assert_eq!(std::fs::read(&audio).unwrap(), repaired());
        assert_eq!(files(dir.path()), ["abc.ogg", "abc_cover.jpg"]);

        let ffmpeg = runner.calls_to("ffmpeg");
        assert_eq!(ffmpeg.len(), 1);
        assert_eq!(ffmpeg[0][6], "lyrics=la la");
        assert_eq!(runner.calls_to("./cover_gen.sh").len(), 1);
        assert_eq!(runner.calls_to("vorbiscomment").len(), 1);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&audio).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o640);
        }
    }

    #[tokio::test]
    async fn second_acquisition_reuses_file() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TransportStub::default().with(CDN, ciphertext()));
        let runner = Arc::new(runner());
        let pipeline = pipeline(dir.path(), transport.clone(), runner.clone());

        let first = pipeline.acquire(&encrypted_track()).await.unwrap();
        let requests = transport.requests();
        let calls = runner.call_count();

        let second = pipeline.acquire(&encrypted_track()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(transport.requests(), requests);
        assert_eq!(runner.call_count(), calls);
    }

    #[tokio::test]
    async fn missing_key_creates_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TransportStub::default().with(CDN, ciphertext()));
        let runner = Arc::new(runner());
        let pipeline = pipeline(dir.path(), transport.clone(), runner.clone());

        let mut track = encrypted_track();
        track.key_hex = None;
        let err = pipeline.acquire(&track).await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::MissingKey);
        assert!(files(dir.path()).is_empty());
        assert_eq!(transport.requests(), 0);
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(TransportStub::default()),
            Arc::new(runner()),
        );

        let mut track = encrypted_track();
        track.cdn_url = None;
        let err = pipeline.acquire(&track).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::MissingSource);

        let mut track = encrypted_track();
        track.key_hex = Some("abcd".to_owned());
        let err = pipeline.acquire(&track).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidKey);

        let mut track = encrypted_track();
        track.stable_id = String::new();
        let err = pipeline.acquire(&track).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProcessingFailed);

        track.stable_id = "a:b".to_owned();
        let err = pipeline.acquire(&track).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProcessingFailed);

        assert!(files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn download_failure_is_a_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(
            dir.path(),
            Arc::new(TransportStub::default()),
            Arc::new(runner()),
        );

        let err = pipeline.acquire(&encrypted_track()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);
        assert!(files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn short_payload_fails_processing() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TransportStub::default().with(CDN, vec![0u8; 16]));
        let pipeline = pipeline(dir.path(), transport, Arc::new(runner()));

        let err = pipeline.acquire(&encrypted_track()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProcessingFailed);
        assert!(files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failed_remux_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TransportStub::default().with(CDN, ciphertext()));
        let runner = Arc::new(RunnerStub::default().with("ffmpeg", |args: &[OsString]| {
            std::fs::write(&args[7], b"partial").unwrap();
            Ok(ToolOutput {
                code: Some(1),
                stderr: b"Invalid data found when processing input".to_vec(),
                ..ToolOutput::default()
            })
        }));
        let pipeline = pipeline(dir.path(), transport, runner);

        let err = pipeline.acquire(&encrypted_track()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ExternalTool);
        assert!(files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn failed_tagging_still_delivers() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TransportStub::default().with(CDN, ciphertext()));
        let runner = Arc::new(
            RunnerStub::default()
                .with("ffmpeg", copying_ffmpeg)
                .with("vorbiscomment", |_| {
                    Ok(ToolOutput {
                        code: Some(1),
                        ..ToolOutput::default()
                    })
                }),
        );
        let pipeline = pipeline(dir.path(), transport, runner);

        let asset = pipeline.acquire(&encrypted_track()).await.unwrap();
        assert_eq!(asset.audio, AudioSource::File(dir.path().join("abc.ogg")));
        assert_eq!(files(dir.path()), ["abc.ogg"]);
    }

    #[tokio::test]
    async fn direct_platforms_download_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let url = "https://cdn.example.com/audio/song.m4a";
        let transport = Arc::new(
            TransportStub::default()
                .with(url, b"ftypM4A".to_vec())
                .with(COVER, b"jpeg".to_vec()),
        );
        let runner = Arc::new(runner());
        let pipeline = pipeline(dir.path(), transport.clone(), runner.clone());

        let track = TrackInfo {
            cdn_url: Some(url.to_owned()),
            cover_url: Some(COVER.to_owned()),
            stable_id: "yt1".to_owned(),
            platform: Platform::Youtube,
            ..TrackInfo::default()
        };
        let asset = pipeline.acquire(&track).await.unwrap();

        assert_eq!(asset.audio, AudioSource::File(dir.path().join("yt1.m4a")));
        assert_eq!(std::fs::read(dir.path().join("yt1.m4a")).unwrap(), b"ftypM4A");
        assert_eq!(files(dir.path()), ["yt1.m4a", "yt1_cover.jpg"]);
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn message_links_are_returned_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        let link = "https://t.me/some_channel/1234";
        let transport = Arc::new(TransportStub::default().with(COVER, b"jpeg".to_vec()));
        let pipeline = pipeline(dir.path(), transport.clone(), Arc::new(runner()));

        let track = TrackInfo {
            cdn_url: Some(link.to_owned()),
            cover_url: Some(COVER.to_owned()),
            stable_id: "sc1".to_owned(),
            platform: Platform::Soundcloud,
            ..TrackInfo::default()
        };
        let asset = pipeline.acquire(&track).await.unwrap();

        assert_eq!(asset.audio, AudioSource::MessageLink(link.to_owned()));
        assert_eq!(asset.cover, Some(dir.path().join("sc1_cover.jpg")));
        assert_eq!(transport.downloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TransportStub::default().with(CDN, ciphertext()));
        let runner = Arc::new(runner());
        let pipeline = pipeline(dir.path(), transport.clone(), runner.clone());

        let track = encrypted_track();
        let (a, b, c) = tokio::join!(
            pipeline.acquire(&track),
            pipeline.acquire(&track),
            pipeline.acquire(&track),
        );

        let audio = AudioSource::File(dir.path().join("abc.ogg"));
        for asset in [a, b, c] {
            assert_eq!(asset.unwrap().audio, audio);
        }
        assert_eq!(transport.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(runner.calls_to("ffmpeg").len(), 1);
        assert!(pipeline.lock_in_flight().is_empty());
    }

    #[tokio::test]
    async fn cancellation_removes_partial_work() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(TransportStub::default().with(CDN, ciphertext()));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let runner = Arc::new(
            RunnerStub::default()
                .with("ffmpeg", move |args: &[OsString]| {
                    trigger.cancel();
                    copying_ffmpeg(args)
                })
                .with("vorbiscomment", |_| ok()),
        );
        let pipeline = pipeline(dir.path(), transport, runner);

        let err = pipeline
            .acquire_with(&encrypted_track(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(files(dir.path()).is_empty());

        // a cancelled token stops the next acquisition before any work
        let err = pipeline
            .acquire_with(&encrypted_track(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
        assert!(pipeline.lock_in_flight().is_empty());
    }
}
