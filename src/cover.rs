//! Cover art for acquired tracks.
//!
//! Covers are optional decoration: every failure in this module is logged
//! and turned into "no cover" instead of failing the acquisition. The only
//! error that is passed on is cancellation.

use std::path::{Path, PathBuf};

use reqwest::Url;
use tempfile::TempPath;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ErrorKind, Result},
    http::Transport,
    scratch,
    tool::CommandRunner,
};

/// Makes sure the cover at `url` is stored at `dest`.
///
/// An existing file at `dest` is reused. Downloads larger than `max_size`
/// are skipped.
pub async fn save_cover(
    transport: &dyn Transport,
    url: Option<&str>,
    dest: &Path,
    max_size: usize,
) -> Option<PathBuf> {
    let url = url?;
    if tokio::fs::try_exists(dest).await.unwrap_or(false) {
        debug!("reusing cover {}", dest.display());
        return Some(dest.to_path_buf());
    }

    match download(transport, url, dest, max_size).await {
        Ok(()) => Some(dest.to_path_buf()),
        Err(e) => {
            warn!("skipping cover for {}: {e}", dest.display());
            None
        }
    }
}

async fn download(
    transport: &dyn Transport,
    url: &str,
    dest: &Path,
    max_size: usize,
) -> Result<()> {
    let url = Url::parse(url)?;
    let dir = dest
        .parent()
        .ok_or_else(|| Error::invalid_argument(format!("{} has no parent", dest.display())))?;

    let body = transport.fetch(&url, max_size).await?;
    if body.is_empty() {
        return Err(Error::not_found("cover is empty"));
    }

    let image = scratch::file_in(dir, ".jpg")?;
    tokio::fs::write(&image, &body).await?;
    scratch::restrict_permissions(&image).await?;
    scratch::persist(image, dest)
}

/// Runs the cover encoder on `image` and returns the picture block it writes
/// next to the image, with surrounding whitespace removed.
///
/// Returns `None` if the encoder is missing, fails, or writes nothing. The
/// encoder's output file is removed in every case.
///
/// # Errors
///
/// Returns `Cancelled` if `cancel` fires while the encoder runs.
pub async fn picture_block(
    runner: &dyn CommandRunner,
    encoder: &Path,
    image: &Path,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let block = TempPath::from_path(image.with_extension("base64"));

    let output = match runner.run(encoder, &[image.as_os_str().to_owned()], cancel).await {
        Ok(output) => output,
        Err(e) if e.kind == ErrorKind::Cancelled => return Err(e),
        Err(e) => {
            error!("cover encoder: {e}");
            return Ok(None);
        }
    };

    if let Err(e) = output.ensure_success(encoder) {
        error!("{e}");
        return Ok(None);
    }

    match tokio::fs::read_to_string(&block).await {
        Ok(contents) => {
            let contents = contents.trim();
            if contents.is_empty() {
                warn!("{} is empty", block.display());
                Ok(None)
            } else {
                Ok(Some(contents.to_owned()))
            }
        }
        Err(e) => {
            error!("{} not generated: {e}", block.display());
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        http::stub::TransportStub,
        tool::{stub::RunnerStub, ToolOutput},
    };

    const COVER: &str = "https://img.example.com/cover.jpg";

    #[tokio::test]
    async fn saves_and_reuses_cover() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc_cover.jpg");
        let transport = TransportStub::default().with(COVER, b"\xff\xd8jpeg".to_vec());

        let saved = save_cover(&transport, Some(COVER), &dest, 1024).await;
        assert_eq!(saved.as_deref(), Some(dest.as_path()));
        assert_eq!(std::fs::read(&dest).unwrap(), b"\xff\xd8jpeg");

        let again = save_cover(&transport, Some(COVER), &dest, 1024).await;
        assert_eq!(again.as_deref(), Some(dest.as_path()));
        assert_eq!(transport.requests(), 1);
    }

    #[tokio::test]
    async fn oversized_or_missing_covers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("abc_cover.jpg");
        let transport = TransportStub::default().with(COVER, vec![0; 2048]);

        assert_eq!(save_cover(&transport, Some(COVER), &dest, 1024).await, None);
        assert_eq!(save_cover(&transport, None, &dest, 1024).await, None);
        assert_eq!(
            save_cover(&transport, Some("https://img.example.com/404.jpg"), &dest, 1024).await,
            None
        );
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn reads_and_removes_picture_block() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("abc_cover.jpg");
        std::fs::write(&image, b"jpeg").unwrap();

        let sibling = dir.path().join("abc_cover.base64");
        let written = sibling.clone();
        let runner = RunnerStub::default().with("./cover_gen.sh", move |_| {
            std::fs::write(&written, "AAAAAwAAAAppbWFnZS9qcGVn\n").unwrap();
            crate::tool::stub::ok()
        });

        let encoder = Path::new("./cover_gen.sh");
        let block = picture_block(&runner, encoder, &image, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(block.as_deref(), Some("AAAAAwAAAAppbWFnZS9qcGVn"));
        assert!(!sibling.exists());
        assert_eq!(runner.calls_to("./cover_gen.sh"), vec![vec![image.into_os_string()]]);
    }

    #[tokio::test]
    async fn failing_encoder_yields_no_block() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("abc_cover.jpg");
        let sibling = dir.path().join("abc_cover.base64");
        let written = sibling.clone();

        let runner = RunnerStub::default().with("./cover_gen.sh", move |_| {
            std::fs::write(&written, "partial").unwrap();
            Ok(ToolOutput {
                code: Some(2),
                ..ToolOutput::default()
            })
        });

        let encoder = Path::new("./cover_gen.sh");
        let block = picture_block(&runner, encoder, &image, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(block, None);
        assert!(!sibling.exists());

        let block = picture_block(
            &RunnerStub::default(),
            Path::new("./cover_gen.sh"),
            &image,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(block, None);
    }

    #[tokio::test]
    async fn cancellation_is_passed_on() {
        let runner = RunnerStub::default().with("./cover_gen.sh", |_| crate::tool::stub::ok());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = picture_block(&runner, Path::new("./cover_gen.sh"), Path::new("x.jpg"), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Cancelled);
    }
}
