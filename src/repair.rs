//! Container repair for decrypted payloads.
//!
//! # Container Format
//!
//! After decryption, the payload is an Ogg Vorbis stream whose first two page
//! headers have been overwritten with placeholder bytes by the CDN. Both
//! headers are restored from a constant patch table:
//!
//! * Page 1 (offset 0): capture pattern, zeroed granule position and serial
//!   number, one segment of 30 bytes holding the Vorbis identification
//!   header (2 channels, 44100 Hz, nominal bitrate 320 kbit/s)
//! * Page 2 (offset 58): capture pattern and zeroed header fields
//!
//! CRC fields are left as placeholders. The stream is then copied into a
//! fresh container by `ffmpeg`, which rewrites page checksums without
//! re-encoding the audio.

use std::{ffi::OsString, path::Path};

use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, ErrorKind, Result},
    tool::CommandRunner,
};

/// Byte ranges to overwrite, as `(offset, canonical bytes)`.
pub const PATCHES: [(usize, &[u8]); 9] = [
    (0, b"OggS"),
    (6, &[0; 10]),
    (26, b"\x01\x1E\x01vorbis"),
    (39, b"\x02"),
    (40, b"\x44\xAC\x00\x00"),
    (48, b"\x00\xE2\x04\x00"),
    (56, b"\xB8\x01"),
    (58, b"OggS"),
    (62, &[0; 10]),
];

/// Smallest payload that holds every patched range.
pub const MIN_LEN: usize = 72;

/// Restores both page headers of a decrypted payload in place.
///
/// # Errors
///
/// Returns `ProcessingFailed` if the payload is too short to hold the
/// headers.
pub fn patch(data: &mut [u8]) -> Result<()> {
    if data.len() < MIN_LEN {
        return Err(Error::processing_failed(format!(
            "payload of {} bytes is too short for a container header",
            data.len()
        )));
    }

    for (offset, bytes) in PATCHES {
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    Ok(())
}

/// Arguments for a stream copy of `input` into `output` that adds a single
/// `lyrics` metadata field.
#[must_use]
pub fn remux_args(input: &Path, output: &Path, lyrics: &str) -> Vec<OsString> {
    let mut lyrics_field = OsString::from("lyrics=");
    lyrics_field.push(lyrics);

    vec![
        "-y".into(),
        "-i".into(),
        input.into(),
        "-c".into(),
        "copy".into(),
        "-metadata".into(),
        lyrics_field,
        output.into(),
    ]
}

/// Copies the patched stream at `input` into a valid container at `output`.
///
/// # Errors
///
/// Returns `ExternalTool` if `ffmpeg` is missing, fails or times out, and
/// `Cancelled` if `cancel` fires. In every error case `output` is removed.
pub async fn remux(
    runner: &dyn CommandRunner,
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    lyrics: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let args = remux_args(input, output, lyrics);
    let result = runner
        .run(ffmpeg, &args, cancel)
        .await
        .and_then(|out| out.ensure_success(ffmpeg));

    if let Err(e) = result {
        if let Err(rm) = tokio::fs::remove_file(output).await {
            if rm.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove partial {}: {rm}", output.display());
            }
        }

        return Err(match e.kind {
            ErrorKind::Cancelled | ErrorKind::ExternalTool => e,
            _ => Error::external_tool(e.to_string()),
        });
    }

    trace!("remuxed {} into {}", input.display(), output.display());
    Ok(())
}
