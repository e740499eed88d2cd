//! Decryption of protected CDN payloads.
//!
//! # Encryption Format
//!
//! Encrypted platforms serve the whole audio stream encrypted with AES in
//! counter mode:
//! * The key is per track and delivered hex encoded with the track record
//! * The nonce is empty; the full 16-byte counter block starts at a fixed
//!   value shared by every track ([`Decryptor::INITIAL_COUNTER`])
//! * The counter is incremented as a 128-bit big-endian integer
//!
//! Counter mode is symmetric, so the same operation both encrypts and
//! decrypts.
//!
//! # Concurrency
//!
//! Decryption is CPU bound and works on whole files. [`Decryptor`] runs it on
//! the blocking thread pool, gated by a semaphore so that at most a fixed
//! number of payloads are processed at the same time.

use std::{str::FromStr, sync::Arc};

use aes::{Aes128, Aes192, Aes256};
use ctr::{
    cipher::{KeyIvInit, StreamCipher},
    Ctr128BE,
};
use tokio::sync::Semaphore;
use veil::Redact;

use crate::error::{Error, Result};

/// Validated AES key of 128, 192 or 256 bits.
#[derive(Clone, PartialEq, Eq, Hash, Redact)]
#[redact(all)]
pub struct Key(Vec<u8>);

impl Key {
    /// Key lengths in bytes accepted by AES.
    pub const LENGTHS: [usize; 3] = [16, 24, 32];

    /// Wraps raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` if the length is not a valid AES key
    /// length.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        let len = bytes.len();
        if !Self::LENGTHS.contains(&len) {
            return Err(Error::invalid_key(format!(
                "key length is {len} bytes but should be one of {:?}",
                Self::LENGTHS
            )));
        }
        Ok(Self(bytes))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Key {
    type Err = Error;

    /// Parses a hex encoded key.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` if the string is not valid hex or does not
    /// decode to a valid AES key length.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        Self::from_bytes(bytes)
    }
}

/// Applies the AES-CTR keystream for `key` starting at counter block `iv`.
fn apply_keystream(key: &Key, iv: &[u8; 16], buf: &mut [u8]) -> Result<()> {
    let invalid = |e: ctr::cipher::InvalidLength| Error::invalid_key(e.to_string());
    match key.len() {
        16 => Ctr128BE::<Aes128>::new_from_slices(&key.0, iv)
            .map_err(invalid)?
            .apply_keystream(buf),
        24 => Ctr128BE::<Aes192>::new_from_slices(&key.0, iv)
            .map_err(invalid)?
            .apply_keystream(buf),
        32 => Ctr128BE::<Aes256>::new_from_slices(&key.0, iv)
            .map_err(invalid)?
            .apply_keystream(buf),
        len => return Err(Error::invalid_key(format!("unsupported key length {len}"))),
    }
    Ok(())
}

/// Decrypts payloads on a bounded pool of blocking workers.
#[derive(Clone, Debug)]
pub struct Decryptor {
    permits: Arc<Semaphore>,
}

impl Decryptor {
    /// Initial counter block shared by every track.
    pub const INITIAL_COUNTER: [u8; 16] = [
        0x72, 0xe0, 0x67, 0xfb, 0xdd, 0xcb, 0xcf, 0x77, 0xeb, 0xe8, 0xbc, 0x64, 0x3f, 0x63, 0x0d,
        0x93,
    ];

    /// Creates a decryptor that runs at most `workers` jobs concurrently.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Decrypts `data` in place on the calling thread.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` if the key cannot be used.
    pub fn decrypt_in_place(key: &Key, data: &mut [u8]) -> Result<()> {
        apply_keystream(key, &Self::INITIAL_COUNTER, data)
    }

    /// Decrypts `data` on a worker thread and returns the plaintext.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidKey` if the key cannot be used, or
    /// `Error::ProcessingFailed` if the worker panicked.
    pub async fn decrypt(&self, key: &Key, mut data: Vec<u8>) -> Result<Vec<u8>> {
        // The permit moves into the worker so it is only released once the
        // blocking work is done, even if the caller stops waiting.
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| Error::processing_failed(e.to_string()))?;

        let key = key.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
            let _permit = permit;
            Self::decrypt_in_place(&key, &mut data)?;
            Ok(data)
        })
        .await?
    }
}

impl Default for Decryptor {
    fn default() -> Self {
        Self::new(std::thread::available_parallelism().map_or(1, usize::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    // NIST SP 800-38A, F.5.1 CTR-AES128.Encrypt
    #[test]
    fn matches_reference_vector() {
        let key: Key = "2b7e151628aed2a6abf7158809cf4f3c".parse().unwrap();
        let iv: [u8; 16] = unhex("f0f1f2f3f4f5f6f7f8f9fafbfcfdfeff").try_into().unwrap();

        let mut data = unhex("6bc1bee22e409f96e93d7e117393172aae2d8a571e03ac9c9eb76fac45af8e51");
        apply_keystream(&key, &iv, &mut data).unwrap();

        assert_eq!(
            data,
            unhex("874d6191b620e3261bef6864990db6ce9806f66b7970fdff8617187bb9fffdff")
        );
    }

    // Produced independently with `openssl enc -aes-128-ctr` and the fixed
    // initial counter.
    #[test]
    fn decrypts_known_payload() {
        let key: Key = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let mut data = unhex(concat!(
            "f1d53bbd25b679cc11910500176bd8c2a50173bf10498cc25f8c010c9bc726a4",
            "3cc72fec0f14cf219e770554924b6dbee9721d9fb35e455e2ecf",
        ));

        Decryptor::decrypt_in_place(&key, &mut data).unwrap();
        assert_eq!(data, b"OggS and then some more audio data for the fixed counter!!");
    }

    #[test]
    fn initial_counter_is_fixed() {
        assert_eq!(
            Decryptor::INITIAL_COUNTER.to_vec(),
            unhex("72e067fbddcbcf77ebe8bc643f630d93")
        );
    }

    #[test]
    fn rejects_malformed_keys() {
        let err = "not hex".parse::<Key>().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidKey);

        let err = "00112233".parse::<Key>().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidKey);

        assert!("00112233445566778899aabbccddeeff0011223344556677"
            .parse::<Key>()
            .is_ok());
    }

    #[tokio::test]
    async fn decrypts_on_worker_pool() {
        let key: Key = "000102030405060708090a0b0c0d0e0f".parse().unwrap();
        let plaintext = b"OggS and then some more audio data".to_vec();

        let mut ciphertext = plaintext.clone();
        apply_keystream(&key, &Decryptor::INITIAL_COUNTER, &mut ciphertext).unwrap();
        assert_ne!(ciphertext, plaintext);

        let decryptor = Decryptor::new(2);
        let decrypted = decryptor.decrypt(&key, ciphertext).await.unwrap();
        assert_eq!(decrypted, plaintext);
    }
}
