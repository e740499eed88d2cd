//! Short tokens for URLs that do not fit in callback payloads.
//!
//! A token is a fixed-length prefix of the URL's SHA-256 hex digest. Tokens
//! are one way: decoding is a lookup in the mapping kept by the codec, which
//! is bounded and forgets the least recently used URLs first.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};

use lru::LruCache;
use sha2::{Digest, Sha256};

/// Short opaque handle for a URL.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(String);

impl Token {
    /// Number of hex characters in a token.
    pub const LENGTH: usize = 10;

    /// Derives the token of `url`.
    #[must_use]
    pub fn of(url: &str) -> Self {
        let digest = hex::encode(Sha256::digest(url.as_bytes()));
        Self(digest[..Self::LENGTH].to_owned())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Token {
    fn from(token: &str) -> Self {
        Self(token.to_owned())
    }
}

pub struct TokenCodec {
    urls: Mutex<LruCache<Token, String>>,
}

impl TokenCodec {
    /// Creates a codec that remembers up to `capacity` URLs.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            urls: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Returns the token of `url` and remembers the mapping.
    ///
    /// A colliding token silently replaces the URL it mapped to before.
    pub fn encode(&self, url: &str) -> Token {
        let token = Token::of(url);
        if let Some(previous) = self.lock().put(token.clone(), url.to_owned()) {
            if previous != url {
                debug!("token {token} now maps to a different url");
            }
        }
        token
    }

    /// Looks up the URL behind `token`, if it is still remembered.
    pub fn decode(&self, token: &str) -> Option<String> {
        self.lock().get(&Token::from(token)).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<Token, String>> {
        self.urls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let codec = TokenCodec::new(16);
        let url = "https://cdn.example.com/audio/4uLU6hMCjMI75M1A2tKUQC?token=abcdef&exp=1700000000";

        let token = codec.encode(url);
        assert_eq!(token.as_str().len(), Token::LENGTH);
        assert!(token.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(codec.decode(token.as_str()).as_deref(), Some(url));
    }

    #[test]
    fn is_deterministic() {
        let codec = TokenCodec::new(16);
        let first = codec.encode("https://example.com/a");
        let second = codec.encode("https://example.com/a");
        assert_eq!(first, second);
        assert_eq!(codec.len(), 1);
        assert_ne!(first, codec.encode("https://example.com/b"));
    }

    #[test]
    fn is_a_sha256_prefix() {
        // sha256("abc") = ba7816bf8f01cfea414140de5dae2223...
        assert_eq!(Token::of("abc").as_str(), "ba7816bf8f");
    }

    #[test]
    fn unknown_tokens_decode_to_nothing() {
        let codec = TokenCodec::new(16);
        assert_eq!(codec.decode("0123456789"), None);
    }

    #[test]
    fn forgets_least_recently_used() {
        let codec = TokenCodec::new(2);
        let a = codec.encode("https://example.com/a");
        let b = codec.encode("https://example.com/b");

        // touching a makes b the oldest
        assert!(codec.decode(a.as_str()).is_some());
        codec.encode("https://example.com/c");

        assert_eq!(codec.len(), 2);
        assert!(codec.decode(a.as_str()).is_some());
        assert_eq!(codec.decode(b.as_str()), None);
    }
}
