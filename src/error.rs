//! Error handling for songbot.
//!
//! Provides a single error type that pairs a category ([`ErrorKind`]) with the
//! underlying cause, and maps the errors of the crates we depend on onto
//! those categories.
//!
//! # Error Categories
//!
//! * Input problems: missing source URL, missing or malformed key
//! * Transport problems: HTTP status, connection failures, timeouts
//! * External tools that failed, timed out or could not be started
//! * A catch-all for any other processing fault
//!
//! # Example
//!
//! ```rust
//! use songbot::error::{Error, ErrorKind, Result};
//!
//! fn check(url: Option<&str>) -> Result<&str> {
//!     url.ok_or_else(|| Error::missing_source("track has no delivery url"))
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }

    /// Collapses every kind the acquisition pipeline does not report on its
    /// own into [`ErrorKind::ProcessingFailed`], keeping the original cause.
    #[must_use]
    pub fn into_processing_failed(self) -> Self {
        use ErrorKind::*;
        match self.kind {
            MissingSource | MissingKey | InvalidKey | Network | ExternalTool | Cancelled
            | ProcessingFailed => self,
            _ => Self {
                kind: ProcessingFailed,
                error: format!("{}: {}", self.kind, self.error).into(),
            },
        }
    }
}

/// Standard result type for songbot operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// The track carries no content delivery URL.
    #[error("missing source")]
    MissingSource,

    /// The track is on an encrypted platform but carries no key.
    #[error("missing decryption key")]
    MissingKey,

    /// The key is not valid hex or has an unsupported length.
    #[error("invalid decryption key")]
    InvalidKey,

    /// Non-2xx status, connection failure or timeout.
    #[error("network error")]
    Network,

    /// A required external tool failed, timed out or is not installed.
    #[error("external tool failed")]
    ExternalTool,

    /// Anything else that went wrong while processing.
    #[error("processing failed")]
    ProcessingFailed,

    /// The caller cancelled the operation.
    #[error("operation was cancelled")]
    Cancelled,

    /// Input that is malformed regardless of state.
    #[error("invalid argument specified")]
    InvalidArgument,

    /// A backing service or store could not be reached.
    #[error("service unavailable")]
    Unavailable,

    #[error("not found")]
    NotFound,
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    pub fn missing_source<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::MissingSource, error)
    }

    pub fn missing_key<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::MissingKey, error)
    }

    pub fn invalid_key<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidKey, error)
    }

    pub fn network<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Network, error)
    }

    pub fn external_tool<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::ExternalTool, error)
    }

    pub fn processing_failed<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::ProcessingFailed, error)
    }

    pub fn cancelled<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Cancelled, error)
    }

    pub fn invalid_argument<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::InvalidArgument, error)
    }

    pub fn unavailable<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::Unavailable, error)
    }

    pub fn not_found<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::new(ErrorKind::NotFound, error)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            ConnectionRefused | ConnectionReset | ConnectionAborted | NotConnected
            | AddrNotAvailable | BrokenPipe | TimedOut => Self::network(err),
            Interrupted => Self::cancelled(err),
            InvalidInput => Self::invalid_argument(err),
            _ => Self::processing_failed(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            return Self::processing_failed(err);
        }

        Self::network(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::processing_failed(err)
    }
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Self::invalid_key(e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::network(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            return Self::cancelled(e.to_string());
        }
        Self::processing_failed(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Self::unavailable(e)
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Self::processing_failed(e)
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Self::invalid_argument(e)
    }
}

impl From<tempfile::PathPersistError> for Error {
    fn from(e: tempfile::PathPersistError) -> Self {
        e.error.into()
    }
}
