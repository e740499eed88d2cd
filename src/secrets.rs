//! Loading of the metadata API key.
//!
//! The key can come from the environment or from a small TOML file:
//!
//! ```toml
//! api_key = "..."
//! ```

use std::{fs, path::Path, str::FromStr};

use serde::Deserialize;
use veil::Redact;

use crate::error::{Error, Result};

/// API key for the upstream metadata service.
///
/// Redacted when debug-printed so that it does not end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Redact)]
#[redact(all)]
pub struct ApiKey(String);

impl ApiKey {
    /// Secrets files larger than this are rejected before being read.
    pub const MAX_FILE_SIZE: u64 = 1024;

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads the key from a TOML secrets file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is larger than
    /// [`Self::MAX_FILE_SIZE`], is not valid TOML or has no `api_key`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        #[derive(Deserialize)]
        struct Secrets {
            api_key: Option<ApiKey>,
        }

        let path = path.as_ref();

        // Prevent out-of-memory condition: the secrets file should be small.
        let file_size = fs::metadata(path)?.len();
        if file_size > Self::MAX_FILE_SIZE {
            return Err(Error::invalid_argument(format!(
                "{} is too large ({file_size} bytes)",
                path.display()
            )));
        }

        let contents = fs::read_to_string(path)?;
        let secrets: Secrets = toml::from_str(&contents)?;

        secrets
            .api_key
            .ok_or_else(|| Error::invalid_argument(format!("{} has no api_key", path.display())))?
            .validated()
    }

    fn validated(self) -> Result<Self> {
        if self.0.trim().is_empty() {
            return Err(Error::invalid_argument("api key is empty"));
        }
        Ok(self)
    }
}

impl FromStr for ApiKey {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self(s.trim().to_owned()).validated()
    }
}
