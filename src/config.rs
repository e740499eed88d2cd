use std::{path::PathBuf, time::Duration};

use url::Url;

use crate::secrets::ApiKey;

/// Settings shared by every component.
///
/// Constructed once at startup and handed to the components that need it;
/// nothing in the crate reads configuration from global state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    pub app_name: String,
    pub app_version: String,
    pub user_agent: String,

    /// Directory holding final outputs and all transient files.
    pub download_dir: PathBuf,

    pub api_url: Option<Url>,
    pub api_key: Option<ApiKey>,

    /// Stream-copy tool used to rewrap the repaired container.
    pub ffmpeg: PathBuf,
    /// Comment tagging tool. Tagging is skipped when it is not installed.
    pub vorbiscomment: PathBuf,
    /// Helper that turns a cover image into a base64 picture block.
    pub cover_encoder: PathBuf,
    /// Upper bound on any single external tool invocation.
    pub tool_timeout: Duration,

    pub max_cover_size: usize,
    pub decrypt_workers: usize,
    pub batch_concurrency: usize,

    pub cache_capacity: usize,
    pub token_capacity: usize,
    pub store_timeout: Duration,
}

impl Config {
    pub const DEFAULT_DOWNLOAD_DIR: &'static str = "downloads";
    pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_MAX_COVER_SIZE: usize = 10 * 1024 * 1024;
    pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;
    pub const DEFAULT_CACHE_CAPACITY: usize = 2000;
    pub const DEFAULT_TOKEN_CAPACITY: usize = 10_000;
    pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

    #[must_use]
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        let app_name = env!("CARGO_PKG_NAME").to_owned();
        let app_version = env!("CARGO_PKG_VERSION").to_owned();

        let os_name = match std::env::consts::OS {
            "macos" => "osx",
            other => other,
        };
        let os_version = sysinfo::System::os_version().unwrap_or_else(|| String::from("0"));
        let user_agent = format!("{app_name}/{app_version} (Rust; {os_name}/{os_version})");
        trace!("user agent: {user_agent}");

        let decrypt_workers = std::thread::available_parallelism().map_or(1, usize::from);

        Self {
            app_name,
            app_version,
            user_agent,

            download_dir: download_dir.into(),

            api_url: None,
            api_key: None,

            ffmpeg: PathBuf::from("ffmpeg"),
            vorbiscomment: PathBuf::from("vorbiscomment"),
            cover_encoder: PathBuf::from("./cover_gen.sh"),
            tool_timeout: Self::DEFAULT_TOOL_TIMEOUT,

            max_cover_size: Self::DEFAULT_MAX_COVER_SIZE,
            decrypt_workers,
            batch_concurrency: Self::DEFAULT_BATCH_CONCURRENCY,

            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
            token_capacity: Self::DEFAULT_TOKEN_CAPACITY,
            store_timeout: Self::DEFAULT_STORE_TIMEOUT,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(Self::DEFAULT_DOWNLOAD_DIR)
    }
}
