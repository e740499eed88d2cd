//! Client for the upstream metadata API.
//!
//! Resolves user input (platform URLs, search terms, track ids) into track
//! records. Only the response shapes matter to the rest of the crate:
//! [`PlatformTracks`] for lookups and searches, and [`TrackInfo`] for a
//! single track.

use std::{sync::Arc, sync::LazyLock, time::Duration};

use async_trait::async_trait;
use regex_lite::Regex;
use reqwest::{
    header::{HeaderName, HeaderValue, ACCEPT},
    Url,
};

use crate::{
    config::Config,
    error::{Error, Result},
    http,
    protocol::{self, catalog::PlatformTracks},
    secrets::ApiKey,
    track::TrackInfo,
};

/// URL patterns of the platforms the API can resolve.
static URL_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^(https?://)?([a-z0-9-]+\.)*spotify\.com/(track|playlist|album|artist)/[a-zA-Z0-9]+(\?.*)?$",
        r"^(https?://)?([a-z0-9-]+\.)*(youtube\.com/watch\?v=|youtu\.be/)[\w-]+(\?.*)?$",
        r"^(https?://)?([a-z0-9-]+\.)*youtube\.com/(watch\?v=|playlist\?list=)[\w-]+(\?.*)?$",
        r"^(https?://)?([a-z0-9-]+\.)*soundcloud\.com/[\w-]+(/[\w-]+)?(/sets/[\w-]+)?(\?.*)?$",
        r"^(https?://)?([a-z0-9-]+\.)?apple\.com/[a-z]{2}/(album|playlist|song)/[^/]+/(pl\.[a-zA-Z0-9]+|\d+)(\?i=\d+)?(\?.*)?$",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("platform url pattern"))
    .collect()
});

/// Resolves track ids into full track records.
#[async_trait]
pub trait TrackSource: Send + Sync {
    async fn get_track(&self, id: &str) -> Result<TrackInfo>;
}

pub struct Client {
    http: Arc<http::Client>,
    base: Url,
    key: Option<ApiKey>,
}

impl Client {
    const TIMEOUT: Duration = Duration::from_secs(60);
    const DEFAULT_LIMIT: u32 = 10;
    const MAX_QUERY_LENGTH: usize = 500;
    const MAX_URL_LENGTH: usize = 5000;

    const HEADER_API_KEY: HeaderName = HeaderName::from_static("x-api-key");

    /// # Errors
    ///
    /// Fails with `InvalidArgument` when no API URL is configured.
    pub fn new(config: &Config, http: Arc<http::Client>) -> Result<Self> {
        let base = config
            .api_url
            .clone()
            .ok_or_else(|| Error::invalid_argument("no metadata api url configured"))?;

        Ok(Self {
            http,
            base,
            key: config.api_key.clone(),
        })
    }

    /// Whether `url` looks like a link the API can resolve.
    #[must_use]
    pub fn is_valid(url: &str) -> bool {
        if url.is_empty() || url.len() > Self::MAX_URL_LENGTH {
            return false;
        }

        match Url::parse(url) {
            Ok(parsed) if parsed.has_host() => {}
            _ => return false,
        }

        URL_PATTERNS.iter().any(|pattern| pattern.is_match(url))
    }

    /// Looks up every track behind a platform URL (track, album, playlist).
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` for unsupported URLs, and with `Network`
    /// when the API cannot be reached or answers with an error status.
    pub async fn get_info(&self, url: &str) -> Result<PlatformTracks> {
        if !Self::is_valid(url) {
            return Err(Error::invalid_argument("url is not valid"));
        }

        let mut endpoint = self.endpoint(&["get_url"])?;
        endpoint.query_pairs_mut().append_pair("url", url);
        self.get_json(endpoint, "get_url").await
    }

    /// Searches tracks by free text.
    ///
    /// # Errors
    ///
    /// Fails with `Network` when the API cannot be reached or answers with
    /// an error status.
    pub async fn search(&self, query: &str, limit: Option<u32>) -> Result<PlatformTracks> {
        let query = sanitize(query, Self::MAX_QUERY_LENGTH);
        let limit = limit.unwrap_or(Self::DEFAULT_LIMIT);

        let mut endpoint = self.endpoint(&["search_track", &query])?;
        endpoint
            .query_pairs_mut()
            .append_pair("lim", &limit.to_string());
        self.get_json(endpoint, "search_track").await
    }

    /// Fetches the full record of one track.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` for an empty id, and with `Network` when
    /// the API cannot be reached or answers with an error status.
    pub async fn get_track(&self, id: &str) -> Result<TrackInfo> {
        let id = sanitize(id, Self::MAX_QUERY_LENGTH);
        if id.is_empty() {
            return Err(Error::invalid_argument("empty track id"));
        }

        let mut endpoint = self.endpoint(&["get_track"])?;
        endpoint.query_pairs_mut().append_pair("id", &id);
        self.get_json(endpoint, "get_track").await
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        endpoint(&self.base, segments)
    }

    async fn get_json<T>(&self, url: Url, origin: &str) -> Result<T>
    where
        T: for<'de> serde::Deserialize<'de> + std::fmt::Debug,
    {
        let mut request = self.http.get(url.clone());
        *request.timeout_mut() = Some(Self::TIMEOUT);

        let headers = request.headers_mut();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.key {
            let value = HeaderValue::from_str(key.as_str())
                .map_err(|e| Error::invalid_argument(format!("api key is not a valid header: {e}")))?;
            headers.insert(Self::HEADER_API_KEY, value);
        }

        let response = self.http.execute(request).await?;
        http::ensure_success(&response, &url)?;
        let body = response.text().await?;
        protocol::json(&body, origin)
    }
}

#[async_trait]
impl TrackSource for Client {
    async fn get_track(&self, id: &str) -> Result<TrackInfo> {
        Client::get_track(self, id).await
    }
}

/// Appends path segments to the API base URL, escaping each of them.
fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| Error::invalid_argument(format!("{base} cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Truncates user input to `max` characters.
fn sanitize(input: &str, max: usize) -> String {
    input.trim().chars().take(max).collect()
}
