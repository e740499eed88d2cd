//! HTTP client with rate limiting for the metadata API and plain streaming
//! downloads for CDN content.
//!
//! This module provides a wrapper around `reqwest::Client` that adds:
//! * Request rate limiting for metadata API calls
//! * Streaming downloads straight to disk
//! * Size-capped in-memory fetches (cover art)
//!
//! The [`Transport`] trait is the seam the acquisition pipeline downloads
//! through, so that tests can count and fake network work.

use std::{future::Future, num::NonZeroU32, path::Path, time::Duration};

use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt, TryFutureExt};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{self, Method, Url};
use tokio::io::AsyncWriteExt;

use crate::{
    config::Config,
    error::{Error, Result},
};

/// Network operations used by the acquisition pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Streams the body at `url` into a new file at `dest`.
    ///
    /// Returns the number of bytes written. On error `dest` may be left
    /// partially written; callers own its cleanup.
    async fn download(&self, url: &Url, dest: &Path) -> Result<u64>;

    /// Fetches the body at `url` into memory.
    ///
    /// # Errors
    ///
    /// Fails with `InvalidArgument` when the body is larger than `limit`.
    async fn fetch(&self, url: &Url, limit: usize) -> Result<Vec<u8>>;
}

/// HTTP client with built-in rate limiting.
pub struct Client {
    /// Unlimited request client, used for CDN traffic.
    pub unlimited: reqwest::Client,

    /// Rate limiter for metadata API calls.
    rate_limiter: DefaultDirectRateLimiter,
}

impl Client {
    /// Rolling window for the metadata API quota.
    const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

    /// Maximum allowed API calls per interval.
    const RATE_LIMIT_CALLS_PER_INTERVAL: u8 = 50;

    /// Duration to keep idle connections alive.
    const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(60);

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Duration to wait for individual network reads. CDN nodes can stall
    /// for a while before the first byte of a large file.
    const READ_TIMEOUT: Duration = Duration::from_secs(30);

    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    ///
    /// # Panics
    ///
    /// Panics if rate limit parameters are zero.
    pub fn new(config: &Config) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .tcp_keepalive(Self::KEEPALIVE_TIMEOUT)
            .connect_timeout(Self::CONNECT_TIMEOUT)
            .read_timeout(Self::READ_TIMEOUT)
            .user_agent(&config.user_agent);

        let replenish_interval =
            Self::RATE_LIMIT_INTERVAL / u32::from(Self::RATE_LIMIT_CALLS_PER_INTERVAL);
        let quota = Quota::with_period(replenish_interval)
            .expect("quota time interval is zero")
            .allow_burst(
                NonZeroU32::new(Self::RATE_LIMIT_CALLS_PER_INTERVAL.into())
                    .expect("calls per interval is zero"),
            );

        Ok(Self {
            unlimited: http_client.build()?,
            rate_limiter: governor::RateLimiter::direct(quota),
        })
    }

    /// Builds a GET request that can be executed with `execute()`.
    pub fn get<U>(&self, url: U) -> reqwest::Request
    where
        U: Into<Url>,
    {
        reqwest::Request::new(Method::GET, url.into())
    }

    /// Executes a request with rate limiting.
    ///
    /// # Errors
    ///
    /// Returns error if the request cannot be sent.
    pub fn execute(
        &self,
        request: reqwest::Request,
    ) -> impl Future<Output = Result<reqwest::Response>> + '_ {
        let throttle = self.rate_limiter.until_ready();
        throttle.then(|()| self.unlimited.execute(request).map_err(Into::into))
    }

    /// Sends a GET without rate limiting and checks the status code.
    async fn get_ok(&self, url: &Url) -> Result<reqwest::Response> {
        let response = self.unlimited.get(url.clone()).send().await?;
        ensure_success(&response, url)?;
        Ok(response)
    }
}

/// Turns a non-2xx status into a `Network` error.
///
/// # Errors
///
/// Fails when the response status is not a success.
pub fn ensure_success(response: &reqwest::Response, url: &Url) -> Result<()> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(Error::network(format!("HTTP {status} for {}", redact_query(url))))
    }
}

/// CDN URLs carry signed tokens in their query; keep those out of messages.
fn redact_query(url: &Url) -> String {
    let mut url = url.clone();
    if url.query().is_some() {
        url.set_query(Some("redacted"));
    }
    url.to_string()
}

#[async_trait]
impl Transport for Client {
    async fn download(&self, url: &Url, dest: &Path) -> Result<u64> {
        let response = self.get_ok(url).await?;
        if let Some(len) = response.content_length() {
            debug!("downloading {len} bytes from {}", url.host_str().unwrap_or("?"));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        trace!("wrote {written} bytes to {}", dest.display());
        Ok(written)
    }

    async fn fetch(&self, url: &Url, limit: usize) -> Result<Vec<u8>> {
        let response = self.get_ok(url).await?;
        let too_large =
            |len: u64| Error::invalid_argument(format!("body of {len} bytes exceeds {limit} bytes"));

        if let Some(len) = response.content_length() {
            if len > limit as u64 {
                return Err(too_large(len));
            }
        }

        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > limit {
                return Err(too_large((body.len() + chunk.len()) as u64));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_signed_query() {
        let url: Url = "https://cdn.example.com/audio/abc?token=secret&exp=1"
            .parse()
            .unwrap();
        let shown = redact_query(&url);
        assert!(!shown.contains("secret"));
        assert!(shown.starts_with("https://cdn.example.com/audio/abc"));
    }

    #[test]
    fn leaves_plain_urls_alone() {
        let url: Url = "https://cdn.example.com/audio/abc".parse().unwrap();
        assert_eq!(redact_query(&url), "https://cdn.example.com/audio/abc");
    }
}
