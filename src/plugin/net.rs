//! Network plumbing shared by the registry client and the installer
//!
//! Locations may be `http(s)://` URLs, `file://` URLs or plain filesystem
//! paths. Every wait races against the caller's cancellation token.

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::error::PluginError;
use crate::config::Settings;

/// Outcome of a single fetch attempt that did not succeed
#[derive(Debug)]
pub(crate) enum FetchError {
    /// Worth retrying: connection problems, timeouts, 5xx responses
    Transient(String),
    /// Retrying will not help: 4xx responses, missing files
    Permanent(String),
    Cancelled,
}

impl FetchError {
    pub(crate) fn reason(&self) -> String {
        match self {
            FetchError::Transient(reason) | FetchError::Permanent(reason) => reason.clone(),
            FetchError::Cancelled => "cancelled".to_string(),
        }
    }
}

#[derive(Debug)]
pub(crate) enum Fetched {
    Body { bytes: Vec<u8>, etag: Option<String> },
    NotModified,
}

enum Location {
    Http(Url),
    File(PathBuf),
}

impl Location {
    fn parse(location: &str) -> Self {
        match Url::parse(location) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Location::Http(url),
            Ok(url) if url.scheme() == "file" => match url.to_file_path() {
                Ok(path) => Location::File(path),
                Err(()) => Location::File(PathBuf::from(url.path())),
            },
            _ => Location::File(PathBuf::from(location)),
        }
    }
}

pub(crate) fn http_client(settings: &Settings) -> super::error::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .user_agent(concat!("release-pilot/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|err| PluginError::RegistryUnavailable {
            reason: format!("failed to build HTTP client: {err}"),
        })
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}

/// Fetch a location once, sending `etag` as `If-None-Match` for HTTP
pub(crate) async fn fetch(
    client: &reqwest::Client,
    location: &str,
    etag: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Fetched, FetchError> {
    match Location::parse(location) {
        Location::Http(url) => fetch_http(client, url, etag, cancel).await,
        Location::File(path) => {
            let read = cancellable(cancel, tokio::fs::read(&path))
                .await
                .ok_or(FetchError::Cancelled)?;
            read.map(|bytes| Fetched::Body { bytes, etag: None })
                .map_err(|err| FetchError::Permanent(format!("{}: {err}", path.display())))
        }
    }
}

async fn fetch_http(
    client: &reqwest::Client,
    url: Url,
    etag: Option<&str>,
    cancel: &CancellationToken,
) -> Result<Fetched, FetchError> {
    let mut request = client.get(url.clone());
    if let Some(etag) = etag {
        request = request.header(IF_NONE_MATCH, etag);
    }

    let response = cancellable(cancel, request.send())
        .await
        .ok_or(FetchError::Cancelled)?
        .map_err(|err| classify_reqwest(&url, err))?;

    let status = response.status();
    if status == StatusCode::NOT_MODIFIED {
        return Ok(Fetched::NotModified);
    }
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(FetchError::Transient(format!("{url}: HTTP {status}")));
    }
    if !status.is_success() {
        return Err(FetchError::Permanent(format!("{url}: HTTP {status}")));
    }

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let bytes = cancellable(cancel, response.bytes())
        .await
        .ok_or(FetchError::Cancelled)?
        .map_err(|err| classify_reqwest(&url, err))?;

    Ok(Fetched::Body {
        bytes: bytes.to_vec(),
        etag,
    })
}

fn classify_reqwest(url: &Url, err: reqwest::Error) -> FetchError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        FetchError::Transient(format!("{url}: {err}"))
    } else {
        FetchError::Permanent(format!("{url}: {err}"))
    }
}

/// Retry `op` on transient failures with exponential backoff
///
/// Permanent failures and cancellation return immediately. After the last
/// attempt the final transient error is returned.
pub(crate) async fn with_retries<T, F, Fut>(
    attempts: u32,
    backoff: Duration,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(FetchError::Transient(reason)) if attempt < attempts => {
                let delay = backoff_delay(backoff, attempt);
                tracing::warn!(
                    "{what} failed (attempt {attempt}/{attempts}): {reason}; retrying in {}ms",
                    delay.as_millis()
                );
                cancellable(cancel, tokio::time::sleep(delay))
                    .await
                    .ok_or(FetchError::Cancelled)?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1 << (attempt - 1).min(6))
}
