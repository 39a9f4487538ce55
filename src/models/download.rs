use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, time::sleep};
use tracing::{debug, info, warn};

const USER_AGENT: &str = "pocket-llm/0.1";

/// Transfer failure with the retry decision attached where the error is
/// created, never inferred from message text downstream.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("server answered {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("unexpected content type {content_type:?} for {url}, expected a binary payload")]
    ContentType { content_type: String, url: String },
    #[error("download of {url} produced an empty file")]
    EmptyBody { url: String },
    #[error("writing {path:?} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("download canceled")]
    Canceled,
}

impl DownloadError {
    /// Whether re-attempting the same transfer could plausibly succeed.
    /// Explicit client errors, wrong payloads and local disk failures will
    /// fail again deterministically; everything transport-shaped may not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            DownloadError::Transport { .. } => true,
            DownloadError::Status { status, .. } => !status.is_client_error(),
            DownloadError::ContentType { .. }
            | DownloadError::EmptyBody { .. }
            | DownloadError::Io { .. }
            | DownloadError::Canceled => false,
        }
    }
}

/// Bounded retry with exponential backoff for transient transfer faults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `attempt` (1-based): the base
    /// delay doubled per attempt, capped at the maximum.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let millis = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }
}

/// One transfer to perform: remote source, local destination, and the
/// metadata needed to shape progress and authentication.
pub struct FetchRequest<'a> {
    pub url: &'a str,
    pub dest: &'a Path,
    pub expected_size: Option<u64>,
    pub auth_token: Option<&'a str>,
}

/// Streams a remote artifact to disk. Implementations report
/// `(percent, bytes_so_far)` as data lands, honor the cancellation probe at
/// every chunk boundary, and leave no partial file behind on failure.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &FetchRequest<'_>,
        on_progress: &(dyn Fn(f32, u64) + Send + Sync),
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<u64, DownloadError>;
}

/// HTTP(S) fetcher over a shared reqwest client.
pub struct HttpDownloader {
    client: Client,
}

impl HttpDownloader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    async fn transfer(
        &self,
        request: &FetchRequest<'_>,
        on_progress: &(dyn Fn(f32, u64) + Send + Sync),
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<u64, DownloadError> {
        let url = request.url;

        // never resume or append to a previous attempt
        if let Err(error) = fs::remove_file(request.dest).await {
            if error.kind() != std::io::ErrorKind::NotFound {
                return Err(DownloadError::Io {
                    path: request.dest.to_path_buf(),
                    source: error,
                });
            }
        }

        let mut builder = self.client.get(url).header(header::USER_AGENT, USER_AGENT);
        if let Some(token) = request.auth_token {
            builder = builder.bearer_auth(token);
        }
        let mut response = builder
            .send()
            .await
            .map_err(|source| DownloadError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::Status {
                status,
                url: url.to_string(),
            });
        }

        // a login or error page served with 200 would otherwise land on
        // disk as a corrupt model
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();
        if content_type.contains("text/html") || content_type.contains("application/json") {
            return Err(DownloadError::ContentType {
                content_type,
                url: url.to_string(),
            });
        }

        if let Some(parent) = request.dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| DownloadError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let mut file = fs::File::create(request.dest)
            .await
            .map_err(|source| DownloadError::Io {
                path: request.dest.to_path_buf(),
                source,
            })?;

        let mut downloaded: u64 = 0;
        loop {
            if cancelled() {
                return Err(DownloadError::Canceled);
            }
            let chunk = response
                .chunk()
                .await
                .map_err(|source| DownloadError::Transport {
                    url: url.to_string(),
                    source,
                })?;
            let Some(chunk) = chunk else { break };
            file.write_all(&chunk)
                .await
                .map_err(|source| DownloadError::Io {
                    path: request.dest.to_path_buf(),
                    source,
                })?;
            downloaded += chunk.len() as u64;
            on_progress(percent_of(downloaded, request.expected_size), downloaded);
        }
        file.flush().await.map_err(|source| DownloadError::Io {
            path: request.dest.to_path_buf(),
            source,
        })?;
        drop(file);

        if downloaded == 0 {
            return Err(DownloadError::EmptyBody {
                url: url.to_string(),
            });
        }

        debug!("downloaded {downloaded} bytes from {url}");
        Ok(downloaded)
    }
}

impl Default for HttpDownloader {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelFetcher for HttpDownloader {
    async fn fetch(
        &self,
        request: &FetchRequest<'_>,
        on_progress: &(dyn Fn(f32, u64) + Send + Sync),
        cancelled: &(dyn Fn() -> bool + Send + Sync),
    ) -> Result<u64, DownloadError> {
        match self.transfer(request, on_progress, cancelled).await {
            Ok(bytes) => Ok(bytes),
            Err(error) => {
                remove_partial(request.dest).await;
                Err(error)
            }
        }
    }
}

/// Runs the fetch up to `policy.max_attempts` times. Retryable failures
/// back off exponentially between attempts; a non-retryable failure or a
/// cancellation aborts immediately. Exhausting every attempt surfaces the
/// last error.
pub async fn fetch_with_retry(
    fetcher: &dyn ModelFetcher,
    request: &FetchRequest<'_>,
    policy: &RetryPolicy,
    on_progress: &(dyn Fn(f32, u64) + Send + Sync),
    cancelled: &(dyn Fn() -> bool + Send + Sync),
) -> Result<u64, DownloadError> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if cancelled() {
            return Err(DownloadError::Canceled);
        }
        match fetcher.fetch(request, on_progress, cancelled).await {
            Ok(bytes) => {
                if attempt > 1 {
                    info!("download of {} succeeded on attempt {attempt}", request.url);
                }
                return Ok(bytes);
            }
            Err(error) if !error.is_retryable() => return Err(error),
            Err(error) => {
                warn!(
                    "download attempt {attempt}/{attempts} for {} failed: {error}",
                    request.url
                );
                if attempt < attempts {
                    let delay = policy.delay_for(attempt);
                    debug!("retrying in {delay:?}");
                    sleep(delay).await;
                }
                last_error = Some(error);
            }
        }
    }

    Err(last_error.unwrap_or(DownloadError::Canceled))
}

fn percent_of(bytes: u64, expected: Option<u64>) -> f32 {
    match expected {
        Some(total) if total > 0 => {
            ((bytes as f64 / total as f64) * 100.0).clamp(0.0, 100.0) as f32
        }
        _ => 0.0,
    }
}

async fn remove_partial(dest: &Path) {
    match fs::remove_file(dest).await {
        Ok(()) => debug!("removed partial download {:?}", dest),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!("failed to remove partial download {:?}: {error}", dest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(40), Duration::from_secs(10));
    }

    #[test]
    fn retryability_follows_the_failure_class() {
        let server_error = DownloadError::Status {
            status: StatusCode::BAD_GATEWAY,
            url: "u".into(),
        };
        assert!(server_error.is_retryable());

        let not_found = DownloadError::Status {
            status: StatusCode::NOT_FOUND,
            url: "u".into(),
        };
        assert!(!not_found.is_retryable());

        let forbidden = DownloadError::Status {
            status: StatusCode::FORBIDDEN,
            url: "u".into(),
        };
        assert!(!forbidden.is_retryable());

        let login_page = DownloadError::ContentType {
            content_type: "text/html".into(),
            url: "u".into(),
        };
        assert!(!login_page.is_retryable());

        let empty = DownloadError::EmptyBody { url: "u".into() };
        assert!(!empty.is_retryable());

        assert!(!DownloadError::Canceled.is_retryable());
    }

    #[test]
    fn indeterminate_progress_without_expected_size() {
        assert_eq!(percent_of(512, None), 0.0);
        assert_eq!(percent_of(512, Some(0)), 0.0);
        assert_eq!(percent_of(50, Some(200)), 25.0);
        assert_eq!(percent_of(400, Some(200)), 100.0);
    }
}
