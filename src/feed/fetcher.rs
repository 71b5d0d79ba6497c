use super::query::QueryDescriptor;
use super::types::Page;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Default bound on a single page fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Whether a failure is worth retrying on the next scheduled refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network trouble, timeouts, overloaded server. Retried by the scheduler.
    Transient,
    /// Bad query, auth failure, malformed response. Surfaced, never retried.
    Permanent,
}

/// Errors that can occur while fetching one page.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The fetch did not finish within the configured bound
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
    /// HTTP response with a non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Response body was not a valid page
    #[error("Parse error: {0}")]
    Parse(String),
    /// Response body exceeded the size limit
    #[error("Response too large")]
    ResponseTooLarge,
    /// Local data file could not be read
    #[error("Failed to read posts: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::Network(e) if e.is_builder() => ErrorClass::Permanent,
            FetchError::Network(_) | FetchError::Timeout(_) => ErrorClass::Transient,
            FetchError::HttpStatus(status) => match status {
                408 | 429 => ErrorClass::Transient,
                s if *s >= 500 => ErrorClass::Transient,
                _ => ErrorClass::Permanent,
            },
            FetchError::Io(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                ErrorClass::Permanent
            }
            FetchError::Io(_) => ErrorClass::Transient,
            FetchError::Parse(_) | FetchError::ResponseTooLarge => ErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Backend query collaborator.
///
/// Implementations perform exactly one round trip per call and never retry;
/// retry policy belongs to the refresh scheduler. Calls may overlap, since an
/// abandoned fetch can still be running alongside the live one.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn fetch(&self, descriptor: &QueryDescriptor) -> Result<Page, FetchError>;
}

/// Fetches one page, converting an overrun of `timeout` into
/// [`FetchError::Timeout`]. A timed-out fetch yields no partial page.
pub async fn fetch_page(
    backend: &dyn Backend,
    descriptor: &QueryDescriptor,
    timeout: Duration,
) -> Result<Page, FetchError> {
    match tokio::time::timeout(timeout, backend.fetch(descriptor)).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(
                offset = descriptor.offset,
                limit = descriptor.limit,
                timeout_ms = timeout.as_millis() as u64,
                "Page fetch timed out"
            );
            Err(FetchError::Timeout(timeout))
        }
    }
}
