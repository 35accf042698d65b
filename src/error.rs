use std::time::Duration;

/// Failure modes of a single stream-resolution attempt against one backend.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no match on backend: {0}")]
    NotFound(String),

    #[error("edge-blocked response: {0}")]
    Blocked(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error: {0}")]
    ServerError(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl SourceError {
    /// Whether a bounded retry with backoff makes sense for this failure.
    /// NotFound is authoritative and Blocked wants a different proxy or
    /// strategy, not a repeat of the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::RateLimited(_) | SourceError::ServerError(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            SourceError::NotFound(_) => "not_found",
            SourceError::Blocked(_) => "blocked",
            SourceError::RateLimited(_) => "rate_limited",
            SourceError::ServerError(_) => "server_error",
            SourceError::Timeout(_) => "timeout",
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SourceError::Timeout(Duration::from_secs(0))
        } else if e.is_status() {
            let status = e.status().map(|s| s.as_u16()).unwrap_or(0);
            match status {
                429 => SourceError::RateLimited(e.to_string()),
                403 => SourceError::Blocked(e.to_string()),
                404 => SourceError::NotFound(e.to_string()),
                _ => SourceError::ServerError(e.to_string()),
            }
        } else {
            SourceError::ServerError(e.to_string())
        }
    }
}

/// Total resolution failure: every attempted strategy failed. Collects one
/// reason per strategy so callers can see the whole picture instead of only
/// the last error.
#[derive(Debug, thiserror::Error)]
#[error("{}", self.render())]
pub struct ResolveError {
    pub attempts: Vec<(String, SourceError)>,
}

impl ResolveError {
    pub fn new(attempts: Vec<(String, SourceError)>) -> Self {
        Self { attempts }
    }

    fn render(&self) -> String {
        if self.attempts.is_empty() {
            return "no strategies registered".to_string();
        }
        let parts: Vec<String> = self
            .attempts
            .iter()
            .map(|(name, err)| format!("{}: [{}] {}", name, err.kind(), err))
            .collect();
        format!("all strategies failed: {}", parts.join("; "))
    }
}

/// Failures inside the progressive cache. These never reach the playback
/// caller; they degrade to a remote-URL fallback or a preserved partial file.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("file append corrupted, combine fallback failed: {0}")]
    CorruptWrite(String),

    #[error("download cancelled")]
    Cancelled,

    #[error("downloaded content is not audio")]
    NotAudio,
}

impl From<reqwest::Error> for CacheError {
    fn from(e: reqwest::Error) -> Self {
        CacheError::Http(e.to_string())
    }
}

pub type SourceResult<T> = Result<T, SourceError>;
pub type CacheResult<T> = Result<T, CacheError>;
