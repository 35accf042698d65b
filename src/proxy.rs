use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, warn};
use reqwest::StatusCode;

use crate::error::{SourceError, SourceResult};

pub const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/118.0.0.0 Safari/537.36";

/// Round-robin over a fixed list of CORS-relay prefixes. The index is the
/// only state; the prefix list itself never changes after construction.
pub struct ProxyRotator {
    prefixes: Vec<String>,
    next: AtomicUsize,
}

impl ProxyRotator {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self {
            prefixes,
            next: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.prefixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    /// Next prefix in rotation, or None when no relays are configured.
    pub fn next_prefix(&self) -> Option<&str> {
        if self.prefixes.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.prefixes.len();
        Some(self.prefixes[idx].as_str())
    }

    /// Wrap a target URL with the next relay prefix.
    pub fn wrap(&self, url: &str) -> Option<String> {
        self.next_prefix()
            .map(|prefix| format!("{}{}", prefix, urlencoding::encode(url)))
    }
}

/// Classification of an HTTP response before its body is trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Ok,
    RateLimited,
    ServerError,
    Blocked,
}

/// Inspects status, content-type, and a body prefix to tell a real result
/// apart from an edge/CDN interstitial. A blocking page arrives as HTTP 200
/// with an HTML challenge body, so a 200 alone proves nothing.
pub struct BlockingDetector;

// Markers seen on challenge/interstitial pages across CDNs.
const BLOCK_MARKERS: &[&str] = &[
    "just a moment",
    "attention required",
    "challenge-platform",
    "cf-browser-verification",
    "access denied",
    "has been blocked",
    "forbidden",
];

impl BlockingDetector {
    pub fn classify(status: StatusCode, content_type: &str, body_prefix: &[u8]) -> ResponseClass {
        if status == StatusCode::TOO_MANY_REQUESTS {
            return ResponseClass::RateLimited;
        }
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNAVAILABLE_FOR_LEGAL_REASONS {
            return ResponseClass::Blocked;
        }
        if status.is_server_error() {
            return ResponseClass::ServerError;
        }

        // A 200 serving HTML where we asked for data, or carrying known
        // challenge markers, is an edge block rather than an empty result.
        let body = String::from_utf8_lossy(&body_prefix[..body_prefix.len().min(2048)]);
        let lower = body.to_lowercase();
        let looks_html = content_type.contains("text/html")
            || lower.contains("<html")
            || lower.contains("<!doctype");
        if looks_html {
            for marker in BLOCK_MARKERS {
                if lower.contains(marker) {
                    return ResponseClass::Blocked;
                }
            }
        }
        ResponseClass::Ok
    }
}

/// GET a JSON document, consulting the blocking detector before parsing and
/// rotating through CORS relays when the direct request is edge-blocked.
/// Every resolution strategy goes through here so a blocking page is never
/// mistaken for "no data".
pub async fn fetch_json(
    client: &reqwest::Client,
    rotator: &ProxyRotator,
    url: &str,
    timeout: Duration,
) -> SourceResult<serde_json::Value> {
    let body = fetch_bytes(client, rotator, url, timeout, "application/json").await?;
    serde_json::from_slice(&body)
        .map_err(|e| SourceError::ServerError(format!("bad JSON from {}: {}", url, e)))
}

/// GET a text document (embed pages) with the same blocking-aware relay
/// rotation as `fetch_json`.
pub async fn fetch_text(
    client: &reqwest::Client,
    rotator: &ProxyRotator,
    url: &str,
    timeout: Duration,
) -> SourceResult<String> {
    let body = fetch_bytes(client, rotator, url, timeout, "text/html").await?;
    Ok(String::from_utf8_lossy(&body).into_owned())
}

async fn fetch_bytes(
    client: &reqwest::Client,
    rotator: &ProxyRotator,
    url: &str,
    timeout: Duration,
    accept: &str,
) -> SourceResult<Vec<u8>> {
    // Direct first, then one pass through the relay rotation on Blocked.
    let attempts = 1 + rotator.len();
    let mut last_err = SourceError::ServerError(format!("no fetch attempted for {}", url));

    for attempt in 0..attempts {
        let target = if attempt == 0 {
            url.to_string()
        } else {
            match rotator.wrap(url) {
                Some(wrapped) => wrapped,
                None => break,
            }
        };

        match fetch_once(client, &target, timeout, accept).await {
            Ok(body) => return Ok(body),
            Err(SourceError::Blocked(reason)) => {
                debug!("[proxy] blocked on attempt {} for {}: {}", attempt, url, reason);
                last_err = SourceError::Blocked(reason);
                // rotate to the next relay
            }
            Err(SourceError::NotFound(reason)) => {
                // Authoritative: the backend has no match. Relays won't help.
                return Err(SourceError::NotFound(reason));
            }
            Err(e) => {
                last_err = e;
                // Transient instance trouble; the caller decides whether to
                // try the next mirror. One relay hop is still worth a shot.
                if attempt >= 1 {
                    break;
                }
            }
        }
    }

    warn!("[proxy] exhausted fetch attempts for {}", url);
    Err(last_err)
}

async fn fetch_once(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    accept: &str,
) -> SourceResult<Vec<u8>> {
    let resp = client
        .get(url)
        .header(reqwest::header::ACCEPT, accept)
        .header(reqwest::header::USER_AGENT, USER_AGENT)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                SourceError::Timeout(timeout)
            } else {
                SourceError::ServerError(e.to_string())
            }
        })?;

    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(SourceError::NotFound(format!("{} -> 404", url)));
    }

    let content_type = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = resp
        .bytes()
        .await
        .map_err(|e| SourceError::ServerError(format!("read body: {}", e)))?;

    match BlockingDetector::classify(status, &content_type, &body) {
        ResponseClass::Ok => {
            if !status.is_success() {
                return Err(SourceError::ServerError(format!("{} -> {}", url, status)));
            }
            Ok(body.to_vec())
        }
        ResponseClass::RateLimited => {
            Err(SourceError::RateLimited(format!("{} -> 429", url)))
        }
        ResponseClass::ServerError => {
            Err(SourceError::ServerError(format!("{} -> {}", url, status)))
        }
        ResponseClass::Blocked => Err(SourceError::Blocked(format!(
            "{} served a blocking page (status {})",
            url, status
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotator_round_robins() {
        let rotator = ProxyRotator::new(vec!["a/".into(), "b/".into()]);
        assert_eq!(rotator.next_prefix(), Some("a/"));
        assert_eq!(rotator.next_prefix(), Some("b/"));
        assert_eq!(rotator.next_prefix(), Some("a/"));
    }

    #[test]
    fn empty_rotator_yields_nothing() {
        let rotator = ProxyRotator::new(vec![]);
        assert_eq!(rotator.next_prefix(), None);
        assert!(rotator.wrap("https://x.example").is_none());
    }

    #[test]
    fn classify_challenge_page_as_blocked() {
        let body = b"<!DOCTYPE html><html><title>Just a moment...</title></html>";
        let class = BlockingDetector::classify(StatusCode::OK, "text/html", body);
        assert_eq!(class, ResponseClass::Blocked);
    }

    #[test]
    fn classify_plain_json_as_ok() {
        let body = br#"{"audioStreams":[]}"#;
        let class = BlockingDetector::classify(StatusCode::OK, "application/json", body);
        assert_eq!(class, ResponseClass::Ok);
    }

    #[test]
    fn classify_status_codes() {
        assert_eq!(
            BlockingDetector::classify(StatusCode::TOO_MANY_REQUESTS, "", b""),
            ResponseClass::RateLimited
        );
        assert_eq!(
            BlockingDetector::classify(StatusCode::FORBIDDEN, "", b""),
            ResponseClass::Blocked
        );
        assert_eq!(
            BlockingDetector::classify(StatusCode::BAD_GATEWAY, "", b""),
            ResponseClass::ServerError
        );
    }

    #[test]
    fn html_without_markers_is_not_blocked() {
        let body = b"<html><body>plain page</body></html>";
        let class = BlockingDetector::classify(StatusCode::OK, "text/html", body);
        assert_eq!(class, ResponseClass::Ok);
    }
}
