use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{info, warn};
use once_cell::sync::Lazy;

// Community relay instances rotate in and out of service constantly; these
// defaults are a starting set and can be replaced at runtime via
// `refresh_relay_instances`.
static DEFAULT_PIPED_INSTANCES: Lazy<Vec<String>> = Lazy::new(|| {
    vec![
        "https://pipedapi.kavin.rocks".to_string(),
        "https://api.piped.yt".to_string(),
        "https://pipedapi.leptons.xyz".to_string(),
    ]
});

static DEFAULT_INVIDIOUS_INSTANCES: Lazy<Vec<String>> = Lazy::new(|| {
    vec![
        "https://inv.nadeko.net".to_string(),
        "https://yewtu.be".to_string(),
        "https://invidious.nerdvpn.de".to_string(),
    ]
});

static DEFAULT_PROXY_PREFIXES: Lazy<Vec<String>> = Lazy::new(|| {
    vec![
        "https://corsproxy.io/?".to_string(),
        "https://api.allorigins.win/raw?url=".to_string(),
        "https://proxy.cors.sh/".to_string(),
    ]
});

/// Total-size estimation bands. Upstream content-length is frequently absent
/// or wrong, so totals are projected from bytes-downloaded-so-far with a
/// shrinking buffer multiplier. The constants are tuned against observed
/// audio file sizes and are deliberately adjustable.
#[derive(Debug, Clone)]
pub struct SizeBands {
    /// <1 MB downloaded
    pub tiny_multiplier: f64,
    /// minimum estimate while in the tiny band
    pub tiny_floor: u64,
    /// 1-3 MB downloaded
    pub small_multiplier: f64,
    /// 3-5 MB downloaded
    pub medium_multiplier: f64,
    /// 5-10 MB downloaded
    pub large_multiplier: f64,
    /// >=10 MB downloaded
    pub huge_multiplier: f64,
    /// estimate cap in the huge band (lifted when actual bytes exceed it)
    pub huge_cap: u64,
    /// downloaded/estimate ratio beyond which the estimate is boosted
    pub boost_threshold: f64,
    pub boost_multiplier: f64,
    /// estimates never report above this; 100 is reserved for confirmed
    /// completion
    pub max_estimated_percent: f64,
}

impl Default for SizeBands {
    fn default() -> Self {
        Self {
            tiny_multiplier: 4.0,
            tiny_floor: 2 * 1024 * 1024,
            small_multiplier: 2.5,
            medium_multiplier: 2.0,
            large_multiplier: 1.5,
            huge_multiplier: 1.2,
            huge_cap: 12 * 1024 * 1024,
            boost_threshold: 0.85,
            boost_multiplier: 1.15,
            max_estimated_percent: 98.0,
        }
    }
}

/// Immutable snapshot of the relay mirror pools. Consumers clone the Arc and
/// read a consistent list; `refresh_relay_instances` swaps in a new snapshot
/// with a bumped version.
#[derive(Debug, Clone)]
pub struct MirrorSnapshot {
    pub version: u64,
    pub piped: Vec<String>,
    pub invidious: Vec<String>,
}

/// Engine configuration. Constructed once and shared; the mirror snapshot is
/// the only part that changes after construction.
pub struct EngineConfig {
    /// Root directory holding the per-family cache subdirectories.
    pub cache_root: PathBuf,

    /// CORS-relay prefixes tried, in rotation, when a backend edge-blocks us.
    pub proxy_prefixes: Vec<String>,

    /// Commercial-catalog proxy base URL.
    pub catalog_base: String,

    /// Social-audio platform API base and client id.
    pub social_api_base: String,
    pub social_widget_base: String,
    pub social_client_id: String,

    /// Remote manifest listing currently-alive relay instances.
    pub instance_manifest_url: Option<String>,

    /// Per-leg deadline inside the concurrent strategy race.
    pub race_leg_timeout: Duration,
    /// Timeout for single resolution fetches (instance API calls, scrapes).
    pub fetch_timeout: Duration,
    /// Connect timeout for long-running media downloads (no total timeout;
    /// a download may legitimately run for minutes).
    pub download_connect_timeout: Duration,

    pub max_retry_attempts: u32,
    pub retry_backoff: Duration,
    pub retry_jitter_ms: u64,

    /// Phase 1 initial window downloaded before playback is unblocked.
    pub initial_window_bytes: u64,
    /// Phase 3 chunk size.
    pub chunk_bytes: u64,
    /// Phase 2 acceptance margin: a full-file attempt must beat the partial
    /// file by at least this much (or carry full-content status) to replace it.
    pub full_margin_bytes: u64,

    pub stall_poll_interval: Duration,
    /// Consecutive flat polls before a stall is declared.
    pub stall_flat_checks: u32,

    /// Records untouched for this long (and not downloading) are reset by
    /// maintenance, keeping only the resume URL.
    pub record_staleness: Duration,

    pub size_bands: SizeBands,

    mirrors: RwLock<Arc<MirrorSnapshot>>,
    mirror_version: AtomicU64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cache_root = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Tunestream")
            .join("stream_cache");

        Self {
            cache_root,
            proxy_prefixes: DEFAULT_PROXY_PREFIXES.clone(),
            catalog_base: "https://saavn.dev".to_string(),
            social_api_base: "https://api-v2.soundcloud.com".to_string(),
            social_widget_base: "https://api-widget.soundcloud.com".to_string(),
            social_client_id: "a3dd183a357fcff9a6943c0d65664087".to_string(),
            instance_manifest_url: Some(
                "https://piped-instances.kavin.rocks/".to_string(),
            ),
            race_leg_timeout: Duration::from_secs(8),
            fetch_timeout: Duration::from_secs(12),
            download_connect_timeout: Duration::from_secs(10),
            max_retry_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            retry_jitter_ms: 250,
            initial_window_bytes: 5 * 1024 * 1024,
            chunk_bytes: 2 * 1024 * 1024,
            full_margin_bytes: 1024 * 1024,
            stall_poll_interval: Duration::from_secs(3),
            stall_flat_checks: 3,
            record_staleness: Duration::from_secs(30 * 60),
            size_bands: SizeBands::default(),
            mirrors: RwLock::new(Arc::new(MirrorSnapshot {
                version: 0,
                piped: DEFAULT_PIPED_INSTANCES.clone(),
                invidious: DEFAULT_INVIDIOUS_INSTANCES.clone(),
            })),
            mirror_version: AtomicU64::new(0),
        }
    }
}

impl EngineConfig {
    /// Latest mirror snapshot. Cheap; callers hold the Arc for the duration
    /// of one resolution attempt so a concurrent refresh never mutates a
    /// list out from under them.
    pub fn relay_snapshot(&self) -> Arc<MirrorSnapshot> {
        self.mirrors.read().unwrap().clone()
    }

    /// Replace the relay mirror pools wholesale (used by tests and by hosts
    /// with their own instance discovery).
    pub fn set_relay_instances(&self, piped: Vec<String>, invidious: Vec<String>) {
        let version = self.mirror_version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(MirrorSnapshot {
            version,
            piped,
            invidious,
        });
        *self.mirrors.write().unwrap() = snapshot;
    }

    /// Fetch the remote instance manifest and swap in a fresh mirror
    /// snapshot. Keeps the current snapshot on any failure; an unreachable
    /// manifest must not degrade a working pool.
    pub async fn refresh_relay_instances(&self, client: &reqwest::Client) {
        let Some(manifest_url) = self.instance_manifest_url.as_deref() else {
            return;
        };

        let resp = match client
            .get(manifest_url)
            .timeout(self.fetch_timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("[config] instance manifest fetch failed: {}", e);
                return;
            }
        };
        if !resp.status().is_success() {
            warn!(
                "[config] instance manifest returned status {}",
                resp.status()
            );
            return;
        }

        let payload: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("[config] instance manifest is not JSON: {}", e);
                return;
            }
        };

        // Manifest shape: a JSON array of instance descriptors carrying an
        // "api_url" (or plain string URLs).
        let mut piped: Vec<String> = Vec::new();
        if let Some(items) = payload.as_array() {
            for item in items {
                if let Some(url) = item.get("api_url").and_then(|u| u.as_str()) {
                    piped.push(url.trim_end_matches('/').to_string());
                } else if let Some(url) = item.as_str() {
                    piped.push(url.trim_end_matches('/').to_string());
                }
            }
        }

        if piped.is_empty() {
            warn!("[config] instance manifest contained no usable instances");
            return;
        }

        let invidious = self.relay_snapshot().invidious.clone();
        self.set_relay_instances(piped, invidious);
        let snap = self.relay_snapshot();
        info!(
            "[config] relay instance list refreshed: {} piped instances (v{})",
            snap.piped.len(),
            snap.version
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_swap_bumps_version() {
        let config = EngineConfig::default();
        let before = config.relay_snapshot();
        config.set_relay_instances(vec!["https://a.example".into()], vec![]);
        let after = config.relay_snapshot();
        assert!(after.version > before.version);
        assert_eq!(after.piped, vec!["https://a.example".to_string()]);
        // old snapshot is untouched
        assert!(!before.piped.is_empty());
    }
}
