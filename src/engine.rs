use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, info};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::downloader::ProgressiveDownloader;
use crate::error::ResolveError;
use crate::progress::{CacheProgressStore, ProgressUpdate};
use crate::proxy::ProxyRotator;
use crate::racer::StrategyRacer;
use crate::sources::{default_strategies, SourceFamily, SourceStrategy, TrackQuery};
use crate::stall::StallMonitor;

const ALL_FAMILIES: [SourceFamily; 3] = [
    SourceFamily::Relay,
    SourceFamily::Catalog,
    SourceFamily::Social,
];

/// Snapshot handed to the UI poller. Everything beyond `percentage` and
/// `is_fully_cached` is best-effort.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub percentage: f64,
    #[serde(rename = "fileSizeMB")]
    pub file_size_mb: f64,
    #[serde(rename = "totalFileSizeMB", skip_serializing_if = "Option::is_none")]
    pub total_file_size_mb: Option<f64>,
    pub is_fully_cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_downloading: Option<bool>,
    #[serde(rename = "downloadSpeedMBps", skip_serializing_if = "Option::is_none")]
    pub download_speed_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

/// Per-family cache usage totals.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub family: SourceFamily,
    pub total_bytes: u64,
    pub file_count: usize,
}

/// The one entry point the rest of the app talks to. Owns its progress
/// store, proxy rotation state, strategy list, and background task
/// registry; construct one and inject it wherever needed.
pub struct CacheEngine {
    config: Arc<EngineConfig>,
    store: Arc<CacheProgressStore>,
    downloader: Arc<ProgressiveDownloader>,
    racer: StrategyRacer,
    resolve_client: reqwest::Client,
    /// Which family a track resolved through, so lookups and clears probe
    /// the right cache directory.
    families: Mutex<HashMap<String, SourceFamily>>,
    monitors: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl CacheEngine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let config = Arc::new(config);
        let rotator = Arc::new(ProxyRotator::new(config.proxy_prefixes.clone()));
        let resolve_client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .unwrap();
        let strategies = default_strategies(config.clone(), resolve_client.clone(), rotator);
        Self::with_strategies(config, resolve_client, strategies)
    }

    /// Construction with an explicit strategy list (tests swap in fakes or
    /// mock-server-backed strategies here).
    pub fn with_strategies(
        config: Arc<EngineConfig>,
        resolve_client: reqwest::Client,
        strategies: Vec<Arc<dyn SourceStrategy>>,
    ) -> Arc<Self> {
        let store = Arc::new(CacheProgressStore::new());
        let downloader = Arc::new(ProgressiveDownloader::new(config.clone(), store.clone()));
        let racer = StrategyRacer::new(strategies, downloader.clone(), config.race_leg_timeout);

        Arc::new(Self {
            config,
            store,
            downloader,
            racer,
            resolve_client,
            families: Mutex::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &Arc<CacheProgressStore> {
        &self.store
    }

    pub fn downloader(&self) -> &Arc<ProgressiveDownloader> {
        &self.downloader
    }

    fn family_of(&self, track_id: &str) -> Option<SourceFamily> {
        self.families.lock().unwrap().get(track_id).copied()
    }

    fn families_to_probe(&self, track_id: &str) -> Vec<SourceFamily> {
        match self.family_of(track_id) {
            Some(family) => vec![family],
            None => ALL_FAMILIES.to_vec(),
        }
    }

    /// Resolve a playable URL for the track and start (or reuse) its local
    /// cache. Returns a `file://` path when a local copy is usable, else
    /// the remote URL. Only total resolution failure errors; caching
    /// trouble silently degrades to remote playback.
    pub async fn resolve_and_cache(
        self: &Arc<Self>,
        track_id: &str,
        source_kind: SourceFamily,
        title_hint: Option<&str>,
        artist_hint: Option<&str>,
    ) -> Result<String, ResolveError> {
        // A finished local copy needs no network at all.
        for family in self.families_to_probe(track_id) {
            if let Some((path, true)) = self.downloader.find_cached(track_id, family) {
                debug!("[engine] {} already fully cached", track_id);
                self.store
                    .merge_update(track_id, ProgressUpdate::completed());
                return Ok(to_file_url(&path.to_string_lossy()));
            }
        }

        let query = TrackQuery {
            id: track_id.to_string(),
            title_hint: title_hint.map(|s| s.to_string()),
            artist_hint: artist_hint.map(|s| s.to_string()),
        };

        let outcome = self
            .racer
            .resolve_playable(track_id, &query, Some(source_kind))
            .await?;

        info!(
            "[engine] {} resolved via {} in {}ms",
            track_id, outcome.result.strategy_name, outcome.result.latency_ms
        );

        self.families
            .lock()
            .unwrap()
            .insert(track_id.to_string(), outcome.result.family);
        self.spawn_stall_monitor(track_id, outcome.result.family);

        if outcome.playable_url.starts_with("http") {
            Ok(outcome.playable_url)
        } else {
            Ok(to_file_url(&outcome.playable_url))
        }
    }

    /// One stall monitor per track; replacing a finished/aborted watcher is
    /// fine, a second live one is not.
    fn spawn_stall_monitor(self: &Arc<Self>, track_id: &str, family: SourceFamily) {
        let mut monitors = self.monitors.lock().unwrap();
        if let Some(handle) = monitors.get(track_id) {
            if !handle.is_finished() {
                return;
            }
        }

        let monitor = StallMonitor::new(
            self.store.clone(),
            self.downloader.clone(),
            self.config.stall_poll_interval,
            self.config.stall_flat_checks,
        );
        let track = track_id.to_string();
        let handle = tokio::spawn(async move {
            monitor.watch(&track, family, |_| {}).await;
        });
        monitors.insert(track_id.to_string(), handle);
    }

    /// Progress snapshot for the UI. File size comes from disk so it tracks
    /// a growing partial file even between store updates.
    pub fn get_cache_info(&self, track_id: &str) -> CacheInfo {
        let record = self.store.get(track_id);

        let mut file_size: u64 = 0;
        let mut disk_full = false;
        for family in self.families_to_probe(track_id) {
            if let Some((path, full)) = self.downloader.find_cached(track_id, family) {
                file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                disk_full = full;
                break;
            }
        }

        match record {
            Some(record) => CacheInfo {
                percentage: record.percentage,
                file_size_mb: to_mb(file_size.max(record.downloaded_bytes)),
                total_file_size_mb: (record.estimated_total_bytes > 0)
                    .then(|| to_mb(record.estimated_total_bytes)),
                is_fully_cached: record.is_fully_cached || disk_full,
                is_downloading: Some(record.is_downloading),
                download_speed_mbps: (record.speed_bps > 0.0)
                    .then(|| record.speed_bps / (1024.0 * 1024.0)),
                retry_count: Some(record.retry_count),
            },
            None if disk_full => CacheInfo {
                percentage: 100.0,
                file_size_mb: to_mb(file_size),
                total_file_size_mb: Some(to_mb(file_size)),
                is_fully_cached: true,
                is_downloading: Some(false),
                download_speed_mbps: None,
                retry_count: None,
            },
            None => CacheInfo {
                percentage: 0.0,
                file_size_mb: to_mb(file_size),
                total_file_size_mb: None,
                is_fully_cached: false,
                is_downloading: Some(false),
                download_speed_mbps: None,
                retry_count: None,
            },
        }
    }

    /// Delete cached files and records for one track, or for everything.
    /// In-flight downloads and watchers are cancelled first so nothing
    /// recreates the files mid-delete.
    pub async fn clear_cache(&self, track_id: Option<&str>) {
        match track_id {
            Some(id) => self.clear_one(id).await,
            None => {
                let ids: Vec<String> = {
                    let mut all: Vec<String> = self.store.tracked_ids();
                    let families = self.families.lock().unwrap();
                    all.extend(families.keys().cloned());
                    all.sort();
                    all.dedup();
                    all
                };
                for id in ids {
                    self.clear_one(&id).await;
                }
            }
        }
    }

    async fn clear_one(&self, track_id: &str) {
        self.downloader.cancel(track_id);
        if let Some(handle) = self.monitors.lock().unwrap().remove(track_id) {
            handle.abort();
        }
        for family in self.families_to_probe(track_id) {
            self.downloader.remove_files(track_id, family).await;
        }
        self.store.clear(Some(track_id));
        self.families.lock().unwrap().remove(track_id);
        info!("[engine] cache cleared for {}", track_id);
    }

    /// Per-family on-disk usage.
    pub fn cache_stats(&self) -> Vec<CacheStats> {
        ALL_FAMILIES
            .iter()
            .map(|family| {
                let dir = self.downloader.cache_dir(*family);
                let mut total_bytes = 0u64;
                let mut file_count = 0usize;
                if let Ok(entries) = std::fs::read_dir(&dir) {
                    for entry in entries.flatten() {
                        if let Ok(meta) = entry.metadata() {
                            if meta.is_file() {
                                total_bytes += meta.len();
                                file_count += 1;
                            }
                        }
                    }
                }
                CacheStats {
                    family: *family,
                    total_bytes,
                    file_count,
                }
            })
            .collect()
    }

    /// Periodic housekeeping: stale records are reset (keeping their resume
    /// URL) so long-idle tracks do not pin memory or show phantom progress.
    /// Explicit so hosts control the task's lifetime.
    pub fn start_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let store = self.store.clone();
        let staleness = self.config.record_staleness;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(staleness / 2);
            interval.tick().await;
            loop {
                interval.tick().await;
                let reset = store.reset_stale(staleness);
                if reset > 0 {
                    debug!("[engine] maintenance reset {} stale records", reset);
                }
            }
        })
    }

    /// Pull a fresh relay instance list from the configured manifest.
    pub async fn refresh_instances(&self) {
        self.config
            .refresh_relay_instances(&self.resolve_client)
            .await;
    }
}

fn to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

fn to_file_url(path: &str) -> String {
    if path.starts_with("file://") {
        path.to_string()
    } else {
        format!("file://{}", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_url_formatting() {
        assert_eq!(to_file_url("/tmp/a.m4a"), "file:///tmp/a.m4a");
        assert_eq!(to_file_url("file:///tmp/a.m4a"), "file:///tmp/a.m4a");
    }

    #[test]
    fn cache_info_serializes_interface_field_names() {
        let info = CacheInfo {
            percentage: 42.0,
            file_size_mb: 1.5,
            total_file_size_mb: Some(3.0),
            is_fully_cached: false,
            is_downloading: Some(true),
            download_speed_mbps: Some(0.25),
            retry_count: Some(1),
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["percentage"], 42.0);
        assert_eq!(value["fileSizeMB"], 1.5);
        assert_eq!(value["totalFileSizeMB"], 3.0);
        assert_eq!(value["isFullyCached"], false);
        assert_eq!(value["isDownloading"], true);
        assert_eq!(value["downloadSpeedMBps"], 0.25);
        assert_eq!(value["retryCount"], 1);
    }
}
