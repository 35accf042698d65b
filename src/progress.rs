use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::debug;

use crate::config::SizeBands;

const MB: u64 = 1024 * 1024;

// merge_update rules
const MAX_PERCENT_REGRESSION: f64 = 5.0;
const MIN_PERCENT_STEP: f64 = 0.5;
const MIN_STEP_WINDOW: Duration = Duration::from_secs(1);

/// Per-track download progress and resume state. Owned exclusively by
/// `CacheProgressStore`; everything outside reads clones.
#[derive(Debug, Clone)]
pub struct CacheProgressRecord {
    /// 0..=100. An estimate until completion; 100 only after a confirmed
    /// complete download.
    pub percentage: f64,
    pub downloaded_bytes: u64,
    pub estimated_total_bytes: u64,
    pub is_downloading: bool,
    /// Terminal once true; only an explicit cache clear resets it.
    pub is_fully_cached: bool,
    pub retry_count: u32,
    pub download_started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Preserved across cleanups so a stalled download can resume without a
    /// fresh resolution. Cleared only by explicit cache clear.
    pub original_stream_url: Option<String>,
    /// Rolling download speed in bytes/sec.
    pub speed_bps: f64,

    last_touched: Instant,
    last_speed_sample: Option<(Instant, u64)>,
}

impl CacheProgressRecord {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            percentage: 0.0,
            downloaded_bytes: 0,
            estimated_total_bytes: 0,
            is_downloading: false,
            is_fully_cached: false,
            retry_count: 0,
            download_started_at: now,
            last_updated_at: now,
            original_stream_url: None,
            speed_bps: 0.0,
            last_touched: Instant::now(),
            last_speed_sample: None,
        }
    }
}

/// Field-wise update applied through `merge_update`. Absent fields keep
/// their stored values.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdate {
    pub percentage: Option<f64>,
    pub downloaded_bytes: Option<u64>,
    pub estimated_total_bytes: Option<u64>,
    pub is_downloading: Option<bool>,
    pub is_fully_cached: Option<bool>,
    pub retry_count: Option<u32>,
    pub original_stream_url: Option<String>,
}

impl ProgressUpdate {
    pub fn downloading(value: bool) -> Self {
        Self {
            is_downloading: Some(value),
            ..Self::default()
        }
    }

    pub fn completed() -> Self {
        Self {
            percentage: Some(100.0),
            is_fully_cached: Some(true),
            is_downloading: Some(false),
            ..Self::default()
        }
    }
}

/// In-memory map of per-track progress records. The single `merge_update`
/// entry point is the only mutation path, which is what makes the record
/// safe to read from a stall monitor, a UI poller, and an in-flight
/// download at the same time.
pub struct CacheProgressStore {
    records: Mutex<HashMap<String, CacheProgressRecord>>,
}

impl CacheProgressStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, track_id: &str) -> Option<CacheProgressRecord> {
        self.records.lock().unwrap().get(track_id).cloned()
    }

    /// Resume URL survives everything short of an explicit clear, so this
    /// works even after a staleness reset.
    pub fn resume_url(&self, track_id: &str) -> Option<String> {
        self.records
            .lock()
            .unwrap()
            .get(track_id)
            .and_then(|r| r.original_stream_url.clone())
    }

    /// Apply an update, subject to the ordering/regression rules. Returns
    /// whether the update was applied.
    pub fn merge_update(&self, track_id: &str, update: ProgressUpdate) -> bool {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(track_id.to_string())
            .or_insert_with(CacheProgressRecord::new);

        let state_change = update
            .is_downloading
            .map(|d| d != record.is_downloading)
            .unwrap_or(false)
            || update
                .is_fully_cached
                .map(|f| f != record.is_fully_cached)
                .unwrap_or(false);

        let total_grew = update
            .estimated_total_bytes
            .map(|t| t > record.estimated_total_bytes)
            .unwrap_or(false);

        if let Some(new_pct) = update.percentage {
            // Re-estimation can legitimately pull the percentage down; a
            // large drop without a grown total or a state change is noise
            // and would show as visible progress regression.
            if new_pct + MAX_PERCENT_REGRESSION < record.percentage
                && !total_grew
                && !state_change
            {
                debug!(
                    "[progress] rejected regression for {}: {:.1} -> {:.1}",
                    track_id, record.percentage, new_pct
                );
                return false;
            }

            // Sub-half-point updates within a second are churn.
            if (new_pct - record.percentage).abs() < MIN_PERCENT_STEP
                && record.last_touched.elapsed() < MIN_STEP_WINDOW
                && !state_change
            {
                return false;
            }
        }

        if let Some(pct) = update.percentage {
            record.percentage = pct.clamp(0.0, 100.0);
        }
        if let Some(bytes) = update.downloaded_bytes {
            // Rolling speed from byte deltas between applied updates.
            let now = Instant::now();
            if let Some((at, prev_bytes)) = record.last_speed_sample {
                let dt = now.duration_since(at).as_secs_f64();
                if dt > 0.0 && bytes > prev_bytes {
                    let instant_bps = (bytes - prev_bytes) as f64 / dt;
                    record.speed_bps = if record.speed_bps > 0.0 {
                        record.speed_bps * 0.7 + instant_bps * 0.3
                    } else {
                        instant_bps
                    };
                }
            }
            record.last_speed_sample = Some((now, bytes));
            record.downloaded_bytes = bytes;
        }
        if let Some(total) = update.estimated_total_bytes {
            record.estimated_total_bytes = total;
        }
        if let Some(downloading) = update.is_downloading {
            record.is_downloading = downloading;
        }
        if let Some(fully) = update.is_fully_cached {
            record.is_fully_cached = fully;
        }
        if let Some(retries) = update.retry_count {
            record.retry_count = retries;
        }
        if update.original_stream_url.is_some() {
            record.original_stream_url = update.original_stream_url;
        }

        // completion invariant: 100% <=> fully cached, never still downloading
        if record.is_fully_cached {
            record.percentage = 100.0;
            record.is_downloading = false;
            record.speed_bps = 0.0;
        }

        record.last_updated_at = Utc::now();
        record.last_touched = Instant::now();
        true
    }

    /// Reset records untouched for longer than `staleness` and not actively
    /// downloading. The resume URL is the one field that survives; fully
    /// cached records are terminal and skipped entirely.
    pub fn reset_stale(&self, staleness: Duration) -> usize {
        let mut records = self.records.lock().unwrap();
        let mut reset = 0;
        for (track_id, record) in records.iter_mut() {
            if record.is_downloading || record.is_fully_cached {
                continue;
            }
            if record.last_touched.elapsed() < staleness {
                continue;
            }
            let resume = record.original_stream_url.take();
            *record = CacheProgressRecord::new();
            record.original_stream_url = resume;
            debug!("[progress] reset stale record for {}", track_id);
            reset += 1;
        }
        reset
    }

    /// Clear one record, or everything. Only path that forgets a resume URL.
    pub fn clear(&self, track_id: Option<&str>) {
        let mut records = self.records.lock().unwrap();
        match track_id {
            Some(id) => {
                records.remove(id);
            }
            None => records.clear(),
        }
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        self.records.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for CacheProgressStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Banded total-size estimation. Pure; all tunables live on `SizeBands`.
pub struct SizeEstimator;

impl SizeEstimator {
    /// Map bytes-downloaded-so-far (plus any previous estimate) to an
    /// estimated total and a bounded percentage. 100 is never produced here;
    /// it is reserved for a confirmed-complete download.
    pub fn estimate(
        bands: &SizeBands,
        current_bytes: u64,
        previous_estimate: Option<u64>,
    ) -> (u64, f64) {
        let current = current_bytes as f64;

        let banded = if current_bytes < MB {
            (current * bands.tiny_multiplier).max(bands.tiny_floor as f64)
        } else if current_bytes < 3 * MB {
            current * bands.small_multiplier
        } else if current_bytes < 5 * MB {
            current * bands.medium_multiplier
        } else if current_bytes < 10 * MB {
            current * bands.large_multiplier
        } else {
            // Big files: thin margin, capped, but the estimate always stays
            // ahead of what is already on disk.
            (current * bands.huge_multiplier)
                .min(bands.huge_cap as f64)
                .max(current + MB as f64)
        };

        // A previous estimate never shrinks; shrinking totals are what cause
        // visible percentage regressions.
        let mut estimate = match previous_estimate {
            Some(prev) => banded.max(prev as f64),
            None => banded,
        };

        // Nearly caught up with the estimate while the file is still
        // growing: push the ceiling out before renormalizing so we do not
        // show near-complete prematurely.
        if current / estimate > bands.boost_threshold {
            estimate *= bands.boost_multiplier;
        }

        let percentage = ((current / estimate) * 100.0)
            .round()
            .min(bands.max_estimated_percent);

        (estimate.round() as u64, percentage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn bands() -> SizeBands {
        SizeBands::default()
    }

    #[test]
    fn estimate_mid_band() {
        let (total, pct) = SizeEstimator::estimate(&bands(), 3_500_000, None);
        assert!(total >= 6 * MB && total <= 8 * MB, "total {}", total);
        assert!(pct < 98.0);
    }

    #[test]
    fn estimate_never_reports_complete() {
        for bytes in [100, 500_000, 2 * MB, 9 * MB, 11 * MB, 50 * MB] {
            let (_, pct) = SizeEstimator::estimate(&bands(), bytes, None);
            assert!(pct <= 98.0, "bytes {} -> pct {}", bytes, pct);
        }
    }

    #[test]
    fn estimate_tiny_band_floor() {
        let (total, _) = SizeEstimator::estimate(&bands(), 100_000, None);
        assert!(total >= 2 * MB);
    }

    #[test]
    fn estimate_keeps_previous_ceiling() {
        let (first, _) = SizeEstimator::estimate(&bands(), 8 * MB, None);
        // downloaded bytes unchanged but estimator re-invoked with the prior
        // total: the estimate must not shrink
        let (second, _) = SizeEstimator::estimate(&bands(), 8 * MB, Some(first));
        assert!(second >= first);
    }

    #[test]
    fn estimate_boosts_near_ceiling() {
        // 11 MB downloaded against a 12 MB cap is past the boost threshold
        let (total, pct) = SizeEstimator::estimate(&bands(), 11 * MB, None);
        assert!(total > 12 * MB, "boost should lift the cap, got {}", total);
        assert!(pct < 98.0);
    }

    #[test]
    fn merge_applies_plain_update() {
        let store = CacheProgressStore::new();
        let applied = store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(10.0),
                downloaded_bytes: Some(MB),
                estimated_total_bytes: Some(10 * MB),
                is_downloading: Some(true),
                ..Default::default()
            },
        );
        assert!(applied);
        let record = store.get("t1").unwrap();
        assert_eq!(record.percentage, 10.0);
        assert!(record.is_downloading);
    }

    #[test]
    fn merge_rejects_regression() {
        let store = CacheProgressStore::new();
        store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(50.0),
                is_downloading: Some(true),
                ..Default::default()
            },
        );
        let applied = store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(30.0),
                ..Default::default()
            },
        );
        assert!(!applied);
        assert_eq!(store.get("t1").unwrap().percentage, 50.0);
    }

    #[test]
    fn merge_allows_regression_with_grown_total() {
        let store = CacheProgressStore::new();
        store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(50.0),
                estimated_total_bytes: Some(4 * MB),
                is_downloading: Some(true),
                ..Default::default()
            },
        );
        let applied = store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(30.0),
                estimated_total_bytes: Some(8 * MB),
                ..Default::default()
            },
        );
        assert!(applied);
        assert_eq!(store.get("t1").unwrap().percentage, 30.0);
    }

    #[test]
    fn merge_allows_regression_on_state_change() {
        let store = CacheProgressStore::new();
        store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(50.0),
                is_downloading: Some(true),
                ..Default::default()
            },
        );
        let applied = store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(0.0),
                is_downloading: Some(false),
                ..Default::default()
            },
        );
        assert!(applied);
    }

    #[test]
    fn merge_throttles_tiny_updates() {
        let store = CacheProgressStore::new();
        store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(10.0),
                is_downloading: Some(true),
                ..Default::default()
            },
        );
        // 0.2 points within the same second, no state change
        let applied = store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(10.2),
                ..Default::default()
            },
        );
        assert!(!applied);
    }

    #[test]
    fn completion_is_idempotent_and_consistent() {
        let store = CacheProgressStore::new();
        store.merge_update("t1", ProgressUpdate::completed());
        let first = store.get("t1").unwrap();
        assert_eq!(first.percentage, 100.0);
        assert!(first.is_fully_cached);
        assert!(!first.is_downloading);

        // reading again without new downloads returns the same values
        let second = store.get("t1").unwrap();
        assert_eq!(second.percentage, first.percentage);
        assert_eq!(second.is_fully_cached, first.is_fully_cached);
    }

    #[test]
    fn stale_reset_preserves_resume_url() {
        let store = CacheProgressStore::new();
        store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(40.0),
                original_stream_url: Some("https://cdn/stream".into()),
                is_downloading: Some(false),
                ..Default::default()
            },
        );
        let reset = store.reset_stale(Duration::from_secs(0));
        assert_eq!(reset, 1);
        let record = store.get("t1").unwrap();
        assert_eq!(record.percentage, 0.0);
        assert!(!record.is_downloading);
        assert_eq!(
            record.original_stream_url.as_deref(),
            Some("https://cdn/stream")
        );
    }

    #[test]
    fn clear_forgets_resume_url() {
        let store = CacheProgressStore::new();
        store.merge_update(
            "t1",
            ProgressUpdate {
                original_stream_url: Some("https://cdn/stream".into()),
                ..Default::default()
            },
        );
        store.clear(Some("t1"));
        assert!(store.get("t1").is_none());
    }

    #[test]
    fn randomized_updates_never_visibly_regress() {
        let store = CacheProgressStore::new();
        let mut rng = rand::thread_rng();
        store.merge_update(
            "t1",
            ProgressUpdate {
                percentage: Some(0.0),
                is_downloading: Some(true),
                ..Default::default()
            },
        );

        let mut shown = 0.0f64;
        for _ in 0..500 {
            let pct: f64 = rng.gen_range(0.0..100.0);
            let total = if rng.gen_bool(0.2) {
                Some(rng.gen_range(1..(64 * MB)))
            } else {
                None
            };
            let before = store.get("t1").unwrap();
            let update = ProgressUpdate {
                percentage: Some(pct),
                estimated_total_bytes: total,
                ..Default::default()
            };
            let total_grew = total.map(|t| t > before.estimated_total_bytes).unwrap_or(false);
            let applied = store.merge_update("t1", update);
            let after = store.get("t1").unwrap().percentage;
            if applied && !total_grew {
                assert!(
                    after + MAX_PERCENT_REGRESSION >= shown,
                    "visible regression {} -> {}",
                    shown,
                    after
                );
            }
            shown = after;
        }
    }
}
