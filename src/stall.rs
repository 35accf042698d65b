use std::sync::Arc;

use log::{info, warn};

use crate::downloader::ProgressiveDownloader;
use crate::progress::{CacheProgressRecord, CacheProgressStore};
use crate::sources::SourceFamily;

/// Percentage at or above which monitoring stops; the tail end is the
/// downloader's to finish.
const STOP_THRESHOLD: f64 = 98.0;
/// Movement below this across a poll counts as flat.
const FLAT_DELTA: f64 = 1.0;

/// Watches a track's progress and restarts the chunked continuation when a
/// download silently stops advancing. Reads the same store everyone else
/// does; its only write path is the downloader's resume entry point.
pub struct StallMonitor {
    store: Arc<CacheProgressStore>,
    downloader: Arc<ProgressiveDownloader>,
    poll_interval: std::time::Duration,
    flat_checks: u32,
}

impl StallMonitor {
    pub fn new(
        store: Arc<CacheProgressStore>,
        downloader: Arc<ProgressiveDownloader>,
        poll_interval: std::time::Duration,
        flat_checks: u32,
    ) -> Self {
        Self {
            store,
            downloader,
            poll_interval,
            flat_checks,
        }
    }

    /// Poll every interval until the track is (nearly) complete or its
    /// record disappears. `on_progress` fires on every poll with the
    /// current record.
    pub async fn watch<F>(&self, track_id: &str, family: SourceFamily, mut on_progress: F)
    where
        F: FnMut(&CacheProgressRecord) + Send,
    {
        let mut flat_streak: u32 = 0;
        let mut last_pct: Option<f64> = None;
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.tick().await; // immediate first tick

        loop {
            interval.tick().await;

            // Record gone means the cache was cleared; nothing to watch.
            let Some(record) = self.store.get(track_id) else {
                break;
            };
            on_progress(&record);

            if record.percentage >= STOP_THRESHOLD || record.is_fully_cached {
                info!(
                    "[stall] {} reached {:.0}%, monitoring done",
                    track_id, record.percentage
                );
                break;
            }

            let moved = last_pct
                .map(|p| (record.percentage - p).abs() >= FLAT_DELTA)
                .unwrap_or(true);
            last_pct = Some(record.percentage);

            if moved {
                flat_streak = 0;
                continue;
            }
            flat_streak += 1;
            if flat_streak < self.flat_checks {
                continue;
            }

            // Flat long enough to call it a stall, but only when nothing is
            // actually running; a slow-but-alive download keeps its slot.
            if record.is_downloading || self.downloader.is_active(track_id) {
                flat_streak = 0;
                continue;
            }

            match self.store.resume_url(track_id) {
                Some(url) => {
                    warn!(
                        "[stall] {} stalled at {:.1}%, resuming from current file size",
                        track_id, record.percentage
                    );
                    if let Err(e) = self
                        .downloader
                        .resume_from_disk(track_id, family, &url)
                        .await
                    {
                        warn!("[stall] resume failed for {}: {}", track_id, e);
                    }
                    flat_streak = 0;
                }
                None => {
                    // Cold resolution has to come from the caller; keep
                    // watching in case one shows up.
                    warn!(
                        "[stall] {} stalled with no resume URL, cannot resume",
                        track_id
                    );
                    flat_streak = 0;
                }
            }
        }
    }
}
