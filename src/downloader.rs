use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use log::{debug, info, warn};
use rand::Rng;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_RANGE, RANGE, USER_AGENT as UA_HEADER};
use reqwest::StatusCode;
use tokio::fs as tokio_fs;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::config::EngineConfig;
use crate::error::{CacheError, CacheResult};
use crate::progress::{CacheProgressStore, ProgressUpdate, SizeEstimator};
use crate::proxy::USER_AGENT;
use crate::sources::SourceFamily;

const VALIDATION_BYTES: usize = 8192;

/// Cooperative cancellation state for one in-flight download. Checked at
/// every chunk boundary.
struct DownloadControl {
    cancel: AtomicBool,
}

impl DownloadControl {
    fn new() -> Self {
        Self {
            cancel: AtomicBool::new(false),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// What a finished transfer attempt looked like from the server's side.
enum ChunkOutcome {
    /// more data may remain
    More,
    /// server signalled end of resource (416 or undersized chunk)
    End,
}

/// Builds the local copy of a stream: a quick initial window to unblock
/// playback, a background full-file attempt, and a chunked range fallback.
/// The downloader is the only writer of cache files; at most one run is
/// active per track id.
pub struct ProgressiveDownloader {
    config: Arc<EngineConfig>,
    store: Arc<CacheProgressStore>,
    client: reqwest::Client,
    active: Mutex<HashMap<String, Arc<DownloadControl>>>,
}

impl ProgressiveDownloader {
    pub fn new(config: Arc<EngineConfig>, store: Arc<CacheProgressStore>) -> Self {
        // Long-running media downloads: short connect timeout, no total
        // timeout, and no automatic decompression (servers mislabel
        // encodings on media bodies).
        let client = reqwest::Client::builder()
            .connect_timeout(config.download_connect_timeout)
            .gzip(false)
            .brotli(false)
            .build()
            .unwrap();

        for family in [SourceFamily::Relay, SourceFamily::Catalog, SourceFamily::Social] {
            std::fs::create_dir_all(config.cache_root.join(family.cache_dir_name())).ok();
        }

        Self {
            config,
            store,
            client,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache_dir(&self, family: SourceFamily) -> PathBuf {
        self.config.cache_root.join(family.cache_dir_name())
    }

    fn safe_id(track_id: &str) -> String {
        track_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    fn partial_path(&self, track_id: &str, family: SourceFamily) -> PathBuf {
        self.cache_dir(family)
            .join(format!("{}.{}", Self::safe_id(track_id), family.default_extension()))
    }

    /// Probe known extensions for an existing cache file. No index file:
    /// presence on disk is discovered at lookup time. Returns the path and
    /// whether it is the complete `.full` artifact.
    pub fn find_cached(&self, track_id: &str, family: SourceFamily) -> Option<(PathBuf, bool)> {
        let dir = self.cache_dir(family);
        let id = Self::safe_id(track_id);
        for ext in family.extensions() {
            let full = dir.join(format!("{}.{}.full", id, ext));
            if full.exists() {
                return Some((full, true));
            }
        }
        for ext in family.extensions() {
            let partial = dir.join(format!("{}.{}", id, ext));
            if partial.exists() {
                return Some((partial, false));
            }
        }
        None
    }

    pub fn is_active(&self, track_id: &str) -> bool {
        self.active.lock().unwrap().contains_key(track_id)
    }

    fn register(&self, track_id: &str) -> Option<Arc<DownloadControl>> {
        let mut active = self.active.lock().unwrap();
        if active.contains_key(track_id) {
            return None;
        }
        let control = Arc::new(DownloadControl::new());
        active.insert(track_id.to_string(), control.clone());
        Some(control)
    }

    fn unregister(&self, track_id: &str) {
        self.active.lock().unwrap().remove(track_id);
    }

    /// Request cancellation of an in-flight download. Honored at the next
    /// chunk boundary.
    pub fn cancel(&self, track_id: &str) {
        let active = self.active.lock().unwrap();
        if let Some(control) = active.get(track_id) {
            control.cancel.store(true, Ordering::SeqCst);
            info!("[downloader] cancel requested for {}", track_id);
        }
    }

    /// Delete every on-disk artifact for a track (all extensions, partial,
    /// full, and temp files).
    pub async fn remove_files(&self, track_id: &str, family: SourceFamily) {
        let dir = self.cache_dir(family);
        let id = Self::safe_id(track_id);
        for ext in family.extensions() {
            for name in [
                format!("{}.{}", id, ext),
                format!("{}.{}.part", id, ext),
                format!("{}.{}.full", id, ext),
                format!("{}.{}.full.part", id, ext),
                format!("{}.{}.combine", id, ext),
            ] {
                let _ = tokio_fs::remove_file(dir.join(name)).await;
            }
        }
    }

    /// Entry point: make the stream at `remote_url` locally playable.
    /// Returns a local path as soon as the initial window is on disk,
    /// otherwise the remote URL unchanged. Caching failures never propagate;
    /// playback always gets something usable.
    pub async fn begin_cache(
        self: &Arc<Self>,
        track_id: &str,
        family: SourceFamily,
        remote_url: &str,
    ) -> String {
        // Complete copy already on disk.
        if let Some((path, true)) = self.find_cached(track_id, family) {
            self.store.merge_update(track_id, ProgressUpdate::completed());
            return path.to_string_lossy().to_string();
        }

        // Another run is already building this file: attach to its effort
        // instead of opening a second writer on the same path.
        let Some(control) = self.register(track_id) else {
            debug!("[downloader] {} already downloading, attaching", track_id);
            if let Some((path, _)) = self.find_cached(track_id, family) {
                return path.to_string_lossy().to_string();
            }
            return remote_url.to_string();
        };

        self.store.merge_update(
            track_id,
            ProgressUpdate {
                is_downloading: Some(true),
                retry_count: Some(0),
                original_stream_url: Some(remote_url.to_string()),
                ..Default::default()
            },
        );

        let partial = self.partial_path(track_id, family);
        let phase1 = self
            .download_initial_window(track_id, remote_url, &partial, &control)
            .await;

        match phase1 {
            Ok(()) => {
                // Background completion continues detached; the playback
                // caller never awaits it.
                let this = self.clone();
                let track = track_id.to_string();
                let url = remote_url.to_string();
                tokio::spawn(async move {
                    this.run_background_completion(&track, family, &url, control)
                        .await;
                });
                partial.to_string_lossy().to_string()
            }
            Err(e) => {
                warn!(
                    "[downloader] initial window failed for {}: {}, playing remote",
                    track_id, e
                );
                self.store
                    .merge_update(track_id, ProgressUpdate::downloading(false));
                self.unregister(track_id);
                remote_url.to_string()
            }
        }
    }

    /// Phase 1: a fixed initial window via a byte-range GET (plain GET when
    /// the backend rejects ranges) into the partial cache file.
    async fn download_initial_window(
        &self,
        track_id: &str,
        url: &str,
        partial: &PathBuf,
        control: &DownloadControl,
    ) -> CacheResult<()> {
        let window = self.config.initial_window_bytes;

        let ranged = self
            .client
            .get(url)
            .header(RANGE, format!("bytes=0-{}", window - 1))
            .header(UA_HEADER, USER_AGENT)
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await;

        let (resp, range_honored) = match ranged {
            Ok(r) if r.status() == StatusCode::PARTIAL_CONTENT => (r, true),
            Ok(r) if r.status().is_success() => (r, false),
            _ => {
                // Range rejected outright; retry plain.
                let plain = self
                    .client
                    .get(url)
                    .header(UA_HEADER, USER_AGENT)
                    .header(ACCEPT_ENCODING, "identity")
                    .send()
                    .await?;
                if !plain.status().is_success() {
                    return Err(CacheError::Http(format!(
                        "initial fetch returned {}",
                        plain.status()
                    )));
                }
                (plain, false)
            }
        };

        // Content-Range carries the real total when the server honors
        // ranges; far more trustworthy than the estimator.
        let known_total = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .or_else(|| if range_honored { None } else { resp.content_length() });

        let part = partial.with_extension(format!("{}.part", ext_of(partial)));
        let file = tokio_fs::File::create(&part).await?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);

        let mut stream = resp.bytes_stream();
        let mut prefix: Vec<u8> = Vec::with_capacity(VALIDATION_BYTES);
        let mut written: u64 = 0;

        while let Some(item) = stream.next().await {
            if control.is_cancelled() {
                drop(writer);
                let _ = tokio_fs::remove_file(&part).await;
                return Err(CacheError::Cancelled);
            }
            let chunk = item.map_err(|e| CacheError::Http(e.to_string()))?;
            if prefix.len() < VALIDATION_BYTES {
                let need = VALIDATION_BYTES - prefix.len();
                prefix.extend_from_slice(&chunk[..need.min(chunk.len())]);
            }
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;

            self.report_progress(track_id, written, known_total);

            // Plain GET with no honored range: stop once the window is full,
            // Phase 3 picks up from here with proper ranges.
            if !range_honored && written >= window {
                break;
            }
        }

        writer.flush().await?;
        drop(writer);

        if written == 0 || !is_valid_audio_prefix(&prefix) {
            let _ = tokio_fs::remove_file(&part).await;
            return Err(CacheError::NotAudio);
        }

        tokio_fs::rename(&part, partial).await?;
        info!(
            "[downloader] initial window ready for {} ({:.2} MB)",
            track_id,
            written as f64 / (1024.0 * 1024.0)
        );
        Ok(())
    }

    /// Phases 2 and 3 with bounded retries. Runs detached from the caller of
    /// `begin_cache`; its only owners are the task registry and cleanup.
    async fn run_background_completion(
        self: &Arc<Self>,
        track_id: &str,
        family: SourceFamily,
        url: &str,
        control: Arc<DownloadControl>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if control.is_cancelled() {
                break;
            }
            match self.complete_once(track_id, family, url, &control).await {
                Ok(()) => {
                    self.unregister(track_id);
                    return;
                }
                Err(CacheError::Cancelled) => break,
                Err(e) => {
                    attempt += 1;
                    self.store.merge_update(
                        track_id,
                        ProgressUpdate {
                            retry_count: Some(attempt),
                            ..Default::default()
                        },
                    );
                    if attempt >= self.config.max_retry_attempts {
                        warn!(
                            "[downloader] retries exhausted for {} ({}), keeping partial file",
                            track_id, e
                        );
                        break;
                    }
                    // Fixed backoff with a little jitter so parallel tracks
                    // do not hammer a recovering server in lockstep.
                    let jitter =
                        rand::thread_rng().gen_range(0..=self.config.retry_jitter_ms);
                    let delay =
                        self.config.retry_backoff + std::time::Duration::from_millis(jitter);
                    debug!(
                        "[downloader] attempt {} for {} failed: {}, retrying in {:?}",
                        attempt, track_id, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }

        // Degraded, not deleted: the partial file and resume URL stay so a
        // later explicit resume can continue.
        self.store
            .merge_update(track_id, ProgressUpdate::downloading(false));
        self.unregister(track_id);
    }

    async fn complete_once(
        &self,
        track_id: &str,
        family: SourceFamily,
        url: &str,
        control: &DownloadControl,
    ) -> CacheResult<()> {
        match self.try_full_download(track_id, family, url, control).await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                debug!("[downloader] full-file attempt not usable for {}, chunking", track_id);
            }
            Err(CacheError::Cancelled) => return Err(CacheError::Cancelled),
            Err(e) => {
                debug!("[downloader] full-file attempt failed for {}: {}", track_id, e);
            }
        }
        self.chunked_continue(track_id, family, url, control).await
    }

    /// Phase 2: one range-free download into a sibling `.full` file. Only
    /// accepted when it meaningfully beats the partial file; an upstream
    /// that cuts the connection early would otherwise replace good data
    /// with less.
    async fn try_full_download(
        &self,
        track_id: &str,
        family: SourceFamily,
        url: &str,
        control: &DownloadControl,
    ) -> CacheResult<bool> {
        let partial = self.partial_path(track_id, family);
        let partial_len = tokio_fs::metadata(&partial)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let resp = self
            .client
            .get(url)
            .header(UA_HEADER, USER_AGENT)
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(CacheError::Http(format!("full fetch returned {}", status)));
        }
        let declared_len = resp.content_length();

        let full = PathBuf::from(format!("{}.full", partial.to_string_lossy()));
        let full_part = PathBuf::from(format!("{}.part", full.to_string_lossy()));

        let file = tokio_fs::File::create(&full_part).await?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;

        while let Some(item) = stream.next().await {
            if control.is_cancelled() {
                drop(writer);
                let _ = tokio_fs::remove_file(&full_part).await;
                return Err(CacheError::Cancelled);
            }
            let chunk = item.map_err(|e| CacheError::Http(e.to_string()))?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
            self.report_progress(track_id, partial_len.max(written), declared_len);
        }
        writer.flush().await?;
        drop(writer);

        let got_everything = declared_len.map(|l| written >= l).unwrap_or(false);
        let meaningfully_larger = written >= partial_len + self.config.full_margin_bytes;

        if !(meaningfully_larger || (status == StatusCode::OK && got_everything && written >= partial_len)) {
            let _ = tokio_fs::remove_file(&full_part).await;
            return Ok(false);
        }

        // Atomically swap in the complete artifact and drop the partial.
        tokio_fs::rename(&full_part, &full).await?;
        let _ = tokio_fs::remove_file(&partial).await;

        self.store.merge_update(
            track_id,
            ProgressUpdate {
                downloaded_bytes: Some(written),
                estimated_total_bytes: Some(written),
                ..ProgressUpdate::completed()
            },
        );
        info!(
            "[downloader] full download complete for {} ({:.2} MB)",
            track_id,
            written as f64 / (1024.0 * 1024.0)
        );
        Ok(true)
    }

    /// Phase 3: 2 MB range requests appended from the current file size
    /// until the server reports end of resource.
    async fn chunked_continue(
        &self,
        track_id: &str,
        family: SourceFamily,
        url: &str,
        control: &DownloadControl,
    ) -> CacheResult<()> {
        let partial = self.partial_path(track_id, family);
        let chunk_size = self.config.chunk_bytes;

        loop {
            if control.is_cancelled() {
                return Err(CacheError::Cancelled);
            }

            let offset = tokio_fs::metadata(&partial)
                .await
                .map(|m| m.len())
                .unwrap_or(0);

            match self
                .fetch_and_append_chunk(track_id, url, &partial, offset, chunk_size)
                .await?
            {
                ChunkOutcome::More => continue,
                ChunkOutcome::End => break,
            }
        }

        // Confirmed complete: promote the partial file to the `.full`
        // artifact so later lookups short-circuit.
        let final_len = tokio_fs::metadata(&partial)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        let full = PathBuf::from(format!("{}.full", partial.to_string_lossy()));
        tokio_fs::rename(&partial, &full).await?;

        self.store.merge_update(
            track_id,
            ProgressUpdate {
                downloaded_bytes: Some(final_len),
                estimated_total_bytes: Some(final_len),
                ..ProgressUpdate::completed()
            },
        );
        info!(
            "[downloader] chunked download complete for {} ({:.2} MB)",
            track_id,
            final_len as f64 / (1024.0 * 1024.0)
        );
        Ok(())
    }

    async fn fetch_and_append_chunk(
        &self,
        track_id: &str,
        url: &str,
        partial: &PathBuf,
        offset: u64,
        chunk_size: u64,
    ) -> CacheResult<ChunkOutcome> {
        let resp = self
            .client
            .get(url)
            .header(RANGE, format!("bytes={}-{}", offset, offset + chunk_size - 1))
            .header(UA_HEADER, USER_AGENT)
            .header(ACCEPT_ENCODING, "identity")
            .send()
            .await?;

        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Past the end of the resource: the file is complete.
            return Ok(ChunkOutcome::End);
        }
        if !status.is_success() {
            return Err(CacheError::Http(format!("chunk fetch returned {}", status)));
        }

        let known_total = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total);

        // 200 instead of 206 means the server ignored the range and sent the
        // whole resource. Appending that would duplicate the first `offset`
        // bytes, so replace the file wholesale instead.
        if status == StatusCode::OK && offset > 0 {
            let bytes = resp
                .bytes()
                .await
                .map_err(|e| CacheError::Http(e.to_string()))?;
            if (bytes.len() as u64) < offset {
                return Err(CacheError::Http(
                    "range-less response shorter than existing partial file".to_string(),
                ));
            }
            self.replace_with(partial, &bytes).await?;
            self.report_progress(track_id, bytes.len() as u64, Some(bytes.len() as u64));
            return Ok(ChunkOutcome::End);
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| CacheError::Http(e.to_string()))?;
        if bytes.is_empty() {
            return Ok(ChunkOutcome::End);
        }

        if let Err(e) = self.append_bytes(partial, &bytes).await {
            // Append went sideways; rebuild the file with a copy-based
            // combine rather than losing the partial data.
            warn!(
                "[downloader] append failed for {} ({}), using combine fallback",
                track_id, e
            );
            self.combine_fallback(partial, &bytes).await?;
        }

        let new_len = offset + bytes.len() as u64;
        self.report_progress(track_id, new_len, known_total);

        if (bytes.len() as u64) < chunk_size {
            // Undersized chunk: server gave us its tail.
            return Ok(ChunkOutcome::End);
        }
        Ok(ChunkOutcome::More)
    }

    async fn append_bytes(&self, path: &PathBuf, bytes: &[u8]) -> CacheResult<()> {
        let mut file = tokio_fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    /// Overwrite the partial file with a complete body via a temp file and
    /// atomic rename.
    async fn replace_with(&self, path: &PathBuf, bytes: &[u8]) -> CacheResult<()> {
        let temp = PathBuf::from(format!("{}.combine", path.to_string_lossy()));
        let file = tokio_fs::File::create(&temp).await?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        writer.write_all(bytes).await?;
        writer.flush().await?;
        drop(writer);
        tokio_fs::rename(&temp, path).await?;
        Ok(())
    }

    /// Binary-safe recombination: write existing content plus the new chunk
    /// to a temp file, then rename over the original.
    async fn combine_fallback(&self, path: &PathBuf, bytes: &[u8]) -> CacheResult<()> {
        let combine = PathBuf::from(format!("{}.combine", path.to_string_lossy()));
        let existing = tokio_fs::read(path).await.unwrap_or_default();

        let file = tokio_fs::File::create(&combine).await?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        writer.write_all(&existing).await?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        drop(writer);

        tokio_fs::rename(&combine, path)
            .await
            .map_err(|e| CacheError::CorruptWrite(e.to_string()))?;
        Ok(())
    }

    /// Resume a stalled or degraded download from whatever is on disk.
    /// Single-flight like `begin_cache`; a no-op when a run is already
    /// active for the track.
    pub async fn resume_from_disk(
        self: &Arc<Self>,
        track_id: &str,
        family: SourceFamily,
        url: &str,
    ) -> CacheResult<()> {
        let Some(control) = self.register(track_id) else {
            debug!("[downloader] resume skipped, {} already active", track_id);
            return Ok(());
        };
        self.store
            .merge_update(track_id, ProgressUpdate::downloading(true));

        let this = self.clone();
        let track = track_id.to_string();
        let url = url.to_string();
        tokio::spawn(async move {
            this.run_background_completion(&track, family, &url, control)
                .await;
        });
        Ok(())
    }

    fn report_progress(&self, track_id: &str, bytes: u64, known_total: Option<u64>) {
        let bands = &self.config.size_bands;
        let (estimate, percentage) = match known_total {
            // A server-declared total still reports at most 98; only a
            // confirmed end-of-stream is allowed to say 100.
            Some(total) if total > 0 => {
                let pct = ((bytes as f64 / total as f64) * 100.0)
                    .round()
                    .min(bands.max_estimated_percent);
                (total, pct)
            }
            _ => {
                let previous = self
                    .store
                    .get(track_id)
                    .map(|r| r.estimated_total_bytes)
                    .filter(|&t| t > 0);
                SizeEstimator::estimate(bands, bytes, previous)
            }
        };

        self.store.merge_update(
            track_id,
            ProgressUpdate {
                percentage: Some(percentage),
                downloaded_bytes: Some(bytes),
                estimated_total_bytes: Some(estimate),
                ..Default::default()
            },
        );
    }
}

fn ext_of(path: &PathBuf) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// "bytes 0-499/12345" -> 12345
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Sniff the first KBs of a download before trusting it. Error pages and
/// CDN interstitials arrive with HTTP 200 and an HTML body.
fn is_valid_audio_prefix(bytes: &[u8]) -> bool {
    if bytes.len() < 1024 {
        return false;
    }
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(512)]);
    if head.contains("<html") || head.contains("<HTML") || head.contains("<!DOCTYPE") {
        return false;
    }
    if head.contains("Video unavailable") || head.contains("This video is unavailable") {
        return false;
    }
    // MP4/M4A carries an ftyp box near the start; anything else gets the
    // benefit of the doubt (raw MP3/WebM have no fixed magic here).
    if bytes.len() > 8 {
        for i in 4..bytes.len().saturating_sub(4).min(64) {
            if &bytes[i..i + 4] == b"ftyp" {
                return true;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total_parses() {
        assert_eq!(parse_content_range_total("bytes 0-499/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-499/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn audio_sniff_rejects_html() {
        let mut page = b"<!DOCTYPE html><html><body>blocked</body></html>".to_vec();
        page.resize(2048, b' ');
        assert!(!is_valid_audio_prefix(&page));
    }

    #[test]
    fn audio_sniff_rejects_short_bodies() {
        assert!(!is_valid_audio_prefix(b"tiny"));
    }

    #[test]
    fn audio_sniff_accepts_mp4_ftyp() {
        let mut data = vec![0u8; 2048];
        data[4..8].copy_from_slice(b"ftyp");
        assert!(is_valid_audio_prefix(&data));
    }

    #[test]
    fn safe_id_sanitizes_path_separators() {
        assert_eq!(ProgressiveDownloader::safe_id("a/b\\c:d"), "a_b_c_d");
        assert_eq!(ProgressiveDownloader::safe_id("dQw4w9WgXcQ"), "dQw4w9WgXcQ");
    }
}
