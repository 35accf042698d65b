use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use scraper::{Html, Selector};
use serde::Deserialize;

use crate::config::EngineConfig;
use crate::error::{SourceError, SourceResult};
use crate::proxy::{fetch_json, fetch_text, ProxyRotator};

/// Backend family a resolved stream came from. Decides which cache
/// subdirectory and file extensions apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFamily {
    Relay,
    Catalog,
    Social,
}

impl SourceFamily {
    pub fn cache_dir_name(&self) -> &'static str {
        match self {
            SourceFamily::Relay => "relay-cache",
            SourceFamily::Catalog => "catalog-cache",
            SourceFamily::Social => "social-cache",
        }
    }

    /// Extensions probed, in order, when looking for an existing cache file.
    /// There is no index file; presence on disk is the truth.
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            SourceFamily::Relay => &["m4a", "webm"],
            SourceFamily::Catalog => &["m4a", "mp3"],
            SourceFamily::Social => &["mp3", "m4a"],
        }
    }

    pub fn default_extension(&self) -> &'static str {
        self.extensions()[0]
    }
}

/// What the caller is asking to resolve. Only `id` is required; the hints
/// feed the social-platform search fallback.
#[derive(Debug, Clone)]
pub struct TrackQuery {
    pub id: String,
    pub title_hint: Option<String>,
    pub artist_hint: Option<String>,
}

impl TrackQuery {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title_hint: None,
            artist_hint: None,
        }
    }
}

/// Canonical normalized stream shape every backend adapter produces.
/// `muxed` flags a combined audio+video stream the player has to demux
/// itself; strategies prefer audio-only but degrade rather than fail.
#[derive(Debug, Clone)]
pub struct StreamCandidate {
    pub url: String,
    pub mime: Option<String>,
    pub bitrate: Option<u32>,
    pub muxed: bool,
}

/// One backend-specific way of turning a track id into a playable URL.
/// Implementations must tolerate individual mirror instances being dead and
/// never let one bad instance block trying the next.
pub trait SourceStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn family(&self) -> SourceFamily;
    fn resolve<'a>(&'a self, query: &'a TrackQuery) -> BoxFuture<'a, SourceResult<StreamCandidate>>;
}

// ---------------------------------------------------------------------------
// Relay mirror family A (Piped-style API)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct PipedStream {
    url: String,
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    bitrate: Option<u32>,
    #[serde(rename = "videoOnly", default)]
    video_only: bool,
}

#[derive(Deserialize)]
struct PipedStreamsPayload {
    #[serde(rename = "audioStreams", default)]
    audio_streams: Vec<PipedStream>,
    #[serde(rename = "videoStreams", default)]
    video_streams: Vec<PipedStream>,
}

/// Normalize a Piped `/streams/{id}` payload. Rejects payloads that match
/// neither known field set instead of guessing.
fn adapt_piped(value: serde_json::Value) -> SourceResult<StreamCandidate> {
    let payload: PipedStreamsPayload = serde_json::from_value(value)
        .map_err(|e| SourceError::ServerError(format!("unrecognized piped payload: {}", e)))?;

    if let Some(best) = payload
        .audio_streams
        .iter()
        .max_by_key(|s| s.bitrate.unwrap_or(0))
    {
        return Ok(StreamCandidate {
            url: best.url.clone(),
            mime: best.mime_type.clone(),
            bitrate: best.bitrate,
            muxed: false,
        });
    }

    // No audio-only variant: fall back to a muxed stream rather than failing.
    if let Some(muxed) = payload.video_streams.iter().find(|s| !s.video_only) {
        warn!("[sources] piped offered no audio-only stream, passing muxed variant through");
        return Ok(StreamCandidate {
            url: muxed.url.clone(),
            mime: muxed.mime_type.clone(),
            bitrate: muxed.bitrate,
            muxed: true,
        });
    }

    Err(SourceError::NotFound("piped payload had no usable streams".into()))
}

pub struct PipedStrategy {
    config: Arc<EngineConfig>,
    client: reqwest::Client,
    rotator: Arc<ProxyRotator>,
}

impl PipedStrategy {
    pub fn new(config: Arc<EngineConfig>, client: reqwest::Client, rotator: Arc<ProxyRotator>) -> Self {
        Self { config, client, rotator }
    }

    async fn resolve_inner(&self, query: &TrackQuery) -> SourceResult<StreamCandidate> {
        let snapshot = self.config.relay_snapshot();
        let mut last_err = SourceError::ServerError("no piped instances configured".into());

        for instance in &snapshot.piped {
            let url = format!("{}/streams/{}", instance, query.id);
            match fetch_json(&self.client, &self.rotator, &url, self.config.fetch_timeout).await {
                Ok(value) => match adapt_piped(value) {
                    Ok(candidate) => {
                        debug!("[sources] piped hit via {}", instance);
                        return Ok(candidate);
                    }
                    Err(e @ SourceError::NotFound(_)) => return Err(e),
                    Err(e) => last_err = e,
                },
                Err(e @ SourceError::NotFound(_)) => return Err(e),
                Err(e) => {
                    debug!("[sources] piped instance {} failed: {}", instance, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

impl SourceStrategy for PipedStrategy {
    fn name(&self) -> &'static str {
        "piped"
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Relay
    }

    fn resolve<'a>(&'a self, query: &'a TrackQuery) -> BoxFuture<'a, SourceResult<StreamCandidate>> {
        Box::pin(self.resolve_inner(query))
    }
}

// ---------------------------------------------------------------------------
// Relay mirror family B (Invidious-style API)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct InvidiousFormat {
    url: String,
    #[serde(rename = "type")]
    mime_type: Option<String>,
    bitrate: Option<serde_json::Value>,
    itag: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct InvidiousVideoPayload {
    #[serde(rename = "adaptiveFormats", default)]
    adaptive_formats: Vec<InvidiousFormat>,
    #[serde(rename = "formatStreams", default)]
    format_streams: Vec<InvidiousFormat>,
}

// Instances serialize bitrate/itag as either numbers or strings.
fn loose_u32(v: &Option<serde_json::Value>) -> Option<u32> {
    match v {
        Some(serde_json::Value::Number(n)) => n.as_u64().map(|x| x as u32),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

// Audio-only itags on the upstream CDN; substituting one into a muxed URL
// often yields the audio rendition of the same resource.
const AUDIO_ITAGS: &[u32] = &[251, 140, 250, 249];

fn substitute_itag(url: &str, itag: u32) -> Option<String> {
    let pos = url.find("itag=")?;
    let value_start = pos + "itag=".len();
    let rest = &url[value_start..];
    let tail = rest.find('&').map(|i| &rest[i..]).unwrap_or("");
    Some(format!("{}{}{}", &url[..value_start], itag, tail))
}

fn adapt_invidious(value: serde_json::Value) -> SourceResult<StreamCandidate> {
    let payload: InvidiousVideoPayload = serde_json::from_value(value)
        .map_err(|e| SourceError::ServerError(format!("unrecognized invidious payload: {}", e)))?;

    let audio = payload
        .adaptive_formats
        .iter()
        .filter(|f| {
            f.mime_type
                .as_deref()
                .map(|m| m.starts_with("audio/"))
                .unwrap_or(false)
        })
        .max_by_key(|f| loose_u32(&f.bitrate).unwrap_or(0));

    if let Some(best) = audio {
        return Ok(StreamCandidate {
            url: best.url.clone(),
            mime: best.mime_type.clone(),
            bitrate: loose_u32(&best.bitrate),
            muxed: false,
        });
    }

    // Muxed-only: try rewriting the itag parameter toward an audio rendition
    // before passing the combined stream through.
    if let Some(muxed) = payload.format_streams.first() {
        if loose_u32(&muxed.itag).is_some() {
            for itag in AUDIO_ITAGS {
                if let Some(rewritten) = substitute_itag(&muxed.url, *itag) {
                    debug!("[sources] invidious muxed-only, substituted itag {}", itag);
                    return Ok(StreamCandidate {
                        url: rewritten,
                        mime: None,
                        bitrate: None,
                        muxed: false,
                    });
                }
            }
        }
        warn!("[sources] invidious offered only muxed streams, passing through");
        return Ok(StreamCandidate {
            url: muxed.url.clone(),
            mime: muxed.mime_type.clone(),
            bitrate: loose_u32(&muxed.bitrate),
            muxed: true,
        });
    }

    Err(SourceError::NotFound("invidious payload had no usable streams".into()))
}

pub struct InvidiousStrategy {
    config: Arc<EngineConfig>,
    client: reqwest::Client,
    rotator: Arc<ProxyRotator>,
}

impl InvidiousStrategy {
    pub fn new(config: Arc<EngineConfig>, client: reqwest::Client, rotator: Arc<ProxyRotator>) -> Self {
        Self { config, client, rotator }
    }

    async fn resolve_inner(&self, query: &TrackQuery) -> SourceResult<StreamCandidate> {
        let snapshot = self.config.relay_snapshot();
        let mut last_err = SourceError::ServerError("no invidious instances configured".into());

        for instance in &snapshot.invidious {
            let url = format!("{}/api/v1/videos/{}", instance, query.id);
            match fetch_json(&self.client, &self.rotator, &url, self.config.fetch_timeout).await {
                Ok(value) => match adapt_invidious(value) {
                    Ok(candidate) => {
                        debug!("[sources] invidious hit via {}", instance);
                        return Ok(candidate);
                    }
                    Err(e @ SourceError::NotFound(_)) => return Err(e),
                    Err(e) => last_err = e,
                },
                Err(e @ SourceError::NotFound(_)) => return Err(e),
                Err(e) => {
                    debug!("[sources] invidious instance {} failed: {}", instance, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }
}

impl SourceStrategy for InvidiousStrategy {
    fn name(&self) -> &'static str {
        "invidious"
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Relay
    }

    fn resolve<'a>(&'a self, query: &'a TrackQuery) -> BoxFuture<'a, SourceResult<StreamCandidate>> {
        Box::pin(self.resolve_inner(query))
    }
}

// ---------------------------------------------------------------------------
// Commercial-catalog proxy
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CatalogDownload {
    quality: Option<String>,
    url: String,
}

#[derive(Deserialize)]
struct CatalogSong {
    #[serde(rename = "downloadUrl", default)]
    download_url: Vec<CatalogDownload>,
}

fn adapt_catalog(value: serde_json::Value) -> SourceResult<StreamCandidate> {
    // The proxy wraps results either as {"data":[...]} or
    // {"data":{"results":[...]}} depending on the endpoint revision.
    let songs = value
        .get("data")
        .map(|d| {
            if let Some(arr) = d.as_array() {
                arr.clone()
            } else {
                d.get("results")
                    .and_then(|r| r.as_array())
                    .cloned()
                    .unwrap_or_default()
            }
        })
        .unwrap_or_default();

    let Some(first) = songs.into_iter().next() else {
        return Err(SourceError::NotFound("catalog proxy returned no songs".into()));
    };

    let song: CatalogSong = serde_json::from_value(first)
        .map_err(|e| SourceError::ServerError(format!("unrecognized catalog payload: {}", e)))?;

    // Qualities are labeled like "320kbps"; take the numerically highest.
    let best = song
        .download_url
        .iter()
        .max_by_key(|d| {
            d.quality
                .as_deref()
                .and_then(|q| q.trim_end_matches("kbps").parse::<u32>().ok())
                .unwrap_or(0)
        })
        .ok_or_else(|| SourceError::NotFound("catalog song had no download URLs".into()))?;

    Ok(StreamCandidate {
        url: best.url.clone(),
        mime: Some("audio/mp4".into()),
        bitrate: best
            .quality
            .as_deref()
            .and_then(|q| q.trim_end_matches("kbps").parse().ok()),
        muxed: false,
    })
}

pub struct CatalogStrategy {
    config: Arc<EngineConfig>,
    client: reqwest::Client,
    rotator: Arc<ProxyRotator>,
}

impl CatalogStrategy {
    pub fn new(config: Arc<EngineConfig>, client: reqwest::Client, rotator: Arc<ProxyRotator>) -> Self {
        Self { config, client, rotator }
    }

    async fn resolve_inner(&self, query: &TrackQuery) -> SourceResult<StreamCandidate> {
        let url = format!("{}/api/songs/{}", self.config.catalog_base, query.id);
        let value = fetch_json(&self.client, &self.rotator, &url, self.config.fetch_timeout).await?;
        adapt_catalog(value)
    }
}

impl SourceStrategy for CatalogStrategy {
    fn name(&self) -> &'static str {
        "catalog"
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Catalog
    }

    fn resolve<'a>(&'a self, query: &'a TrackQuery) -> BoxFuture<'a, SourceResult<StreamCandidate>> {
        Box::pin(self.resolve_inner(query))
    }
}

// ---------------------------------------------------------------------------
// Social-audio platform (direct resolve -> widget resolve -> search)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct SocialTranscoding {
    url: String,
    format: Option<SocialTranscodingFormat>,
}

#[derive(Deserialize)]
struct SocialTranscodingFormat {
    protocol: Option<String>,
    mime_type: Option<String>,
}

#[derive(Deserialize)]
struct SocialMedia {
    #[serde(default)]
    transcodings: Vec<SocialTranscoding>,
}

#[derive(Deserialize)]
struct SocialTrack {
    id: Option<u64>,
    media: Option<SocialMedia>,
}

pub struct SocialStrategy {
    config: Arc<EngineConfig>,
    client: reqwest::Client,
    rotator: Arc<ProxyRotator>,
}

impl SocialStrategy {
    pub fn new(config: Arc<EngineConfig>, client: reqwest::Client, rotator: Arc<ProxyRotator>) -> Self {
        Self { config, client, rotator }
    }

    /// Pick the progressive (non-HLS) transcoding and dereference it into the
    /// short-lived CDN URL.
    async fn transcoding_to_url(&self, track: &SocialTrack) -> SourceResult<StreamCandidate> {
        let media = track
            .media
            .as_ref()
            .ok_or_else(|| SourceError::NotFound("social track carries no media".into()))?;

        let transcoding = media
            .transcodings
            .iter()
            .find(|t| {
                t.format
                    .as_ref()
                    .and_then(|f| f.protocol.as_deref())
                    .map(|p| p == "progressive")
                    .unwrap_or(false)
            })
            .or_else(|| media.transcodings.first())
            .ok_or_else(|| SourceError::NotFound("social track has no transcodings".into()))?;

        let deref_url = format!(
            "{}?client_id={}",
            transcoding.url, self.config.social_client_id
        );
        let value =
            fetch_json(&self.client, &self.rotator, &deref_url, self.config.fetch_timeout).await?;
        let url = value
            .get("url")
            .and_then(|u| u.as_str())
            .ok_or_else(|| {
                SourceError::ServerError("unrecognized transcoding payload (no url field)".into())
            })?;

        Ok(StreamCandidate {
            url: url.to_string(),
            mime: transcoding
                .format
                .as_ref()
                .and_then(|f| f.mime_type.clone()),
            bitrate: None,
            muxed: false,
        })
    }

    async fn resolve_direct(&self, id: &str) -> SourceResult<StreamCandidate> {
        let url = format!(
            "{}/tracks/{}?client_id={}",
            self.config.social_api_base, id, self.config.social_client_id
        );
        let value = fetch_json(&self.client, &self.rotator, &url, self.config.fetch_timeout).await?;
        let track: SocialTrack = serde_json::from_value(value)
            .map_err(|e| SourceError::ServerError(format!("unrecognized social payload: {}", e)))?;
        self.transcoding_to_url(&track).await
    }

    async fn resolve_widget(&self, id: &str) -> SourceResult<StreamCandidate> {
        // The widget endpoint accepts an anonymous client context and often
        // works when the main API rejects our client id.
        let url = format!(
            "{}/resolve?url={}&format=json&client_id={}",
            self.config.social_widget_base,
            urlencoding::encode(&format!("https://soundcloud.com/tracks/{}", id)),
            self.config.social_client_id
        );
        let value = fetch_json(&self.client, &self.rotator, &url, self.config.fetch_timeout).await?;
        let track: SocialTrack = serde_json::from_value(value)
            .map_err(|e| SourceError::ServerError(format!("unrecognized widget payload: {}", e)))?;
        self.transcoding_to_url(&track).await
    }

    async fn resolve_search(&self, query: &TrackQuery) -> SourceResult<StreamCandidate> {
        let (Some(title), artist) = (query.title_hint.as_deref(), query.artist_hint.as_deref())
        else {
            return Err(SourceError::NotFound(
                "no title hint available for social search".into(),
            ));
        };
        let text = match artist {
            Some(a) => format!("{} {}", title, a),
            None => title.to_string(),
        };
        let url = format!(
            "{}/search/tracks?q={}&limit=3&client_id={}",
            self.config.social_api_base,
            urlencoding::encode(&text),
            self.config.social_client_id
        );
        let value = fetch_json(&self.client, &self.rotator, &url, self.config.fetch_timeout).await?;
        let collection = value
            .get("collection")
            .and_then(|c| c.as_array())
            .cloned()
            .ok_or_else(|| {
                SourceError::ServerError("unrecognized social search payload".into())
            })?;

        for item in collection {
            if let Ok(track) = serde_json::from_value::<SocialTrack>(item) {
                if track.id.is_some() {
                    if let Ok(candidate) = self.transcoding_to_url(&track).await {
                        return Ok(candidate);
                    }
                }
            }
        }
        Err(SourceError::NotFound(format!(
            "social search found no playable match for '{}'",
            text
        )))
    }

    async fn resolve_inner(&self, query: &TrackQuery) -> SourceResult<StreamCandidate> {
        match self.resolve_direct(&query.id).await {
            Ok(candidate) => return Ok(candidate),
            Err(e) => debug!("[sources] social direct resolve failed: {}", e),
        }
        match self.resolve_widget(&query.id).await {
            Ok(candidate) => return Ok(candidate),
            Err(e) => debug!("[sources] social widget resolve failed: {}", e),
        }
        info!("[sources] social falling back to title/artist search");
        self.resolve_search(query).await
    }
}

impl SourceStrategy for SocialStrategy {
    fn name(&self) -> &'static str {
        "social"
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Social
    }

    fn resolve<'a>(&'a self, query: &'a TrackQuery) -> BoxFuture<'a, SourceResult<StreamCandidate>> {
        Box::pin(self.resolve_inner(query))
    }
}

// ---------------------------------------------------------------------------
// Embed page scrape (last resort)
// ---------------------------------------------------------------------------

pub struct EmbedScrapeStrategy {
    config: Arc<EngineConfig>,
    client: reqwest::Client,
    rotator: Arc<ProxyRotator>,
}

impl EmbedScrapeStrategy {
    pub fn new(config: Arc<EngineConfig>, client: reqwest::Client, rotator: Arc<ProxyRotator>) -> Self {
        Self { config, client, rotator }
    }

    /// Extract the player-response JSON blob embedded in a script tag.
    fn extract_player_response(page: &str) -> Option<serde_json::Value> {
        let doc = Html::parse_document(page);
        let selector = Selector::parse("script").ok()?;

        for script in doc.select(&selector) {
            let text: String = script.text().collect();
            let Some(start_marker) = text.find("ytInitialPlayerResponse") else {
                continue;
            };
            let json_start = text[start_marker..].find('{')? + start_marker;

            // Walk to the matching closing brace; the blob is followed by
            // unrelated script statements.
            let bytes = text.as_bytes();
            let mut depth = 0usize;
            let mut in_string = false;
            let mut escaped = false;
            for (offset, &b) in bytes[json_start..].iter().enumerate() {
                match b {
                    b'\\' if in_string => escaped = !escaped,
                    b'"' if !escaped => in_string = !in_string,
                    b'{' if !in_string => depth += 1,
                    b'}' if !in_string => {
                        depth -= 1;
                        if depth == 0 {
                            let blob = &text[json_start..=json_start + offset];
                            return serde_json::from_str(blob).ok();
                        }
                    }
                    _ => escaped = false,
                }
                if b != b'\\' {
                    escaped = false;
                }
            }
        }
        None
    }

    async fn resolve_inner(&self, query: &TrackQuery) -> SourceResult<StreamCandidate> {
        let url = format!("https://www.youtube-nocookie.com/embed/{}", query.id);
        let page = fetch_text(&self.client, &self.rotator, &url, self.config.fetch_timeout).await?;

        let player = Self::extract_player_response(&page).ok_or_else(|| {
            SourceError::ServerError("embed page carried no player response".into())
        })?;

        let formats = player
            .get("streamingData")
            .and_then(|s| s.get("adaptiveFormats"))
            .and_then(|f| f.as_array())
            .cloned()
            .unwrap_or_default();

        let audio = formats
            .iter()
            .filter(|f| {
                f.get("mimeType")
                    .and_then(|m| m.as_str())
                    .map(|m| m.starts_with("audio/"))
                    .unwrap_or(false)
            })
            .max_by_key(|f| f.get("bitrate").and_then(|b| b.as_u64()).unwrap_or(0));

        let Some(format) = audio else {
            return Err(SourceError::NotFound(
                "embed player response had no audio formats".into(),
            ));
        };
        let Some(stream_url) = format.get("url").and_then(|u| u.as_str()) else {
            // Ciphered formats carry signatureCipher instead of a plain URL;
            // out of reach for a scrape-level fallback.
            return Err(SourceError::Blocked(
                "embed formats are ciphered, scrape cannot recover a URL".into(),
            ));
        };

        Ok(StreamCandidate {
            url: stream_url.to_string(),
            mime: format
                .get("mimeType")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string()),
            bitrate: format
                .get("bitrate")
                .and_then(|b| b.as_u64())
                .map(|b| b as u32),
            muxed: false,
        })
    }
}

impl SourceStrategy for EmbedScrapeStrategy {
    fn name(&self) -> &'static str {
        "embed-scrape"
    }

    fn family(&self) -> SourceFamily {
        SourceFamily::Relay
    }

    fn resolve<'a>(&'a self, query: &'a TrackQuery) -> BoxFuture<'a, SourceResult<StreamCandidate>> {
        Box::pin(self.resolve_inner(query))
    }
}

/// Default strategy registration order. The first three participate in the
/// concurrent race; the rest are sequential fallbacks.
pub fn default_strategies(
    config: Arc<EngineConfig>,
    client: reqwest::Client,
    rotator: Arc<ProxyRotator>,
) -> Vec<Arc<dyn SourceStrategy>> {
    vec![
        Arc::new(PipedStrategy::new(config.clone(), client.clone(), rotator.clone())),
        Arc::new(InvidiousStrategy::new(config.clone(), client.clone(), rotator.clone())),
        Arc::new(CatalogStrategy::new(config.clone(), client.clone(), rotator.clone())),
        Arc::new(SocialStrategy::new(config.clone(), client.clone(), rotator.clone())),
        Arc::new(EmbedScrapeStrategy::new(config, client, rotator)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn piped_adapter_picks_highest_bitrate_audio() {
        let value = json!({
            "audioStreams": [
                {"url": "https://cdn/low", "mimeType": "audio/mp4", "bitrate": 64000},
                {"url": "https://cdn/high", "mimeType": "audio/webm", "bitrate": 160000}
            ],
            "videoStreams": []
        });
        let candidate = adapt_piped(value).unwrap();
        assert_eq!(candidate.url, "https://cdn/high");
        assert!(!candidate.muxed);
    }

    #[test]
    fn piped_adapter_degrades_to_muxed() {
        let value = json!({
            "audioStreams": [],
            "videoStreams": [
                {"url": "https://cdn/muxed", "mimeType": "video/mp4", "bitrate": 500000, "videoOnly": false}
            ]
        });
        let candidate = adapt_piped(value).unwrap();
        assert_eq!(candidate.url, "https://cdn/muxed");
        assert!(candidate.muxed);
    }

    #[test]
    fn piped_adapter_rejects_unknown_shape() {
        let value = json!({"videos": [{"something": 1}], "audioStreams": "nope"});
        assert!(adapt_piped(value).is_err());
    }

    #[test]
    fn invidious_adapter_substitutes_audio_itag() {
        let value = json!({
            "adaptiveFormats": [],
            "formatStreams": [
                {"url": "https://cdn/video?itag=18&sig=abc", "type": "video/mp4", "itag": "18"}
            ]
        });
        let candidate = adapt_invidious(value).unwrap();
        assert_eq!(candidate.url, "https://cdn/video?itag=251&sig=abc");
        assert!(!candidate.muxed);
    }

    #[test]
    fn invidious_adapter_prefers_adaptive_audio() {
        let value = json!({
            "adaptiveFormats": [
                {"url": "https://cdn/a", "type": "audio/webm; codecs=opus", "bitrate": "140000", "itag": "251"},
                {"url": "https://cdn/v", "type": "video/mp4", "bitrate": "900000", "itag": "137"}
            ],
            "formatStreams": []
        });
        let candidate = adapt_invidious(value).unwrap();
        assert_eq!(candidate.url, "https://cdn/a");
    }

    #[test]
    fn catalog_adapter_takes_highest_quality() {
        let value = json!({
            "data": [{
                "downloadUrl": [
                    {"quality": "96kbps", "url": "https://cat/96"},
                    {"quality": "320kbps", "url": "https://cat/320"}
                ]
            }]
        });
        let candidate = adapt_catalog(value).unwrap();
        assert_eq!(candidate.url, "https://cat/320");
        assert_eq!(candidate.bitrate, Some(320));
    }

    #[test]
    fn catalog_adapter_handles_results_envelope() {
        let value = json!({
            "data": {"results": [{
                "downloadUrl": [{"quality": "160kbps", "url": "https://cat/160"}]
            }]}
        });
        assert_eq!(adapt_catalog(value).unwrap().url, "https://cat/160");
    }

    #[test]
    fn catalog_adapter_rejects_empty() {
        let value = json!({"data": []});
        assert!(matches!(adapt_catalog(value), Err(SourceError::NotFound(_))));
    }

    #[test]
    fn embed_scrape_extracts_player_blob() {
        let page = r#"<html><body><script>
            var ytInitialPlayerResponse = {"streamingData":{"adaptiveFormats":[
                {"url":"https://cdn/audio","mimeType":"audio/mp4","bitrate":128000}
            ]}};var other = 1;
        </script></body></html>"#;
        let blob = EmbedScrapeStrategy::extract_player_response(page).unwrap();
        assert!(blob.get("streamingData").is_some());
    }
}
