//! Stream resolution and progressive caching for free music backends.
//!
//! The engine races several independent resolution strategies (relay
//! mirrors, a commercial-catalog proxy, a social-audio platform, an embed
//! scrape) to find a working stream URL, then builds a durable local copy
//! of the stream incrementally while playback is already underway. Stalled
//! downloads are detected and resumed from the last byte on disk.
//!
//! Everything hangs off an explicitly constructed [`CacheEngine`]:
//!
//! ```no_run
//! use tunestream::{CacheEngine, EngineConfig, SourceFamily};
//!
//! # async fn demo() {
//! let engine = CacheEngine::new(EngineConfig::default());
//! let url = engine
//!     .resolve_and_cache("dQw4w9WgXcQ", SourceFamily::Relay, None, None)
//!     .await
//!     .expect("every strategy failed");
//! // hand `url` (file:// or https://) to the player
//! let info = engine.get_cache_info("dQw4w9WgXcQ");
//! println!("cached: {:.0}%", info.percentage);
//! # }
//! ```

pub mod config;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod progress;
pub mod proxy;
pub mod racer;
pub mod sources;
pub mod stall;

pub use config::{EngineConfig, MirrorSnapshot, SizeBands};
pub use downloader::ProgressiveDownloader;
pub use engine::{CacheEngine, CacheInfo, CacheStats};
pub use error::{CacheError, ResolveError, SourceError};
pub use progress::{CacheProgressRecord, CacheProgressStore, ProgressUpdate, SizeEstimator};
pub use proxy::{BlockingDetector, ProxyRotator, ResponseClass};
pub use racer::{RaceOutcome, StrategyRacer, StrategyResult};
pub use sources::{SourceFamily, SourceStrategy, StreamCandidate, TrackQuery};
pub use stall::StallMonitor;
