use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{FuturesUnordered, StreamExt};
use log::{debug, info, warn};

use crate::downloader::ProgressiveDownloader;
use crate::error::{ResolveError, SourceError};
use crate::sources::{SourceFamily, SourceStrategy, StreamCandidate, TrackQuery};

/// How many strategies join the concurrent race; the rest are sequential
/// fallbacks.
const RACE_WIDTH: usize = 3;

/// Winning resolution: which strategy produced which URL, and how fast.
/// Ephemeral; never persisted.
#[derive(Debug, Clone)]
pub struct StrategyResult {
    pub url: String,
    pub latency_ms: u64,
    pub strategy_name: &'static str,
    pub family: SourceFamily,
    pub muxed: bool,
}

/// A race plus its playable answer: local cache path when the initial
/// window landed inside the race window, remote URL otherwise.
#[derive(Debug, Clone)]
pub struct RaceOutcome {
    pub result: StrategyResult,
    pub playable_url: String,
}

/// Runs strategies against a per-leg deadline: the first `RACE_WIDTH`
/// concurrently (first success to complete is the lowest-latency success),
/// then the remainder sequentially, first success wins.
pub struct StrategyRacer {
    strategies: Vec<Arc<dyn SourceStrategy>>,
    downloader: Arc<ProgressiveDownloader>,
    leg_timeout: Duration,
}

impl StrategyRacer {
    pub fn new(
        strategies: Vec<Arc<dyn SourceStrategy>>,
        downloader: Arc<ProgressiveDownloader>,
        leg_timeout: Duration,
    ) -> Self {
        Self {
            strategies,
            downloader,
            leg_timeout,
        }
    }

    async fn run_leg(
        &self,
        strategy: &Arc<dyn SourceStrategy>,
        query: &TrackQuery,
    ) -> Result<(StreamCandidate, u64), SourceError> {
        let start = Instant::now();
        match tokio::time::timeout(self.leg_timeout, strategy.resolve(query)).await {
            Ok(Ok(candidate)) => Ok((candidate, start.elapsed().as_millis() as u64)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(SourceError::Timeout(self.leg_timeout)),
        }
    }

    fn to_result(
        strategy: &Arc<dyn SourceStrategy>,
        candidate: StreamCandidate,
        latency_ms: u64,
    ) -> StrategyResult {
        StrategyResult {
            url: candidate.url,
            latency_ms,
            strategy_name: strategy.name(),
            family: strategy.family(),
            muxed: candidate.muxed,
        }
    }

    /// Produce one playable URL or fail with every attempted strategy's
    /// reason aggregated.
    pub async fn resolve(
        &self,
        query: &TrackQuery,
        hint: Option<SourceFamily>,
    ) -> Result<StrategyResult, ResolveError> {
        let mut attempts: Vec<(String, SourceError)> = Vec::new();
        let mut hinted_name: Option<&'static str> = None;

        // A source hint names the backend the track came from: try that
        // strategy first. Its failure feeds the aggregate but never aborts
        // the overall resolution.
        if let Some(family) = hint {
            if let Some(strategy) = self.strategies.iter().find(|s| s.family() == family) {
                hinted_name = Some(strategy.name());
                match self.run_leg(strategy, query).await {
                    Ok((candidate, latency)) => {
                        info!(
                            "[racer] hinted strategy {} resolved in {}ms",
                            strategy.name(),
                            latency
                        );
                        return Ok(Self::to_result(strategy, candidate, latency));
                    }
                    Err(e) => {
                        warn!(
                            "[racer] hinted strategy {} failed ({}), racing the rest",
                            strategy.name(),
                            e
                        );
                        attempts.push((strategy.name().to_string(), e));
                    }
                }
            }
        }

        let remaining: Vec<&Arc<dyn SourceStrategy>> = self
            .strategies
            .iter()
            .filter(|s| Some(s.name()) != hinted_name)
            .collect();
        let (racers, rest) = remaining.split_at(remaining.len().min(RACE_WIDTH));

        // Concurrent legs: completion order decides, so the first success
        // out of the set is also the lowest-latency one.
        let mut in_flight: FuturesUnordered<_> = racers
            .iter()
            .map(|strategy| async move {
                let outcome = self.run_leg(strategy, query).await;
                (*strategy, outcome)
            })
            .collect();

        while let Some((strategy, outcome)) = in_flight.next().await {
            match outcome {
                Ok((candidate, latency)) => {
                    info!(
                        "[racer] {} won the race in {}ms",
                        strategy.name(),
                        latency
                    );
                    return Ok(Self::to_result(strategy, candidate, latency));
                }
                Err(e) => {
                    debug!("[racer] {} lost the race: {}", strategy.name(), e);
                    attempts.push((strategy.name().to_string(), e));
                }
            }
        }

        // Sequential fallbacks: first success wins, nothing further runs.
        for strategy in rest {
            match self.run_leg(strategy, query).await {
                Ok((candidate, latency)) => {
                    info!(
                        "[racer] fallback {} resolved in {}ms",
                        strategy.name(),
                        latency
                    );
                    return Ok(Self::to_result(strategy, candidate, latency));
                }
                Err(e) => {
                    debug!("[racer] fallback {} failed: {}", strategy.name(), e);
                    attempts.push((strategy.name().to_string(), e));
                }
            }
        }

        Err(ResolveError::new(attempts))
    }

    /// Resolve and immediately prime the cache. Relay streams are handed to
    /// the downloader before returning so the caller gets a locally playable
    /// path whenever the initial window lands in time; other families start
    /// caching detached and play from the remote URL meanwhile.
    pub async fn resolve_playable(
        &self,
        track_id: &str,
        query: &TrackQuery,
        hint: Option<SourceFamily>,
    ) -> Result<RaceOutcome, ResolveError> {
        let result = self.resolve(query, hint).await?;

        let playable_url = if result.family == SourceFamily::Relay {
            self.downloader
                .begin_cache(track_id, result.family, &result.url)
                .await
        } else {
            let downloader = self.downloader.clone();
            let track = track_id.to_string();
            let family = result.family;
            let url = result.url.clone();
            tokio::spawn(async move {
                downloader.begin_cache(&track, family, &url).await;
            });
            result.url.clone()
        };

        Ok(RaceOutcome {
            result,
            playable_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::progress::CacheProgressStore;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStrategy {
        name: &'static str,
        family: SourceFamily,
        delay: Duration,
        outcome: Result<String, fn() -> SourceError>,
        calls: AtomicUsize,
    }

    impl FakeStrategy {
        fn ok(name: &'static str, family: SourceFamily, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                name,
                family,
                delay: Duration::from_millis(delay_ms),
                outcome: Ok(format!("https://cdn.example/{}", name)),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(
            name: &'static str,
            family: SourceFamily,
            delay_ms: u64,
            err: fn() -> SourceError,
        ) -> Arc<Self> {
            Arc::new(Self {
                name,
                family,
                delay: Duration::from_millis(delay_ms),
                outcome: Err(err),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl SourceStrategy for FakeStrategy {
        fn name(&self) -> &'static str {
            self.name
        }

        fn family(&self) -> SourceFamily {
            self.family
        }

        fn resolve<'a>(
            &'a self,
            _query: &'a TrackQuery,
        ) -> BoxFuture<'a, Result<StreamCandidate, SourceError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                match &self.outcome {
                    Ok(url) => Ok(StreamCandidate {
                        url: url.clone(),
                        mime: None,
                        bitrate: None,
                        muxed: false,
                    }),
                    Err(make) => Err(make()),
                }
            })
        }
    }

    fn racer_with(strategies: Vec<Arc<dyn SourceStrategy>>, leg_ms: u64) -> StrategyRacer {
        let config = Arc::new(EngineConfig::default());
        let store = Arc::new(CacheProgressStore::new());
        let downloader = Arc::new(ProgressiveDownloader::new(config, store));
        StrategyRacer::new(strategies, downloader, Duration::from_millis(leg_ms))
    }

    #[tokio::test]
    async fn fastest_success_wins_the_race() {
        let a = FakeStrategy::ok("a", SourceFamily::Relay, 500);
        let b = FakeStrategy::ok("b", SourceFamily::Relay, 50);
        let c = FakeStrategy::failing("c", SourceFamily::Catalog, 10_000, || {
            SourceError::ServerError("down".into())
        });
        let racer = racer_with(vec![a, b, c], 1000);

        let result = racer
            .resolve(&TrackQuery::new("track-1"), None)
            .await
            .unwrap();
        assert_eq!(result.strategy_name, "b");
        assert_eq!(result.url, "https://cdn.example/b");
        assert!(result.latency_ms < 400);
    }

    #[tokio::test]
    async fn sequential_fallback_after_race_fails() {
        let fail = || SourceError::ServerError("down".into());
        let a = FakeStrategy::failing("a", SourceFamily::Relay, 10, fail);
        let b = FakeStrategy::failing("b", SourceFamily::Relay, 10, fail);
        let c = FakeStrategy::failing("c", SourceFamily::Catalog, 10, fail);
        let d = FakeStrategy::ok("d", SourceFamily::Social, 10);
        let e = FakeStrategy::ok("e", SourceFamily::Relay, 10);
        let e_probe = e.clone();
        let racer = racer_with(vec![a, b, c, d, e], 1000);

        let result = racer
            .resolve(&TrackQuery::new("track-1"), None)
            .await
            .unwrap();
        assert_eq!(result.strategy_name, "d");
        // first fallback success wins; nothing after it runs
        assert_eq!(e_probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hint_failure_does_not_abort_resolution() {
        let social = FakeStrategy::failing("social", SourceFamily::Social, 10, || {
            SourceError::NotFound("gone".into())
        });
        let relay = FakeStrategy::ok("relay", SourceFamily::Relay, 10);
        let social_probe = social.clone();
        let racer = racer_with(vec![relay, social], 1000);

        let result = racer
            .resolve(&TrackQuery::new("track-1"), Some(SourceFamily::Social))
            .await
            .unwrap();
        assert_eq!(result.strategy_name, "relay");
        // hinted strategy ran exactly once, not again in the race
        assert_eq!(social_probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn total_failure_aggregates_every_reason() {
        let fail_server = || SourceError::ServerError("boom".into());
        let a = FakeStrategy::failing("a", SourceFamily::Relay, 10, fail_server);
        let b = FakeStrategy::failing("b", SourceFamily::Catalog, 10, || {
            SourceError::NotFound("missing".into())
        });
        let c = FakeStrategy::failing("c", SourceFamily::Social, 10, || {
            SourceError::Blocked("wall".into())
        });
        let racer = racer_with(vec![a, b, c], 1000);

        let err = racer
            .resolve(&TrackQuery::new("track-1"), None)
            .await
            .unwrap_err();
        assert_eq!(err.attempts.len(), 3);
        let text = err.to_string();
        assert!(text.contains("a:"));
        assert!(text.contains("not_found"));
        assert!(text.contains("blocked"));
    }

    #[tokio::test]
    async fn timeout_abandons_slow_leg() {
        let slow = FakeStrategy::ok("slow", SourceFamily::Relay, 5_000);
        let racer = racer_with(vec![slow], 100);

        let err = racer
            .resolve(&TrackQuery::new("track-1"), None)
            .await
            .unwrap_err();
        assert!(matches!(err.attempts[0].1, SourceError::Timeout(_)));
    }
}
