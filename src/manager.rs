// src/manager.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::downloader::{FetchError, SegmentProber, Transport};
use crate::fetcher::ManifestFetcher;
use crate::resolver::{EncodingResolver, ResolveError};
use crate::retry::{FailureClass, Retryable};
use crate::store::{EncodingStore, StateError};

/// Outcome of one segment-size pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Videos lacking encodings when the pass started.
    pub pending: usize,
    pub attempted: usize,
    pub persisted: usize,
    pub failed: usize,
    pub deadline_reached: bool,
    pub cancelled: bool,
}

/// Drives the segment-size pass over every video that has no encodings yet.
pub struct EncodingManager {
    resolver: EncodingResolver,
    horizon: Duration,
    shutdown: CancellationToken,
}

impl EncodingManager {
    pub fn new(resolver: EncodingResolver, horizon: Duration) -> Self {
        Self {
            resolver,
            horizon,
            shutdown: CancellationToken::new(),
        }
    }

    /// Wires fetcher, prober and resolver from `config` over one shared transport.
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>) -> Self {
        let retry = Arc::new(config.retry_policies());
        let fetcher = ManifestFetcher::new(
            transport.clone(),
            retry.clone(),
            config.api_url.clone(),
            config.format_priority.clone(),
            config.excluded_codecs.clone(),
        );
        let prober = SegmentProber::new(transport, retry, config.probe_timeout());
        let resolver = EncodingResolver::new(fetcher, prober, config.concurrency_limit);
        Self::new(resolver, config.run_horizon())
    }

    /// Stops the pass between two videos once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub async fn run(&self, store: &dyn EncodingStore) -> Result<RunSummary, StateError> {
        self.run_until(store, Instant::now() + self.horizon).await
    }

    /// Resolves and stores encodings one video at a time until every pending
    /// video was tried or `deadline` passes. A video's failure never stops the
    /// pass; only listing the pending videos can fail it.
    pub async fn run_until(
        &self,
        store: &dyn EncodingStore,
        deadline: Instant,
    ) -> Result<RunSummary, StateError> {
        let ids = store.ids_lacking_encodings().await?;
        let mut summary = RunSummary {
            pending: ids.len(),
            ..RunSummary::default()
        };
        info!(pending = summary.pending, "starting segment size pass");

        for video_id in &ids {
            if Instant::now() >= deadline {
                summary.deadline_reached = true;
                info!(
                    remaining = summary.pending - summary.attempted,
                    "run horizon reached, stopping"
                );
                break;
            }
            if self.shutdown.is_cancelled() {
                summary.cancelled = true;
                info!("shutdown requested, stopping");
                break;
            }

            summary.attempted += 1;
            match self.resolver.resolve(video_id).await {
                Ok(set) => match store.persist(&set).await {
                    Ok(()) => summary.persisted += 1,
                    Err(e) => {
                        summary.failed += 1;
                        warn!(
                            video_id = %video_id,
                            class = %e.failure_class(),
                            "failed to store encodings: {e}"
                        );
                    }
                },
                Err(e) => {
                    summary.failed += 1;
                    log_failure(video_id, &e);
                }
            }
        }

        info!(
            attempted = summary.attempted,
            persisted = summary.persisted,
            failed = summary.failed,
            "segment size pass finished"
        );
        Ok(summary)
    }
}

fn log_failure(video_id: &str, error: &ResolveError) {
    let class = error.failure_class();
    match (error, class) {
        (ResolveError::Fetch(FetchError::Response { status, url }), _) => warn!(
            video_id,
            %class,
            "[{video_id}] failed with {status} on {url} - exhausted retries"
        ),
        (ResolveError::Fetch(e), FailureClass::Connection) => warn!(
            video_id,
            %class,
            "[{video_id}] failed with {e} - exhausted retries"
        ),
        (ResolveError::Fetch(_), FailureClass::Timeout) => {
            warn!(video_id, %class, "[{video_id}] timed out - exhausted retries")
        }
        _ => warn!(video_id, %class, "[{video_id}] failed because {error}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::test_support::{serve_simple_video, serve_video, FakeTransport, MemoryStore, Reply};

    fn manager(transport: Arc<FakeTransport>, horizon: Duration) -> EncodingManager {
        let config = Config {
            api_url: "https://api.test".to_string(),
            format_priority: vec!["dash".to_string()],
            run_horizon_secs: horizon.as_secs(),
            retry: RetryConfig {
                jitter: false,
                ..RetryConfig::default()
            },
            ..Config::default()
        };
        EncodingManager::from_config(&config, transport)
    }

    #[tokio::test(start_paused = true)]
    async fn past_deadline_processes_nothing() {
        let transport = Arc::new(FakeTransport::default());
        serve_simple_video(&transport);
        let store = MemoryStore::with_pending(&["abc1234"]);

        let summary = manager(transport.clone(), Duration::from_secs(60))
            .run_until(&store, Instant::now())
            .await
            .unwrap();

        assert!(summary.deadline_reached);
        assert_eq!(summary.pending, 1);
        assert_eq!(summary.attempted, 0);
        assert!(store.persisted().is_empty());
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_video_does_not_stop_the_run() {
        let transport = Arc::new(FakeTransport::default());
        serve_simple_video(&transport);
        serve_video(&transport, "def5678");
        // No references at all for the first video.
        transport.set(
            "https://api.test/video/bad0000",
            Reply::Body(r#"{"videoReferences":[]}"#.to_string()),
        );
        let store = MemoryStore::with_pending(&["bad0000", "abc1234", "def5678"]);

        let summary = manager(transport, Duration::from_secs(3600))
            .run(&store)
            .await
            .unwrap();

        assert_eq!(
            summary,
            RunSummary {
                pending: 3,
                attempted: 3,
                persisted: 2,
                failed: 1,
                deadline_reached: false,
                cancelled: false,
            }
        );
        let ids: Vec<_> = store.persisted().into_iter().map(|s| s.video_id).collect();
        assert_eq!(ids, vec!["abc1234".to_string(), "def5678".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_segments_persist_nothing() {
        let transport = Arc::new(FakeTransport::default());
        serve_simple_video(&transport);
        transport.set("https://cdn.test/video/v1-3.m4s", Reply::Connection);
        let store = MemoryStore::with_pending(&["abc1234"]);

        let summary = manager(transport.clone(), Duration::from_secs(3600))
            .run(&store)
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert!(store.persisted().is_empty());
        assert!(transport.calls("https://cdn.test/video/v1-3.m4s") > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_between_videos_once_the_horizon_passes() {
        let transport = Arc::new(FakeTransport::default());
        serve_simple_video(&transport);
        serve_video(&transport, "def5678");
        transport.set_delayed(
            "https://cdn.test/video/v1-1.m4s",
            Reply::Length(100),
            Duration::from_secs(10),
        );
        let store = MemoryStore::with_pending(&["abc1234", "def5678"]);

        let summary = manager(transport, Duration::from_secs(5))
            .run(&store)
            .await
            .unwrap();

        // The in-flight video still completes.
        assert_eq!(summary.persisted, 1);
        assert_eq!(summary.attempted, 1);
        assert!(summary.deadline_reached);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_before_the_next_video() {
        let transport = Arc::new(FakeTransport::default());
        serve_simple_video(&transport);
        let store = MemoryStore::with_pending(&["abc1234"]);
        let token = CancellationToken::new();
        token.cancel();

        let summary = manager(transport.clone(), Duration::from_secs(3600))
            .with_shutdown(token)
            .run(&store)
            .await
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.attempted, 0);
        assert_eq!(transport.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn storage_failures_are_counted_and_skipped() {
        let transport = Arc::new(FakeTransport::default());
        serve_simple_video(&transport);
        serve_video(&transport, "def5678");
        let store = MemoryStore {
            fail_persist: true,
            ..MemoryStore::with_pending(&["abc1234", "def5678"])
        };

        let summary = manager(transport, Duration::from_secs(3600))
            .run(&store)
            .await
            .unwrap();

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.persisted, 0);
    }
}
