// src/resolver.rs

use futures_util::future::{join, join_all};
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::downloader::{FetchError, SegmentProber};
use crate::fetcher::ManifestFetcher;
use crate::limiter::ProbeGate;
use crate::manifest::{self, ManifestError, Representation};
use crate::models::{Encoding, EncodingSet};
use crate::retry::{FailureClass, Retryable};
use crate::segments;

/// Why one video's encodings could not be resolved.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("no supported manifest format offered for {video_id}")]
    FormatNotFound { video_id: String },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl Retryable for ResolveError {
    fn failure_class(&self) -> FailureClass {
        match self {
            ResolveError::FormatNotFound { .. } | ResolveError::Manifest(_) => FailureClass::Content,
            ResolveError::Fetch(e) => e.failure_class(),
        }
    }

    fn is_client_error(&self) -> bool {
        matches!(self, ResolveError::Fetch(e) if e.is_client_error())
    }
}

/// Turns a video id into a complete [`EncodingSet`], or fails as a whole.
#[derive(Clone)]
pub struct EncodingResolver {
    fetcher: ManifestFetcher,
    prober: SegmentProber,
    concurrency_limit: usize,
}

impl EncodingResolver {
    pub fn new(fetcher: ManifestFetcher, prober: SegmentProber, concurrency_limit: usize) -> Self {
        Self {
            fetcher,
            prober,
            concurrency_limit,
        }
    }

    pub async fn resolve(&self, video_id: &str) -> Result<EncodingSet, ResolveError> {
        let document = self.fetcher.resolve_manifest(video_id).await?;
        let manifest = manifest::parse(&document)?;

        let video_tasks = manifest
            .video
            .iter()
            .map(|rep| self.resolve_representation(&manifest.base_url, rep));
        let audio_task = self.resolve_representation(&manifest.base_url, &manifest.audio);
        let (video_results, audio_result) = join(join_all(video_tasks), audio_task).await;

        let videos = video_results.into_iter().collect::<Result<Vec<_>, _>>()?;
        let audio = audio_result?;

        Ok(EncodingSet {
            video_id: video_id.to_string(),
            videos,
            audio,
        })
    }

    /// Probes every segment of one representation.
    pub async fn resolve_representation(
        &self,
        base_url: &Url,
        rep: &Representation,
    ) -> Result<Encoding, ResolveError> {
        let template = &rep.segment_template;
        let urls = segments::enumerate(base_url, template)?;
        debug!(representation = %rep.id, segments = urls.len(), "probing segments");

        let gate = ProbeGate::new(self.concurrency_limit);
        let segment_sizes = self.prober.probe_sizes(&urls, &gate).await?;

        Ok(Encoding {
            bandwidth: rep.bandwidth,
            codecs: rep.codecs.clone(),
            mime_type: rep.mime_type.clone(),
            segment_length: template.segment_length(),
            segment_sizes,
            track: rep.track.clone(),
        })
    }
}
