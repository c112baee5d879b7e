// src/fetcher.rs

use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tracing::debug;

use crate::downloader::{fetch, fetch_json, Transport};
use crate::resolver::ResolveError;
use crate::retry::RetryPolicies;

/// One manifest offered for a video: a format tag and where to get it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ManifestReference {
    pub format: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct VideoData {
    #[serde(rename = "videoReferences", default)]
    video_references: Vec<ManifestReference>,
}

/// Picks the reference whose format comes earliest in `priority`.
pub fn select_reference<'a>(
    references: &'a [ManifestReference],
    priority: &[String],
) -> Option<&'a ManifestReference> {
    priority
        .iter()
        .find_map(|format| references.iter().find(|r| &r.format == format))
}

/// Appends one `excludeCodecs` query parameter per codec.
pub fn with_excluded_codecs(url: &str, codecs: &[String]) -> String {
    let mut url = url.to_string();
    for codec in codecs {
        url.push(if url.contains('?') { '&' } else { '?' });
        url.push_str("excludeCodecs=");
        url.push_str(codec);
    }
    url
}

/// Resolves a video id to its manifest document.
#[derive(Clone)]
pub struct ManifestFetcher {
    transport: Arc<dyn Transport>,
    retry: Arc<RetryPolicies>,
    api_url: String,
    format_priority: Vec<String>,
    excluded_codecs: Vec<String>,
}

impl ManifestFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        retry: Arc<RetryPolicies>,
        api_url: impl Into<String>,
        format_priority: Vec<String>,
        excluded_codecs: Vec<String>,
    ) -> Self {
        Self {
            transport,
            retry,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            format_priority,
            excluded_codecs,
        }
    }

    /// Every manifest reference the catalog offers for `video_id`.
    pub async fn references(&self, video_id: &str) -> Result<Vec<ManifestReference>, ResolveError> {
        let url = format!("{}/video/{}", self.api_url, video_id);
        let data: VideoData = fetch_json(self.transport.as_ref(), &self.retry, &url).await?;
        Ok(data.video_references)
    }

    /// The url the manifest is fetched from: the best reference, with codec
    /// exclusions, routed through the manifest service.
    pub async fn manifest_url(&self, video_id: &str) -> Result<String, ResolveError> {
        let references = self.references(video_id).await?;
        let reference = select_reference(&references, &self.format_priority).ok_or_else(|| {
            ResolveError::FormatNotFound {
                video_id: video_id.to_string(),
            }
        })?;
        debug!(video_id, format = %reference.format, "selected manifest format");
        Ok(format!(
            "{}/ditto/api/V1/web?manifestUrl={}",
            self.api_url,
            with_excluded_codecs(&reference.url, &self.excluded_codecs)
        ))
    }

    pub async fn resolve_manifest(&self, video_id: &str) -> Result<Bytes, ResolveError> {
        let url = self.manifest_url(video_id).await?;
        Ok(fetch(self.transport.as_ref(), &self.retry, &url).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeTransport, Reply};

    fn reference(format: &str) -> ManifestReference {
        ManifestReference {
            format: format.to_string(),
            url: format!("https://switcher.test/{format}.mpd?alt=x"),
        }
    }

    fn priority(formats: &[&str]) -> Vec<String> {
        formats.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn earliest_priority_wins_over_offer_order() {
        let refs = vec![reference("x"), reference("y")];
        let chosen = select_reference(&refs, &priority(&["y", "x"])).unwrap();
        assert_eq!(chosen.format, "y");
    }

    #[test]
    fn unknown_formats_are_not_selected() {
        let refs = vec![reference("hls"), reference("dash-hevc")];
        assert!(select_reference(&refs, &priority(&["dash-full", "dash"])).is_none());
        assert!(select_reference(&[], &priority(&["dash"])).is_none());
    }

    #[test]
    fn codec_exclusions_are_appended() {
        let codecs = priority(&["hvc", "ac-3"]);
        assert_eq!(
            with_excluded_codecs("https://a.test/m.mpd?x=1", &codecs),
            "https://a.test/m.mpd?x=1&excludeCodecs=hvc&excludeCodecs=ac-3"
        );
        assert_eq!(
            with_excluded_codecs("https://a.test/m.mpd", &codecs),
            "https://a.test/m.mpd?excludeCodecs=hvc&excludeCodecs=ac-3"
        );
    }

    fn fetcher(transport: Arc<FakeTransport>) -> ManifestFetcher {
        ManifestFetcher::new(
            transport,
            Arc::new(RetryPolicies::none()),
            "https://api.test/",
            priority(&["dash-full", "dash"]),
            priority(&["hvc"]),
        )
    }

    #[tokio::test]
    async fn fetches_the_best_manifest() {
        let transport = Arc::new(FakeTransport::default());
        transport.set(
            "https://api.test/video/abc1234",
            Reply::Body(
                r#"{"videoReferences":[
                    {"format":"hls","url":"https://s.test/h.m3u8?a=1"},
                    {"format":"dash","url":"https://s.test/d.mpd?a=1"}]}"#
                    .to_string(),
            ),
        );
        transport.set(
            "https://api.test/ditto/api/V1/web?manifestUrl=https://s.test/d.mpd?a=1&excludeCodecs=hvc",
            Reply::Body("<MPD/>".to_string()),
        );

        let body = fetcher(transport).resolve_manifest("abc1234").await.unwrap();
        assert_eq!(&body[..], b"<MPD/>");
    }

    #[tokio::test]
    async fn no_matching_format_fails_without_fetching_a_manifest() {
        let transport = Arc::new(FakeTransport::default());
        transport.set(
            "https://api.test/video/abc1234",
            Reply::Body(r#"{"videoReferences":[{"format":"hls","url":"u"}]}"#.to_string()),
        );

        let err = fetcher(transport.clone())
            .resolve_manifest("abc1234")
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::FormatNotFound { .. }));
        assert_eq!(transport.total_calls(), 1);
    }
}
