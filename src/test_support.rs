// In-memory collaborators for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::downloader::{FetchError, Transport};
use crate::models::{EncodingSet, VideoId};
use crate::store::{EncodingStore, StateError};

/// What a fake endpoint answers.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Body(String),
    Length(u64),
    Status(u16),
    Connection,
    Timeout,
}

struct Route {
    /// The last reply repeats forever.
    replies: VecDeque<Reply>,
    delay: Duration,
}

/// A [`Transport`] answering from a url-keyed table. Unknown urls get a 404.
#[derive(Default)]
pub(crate) struct FakeTransport {
    routes: Mutex<HashMap<String, Route>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl FakeTransport {
    pub fn set(&self, url: &str, reply: Reply) {
        self.set_delayed(url, reply, Duration::ZERO);
    }

    pub fn set_delayed(&self, url: &str, reply: Reply, delay: Duration) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                replies: VecDeque::from([reply]),
                delay,
            },
        );
    }

    pub fn set_sequence(&self, url: &str, replies: Vec<Reply>) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                replies: replies.into(),
                delay: Duration::ZERO,
            },
        );
    }

    pub fn calls(&self, url: &str) -> u32 {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    async fn answer(&self, url: &str) -> Result<Reply, FetchError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        let (reply, delay) = {
            let mut routes = self.routes.lock().unwrap();
            match routes.get_mut(url) {
                Some(route) if route.replies.len() > 1 => {
                    (route.replies.pop_front().unwrap(), route.delay)
                }
                Some(route) => (route.replies[0].clone(), route.delay),
                None => (Reply::Status(404), Duration::ZERO),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let url = url.to_string();
        match reply {
            Reply::Status(status) => Err(FetchError::Response { status, url }),
            Reply::Connection => Err(FetchError::Connection {
                url,
                reason: "connection reset by peer".to_string(),
            }),
            Reply::Timeout => Err(FetchError::Timeout { url }),
            other => Ok(other),
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get_bytes(&self, url: &str) -> Result<Bytes, FetchError> {
        match self.answer(url).await? {
            Reply::Body(body) => Ok(Bytes::from(body)),
            _ => Ok(Bytes::new()),
        }
    }

    async fn post_json(&self, url: &str, _body: &serde_json::Value) -> Result<Bytes, FetchError> {
        self.get_bytes(url).await
    }

    async fn content_length(&self, url: &str, _timeout: Duration) -> Result<u64, FetchError> {
        match self.answer(url).await? {
            Reply::Length(length) => Ok(length),
            Reply::Body(body) => Ok(body.len() as u64),
            _ => Err(FetchError::MissingContentLength {
                url: url.to_string(),
            }),
        }
    }
}

/// An [`EncodingStore`] over a fixed id list that keeps what it is given.
#[derive(Default)]
pub(crate) struct MemoryStore {
    pub pending: Vec<VideoId>,
    pub persisted: Mutex<Vec<EncodingSet>>,
    pub fail_persist: bool,
}

impl MemoryStore {
    pub fn with_pending(ids: &[&str]) -> Self {
        Self {
            pending: ids.iter().map(|id| id.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn persisted(&self) -> Vec<EncodingSet> {
        self.persisted.lock().unwrap().clone()
    }
}

#[async_trait]
impl EncodingStore for MemoryStore {
    async fn ids_lacking_encodings(&self) -> Result<Vec<VideoId>, StateError> {
        Ok(self.pending.clone())
    }

    async fn persist(&self, set: &EncodingSet) -> Result<(), StateError> {
        if self.fail_persist {
            return Err(StateError::Closed);
        }
        self.persisted.lock().unwrap().push(set.clone());
        Ok(())
    }
}

/// Manifest with one video representation (three 4s segments) and a main
/// audio track (one 2s segment), plus an ignored secondary audio track.
pub(crate) const SIMPLE_MPD: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT12S">
  <BaseURL>https://cdn.test/video/</BaseURL>
  <Period id="0">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <Representation id="v1" bandwidth="1500000" codecs="avc1.64001f" width="1280" height="720">
        <SegmentTemplate timescale="1" media="v1-$Number$.m4s" initialization="v1-init.mp4">
          <SegmentTimeline>
            <S t="0" d="4" r="2"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="sv">
      <Role schemeIdUri="urn:mpeg:dash:role:2011" value="main"/>
      <Representation id="a1" bandwidth="96000" codecs="mp4a.40.2" audioSamplingRate="48000">
        <SegmentTemplate timescale="1" media="a1-$Number$.m4s" initialization="a1-init.mp4">
          <SegmentTimeline>
            <S t="0" d="2"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <Role schemeIdUri="urn:mpeg:dash:role:2011" value="alternate"/>
      <Representation id="a2" bandwidth="96000" codecs="mp4a.40.2" audioSamplingRate="48000">
        <SegmentTemplate timescale="1" media="a2-$Number$.m4s">
          <SegmentTimeline>
            <S t="0" d="2"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>
"#;

pub(crate) const SIMPLE_MANIFEST_URL: &str =
    "https://api.test/ditto/api/V1/web?manifestUrl=https://s.test/d.mpd?a=1&excludeCodecs=hvc&excludeCodecs=ac-3";

/// Serves video `abc1234` with [`SIMPLE_MPD`]: video segments of 100, 200
/// and 300 bytes and one audio segment of 50 bytes.
pub(crate) fn serve_simple_video(transport: &FakeTransport) {
    serve_video(transport, "abc1234");
    transport.set(SIMPLE_MANIFEST_URL, Reply::Body(SIMPLE_MPD.to_string()));
    for (n, size) in [(1, 100), (2, 200), (3, 300)] {
        transport.set(&format!("https://cdn.test/video/v1-{n}.m4s"), Reply::Length(size));
    }
    transport.set("https://cdn.test/video/a1-1.m4s", Reply::Length(50));
}

/// Makes the catalog offer the simple manifest for `video_id`.
pub(crate) fn serve_video(transport: &FakeTransport, video_id: &str) {
    transport.set(
        &format!("https://api.test/video/{video_id}"),
        Reply::Body(
            r#"{"videoReferences":[{"format":"dash","url":"https://s.test/d.mpd?a=1"}]}"#.to_string(),
        ),
    );
}
