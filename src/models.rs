// src/models.rs

use serde::{Deserialize, Serialize};

/// Opaque external identifier of a video in the catalog.
pub type VideoId = String;

/// Track-specific attributes of an encoding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Track {
    Video { width: u32, height: u32 },
    Audio { sampling_rate: u32 },
}

/// The resolved segment layout of one representation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Encoding {
    pub bandwidth: u64,
    pub codecs: String,
    pub mime_type: String,
    /// Length of every segment in seconds, taken from the first timeline entry.
    pub segment_length: f64,
    /// Byte size of each segment, in playback order.
    pub segment_sizes: Vec<u64>,
    pub track: Track,
}

impl Encoding {
    pub fn segment_count(&self) -> usize {
        self.segment_sizes.len()
    }

    /// Sum of all segment sizes in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.segment_sizes.iter().sum()
    }
}

/// Every resolved encoding of a single video.
///
/// Only ever built once all segment sizes of every representation are known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingSet {
    pub video_id: VideoId,
    pub videos: Vec<Encoding>,
    pub audio: Encoding,
}

impl EncodingSet {
    /// Segments across every encoding.
    pub fn segment_count(&self) -> usize {
        self.encodings().map(Encoding::segment_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.encodings().map(Encoding::total_bytes).sum()
    }

    /// Video encodings first, then audio.
    pub fn encodings(&self) -> impl Iterator<Item = &Encoding> {
        self.videos.iter().chain(std::iter::once(&self.audio))
    }
}

/// A catalog genre.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Genre {
    pub id: String,
    pub name: String,
    pub description: String,
}

/// A catalog video, one per episode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Video {
    pub id: VideoId,
    pub name: String,
    /// Duration in seconds.
    pub duration: u64,
    /// Start of availability, `%Y-%m-%dT%H:%M:%S` local to the provider.
    pub valid_from: String,
    pub valid_to: String,
    pub sweden_only: bool,
    /// Relative page URL, empty when unknown.
    pub url: String,
    pub short_description: String,
    pub long_description: String,
    pub production_year: Option<i32>,
    pub genres: Vec<String>,
}
