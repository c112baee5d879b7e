// src/segments.rs

use std::sync::LazyLock;

use regex::{Captures, Regex};
use url::Url;

use crate::manifest::{ManifestError, SegmentTemplate};

static NUMBER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$Number(?:%0(\d+)d)?\$").expect("segment number pattern is valid")
});

/// Substitutes `number` into every `$Number$` / `$Number%0Nd$` of `media`.
pub fn media_path(media: &str, number: u64) -> String {
    NUMBER
        .replace_all(media, |caps: &Captures<'_>| match caps.get(1) {
            Some(width) => {
                let width = width.as_str().parse::<usize>().unwrap_or(0);
                format!("{number:0width$}")
            }
            None => number.to_string(),
        })
        .into_owned()
}

/// Expands a segment template into the url of every segment, numbered from 1,
/// in playback order.
pub fn enumerate(base_url: &Url, template: &SegmentTemplate) -> Result<Vec<Url>, ManifestError> {
    (1..=template.segment_count())
        .map(|number| {
            let path = media_path(&template.media, number);
            base_url
                .join(&path)
                .map_err(|e| ManifestError::InvalidMediaUrl {
                    media: path,
                    reason: e.to_string(),
                })
        })
        .collect()
}
