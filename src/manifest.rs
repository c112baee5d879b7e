//! Typed model of a DASH manifest and its parser.
//!
//! Only the layout served for on-demand videos is supported: an absolute
//! `BaseURL`, `$Number$`-addressed segment templates with an explicit
//! `SegmentTimeline`, any number of video representations and one audio
//! adaptation set with the `main` role.

use std::collections::HashMap;

use quick_xml::events::attributes::AttrError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use thiserror::Error;
use url::Url;

use crate::models::Track;

/// Media paths of the track-fragmented layout start with this prefix.
const UNSUPPORTED_MEDIA_PREFIX: &str = "chunk-stream";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed manifest: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed manifest attribute: {0}")]
    Attribute(#[from] AttrError),
    #[error("unsupported manifest schema (media path {media})")]
    UnsupportedSchema { media: String },
    #[error("manifest has no BaseURL")]
    MissingBaseUrl,
    #[error("invalid BaseURL {url}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("manifest has no main audio track")]
    MissingAudioTrack,
    #[error("manifest has no video track")]
    MissingVideoTrack,
    #[error("{content_type} adaptation set has no representation")]
    MissingRepresentation { content_type: String },
    #[error("representation {representation} has no segment template")]
    MissingSegmentTemplate { representation: String },
    #[error("representation {representation} has an empty segment timeline")]
    MissingTimeline { representation: String },
    #[error("{element} is missing attribute {attribute}")]
    MissingAttribute {
        element: &'static str,
        attribute: &'static str,
    },
    #[error("{element} has invalid {attribute}={value:?}")]
    InvalidAttribute {
        element: &'static str,
        attribute: &'static str,
        value: String,
    },
    #[error("cannot build segment url from {media}: {reason}")]
    InvalidMediaUrl { media: String, reason: String },
}

/// One `<S>` run of a segment timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineEntry {
    /// Duration of each segment of the run, in timescale ticks.
    pub duration: u64,
    /// How many additional segments of the same duration follow.
    pub repeat: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentTemplate {
    /// Ticks per second.
    pub timescale: u64,
    /// Media path pattern, with `$Number$` (or `$Number%0Nd$`) left in place.
    pub media: String,
    pub timeline: Vec<TimelineEntry>,
}

impl SegmentTemplate {
    /// Total number of segments described by the timeline.
    pub fn segment_count(&self) -> u64 {
        self.timeline.iter().map(|entry| 1 + entry.repeat).sum()
    }

    /// Segment length in seconds. Every segment is assumed to last as long as
    /// the first one.
    pub fn segment_length(&self) -> f64 {
        self.timeline
            .first()
            .map(|entry| entry.duration as f64 / self.timescale as f64)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Representation {
    pub id: String,
    pub bandwidth: u64,
    pub codecs: String,
    pub mime_type: String,
    pub track: Track,
    pub segment_template: SegmentTemplate,
}

/// A parsed manifest: the base url, every video representation and the
/// single main audio representation. Other audio tracks are dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub base_url: Url,
    pub video: Vec<Representation>,
    pub audio: Representation,
}

/// Lower-cased attributes of one element, keyed by local name.
#[derive(Debug, Default, Clone)]
struct Attributes {
    element: &'static str,
    values: HashMap<String, String>,
}

impl Attributes {
    fn read(element: &'static str, start: &BytesStart<'_>) -> Result<Self, ManifestError> {
        let mut values = HashMap::new();
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).to_ascii_lowercase();
            values.insert(key, attr.unescape_value()?.into_owned());
        }
        Ok(Self { element, values })
    }

    fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    fn required(&self, name: &'static str) -> Result<&str, ManifestError> {
        self.get(name).ok_or(ManifestError::MissingAttribute {
            element: self.element,
            attribute: name,
        })
    }

    fn number<T: std::str::FromStr>(&self, name: &'static str) -> Result<Option<T>, ManifestError> {
        match self.get(name) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| ManifestError::InvalidAttribute {
                    element: self.element,
                    attribute: name,
                    value: raw.to_string(),
                }),
        }
    }

    fn required_number<T: std::str::FromStr>(&self, name: &'static str) -> Result<T, ManifestError> {
        self.number(name)?.ok_or(ManifestError::MissingAttribute {
            element: self.element,
            attribute: name,
        })
    }
}

#[derive(Debug, Default)]
struct TemplateBuilder {
    attrs: Attributes,
    timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Default)]
struct RepresentationBuilder {
    attrs: Attributes,
    template: Option<TemplateBuilder>,
}

#[derive(Debug, Default)]
struct AdaptationSetBuilder {
    attrs: Attributes,
    role: Option<String>,
    template: Option<TemplateBuilder>,
    representations: Vec<RepresentationBuilder>,
}

impl AdaptationSetBuilder {
    fn content_type(&self) -> String {
        if let Some(content_type) = self.attrs.get("contenttype") {
            return content_type.to_ascii_lowercase();
        }
        let mime = self.attrs.get("mimetype").unwrap_or_default();
        if mime.contains("audio") {
            "audio".to_string()
        } else if mime.contains("video") {
            "video".to_string()
        } else {
            String::new()
        }
    }

    fn is_main(&self) -> bool {
        self.role.as_deref() == Some("main")
    }

    fn build(&self, rep: &RepresentationBuilder, audio: bool) -> Result<Representation, ManifestError> {
        let attrs = &rep.attrs;
        let id = attrs.get("id").unwrap_or_default().to_string();
        let bandwidth = attrs.required_number("bandwidth")?;
        let codecs = inherited(attrs, &self.attrs, "codecs")?;
        let mime_type = inherited(attrs, &self.attrs, "mimetype")?;

        let track = if audio {
            Track::Audio {
                sampling_rate: match attrs.number("audiosamplingrate")? {
                    Some(rate) => rate,
                    None => self.attrs.required_number("audiosamplingrate")?,
                },
            }
        } else {
            Track::Video {
                width: attrs.required_number("width")?,
                height: attrs.required_number("height")?,
            }
        };

        let template = rep
            .template
            .as_ref()
            .or(self.template.as_ref())
            .ok_or_else(|| ManifestError::MissingSegmentTemplate {
                representation: id.clone(),
            })?;
        let segment_template = build_template(template, &id, bandwidth)?;

        Ok(Representation {
            id,
            bandwidth,
            codecs,
            mime_type,
            track,
            segment_template,
        })
    }
}

/// An attribute declared on the representation or, failing that, on its set.
fn inherited(own: &Attributes, set: &Attributes, name: &'static str) -> Result<String, ManifestError> {
    own.get(name)
        .or_else(|| set.get(name))
        .map(str::to_string)
        .ok_or(ManifestError::MissingAttribute {
            element: own.element,
            attribute: name,
        })
}

fn build_template(
    template: &TemplateBuilder,
    representation: &str,
    bandwidth: u64,
) -> Result<SegmentTemplate, ManifestError> {
    let attrs = &template.attrs;
    let timescale: u64 = attrs.number("timescale")?.unwrap_or(1);
    if timescale == 0 {
        return Err(ManifestError::InvalidAttribute {
            element: "SegmentTemplate",
            attribute: "timescale",
            value: "0".to_string(),
        });
    }
    if template.timeline.is_empty() {
        return Err(ManifestError::MissingTimeline {
            representation: representation.to_string(),
        });
    }
    let media = attrs
        .required("media")?
        .replace("$RepresentationID$", representation)
        .replace("$Bandwidth$", &bandwidth.to_string());

    Ok(SegmentTemplate {
        timescale,
        media,
        timeline: template.timeline.clone(),
    })
}

fn timeline_entry(attrs: &Attributes) -> Result<TimelineEntry, ManifestError> {
    let duration = attrs.required_number("d")?;
    // A negative repeat ("until the next entry") adds no segments here.
    let repeat: i64 = attrs.number("r")?.unwrap_or(0);
    Ok(TimelineEntry {
        duration,
        repeat: repeat.max(0) as u64,
    })
}

fn local_name(start: &[u8]) -> String {
    let name = match start.iter().rposition(|b| *b == b':') {
        Some(colon) => &start[colon + 1..],
        None => start,
    };
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

/// Parses a manifest document.
///
/// The first segment template in the document decides whether the layout is
/// supported at all; an unsupported layout is rejected before anything else
/// is validated.
pub fn parse(document: &[u8]) -> Result<Manifest, ManifestError> {
    let mut reader = Reader::from_reader(document);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut base_url: Option<String> = None;
    let mut in_base_url = false;
    let mut schema_checked = false;

    let mut adaptation: Option<AdaptationSetBuilder> = None;
    let mut representation: Option<RepresentationBuilder> = None;
    let mut template: Option<TemplateBuilder> = None;

    let mut video = Vec::new();
    let mut audio: Option<Representation> = None;

    loop {
        let event = reader.read_event_into(&mut buf)?;
        let (start, empty) = match &event {
            Event::Start(e) => (Some(e), false),
            Event::Empty(e) => (Some(e), true),
            _ => (None, false),
        };

        if let Some(e) = start {
            match local_name(e.name().as_ref()).as_str() {
                "baseurl" if base_url.is_none() => in_base_url = !empty,
                "adaptationset" => {
                    adaptation = Some(AdaptationSetBuilder {
                        attrs: Attributes::read("AdaptationSet", e)?,
                        ..AdaptationSetBuilder::default()
                    });
                }
                "role" => {
                    if let Some(set) = adaptation.as_mut() {
                        if set.role.is_none() {
                            set.role = Attributes::read("Role", e)?.get("value").map(str::to_string);
                        }
                    }
                }
                "representation" => {
                    representation = Some(RepresentationBuilder {
                        attrs: Attributes::read("Representation", e)?,
                        template: None,
                    });
                    if empty {
                        if let (Some(set), Some(rep)) = (adaptation.as_mut(), representation.take()) {
                            set.representations.push(rep);
                        }
                    }
                }
                "segmenttemplate" => {
                    let attrs = Attributes::read("SegmentTemplate", e)?;
                    if !schema_checked {
                        schema_checked = true;
                        let media = attrs.required("media")?;
                        if media.starts_with(UNSUPPORTED_MEDIA_PREFIX) {
                            return Err(ManifestError::UnsupportedSchema {
                                media: media.to_string(),
                            });
                        }
                    }
                    template = Some(TemplateBuilder {
                        attrs,
                        timeline: Vec::new(),
                    });
                    if empty {
                        attach_template(template.take(), &mut representation, &mut adaptation);
                    }
                }
                "s" => {
                    if let Some(template) = template.as_mut() {
                        let entry = timeline_entry(&Attributes::read("S", e)?)?;
                        template.timeline.push(entry);
                    }
                }
                _ => {}
            }
            buf.clear();
            continue;
        }

        match event {
            Event::Text(text) if in_base_url => {
                base_url = Some(text.unescape()?.trim().to_string());
            }
            Event::End(e) => match local_name(e.name().as_ref()).as_str() {
                "baseurl" => in_base_url = false,
                "segmenttemplate" => {
                    attach_template(template.take(), &mut representation, &mut adaptation);
                }
                "representation" => {
                    if let (Some(set), Some(rep)) = (adaptation.as_mut(), representation.take()) {
                        set.representations.push(rep);
                    }
                }
                "adaptationset" => {
                    if let Some(set) = adaptation.take() {
                        collect_adaptation_set(set, &mut video, &mut audio)?;
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let raw_base = base_url.ok_or(ManifestError::MissingBaseUrl)?;
    let base_url = Url::parse(&raw_base).map_err(|e| ManifestError::InvalidBaseUrl {
        url: raw_base.clone(),
        reason: e.to_string(),
    })?;
    if video.is_empty() {
        return Err(ManifestError::MissingVideoTrack);
    }
    let audio = audio.ok_or(ManifestError::MissingAudioTrack)?;

    Ok(Manifest {
        base_url,
        video,
        audio,
    })
}

fn attach_template(
    template: Option<TemplateBuilder>,
    representation: &mut Option<RepresentationBuilder>,
    adaptation: &mut Option<AdaptationSetBuilder>,
) {
    let Some(template) = template else { return };
    if let Some(rep) = representation.as_mut() {
        rep.template = Some(template);
    } else if let Some(set) = adaptation.as_mut() {
        set.template = Some(template);
    }
}

fn collect_adaptation_set(
    set: AdaptationSetBuilder,
    video: &mut Vec<Representation>,
    audio: &mut Option<Representation>,
) -> Result<(), ManifestError> {
    match set.content_type().as_str() {
        "video" => {
            if set.representations.is_empty() {
                return Err(ManifestError::MissingRepresentation {
                    content_type: "video".to_string(),
                });
            }
            for rep in &set.representations {
                video.push(set.build(rep, false)?);
            }
        }
        "audio" if set.is_main() && audio.is_none() => {
            let rep = set
                .representations
                .first()
                .ok_or(ManifestError::MissingRepresentation {
                    content_type: "audio".to_string(),
                })?;
            *audio = Some(set.build(rep, true)?);
        }
        _ => {}
    }
    Ok(())
}
