// src/catalog.rs

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::downloader::{FetchError, Transport};
use crate::models::{Genre, Video};
use crate::retry::RetryPolicies;
use crate::store::{SqliteStore, StateError, TIMESTAMP_FORMAT};

const CATALOG_QUERY: &str = r#"query {
    genresSortedByName {
        genres {
            id
            name
            description
        }
    }
    allEpisodesForInternalUse(include: active) {
        videoSvtId
        urls {
            svtplay
        }
    }
    programAtillO (filter: {includeFullOppetArkiv: true}) {
        flat {
            name
            episodes {
                videoSvtId
                name
                duration
                validFrom
                validTo
                restrictions {
                    onlyAvailableInSweden
                }
                shortDescription
                longDescription
                productionYear
                genres {
                    id
                }
            }
            urls {
                svtplay
            }
        }
    }
}"#;

/// Length of an id the encoding pass can resolve.
const VIDEO_ID_LEN: usize = 7;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("invalid catalog response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("catalog query failed with {0}")]
    Query(String),
    #[error("catalog response has no data")]
    MissingData,
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    data: Option<RawData>,
    #[serde(default)]
    errors: Vec<RawError>,
}

#[derive(Debug, Deserialize)]
struct RawError {
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawData {
    genres_sorted_by_name: RawGenres,
    all_episodes_for_internal_use: Vec<RawEpisodeUrls>,
    #[serde(rename = "programAtillO")]
    programs: RawPrograms,
}

#[derive(Debug, Deserialize)]
struct RawGenres {
    genres: Vec<RawGenre>,
}

#[derive(Debug, Deserialize)]
struct RawGenre {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUrls {
    #[serde(default)]
    svtplay: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEpisodeUrls {
    video_svt_id: String,
    #[serde(default)]
    urls: RawUrls,
}

#[derive(Debug, Deserialize)]
struct RawPrograms {
    flat: Vec<RawProgram>,
}

#[derive(Debug, Deserialize)]
struct RawProgram {
    name: String,
    #[serde(default)]
    episodes: Vec<RawEpisode>,
    #[serde(default)]
    urls: RawUrls,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEpisode {
    video_svt_id: Option<String>,
    name: String,
    #[serde(default)]
    duration: u64,
    valid_from: String,
    valid_to: String,
    #[serde(default)]
    restrictions: RawRestrictions,
    #[serde(default)]
    short_description: Option<String>,
    #[serde(default)]
    long_description: Option<String>,
    #[serde(default)]
    production_year: Option<i32>,
    #[serde(default)]
    genres: Vec<RawGenreRef>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRestrictions {
    #[serde(default)]
    only_available_in_sweden: bool,
}

#[derive(Debug, Deserialize)]
struct RawGenreRef {
    id: String,
}

/// Genres and currently active videos from one catalog query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogUpdate {
    pub genres: Vec<Genre>,
    pub videos: Vec<Video>,
}

impl CatalogUpdate {
    /// Decodes a GraphQL response, keeping the videos available at `now`.
    pub fn from_json(body: &[u8], now: NaiveDateTime) -> Result<Self, CatalogError> {
        let raw: RawResponse = serde_json::from_slice(body)?;
        if !raw.errors.is_empty() {
            let messages: Vec<_> = raw.errors.into_iter().map(|e| e.message).collect();
            return Err(CatalogError::Query(messages.join(" | ")));
        }
        let data = raw.data.ok_or(CatalogError::MissingData)?;

        let genres = data
            .genres_sorted_by_name
            .genres
            .into_iter()
            .map(|genre| Genre {
                id: genre.id,
                name: genre.name.trim().to_string(),
                description: genre.description.unwrap_or_default().trim().to_string(),
            })
            .collect();

        let episode_urls: HashMap<String, String> = data
            .all_episodes_for_internal_use
            .into_iter()
            .filter_map(|ep| Some((ep.video_svt_id, ep.urls.svtplay?)))
            .collect();

        let mut videos = Vec::new();
        for program in data.programs.flat {
            let program_url = program.urls.svtplay.unwrap_or_default();
            for episode in program.episodes {
                let Some(video) = episode_video(&program.name, &program_url, episode, &episode_urls)
                else {
                    continue;
                };
                if !is_active(&video, now) {
                    continue;
                }
                if video.id.chars().count() != VIDEO_ID_LEN {
                    warn!(name = %video.name, id = %video.id, "skipping video with unexpected id");
                    continue;
                }
                videos.push(video);
            }
        }

        Ok(Self { genres, videos })
    }
}

fn episode_video(
    program_name: &str,
    program_url: &str,
    episode: RawEpisode,
    episode_urls: &HashMap<String, String>,
) -> Option<Video> {
    let id = episode.video_svt_id?;
    let name = if program_name == episode.name {
        program_name.trim().to_string()
    } else {
        format!("{}: {}", program_name.trim(), episode.name.trim())
    };
    let url = if program_url.starts_with("/video/") {
        program_url.to_string()
    } else {
        episode_urls.get(&id).cloned().unwrap_or_default()
    };
    Some(Video {
        name,
        duration: episode.duration,
        valid_from: truncate_timestamp(&episode.valid_from).to_string(),
        valid_to: truncate_timestamp(&episode.valid_to).to_string(),
        sweden_only: episode.restrictions.only_available_in_sweden,
        url,
        short_description: episode.short_description.unwrap_or_default().trim().to_string(),
        long_description: episode.long_description.unwrap_or_default().trim().to_string(),
        production_year: episode.production_year,
        genres: episode.genres.into_iter().map(|g| g.id).collect(),
        id,
    })
}

/// Drops the sub-second part and zone offset.
fn truncate_timestamp(value: &str) -> &str {
    match value.char_indices().nth(19) {
        Some((end, _)) => &value[..end],
        None => value,
    }
}

fn is_active(video: &Video, now: NaiveDateTime) -> bool {
    let parse = |value: &str| NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT).ok();
    match (parse(&video.valid_from), parse(&video.valid_to)) {
        (Some(from), Some(to)) => from < now && now < to,
        _ => {
            warn!(id = %video.id, "skipping video with unparsable validity");
            false
        }
    }
}

/// Pulls the program catalog from the GraphQL endpoint.
#[derive(Clone)]
pub struct CatalogClient {
    transport: Arc<dyn Transport>,
    retry: Arc<RetryPolicies>,
    api_url: String,
}

impl CatalogClient {
    pub fn new(transport: Arc<dyn Transport>, retry: Arc<RetryPolicies>, api_url: impl Into<String>) -> Self {
        Self {
            transport,
            retry,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn fetch(&self, now: NaiveDateTime) -> Result<CatalogUpdate, CatalogError> {
        let url = format!("{}/contento/graphql", self.api_url);
        let body = json!({ "query": CATALOG_QUERY });
        let transport = self.transport.as_ref();
        let (url, body) = (url.as_str(), &body);
        let response = self
            .retry
            .execute(move || transport.post_json(url, body))
            .await?;
        CatalogUpdate::from_json(&response, now)
    }

    /// Replaces stale catalog rows in `store` with the current catalog.
    pub async fn refresh(&self, store: &SqliteStore, now: NaiveDateTime) -> Result<(), CatalogError> {
        let update = self.fetch(now).await?;
        store.delete_deprecated(now).await?;
        let genres = store.upsert_genres(&update.genres).await?;
        info!(genres, "added/updated genres");
        store.upsert_videos(&update.videos).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EncodingStore;
    use crate::test_support::{FakeTransport, Reply};

    const RESPONSE: &str = r#"{"data": {
        "genresSortedByName": {"genres": [
            {"id": "drama", "name": " Drama ", "description": "Fiction "}
        ]},
        "allEpisodesForInternalUse": [
            {"videoSvtId": "ep00002", "urls": {"svtplay": "/video/ep00002/two"}}
        ],
        "programAtillO": {"flat": [
            {
                "name": "Show ",
                "urls": {"svtplay": "/show"},
                "episodes": [
                    {
                        "videoSvtId": "ep00001", "name": "Show ", "duration": 1800,
                        "validFrom": "2024-01-01T00:00:00+01:00",
                        "validTo": "2025-01-01T00:00:00+01:00",
                        "restrictions": {"onlyAvailableInSweden": true},
                        "shortDescription": " short ", "longDescription": null,
                        "productionYear": 2023, "genres": [{"id": "drama"}]
                    },
                    {
                        "videoSvtId": "ep00002", "name": "Part 2", "duration": 1700,
                        "validFrom": "2024-01-01T00:00:00+01:00",
                        "validTo": "2025-01-01T00:00:00+01:00",
                        "restrictions": {"onlyAvailableInSweden": false},
                        "shortDescription": "", "longDescription": "",
                        "productionYear": null, "genres": []
                    },
                    {
                        "videoSvtId": "expired", "name": "Old", "duration": 60,
                        "validFrom": "2020-01-01T00:00:00+01:00",
                        "validTo": "2021-01-01T00:00:00+01:00",
                        "restrictions": {"onlyAvailableInSweden": false},
                        "genres": []
                    },
                    {
                        "videoSvtId": "toolongid", "name": "Odd", "duration": 60,
                        "validFrom": "2024-01-01T00:00:00+01:00",
                        "validTo": "2025-01-01T00:00:00+01:00",
                        "restrictions": {"onlyAvailableInSweden": false},
                        "genres": []
                    }
                ]
            },
            {
                "name": "Film",
                "urls": {"svtplay": "/video/film0001/film"},
                "episodes": [
                    {
                        "videoSvtId": "film001", "name": "Film", "duration": 5400,
                        "validFrom": "2024-01-01T00:00:00+01:00",
                        "validTo": "2025-01-01T00:00:00+01:00",
                        "restrictions": {"onlyAvailableInSweden": false},
                        "genres": [{"id": "drama"}]
                    }
                ]
            }
        ]}
    }}"#;

    fn now() -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-06-01T12:00:00", TIMESTAMP_FORMAT).unwrap()
    }

    #[test]
    fn converts_the_catalog() {
        let update = CatalogUpdate::from_json(RESPONSE.as_bytes(), now()).unwrap();

        assert_eq!(
            update.genres,
            vec![Genre {
                id: "drama".to_string(),
                name: "Drama".to_string(),
                description: "Fiction".to_string(),
            }]
        );

        let ids: Vec<_> = update.videos.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["ep00001", "ep00002", "film001"]);

        let first = &update.videos[0];
        assert_eq!(first.name, "Show");
        assert_eq!(first.valid_from, "2024-01-01T00:00:00");
        assert!(first.sweden_only);
        assert_eq!(first.short_description, "short");
        assert_eq!(first.long_description, "");
        assert_eq!(first.production_year, Some(2023));
        assert_eq!(first.genres, vec!["drama".to_string()]);
        // The program url is not a video page; the episode map has nothing.
        assert_eq!(first.url, "");

        assert_eq!(update.videos[1].name, "Show: Part 2");
        assert_eq!(update.videos[1].url, "/video/ep00002/two");
        assert_eq!(update.videos[2].url, "/video/film0001/film");
    }

    #[test]
    fn graphql_errors_are_reported() {
        let body = br#"{"errors": [{"message": "bad field"}, {"message": "denied"}]}"#;
        match CatalogUpdate::from_json(body, now()) {
            Err(CatalogError::Query(message)) => assert_eq!(message, "bad field | denied"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn refresh_stores_the_active_catalog() {
        let transport = Arc::new(FakeTransport::default());
        transport.set(
            "https://api.test/contento/graphql",
            Reply::Body(RESPONSE.to_string()),
        );
        let client = CatalogClient::new(transport, Arc::new(RetryPolicies::none()), "https://api.test");
        let store = SqliteStore::open_in_memory().await.unwrap();

        client.refresh(&store, now()).await.unwrap();

        assert_eq!(
            store.ids_lacking_encodings().await.unwrap(),
            vec!["ep00001".to_string(), "ep00002".to_string(), "film001".to_string()]
        );
    }
}
