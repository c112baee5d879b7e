pub mod catalog;
pub mod config;
pub mod downloader;
pub mod fetcher;
pub mod limiter;
pub mod manager;
pub mod manifest;
pub mod models;
pub mod resolver;
pub mod retry;
pub mod segments;
pub mod store;

#[cfg(test)]
mod test_support;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::catalog::{CatalogClient, CatalogError, CatalogUpdate};
    pub use crate::config::{Config, ConfigError};
    pub use crate::downloader::{FetchError, HttpTransport, SegmentProber, Transport};
    pub use crate::fetcher::ManifestFetcher;
    pub use crate::manager::{EncodingManager, RunSummary};
    pub use crate::models::{Encoding, EncodingSet, Genre, Track, Video, VideoId};
    pub use crate::resolver::{EncodingResolver, ResolveError};
    pub use crate::retry::{FailureClass, RetryPolicies, Retryable};
    pub use crate::store::{EncodingStore, SqliteStore, StateError};
}
