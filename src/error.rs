use thiserror::Error;

/// Failures the feed core records or reports. Item-level variants never touch
/// sequence-level state; only `PageLoad` ends up in `FeedState::last_error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("failed to load feed page: {0}")]
    PageLoad(String),
    #[error("video {item_id} failed: {message}")]
    Playback { item_id: String, message: String },
    #[error("prefetch of {item_id} failed: {message}")]
    Prefetch { item_id: String, message: String },
}

impl FeedError {
    pub fn page_load(err: &anyhow::Error) -> Self {
        FeedError::PageLoad(format!("{err:#}"))
    }

    pub fn is_page_load(&self) -> bool {
        matches!(self, FeedError::PageLoad(_))
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload of {key} failed after {attempts} attempt(s)")]
    Exhausted {
        key: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("uploaded {key} but the dependent record update failed")]
    Link {
        key: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("invalid upload: {0}")]
    Invalid(String),
}
