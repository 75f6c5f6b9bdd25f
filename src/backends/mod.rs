//! Remote hashtag statistics backends.

pub mod hashtag_api;

/// Coarse classification of a failed outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpFailureKind {
    RateLimited,
    Hard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    pub kind: HttpFailureKind,
    pub message: String,
}

impl BackendFailure {
    pub fn hard(message: impl Into<String>) -> Self {
        Self {
            kind: HttpFailureKind::Hard,
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            kind: HttpFailureKind::RateLimited,
            message: message.into(),
        }
    }
}

/// Interface implemented by hashtag lookup transports.
///
/// Called from short-lived dispatch threads, one call per chunk.
pub trait HashtagBackend: Send + Sync {
    /// Fetches the raw response body for one comma-joined chunk of tag names.
    fn fetch_chunk(&self, chunk: &str) -> Result<String, BackendFailure>;
}
