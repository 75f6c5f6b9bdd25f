//! Canonical hashtag statistics record and `last_update` sentinels.

/// `last_update` value of a row that has never been fetched.
pub const NEVER_FETCHED: i64 = 0;
/// `last_update` value of a tag the remote service does not recognize.
pub const INVALID_SENTINEL: i64 = 9_999_999_999;
/// Separator used for joined tag lists, both on the wire and in storage.
pub const NAME_SEPARATOR: char = ',';

/// Statistics for one tag, keyed by `name`.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct HashtagRecord {
    pub name: String,
    /// Opaque identifier assigned by the remote service.
    pub hashtag_id: Option<String>,
    pub likes: Option<i64>,
    pub comments: Option<i64>,
    pub engagement: Option<i64>,
    /// `None` means unknown, `Some(vec![])` means the service reported none.
    pub suggestions: Option<Vec<String>>,
    /// Derived from `likes` and the current user's daily likes.
    pub score: Option<f64>,
    /// Epoch seconds of the last successful fetch, or one of the sentinels.
    pub last_update: i64,
}

/// Interpretation of `HashtagRecord::last_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    NeverFetched,
    Invalid,
    FetchedAt(i64),
}

impl HashtagRecord {
    /// Shell row created before the first lookup.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hashtag_id: None,
            likes: None,
            comments: None,
            engagement: None,
            suggestions: None,
            score: None,
            last_update: NEVER_FETCHED,
        }
    }

    /// Outcome for a requested tag that the service silently dropped.
    pub fn invalid(name: impl Into<String>) -> Self {
        Self {
            last_update: INVALID_SENTINEL,
            ..Self::empty(name)
        }
    }

    pub fn fetch_state(&self) -> FetchState {
        match self.last_update {
            NEVER_FETCHED => FetchState::NeverFetched,
            INVALID_SENTINEL => FetchState::Invalid,
            timestamp => FetchState::FetchedAt(timestamp),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.fetch_state() == FetchState::Invalid
    }

    /// Storage form of `suggestions`.
    pub fn joined_suggestions(&self) -> Option<String> {
        self.suggestions
            .as_ref()
            .map(|suggestions| suggestions.join(&NAME_SEPARATOR.to_string()))
    }
}

/// Inverse of `HashtagRecord::joined_suggestions`.
pub fn split_suggestions(joined: &str) -> Vec<String> {
    joined
        .split(NAME_SEPARATOR)
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(str::to_string)
        .collect()
}
