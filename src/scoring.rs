//! Ranking score derived from a tag's likes and the user's daily likes.

use std::fmt;

use crate::hashtag::{FetchState, HashtagRecord};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    /// Never fetched, invalid, no likes, or no usable baseline.
    Unscored,
    Ratio(f64),
}

impl Score {
    pub fn as_option(self) -> Option<f64> {
        match self {
            Self::Unscored => None,
            Self::Ratio(value) => Some(value),
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unscored => f.pad("-"),
            Self::Ratio(value) => f.pad(&format!("{value:.2}")),
        }
    }
}

/// Presentation buckets consumers use for ranking and coloring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreTier {
    Invalid,
    Unknown,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl ScoreTier {
    pub fn label(self) -> &'static str {
        match self {
            Self::Invalid => "invalid",
            Self::Unknown => "unknown",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::VeryHigh => "very-high",
        }
    }
}

pub fn score(record: &HashtagRecord, daily_likes: i64) -> Score {
    if !matches!(record.fetch_state(), FetchState::FetchedAt(_)) {
        return Score::Unscored;
    }
    match record.likes {
        Some(likes) if likes != 0 && daily_likes > 0 => {
            Score::Ratio(likes as f64 / daily_likes as f64)
        }
        _ => Score::Unscored,
    }
}

pub fn tier(record: &HashtagRecord, score: Score) -> ScoreTier {
    if record.is_invalid() {
        return ScoreTier::Invalid;
    }
    match score {
        Score::Unscored => ScoreTier::Unknown,
        Score::Ratio(value) if value < 1.0 => ScoreTier::Low,
        Score::Ratio(value) if value < 2.0 => ScoreTier::Medium,
        Score::Ratio(value) if value < 3.0 => ScoreTier::High,
        Score::Ratio(_) => ScoreTier::VeryHigh,
    }
}
