//! Per-user daily-likes cache backing score computation.

use std::collections::HashMap;

use log::{debug, warn};

use crate::db_manager::DbManager;

/// Reads each user's daily likes once and keeps it for the engine's lifetime
/// unless explicitly invalidated.
#[derive(Debug, Default)]
pub struct UserBaselineCache {
    daily_likes: HashMap<String, Option<i64>>,
}

impl UserBaselineCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn daily_likes(&mut self, db_manager: &DbManager, user: &str) -> Option<i64> {
        if let Some(cached) = self.daily_likes.get(user) {
            return *cached;
        }
        match db_manager.user_daily_likes(user) {
            Ok(daily_likes) => {
                debug!("Loaded daily likes for user {}: {:?}", user, daily_likes);
                self.daily_likes.insert(user.to_string(), daily_likes);
                daily_likes
            }
            Err(error) => {
                // Not cached, so the next lookup retries the read
                warn!("Failed to read daily likes for user {}: {}", user, error);
                None
            }
        }
    }

    pub fn invalidate(&mut self, user: &str) {
        self.daily_likes.remove(user);
    }
}
