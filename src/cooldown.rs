//! Global throttling cooldown for outbound lookups.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(2 * 60 * 60);

pub fn now_unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

/// Tracks the "resume-not-before" timestamp set by a throttling response.
///
/// One window covers every dispatch; there is no backoff and no jitter.
#[derive(Debug, Clone)]
pub struct CooldownPolicy {
    resume_not_before: Option<i64>,
    duration_secs: i64,
}

impl CooldownPolicy {
    pub fn new(duration: Duration) -> Self {
        Self {
            resume_not_before: None,
            duration_secs: duration.as_secs() as i64,
        }
    }

    pub fn is_cooling_down(&self, now: i64) -> bool {
        self.resume_not_before
            .is_some_and(|resume_not_before| now < resume_not_before)
    }

    /// Starts a new window at `now` and returns its end.
    pub fn trip(&mut self, now: i64) -> i64 {
        let resume_not_before = now.saturating_add(self.duration_secs);
        self.resume_not_before = Some(resume_not_before);
        resume_not_before
    }

    pub fn remaining(&self, now: i64) -> Option<Duration> {
        self.resume_not_before
            .filter(|_| self.is_cooling_down(now))
            .map(|resume_not_before| Duration::from_secs((resume_not_before - now) as u64))
    }
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::CooldownPolicy;

    #[test]
    fn test_fresh_policy_allows_dispatch() {
        let policy = CooldownPolicy::default();
        assert!(!policy.is_cooling_down(0));
        assert_eq!(policy.remaining(0), None);
    }

    #[test]
    fn test_trip_blocks_until_two_hours_elapse() {
        let mut policy = CooldownPolicy::default();
        let tripped_at = 1_700_000_000;

        assert_eq!(policy.trip(tripped_at), tripped_at + 7200);

        assert!(policy.is_cooling_down(tripped_at));
        assert!(policy.is_cooling_down(tripped_at + 7199));
        assert!(!policy.is_cooling_down(tripped_at + 7200));
        assert!(!policy.is_cooling_down(tripped_at + 7201));
        assert_eq!(
            policy.remaining(tripped_at + 7000),
            Some(Duration::from_secs(200))
        );
    }

    #[test]
    fn test_retrip_extends_window_from_latest_signal() {
        let mut policy = CooldownPolicy::new(Duration::from_secs(60));
        policy.trip(100);

        assert_eq!(policy.trip(130), 190);
        assert!(policy.is_cooling_down(170));
    }
}
