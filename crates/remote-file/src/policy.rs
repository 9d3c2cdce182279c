//! How often a resolved file is checked again.

use serde::{Deserialize, Serialize};

/// Decides the revalidation interval of a file.
pub trait RevalidationPolicy: Send + Sync {
    /// Seconds between checks of a file last modified at `last_modified`
    /// (unix seconds, `None` if unknown or missing) at time `now`.
    fn revalidate_every_seconds(&self, last_modified: Option<i64>, now: i64) -> i64;
}

/// Missing files are retried on a fixed backoff. Files modified recently are
/// checked often, since producers tend to rewrite the newest data. Everything
/// else is checked rarely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieredRevalidation {
    pub missing_secs: i64,
    pub recent_secs: i64,
    pub recent_window_secs: i64,
    pub stable_secs: i64,
}

impl Default for TieredRevalidation {
    fn default() -> Self {
        Self {
            missing_secs: 180,
            recent_secs: 60,
            recent_window_secs: 3 * 3600,
            stable_secs: 3600,
        }
    }
}

impl RevalidationPolicy for TieredRevalidation {
    fn revalidate_every_seconds(&self, last_modified: Option<i64>, now: i64) -> i64 {
        match last_modified {
            None => self.missing_secs,
            Some(lm) if now - lm < self.recent_window_secs => self.recent_secs,
            Some(_) => self.stable_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers() {
        let policy = TieredRevalidation::default();
        let now = 1_700_000_000;
        assert_eq!(policy.revalidate_every_seconds(None, now), 180);
        assert_eq!(policy.revalidate_every_seconds(Some(now - 60), now), 60);
        assert_eq!(policy.revalidate_every_seconds(Some(now - 3 * 3600 + 1), now), 60);
        assert_eq!(policy.revalidate_every_seconds(Some(now - 3 * 3600), now), 3600);
        assert_eq!(policy.revalidate_every_seconds(Some(0), now), 3600);
    }

    #[test]
    fn test_future_timestamp_counts_as_recent() {
        let policy = TieredRevalidation::default();
        assert_eq!(policy.revalidate_every_seconds(Some(2_000), 1_000), 60);
    }
}
