//! Which accepted matches become detection rows.

use chrono::{DateTime, Local};
use std::collections::HashMap;
use std::time::Duration;

/// Decides whether an accepted match is written to the log.
///
/// A policy instance belongs to one streaming session.
pub trait RecordPolicy: Send {
    fn should_record(&mut self, identity: i64, at: DateTime<Local>) -> bool;
}

/// Log every accepted match on every frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordEveryMatch;

impl RecordPolicy for RecordEveryMatch {
    fn should_record(&mut self, _identity: i64, _at: DateTime<Local>) -> bool {
        true
    }
}

/// Log an identity at most once per `window`.
#[derive(Debug, Clone)]
pub struct DebounceByIdentity {
    window: Duration,
    last_recorded: HashMap<i64, DateTime<Local>>,
}

impl DebounceByIdentity {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_recorded: HashMap::new(),
        }
    }
}

impl RecordPolicy for DebounceByIdentity {
    fn should_record(&mut self, identity: i64, at: DateTime<Local>) -> bool {
        if let Some(last) = self.last_recorded.get(&identity) {
            // A clock step backwards yields a negative delta; record then.
            let within = (at - *last)
                .to_std()
                .map(|elapsed| elapsed < self.window)
                .unwrap_or(false);
            if within {
                return false;
            }
        }
        self.last_recorded.insert(identity, at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, 12, 0, secs).unwrap()
    }

    #[test]
    fn test_every_match_always_records() {
        let mut policy = RecordEveryMatch;
        assert!((0..5).all(|_| policy.should_record(1, at(0))));
    }

    #[test]
    fn test_debounce_per_identity() {
        let mut policy = DebounceByIdentity::new(Duration::from_secs(5));
        assert!(policy.should_record(1, at(0)));
        assert!(!policy.should_record(1, at(2)));
        assert!(policy.should_record(2, at(2)));
        assert!(policy.should_record(1, at(5)));
        assert!(!policy.should_record(1, at(9)));
    }

    #[test]
    fn test_debounce_zero_window_records_everything() {
        let mut policy = DebounceByIdentity::new(Duration::ZERO);
        assert!(policy.should_record(1, at(0)));
        assert!(policy.should_record(1, at(0)));
    }
}
