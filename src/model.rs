use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// High-water mark of delivered entries for one tracked user.
///
/// Ordering is by `logged_at` first; two entries logged at the same instant
/// are distinguished by id, so a cursor may move "sideways" in time but never
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub entry_id: i64,
    pub logged_at: DateTime<Utc>,
}

impl Cursor {
    /// True if the given entry is strictly newer than this cursor: a later
    /// timestamp, or the same timestamp under a different entry id.
    pub fn admits(&self, entry_id: i64, logged_at: DateTime<Utc>) -> bool {
        logged_at > self.logged_at || (logged_at == self.logged_at && entry_id != self.entry_id)
    }
}

/// One monitored diary bound to a delivery destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedUser {
    pub id: i64,
    pub username: String,
    pub destination_id: i64,
    pub cursor: Option<Cursor>,
    pub profile_private: bool,
    pub added_at: DateTime<Utc>,
}

/// One logged viewing event fetched from the upstream diary. Immutable once
/// parsed; the pipeline only reads and classifies entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiaryEntry {
    pub id: i64,
    pub show_id: i64,
    pub show_name: String,
    pub season_number: Option<i32>,
    pub season_name: Option<String>,
    /// Absent for season- or show-level log entries.
    pub episode_number: Option<i32>,
    pub logged_at: DateTime<Utc>,
    /// Upstream 0-10 scale.
    pub rating: Option<f32>,
    pub liked: Option<bool>,
    pub rewatch: bool,
    pub tags: Vec<String>,
    pub review_text: Option<String>,
    pub contains_spoilers: bool,
    pub show_banner: Option<String>,
}

impl DiaryEntry {
    pub fn cursor(&self) -> Cursor {
        Cursor {
            entry_id: self.id,
            logged_at: self.logged_at,
        }
    }
}

/// Ephemeral pairing of a new entry with the user and destination it is to be
/// delivered for. Created by the novelty filter, consumed by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub username: String,
    pub destination_id: i64,
    pub entry: DiaryEntry,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(ts: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(ts, 0).unwrap()
    }

    #[test]
    fn cursor_admits_later_timestamp() {
        let c = Cursor {
            entry_id: 7,
            logged_at: at(1_000),
        };
        assert!(c.admits(8, at(1_001)));
        assert!(!c.admits(8, at(999)));
    }

    #[test]
    fn cursor_admits_same_timestamp_different_id() {
        let c = Cursor {
            entry_id: 7,
            logged_at: at(1_000),
        };
        assert!(c.admits(8, at(1_000)));
        assert!(!c.admits(7, at(1_000)));
    }
}
