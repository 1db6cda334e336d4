//! Backfill policy: decides the comparison baseline for a poll cycle.

use crate::model::{Cursor, DiaryEntry};
use chrono::{DateTime, Duration, Utc};

/// Stateless filter predicate handed to the novelty filter.
///
/// A freshly added user has no cursor; surfacing their whole diary would
/// flood the destination, so only entries inside the backfill window are
/// eligible on the first cycle. Established users get everything after the
/// cursor, where "after" includes entries sharing the cursor's timestamp but
/// carrying a different id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Baseline {
    Backfill { since: DateTime<Utc> },
    AfterCursor(Cursor),
}

impl Baseline {
    pub fn for_user(cursor: Option<Cursor>, now: DateTime<Utc>, window: Duration) -> Self {
        match cursor {
            Some(cursor) => Baseline::AfterCursor(cursor),
            None => Baseline::Backfill {
                since: now - window,
            },
        }
    }

    pub fn admits(&self, entry: &DiaryEntry) -> bool {
        match self {
            Baseline::Backfill { since } => entry.logged_at >= *since,
            Baseline::AfterCursor(cursor) => cursor.admits(entry.id, entry.logged_at),
        }
    }
}
