//! Novelty filter: reduces fetched pages to the genuinely-new entries.

use crate::model::DiaryEntry;
use crate::pipeline::baseline::Baseline;
use std::collections::HashSet;

/// Keep the entries admitted by the baseline, de-duplicated by id, sorted
/// oldest-first.
///
/// Upstream pagination is not guaranteed disjoint, so the same entry may
/// arrive twice within one cycle; the first occurrence wins. The oldest-first
/// order is load-bearing: the dispatcher advances the cursor per delivered
/// entry, so an interrupted batch resumes exactly where it stopped instead of
/// skipping or re-sending entries.
pub fn select_new(entries: Vec<DiaryEntry>, baseline: &Baseline) -> Vec<DiaryEntry> {
    let mut seen = HashSet::new();
    let mut new: Vec<DiaryEntry> = entries
        .into_iter()
        .filter(|e| baseline.admits(e) && seen.insert(e.id))
        .collect();
    new.sort_by_key(|e| (e.logged_at, e.id));
    new
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn entry(id: i64, ts: i64) -> DiaryEntry {
        DiaryEntry {
            id,
            show_id: 1,
            show_name: "Show".into(),
            season_number: None,
            season_name: None,
            episode_number: None,
            logged_at: Utc.timestamp_opt(ts, 0).unwrap(),
            rating: None,
            liked: None,
            rewatch: false,
            tags: vec![],
            review_text: None,
            contains_spoilers: false,
            show_banner: None,
        }
    }

    fn backfill_since(ts: i64) -> Baseline {
        Baseline::Backfill {
            since: Utc.timestamp_opt(ts, 0).unwrap(),
        }
    }

    #[test]
    fn sorts_oldest_first() {
        let fetched = vec![entry(3, 1_003), entry(1, 1_001), entry(2, 1_002)];
        let new = select_new(fetched, &backfill_since(1_000));
        let ids: Vec<i64> = new.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn drops_duplicates_across_pages() {
        // Entry 2 appears on two overlapping pages.
        let fetched = vec![entry(3, 1_003), entry(2, 1_002), entry(2, 1_002), entry(1, 1_001)];
        let new = select_new(fetched, &backfill_since(1_000));
        let ids: Vec<i64> = new.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn filters_entries_outside_baseline() {
        let fetched = vec![entry(3, 1_003), entry(2, 900)];
        let new = select_new(fetched, &backfill_since(1_000));
        let ids: Vec<i64> = new.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn same_timestamp_entries_keep_id_order() {
        let fetched = vec![entry(8, 1_000), entry(7, 1_000)];
        let new = select_new(fetched, &backfill_since(900));
        let ids: Vec<i64> = new.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![7, 8]);
    }

    #[test]
    fn empty_result_is_fine() {
        assert!(select_new(vec![], &backfill_since(0)).is_empty());
    }
}
