//! Retry/backoff controller for upstream fetches.

use crate::model::DiaryEntry;
use crate::pipeline::baseline::Baseline;
use crate::serializd::{DiaryService, FetchError};
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded exponential backoff with jitter. Shared by the fetch controller
/// and the dispatcher's per-ticket retries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based attempt: base doubled
    /// per attempt, capped, plus up to 50% random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..=0.5);
        exp + exp.mul_f64(jitter)
    }
}

/// Terminal result of one user's fetch phase within a cycle.
#[derive(Debug)]
pub enum FetchOutcome {
    Fetched(Vec<DiaryEntry>),
    /// Transient failures exceeded the attempt ceiling; deferred to the next
    /// scheduled cycle with no cursor change.
    Exhausted,
    ProfileNotFound,
    ProfilePrivate,
}

/// Walk the diary newest-first, restarting pagination from the top. Stops at
/// an empty page, at the page cap, or once an entry older than the baseline
/// is seen; pages up to that point are returned whole and the novelty filter
/// trims the rest.
async fn fetch_pages(
    service: &dyn DiaryService,
    username: &str,
    baseline: &Baseline,
    max_pages: u32,
) -> Result<Vec<DiaryEntry>, FetchError> {
    let mut collected = Vec::new();
    let mut page = 1u32;
    loop {
        let fetched = service.fetch_page(username, page).await?;
        if fetched.entries.is_empty() {
            break;
        }
        let reached_baseline = fetched.entries.iter().any(|e| !baseline.admits(e));
        collected.extend(fetched.entries);
        if reached_baseline {
            break;
        }
        match fetched.next_page {
            Some(next) if next <= max_pages => page = next,
            _ => break,
        }
    }
    Ok(collected)
}

/// Fetch a user's diary with bounded retries. Transient failures (network,
/// 5xx, rate limiting, malformed payloads) are retried with backoff within
/// the cycle; terminal failures are reported as-is for the scheduler to
/// surface upward.
pub async fn fetch_with_retry(
    service: &dyn DiaryService,
    username: &str,
    baseline: &Baseline,
    policy: &RetryPolicy,
    max_pages: u32,
) -> FetchOutcome {
    for attempt in 0..policy.max_attempts {
        match fetch_pages(service, username, baseline, max_pages).await {
            Ok(entries) => {
                debug!(username, count = entries.len(), "diary fetch succeeded");
                return FetchOutcome::Fetched(entries);
            }
            Err(FetchError::ProfileNotFound) => return FetchOutcome::ProfileNotFound,
            Err(FetchError::ProfilePrivate) => return FetchOutcome::ProfilePrivate,
            Err(err) => {
                debug_assert!(err.is_transient());
                let last = attempt + 1 == policy.max_attempts;
                warn!(username, attempt, ?err, "diary fetch failed");
                if !last {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
            }
        }
    }
    FetchOutcome::Exhausted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializd::DiaryPage;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

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

    fn tiny_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
        };
        // Jitter adds at most 50%, so bounds are deterministic.
        let d0 = policy.delay_for(0);
        assert!(d0 >= Duration::from_secs(2) && d0 <= Duration::from_secs(3));
        let d1 = policy.delay_for(1);
        assert!(d1 >= Duration::from_secs(4) && d1 <= Duration::from_secs(6));
        let d4 = policy.delay_for(4);
        assert!(d4 >= Duration::from_secs(10) && d4 <= Duration::from_secs(15));
    }

    struct RateLimitedAlways {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DiaryService for RateLimitedAlways {
        async fn fetch_page(&self, _username: &str, _page: u32) -> Result<DiaryPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::RateLimited)
        }
    }

    #[tokio::test]
    async fn rate_limited_upstream_exhausts_attempt_ceiling() {
        let service = RateLimitedAlways {
            calls: AtomicU32::new(0),
        };
        let baseline = Baseline::Backfill {
            since: Utc.timestamp_opt(0, 0).unwrap(),
        };
        let outcome =
            fetch_with_retry(&service, "alice", &baseline, &tiny_policy(3), 5).await;
        assert!(matches!(outcome, FetchOutcome::Exhausted));
        assert_eq!(service.calls.load(Ordering::SeqCst), 3);
    }

    struct FlakyThenOk {
        calls: AtomicU32,
    }

    #[async_trait]
    impl DiaryService for FlakyThenOk {
        async fn fetch_page(&self, _username: &str, page: u32) -> Result<DiaryPage, FetchError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(FetchError::UpstreamUnavailable("503".into()));
            }
            Ok(DiaryPage {
                entries: if page == 1 { vec![entry(1, 1_000)] } else { vec![] },
                next_page: None,
            })
        }
    }

    #[tokio::test]
    async fn transient_failure_retries_within_cycle() {
        let service = FlakyThenOk {
            calls: AtomicU32::new(0),
        };
        let baseline = Baseline::Backfill {
            since: Utc.timestamp_opt(0, 0).unwrap(),
        };
        let outcome =
            fetch_with_retry(&service, "alice", &baseline, &tiny_policy(3), 5).await;
        match outcome {
            FetchOutcome::Fetched(entries) => assert_eq!(entries.len(), 1),
            other => panic!("expected fetch, got {:?}", other),
        }
    }

    struct TwoPagesStoppingEarly;

    #[async_trait]
    impl DiaryService for TwoPagesStoppingEarly {
        async fn fetch_page(&self, _username: &str, page: u32) -> Result<DiaryPage, FetchError> {
            match page {
                // Oldest entry on page 1 predates the baseline below.
                1 => Ok(DiaryPage {
                    entries: vec![entry(3, 2_000), entry(2, 500)],
                    next_page: Some(2),
                }),
                _ => panic!("pagination should have stopped after page 1"),
            }
        }
    }

    #[tokio::test]
    async fn pagination_stops_at_baseline() {
        let baseline = Baseline::Backfill {
            since: Utc.timestamp_opt(1_000, 0).unwrap(),
        };
        let outcome = fetch_with_retry(
            &TwoPagesStoppingEarly,
            "alice",
            &baseline,
            &tiny_policy(1),
            5,
        )
        .await;
        match outcome {
            FetchOutcome::Fetched(entries) => assert_eq!(entries.len(), 2),
            other => panic!("expected fetch, got {:?}", other),
        }
    }

    struct PrivateProfile;

    #[async_trait]
    impl DiaryService for PrivateProfile {
        async fn fetch_page(&self, _username: &str, _page: u32) -> Result<DiaryPage, FetchError> {
            Err(FetchError::ProfilePrivate)
        }
    }

    #[tokio::test]
    async fn terminal_errors_skip_retries() {
        let baseline = Baseline::Backfill {
            since: Utc.timestamp_opt(0, 0).unwrap(),
        };
        let outcome =
            fetch_with_retry(&PrivateProfile, "alice", &baseline, &tiny_policy(5), 5).await;
        assert!(matches!(outcome, FetchOutcome::ProfilePrivate));
    }
}
