//! Diary ingestion pipeline: scheduler, backfill policy, novelty filter,
//! dispatch queue and retry control.
//!
//! The scheduler wakes on a fixed interval and fans out one unit of work per
//! tracked user under bounded concurrency. Within a unit the steps are
//! strictly sequential: fetch → baseline → novelty filter → dispatch → cursor
//! advance. The registry is the only shared mutable state and its writes are
//! scoped per user, so units never contend with each other.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::model::TrackedUser;
use crate::pipeline::baseline::Baseline;
use crate::pipeline::dispatch::{BatchOutcome, Dispatcher};
use crate::pipeline::novelty::select_new;
use crate::pipeline::retry::{fetch_with_retry, FetchOutcome, RetryPolicy};
use crate::serializd::DiaryService;
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

pub mod baseline;
pub mod dispatch;
pub mod novelty;
pub mod retry;

/// Tunables for one poll cycle, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub backfill_window: chrono::Duration,
    pub fetch_concurrency: usize,
    pub max_pages: u32,
    pub fetch_retry: RetryPolicy,
}

impl PollSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            backfill_window: cfg.backfill_window(),
            fetch_concurrency: cfg.app.fetch_concurrency,
            max_pages: cfg.app.max_pages_per_cycle,
            fetch_retry: RetryPolicy {
                max_attempts: cfg.app.fetch_retry_max_attempts,
                base_delay: Duration::from_millis(cfg.app.fetch_retry_base_delay_ms),
                max_delay: Duration::from_millis(cfg.app.fetch_retry_max_delay_ms),
            },
        }
    }
}

/// Per-user result of one cycle, aggregated into a [`CycleSummary`].
#[derive(Debug)]
enum UserOutcome {
    SkippedPrivate,
    Delivered(usize),
    /// Fetch retries exhausted; deferred to the next scheduled cycle.
    Deferred,
    ProfileNotFound { username: String, destination_id: i64 },
    BecamePrivate,
    DestinationGone { destination_id: i64, delivered: usize },
    Failed,
}

/// Upward report of one cycle. `not_found` users and `gone_destinations` are
/// deactivation signals for whoever owns the registry records; the pipeline
/// itself never deletes them.
#[derive(Debug, Default)]
pub struct CycleSummary {
    pub users_polled: usize,
    /// Users whose fetch was suppressed by the private flag. The registry
    /// snapshot size is `users_polled + skipped`.
    pub skipped: usize,
    pub delivered: usize,
    pub deferred: usize,
    pub failures: usize,
    pub not_found: Vec<(String, i64)>,
    pub gone_destinations: Vec<i64>,
}

impl CycleSummary {
    fn absorb(&mut self, outcome: UserOutcome) {
        match outcome {
            UserOutcome::SkippedPrivate => {
                self.skipped += 1;
            }
            UserOutcome::Delivered(n) => {
                self.users_polled += 1;
                self.delivered += n;
            }
            UserOutcome::Deferred => {
                self.users_polled += 1;
                self.deferred += 1;
            }
            UserOutcome::ProfileNotFound {
                username,
                destination_id,
            } => {
                self.users_polled += 1;
                self.not_found.push((username, destination_id));
            }
            UserOutcome::BecamePrivate => {
                self.users_polled += 1;
            }
            UserOutcome::DestinationGone {
                destination_id,
                delivered,
            } => {
                self.users_polled += 1;
                self.delivered += delivered;
                if !self.gone_destinations.contains(&destination_id) {
                    self.gone_destinations.push(destination_id);
                }
            }
            UserOutcome::Failed => {
                self.users_polled += 1;
                self.failures += 1;
            }
        }
    }
}

/// The periodic driver. Holds its collaborators by reference-counted handles
/// so tests can construct isolated instances and drive cycles via [`tick`]
/// without real-time waiting.
///
/// [`tick`]: Poller::tick
pub struct Poller {
    pool: Pool,
    diary: Arc<dyn DiaryService>,
    dispatcher: Dispatcher,
    settings: PollSettings,
}

impl Poller {
    pub fn new(
        pool: Pool,
        diary: Arc<dyn DiaryService>,
        dispatcher: Dispatcher,
        settings: PollSettings,
    ) -> Self {
        Self {
            pool,
            diary,
            dispatcher,
            settings,
        }
    }

    /// Run the scheduler forever. A failed cycle is logged and the next tick
    /// self-heals; nothing here panics the process.
    pub async fn run(&self, interval: Duration) {
        info!(interval_secs = interval.as_secs(), "poll scheduler started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        loop {
            ticker.tick().await;
            let summary = self.tick().await;
            info!(
                users = summary.users_polled,
                skipped = summary.skipped,
                delivered = summary.delivered,
                deferred = summary.deferred,
                failures = summary.failures,
                "poll cycle complete"
            );
            for (username, destination_id) in &summary.not_found {
                warn!(%username, destination_id, "profile not found; flag for deactivation");
            }
            for destination_id in &summary.gone_destinations {
                warn!(destination_id, "destination gone; flag for deactivation");
            }
        }
    }

    /// Execute one poll cycle immediately. Snapshot the registry, fan out per
    /// user with bounded concurrency, and aggregate the results.
    #[instrument(skip_all)]
    pub async fn tick(&self) -> CycleSummary {
        let users = match db::list_users(&self.pool).await {
            Ok(users) => users,
            Err(err) => {
                error!(?err, "failed to list tracked users; skipping cycle");
                return CycleSummary::default();
            }
        };
        if users.is_empty() {
            debug!("no tracked users; nothing to poll");
            return CycleSummary::default();
        }

        let outcomes: Vec<UserOutcome> = futures::stream::iter(users)
            .map(|user| self.poll_user(user))
            .buffer_unordered(self.settings.fetch_concurrency.max(1))
            .collect()
            .await;

        let mut summary = CycleSummary::default();
        for outcome in outcomes {
            summary.absorb(outcome);
        }
        summary
    }

    /// One unit of work: fetch, filter, deliver, advance. Errors never
    /// escape; a single user's failure must not block other users' cycles.
    #[instrument(skip_all, fields(username = %user.username, destination = user.destination_id))]
    async fn poll_user(&self, user: TrackedUser) -> UserOutcome {
        if user.profile_private {
            // Logged at debug only; the soft-terminal transition was already
            // logged once when the flag was set.
            debug!("profile flagged private; skipping fetch");
            return UserOutcome::SkippedPrivate;
        }

        let baseline = Baseline::for_user(user.cursor, Utc::now(), self.settings.backfill_window);
        let fetched = fetch_with_retry(
            self.diary.as_ref(),
            &user.username,
            &baseline,
            &self.settings.fetch_retry,
            self.settings.max_pages,
        )
        .await;

        let entries = match fetched {
            FetchOutcome::Fetched(entries) => entries,
            FetchOutcome::Exhausted => {
                warn!("fetch attempts exhausted; deferring to next cycle");
                return UserOutcome::Deferred;
            }
            FetchOutcome::ProfileNotFound => {
                warn!("profile not found upstream");
                return UserOutcome::ProfileNotFound {
                    username: user.username,
                    destination_id: user.destination_id,
                };
            }
            FetchOutcome::ProfilePrivate => {
                warn!("profile is private; suppressing future fetches");
                if let Err(err) = db::set_profile_private(&self.pool, user.id, true).await {
                    error!(?err, "failed to persist profile-private flag");
                }
                return UserOutcome::BecamePrivate;
            }
        };

        let new = select_new(entries, &baseline);
        if new.is_empty() {
            debug!("no new entries");
            return UserOutcome::Delivered(0);
        }
        info!(count = new.len(), "delivering new diary entries");

        match self.dispatcher.deliver_batch(&self.pool, &user, new).await {
            Ok(report) => match report.outcome {
                BatchOutcome::Complete | BatchOutcome::Abandoned => {
                    UserOutcome::Delivered(report.delivered)
                }
                BatchOutcome::DestinationGone => UserOutcome::DestinationGone {
                    destination_id: user.destination_id,
                    delivered: report.delivered,
                },
            },
            Err(err) => {
                error!(?err, "delivery failed");
                UserOutcome::Failed
            }
        }
    }
}
