//! Diary fetcher for the upstream show-tracking service.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::any::Any;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::model::DiaryEntry;
use crate::serializd::model::DiaryPageResponse;

pub mod model;

pub const SERIALIZD_BASE: &str = "https://www.serializd.com/";

/// Failure classification for a diary fetch. The retry controller treats the
/// transient kinds as retryable within a cycle; the terminal kinds are
/// surfaced upward instead.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("rate limited by upstream")]
    RateLimited,
    #[error("profile not found")]
    ProfileNotFound,
    #[error("profile exists but entries are not visible")]
    ProfilePrivate,
    #[error("malformed upstream payload: {0}")]
    MalformedEntry(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::UpstreamUnavailable(_)
                | FetchError::RateLimited
                | FetchError::MalformedEntry(_)
        )
    }
}

/// One fetched page, newest entries first.
#[derive(Debug, Clone)]
pub struct DiaryPage {
    pub entries: Vec<DiaryEntry>,
    pub next_page: Option<u32>,
}

/// Abstraction over the upstream diary endpoint. Each fetch restarts
/// pagination; page tokens are not reusable across calls.
#[async_trait]
pub trait DiaryService: Send + Sync + Any {
    async fn fetch_page(&self, username: &str, page: u32) -> Result<DiaryPage, FetchError>;
}

#[derive(Clone)]
pub struct SerializdClient {
    http: Client,
    base_url: Url,
}

impl fmt::Debug for SerializdClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerializdClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SerializdClient {
    pub fn new(timeout: Duration) -> Self {
        let base_url = Url::parse(SERIALIZD_BASE).expect("valid default Serializd URL");
        Self::with_base_url(base_url, timeout)
    }

    pub fn with_base_url(base_url: Url, timeout: Duration) -> Self {
        // The API rejects requests without a browser-shaped identity and the
        // X-Requested-With marker.
        let http = Client::builder()
            .user_agent(
                "Mozilla/5.0 (Linux; Android 6.0; Nexus 5 Build/MRA58N) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/123.0.0.0 Mobile Safari/537.36",
            )
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self { http, base_url }
    }

    fn diary_url(&self, username: &str, page: u32) -> Result<Url, FetchError> {
        let mut url = self
            .base_url
            .join(&format!("api/user/{}/diary", username))
            .map_err(|e| FetchError::MalformedEntry(format!("invalid diary URL: {e}")))?;
        if page > 1 {
            url.query_pairs_mut().append_pair("page", &page.to_string());
        }
        Ok(url)
    }
}

fn classify_reqwest(err: reqwest::Error) -> FetchError {
    // Timeouts are indistinguishable from a down upstream for our purposes.
    FetchError::UpstreamUnavailable(err.to_string())
}

#[async_trait]
impl DiaryService for SerializdClient {
    async fn fetch_page(&self, username: &str, page: u32) -> Result<DiaryPage, FetchError> {
        let url = self.diary_url(username, page)?;
        let res = self
            .http
            .get(url)
            .header("Accept", "application/json, text/plain, */*")
            .header("Referer", self.base_url.as_str())
            .header("X-Requested-With", "serializd_vercel")
            .send()
            .await
            .map_err(classify_reqwest)?;

        match res.status() {
            StatusCode::NOT_FOUND => return Err(FetchError::ProfileNotFound),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::ProfilePrivate)
            }
            StatusCode::TOO_MANY_REQUESTS => return Err(FetchError::RateLimited),
            status if status.is_server_error() => {
                return Err(FetchError::UpstreamUnavailable(format!(
                    "upstream returned {status}"
                )))
            }
            status if !status.is_success() => {
                return Err(FetchError::UpstreamUnavailable(format!(
                    "unexpected upstream status {status}"
                )))
            }
            _ => {}
        }

        let body: DiaryPageResponse = res
            .json()
            .await
            .map_err(|e| FetchError::MalformedEntry(format!("undecodable page: {e}")))?;

        let count = body.reviews.len();
        let entries = body
            .reviews
            .into_iter()
            .map(|raw| raw.into_entry().map_err(FetchError::MalformedEntry))
            .collect::<Result<Vec<_>, _>>()?;
        debug!(username, page, count, "fetched diary page");

        let next_page = if entries.is_empty() {
            None
        } else {
            match body.total_pages {
                Some(total) if page >= total => None,
                _ => Some(page + 1),
            }
        };
        Ok(DiaryPage { entries, next_page })
    }
}
