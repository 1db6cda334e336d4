//! Discord output sink: posts one embed per delivered diary entry.

use crate::model::{DiaryEntry, Notification};
use crate::pipeline::dispatch::{Sink, SinkError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use tracing::warn;

const DISCORD_API_BASE: &str = "https://discord.com/";
const EMBED_COLOUR: u32 = 0x6C63FF;
const REVIEW_PREVIEW_CHARS: usize = 300;
const MAX_TAGS: usize = 5;

#[derive(Clone)]
pub struct DiscordClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for DiscordClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscordClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl DiscordClient {
    pub fn new(token: String, timeout: Duration) -> Self {
        let base_url = Url::parse(DISCORD_API_BASE).expect("valid default Discord URL");
        Self::with_base_url(token, base_url, timeout)
    }

    pub fn with_base_url(token: String, base_url: Url, timeout: Duration) -> Self {
        let http = Client::builder()
            .user_agent("serializd-relay/0.1")
            .timeout(timeout)
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    fn messages_url(&self, channel_id: i64) -> Result<Url, SinkError> {
        self.base_url
            .join(&format!("api/v10/channels/{}/messages", channel_id))
            .map_err(|_| SinkError::Gone)
    }
}

/// Pull the retry-after hint out of a 429 response body, falling back to the
/// Retry-After header.
fn retry_after_hint(headers: &reqwest::header::HeaderMap, body: &str) -> Option<Duration> {
    let from_body = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| value.get("retry_after").and_then(Value::as_f64))
        // A negative, non-finite or overflowing body value falls through to
        // the header.
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
    if from_body.is_some() {
        return from_body;
    }
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl Sink for DiscordClient {
    async fn send(&self, notification: &Notification) -> Result<(), SinkError> {
        let url = self.messages_url(notification.destination_id)?;
        let body = json!({
            "embeds": [build_entry_embed(&notification.username, &notification.entry)],
        });

        let res = self
            .http
            .post(url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                warn!(?err, "failed to reach Discord");
                SinkError::Transient { retry_after: None }
            })?;

        let status = res.status();
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::TOO_MANY_REQUESTS => {
                let headers = res.headers().clone();
                let body = res.text().await.unwrap_or_default();
                warn!(%body, "rate limited by Discord");
                Err(SinkError::Transient {
                    retry_after: retry_after_hint(&headers, &body),
                })
            }
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => {
                warn!(
                    destination = notification.destination_id,
                    %status,
                    "destination rejected send permanently"
                );
                Err(SinkError::Gone)
            }
            _ => {
                let body = res.text().await.unwrap_or_default();
                warn!(%status, %body, "Discord API error");
                Err(SinkError::Transient { retry_after: None })
            }
        }
    }
}

/// Render a diary entry as a Discord embed payload. Pure so it can be tested
/// without a network.
pub fn build_entry_embed(username: &str, entry: &DiaryEntry) -> Value {
    let mut title = format!("📺  {}", entry.show_name);
    if let Some(season_name) = entry.season_name.as_deref().filter(|n| !n.is_empty()) {
        title.push_str(&format!("  ·  {}", season_name));
    } else if let Some(season) = entry.season_number {
        title.push_str(&format!("  ·  Season {}", season));
    }
    if let Some(episode) = entry.episode_number {
        title.push_str(&format!("  ·  Episode {}", episode));
    }

    let ts = entry.logged_at.timestamp();
    let mut parts = vec![format!("**Logged:** <t:{ts}:R> (<t:{ts}:f>)")];

    if let Some(rating) = entry.rating {
        // Upstream rates on a 0-10 scale; render halved with star glyphs.
        let halved = rating / 2.0;
        let full = halved.floor() as usize;
        let half = (halved - halved.floor()) >= 0.5;
        let mut stars = "★".repeat(full);
        if half {
            stars.push('½');
        }
        parts.push(format!("**Rating:** {stars}  ({halved}/5)"));
    }

    match entry.liked {
        Some(true) => parts.push("**❤️ Liked**".into()),
        Some(false) => parts.push("**💔 Not Liked**".into()),
        None => {}
    }

    if entry.rewatch {
        parts.push("**🔄 Rewatched**".into());
    } else {
        parts.push("**👀 First Watch**".into());
    }

    if !entry.tags.is_empty() {
        let tags = entry
            .tags
            .iter()
            .take(MAX_TAGS)
            .map(|t| format!("#{t}"))
            .collect::<Vec<_>>()
            .join(", ");
        parts.push(format!("**Tags:** {tags}"));
    }

    if let Some(review) = entry.review_text.as_deref() {
        let preview = if review.chars().count() <= REVIEW_PREVIEW_CHARS {
            review.to_string()
        } else {
            let cut: String = review.chars().take(REVIEW_PREVIEW_CHARS - 3).collect();
            format!("{cut}…")
        };
        if entry.contains_spoilers {
            parts.push(format!("\n**Review:** ||{preview}||"));
        } else {
            parts.push(format!("\n**Review:** {preview}"));
        }
    }

    let entry_url = format!(
        "https://www.serializd.com/user/{}/diary/{}",
        username, entry.id
    );

    let mut embed = json!({
        "title": title,
        "url": entry_url,
        "description": parts.join("\n"),
        "color": EMBED_COLOUR,
        "timestamp": entry.logged_at.to_rfc3339(),
        "author": {
            "name": format!("{} logged on Serializd", username),
            "url": format!("https://www.serializd.com/user/{}/diary", username),
        },
    });

    if let Some(banner) = entry.show_banner.as_deref() {
        let thumb = if banner.starts_with("http") {
            banner.to_string()
        } else {
            format!("https://image.tmdb.org/t/p/w300{banner}")
        };
        embed["thumbnail"] = json!({ "url": thumb });
    }

    embed
}
