//! Wire types for the upstream diary API.
//!
//! The upstream payload is loosely typed: field names vary between API
//! revisions (`isRewatched`/`isRewatch`, `containsSpoiler`/`containsSpoilers`)
//! and season data sometimes only appears in the `showSeasons` array. Raw
//! entries are parsed permissively here and converted to the strict
//! [`DiaryEntry`] in one place, failing the whole page when a required field
//! is missing.

use crate::model::DiaryEntry;
use chrono::{DateTime, Utc};
use serde::Deserialize;

/// One page of the diary endpoint.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiaryPageResponse {
    #[serde(default)]
    pub reviews: Vec<RawDiaryEntry>,
    #[serde(default)]
    pub total_pages: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawDiaryEntry {
    pub id: Option<i64>,
    pub show_id: Option<i64>,
    pub show_name: Option<String>,
    pub season_id: Option<i64>,
    pub season_number: Option<i32>,
    pub season_name: Option<String>,
    pub episode_number: Option<i32>,
    /// When the entry was logged.
    pub date_added: Option<String>,
    /// User-supplied watch date, preferred over `date_added` when present.
    pub backdate: Option<String>,
    pub rating: Option<f32>,
    pub like: Option<bool>,
    #[serde(default)]
    pub is_rewatched: bool,
    #[serde(default)]
    pub is_rewatch: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    pub review_text: Option<String>,
    #[serde(default)]
    pub contains_spoiler: bool,
    #[serde(default)]
    pub contains_spoilers: bool,
    pub show_banner_image: Option<String>,
    #[serde(default)]
    pub show_seasons: Vec<RawSeason>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSeason {
    pub id: Option<i64>,
    pub name: Option<String>,
    pub season_number: Option<i32>,
}

impl RawDiaryEntry {
    /// Convert to the strict domain type. Returns a human-readable reason on
    /// failure so the fetch can be classified as a malformed payload.
    pub fn into_entry(self) -> Result<DiaryEntry, String> {
        let id = self.id.ok_or("entry is missing an id")?;
        let show_id = self.show_id.ok_or("entry is missing a show id")?;
        let show_name = self
            .show_name
            .filter(|n| !n.trim().is_empty())
            .ok_or("entry is missing a show name")?;
        let raw_date = self
            .backdate
            .as_deref()
            .filter(|d| !d.is_empty())
            .or(self.date_added.as_deref())
            .ok_or("entry is missing a logged-at date")?;
        let logged_at: DateTime<Utc> = DateTime::parse_from_rfc3339(raw_date)
            .map_err(|e| format!("unparseable logged-at date '{raw_date}': {e}"))?
            .with_timezone(&Utc);

        // Season name/number may live only in the showSeasons array.
        let mut season_name = self.season_name.filter(|n| !n.trim().is_empty());
        let mut season_number = self.season_number;
        if season_name.is_none() {
            if let Some(season_id) = self.season_id {
                if let Some(season) = self
                    .show_seasons
                    .iter()
                    .find(|s| s.id == Some(season_id))
                {
                    season_name = season.name.clone().filter(|n| !n.trim().is_empty());
                    season_number = season_number.or(season.season_number);
                }
            }
        }

        Ok(DiaryEntry {
            id,
            show_id,
            show_name,
            season_number,
            season_name,
            episode_number: self.episode_number,
            logged_at,
            rating: self.rating.filter(|r| *r > 0.0),
            liked: self.like,
            rewatch: self.is_rewatched || self.is_rewatch,
            tags: self.tags,
            review_text: self.review_text.filter(|r| !r.is_empty()),
            contains_spoilers: self.contains_spoiler || self.contains_spoilers,
            show_banner: self.show_banner_image.filter(|b| !b.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawDiaryEntry {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn parses_full_entry() {
        let entry = raw(json!({
            "id": 42,
            "showId": 7,
            "showName": "Severance",
            "seasonNumber": 2,
            "seasonName": "Season 2",
            "episodeNumber": 3,
            "dateAdded": "2024-05-01T10:00:00Z",
            "rating": 9.0,
            "like": true,
            "isRewatched": true,
            "tags": ["rewatch-club"],
            "reviewText": "great",
            "containsSpoiler": true
        }))
        .into_entry()
        .unwrap();

        assert_eq!(entry.id, 42);
        assert_eq!(entry.show_name, "Severance");
        assert_eq!(entry.episode_number, Some(3));
        assert_eq!(entry.rating, Some(9.0));
        assert!(entry.rewatch);
        assert!(entry.contains_spoilers);
    }

    #[test]
    fn backdate_wins_over_date_added() {
        let entry = raw(json!({
            "id": 1,
            "showId": 2,
            "showName": "X",
            "dateAdded": "2024-05-02T00:00:00Z",
            "backdate": "2024-05-01T00:00:00Z"
        }))
        .into_entry()
        .unwrap();
        assert_eq!(entry.logged_at.to_rfc3339(), "2024-05-01T00:00:00+00:00");
    }

    #[test]
    fn episode_number_is_optional() {
        let entry = raw(json!({
            "id": 1,
            "showId": 2,
            "showName": "X",
            "dateAdded": "2024-05-01T00:00:00Z"
        }))
        .into_entry()
        .unwrap();
        assert_eq!(entry.episode_number, None);
        assert!(entry.tags.is_empty());
    }

    #[test]
    fn season_name_recovered_from_show_seasons() {
        let entry = raw(json!({
            "id": 1,
            "showId": 2,
            "showName": "X",
            "seasonId": 55,
            "dateAdded": "2024-05-01T00:00:00Z",
            "showSeasons": [
                {"id": 54, "name": "Season 1", "seasonNumber": 1},
                {"id": 55, "name": "Season 2", "seasonNumber": 2}
            ]
        }))
        .into_entry()
        .unwrap();
        assert_eq!(entry.season_name.as_deref(), Some("Season 2"));
        assert_eq!(entry.season_number, Some(2));
    }

    #[test]
    fn missing_id_is_rejected() {
        let err = raw(json!({
            "showId": 2,
            "showName": "X",
            "dateAdded": "2024-05-01T00:00:00Z"
        }))
        .into_entry()
        .unwrap_err();
        assert!(err.contains("id"));
    }

    #[test]
    fn unparseable_date_is_rejected() {
        let err = raw(json!({
            "id": 1,
            "showId": 2,
            "showName": "X",
            "dateAdded": "yesterday"
        }))
        .into_entry()
        .unwrap_err();
        assert!(err.contains("logged-at"));
    }
}
