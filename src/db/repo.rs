use crate::model::{Cursor, TrackedUser};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, instrument};

pub type Pool = SqlitePool;

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Attempted cursor regression. Never expected in normal operation; a
    /// poll cycle that hits this aborts its own write and nothing else.
    #[error("cursor for tracked user {user_id} is not newer than the stored one")]
    StaleCursor { user_id: i64 },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Result of an idempotent `add_user` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyTracked,
}

/// Result of a cursor write. `Discarded` means the row disappeared while the
/// cycle was in flight (user removed); the write is dropped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorWrite {
    Advanced,
    Discarded,
}

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and make sure the
/// parent directory exists. In-memory and non-sqlite URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query_part {
        Some(q) => format!("sqlite://{}?{}", expanded, q),
        None => format!("sqlite://{}", expanded),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> TrackedUser {
    let entry_id: Option<i64> = row.get("cursor_entry_id");
    let logged_at: Option<DateTime<Utc>> = row.get("cursor_logged_at");
    let cursor = match (entry_id, logged_at) {
        (Some(entry_id), Some(logged_at)) => Some(Cursor {
            entry_id,
            logged_at,
        }),
        _ => None,
    };
    TrackedUser {
        id: row.get("id"),
        username: row.get("username"),
        destination_id: row.get("destination_id"),
        cursor,
        profile_private: row.get("profile_private"),
        added_at: row.get("added_at"),
    }
}

const USER_COLUMNS: &str =
    "id, username, destination_id, cursor_entry_id, cursor_logged_at, profile_private, added_at";

/// All tracked users across every destination, in insertion order. The
/// scheduler snapshots this once per cycle.
#[instrument(skip_all)]
pub async fn list_users(pool: &Pool) -> Result<Vec<TrackedUser>> {
    let rows = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM tracked_users ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_user).collect())
}

#[instrument(skip_all)]
pub async fn list_users_for_destination(
    pool: &Pool,
    destination_id: i64,
) -> Result<Vec<TrackedUser>> {
    let rows = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM tracked_users WHERE destination_id = ? ORDER BY id"
    ))
    .bind(destination_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(row_to_user).collect())
}

#[instrument(skip_all)]
pub async fn get_user(
    pool: &Pool,
    username: &str,
    destination_id: i64,
) -> Result<Option<TrackedUser>> {
    let row = sqlx::query(&format!(
        "SELECT {USER_COLUMNS} FROM tracked_users WHERE username = ? AND destination_id = ?"
    ))
    .bind(username)
    .bind(destination_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(row_to_user))
}

/// Track a (username, destination) pair. Re-adding an existing pair is a
/// no-op reported as `AlreadyTracked`.
#[instrument(skip_all, fields(username, destination_id))]
pub async fn add_user(pool: &Pool, username: &str, destination_id: i64) -> Result<AddOutcome> {
    let res = sqlx::query(
        "INSERT INTO tracked_users (username, destination_id) VALUES (?, ?) \
         ON CONFLICT (username, destination_id) DO NOTHING",
    )
    .bind(username)
    .bind(destination_id)
    .execute(pool)
    .await?;
    if res.rows_affected() == 0 {
        Ok(AddOutcome::AlreadyTracked)
    } else {
        Ok(AddOutcome::Added)
    }
}

/// Stop tracking a pair. Removing an untracked pair is success; an in-flight
/// poll cycle for the user sees its eventual cursor write discarded.
#[instrument(skip_all, fields(username, destination_id))]
pub async fn remove_user(pool: &Pool, username: &str, destination_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM tracked_users WHERE username = ? AND destination_id = ?")
        .bind(username)
        .bind(destination_id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_cursor(pool: &Pool, user_id: i64) -> Result<Option<Cursor>> {
    let row = sqlx::query(
        "SELECT cursor_entry_id, cursor_logged_at FROM tracked_users WHERE id = ?",
    )
    .bind(user_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let entry_id: Option<i64> = row.get("cursor_entry_id");
    let logged_at: Option<DateTime<Utc>> = row.get("cursor_logged_at");
    Ok(match (entry_id, logged_at) {
        (Some(entry_id), Some(logged_at)) => Some(Cursor {
            entry_id,
            logged_at,
        }),
        _ => None,
    })
}

/// Advance a user's cursor to a strictly newer position. The newer-than guard
/// lives in the UPDATE itself so out-of-order completion of concurrent cycles
/// cannot rewind it.
#[instrument(skip_all, fields(user_id))]
pub async fn advance_cursor(
    pool: &Pool,
    user_id: i64,
    cursor: Cursor,
) -> Result<CursorWrite, RegistryError> {
    let res = sqlx::query(
        "UPDATE tracked_users SET cursor_entry_id = ?, cursor_logged_at = ? \
         WHERE id = ? AND (cursor_logged_at IS NULL \
            OR cursor_logged_at < ? \
            OR (cursor_logged_at = ? AND cursor_entry_id != ?))",
    )
    .bind(cursor.entry_id)
    .bind(cursor.logged_at)
    .bind(user_id)
    .bind(cursor.logged_at)
    .bind(cursor.logged_at)
    .bind(cursor.entry_id)
    .execute(pool)
    .await?;

    if res.rows_affected() > 0 {
        return Ok(CursorWrite::Advanced);
    }

    // Zero rows is either a removal race (row gone) or a stale write.
    let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM tracked_users WHERE id = ?")
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        debug!(user_id, "cursor write discarded: user removed mid-cycle");
        Ok(CursorWrite::Discarded)
    } else {
        Err(RegistryError::StaleCursor { user_id })
    }
}

/// Soft-terminal marker: a private profile stays tracked but is skipped by
/// the poller until an external action clears the flag.
#[instrument(skip_all, fields(user_id, private))]
pub async fn set_profile_private(pool: &Pool, user_id: i64, private: bool) -> Result<()> {
    sqlx::query("UPDATE tracked_users SET profile_private = ? WHERE id = ?")
        .bind(private)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(())
}
