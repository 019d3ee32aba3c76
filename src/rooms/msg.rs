use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{profiles::Profile, RelayError, RelayResult};

pub const DEFAULT_HISTORY_LIMIT: i64 = 50;
pub const MAX_HISTORY_LIMIT: i64 = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(rename = "messageId")]
    pub id: Uuid,
    pub room_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A stored message plus whatever the user directory knows about its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub message: ChatMessage,
    pub sender: Option<Profile>,
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, MAX_HISTORY_LIMIT)
}

/// Chat persistence. Appends are serialized so that `created_at` never goes
/// backwards along insertion order, including across restarts: the first
/// append seeds the floor from the newest stored row.
#[derive(Debug)]
pub struct History {
    db_pool: SqlitePool,
    last_millis: Mutex<Option<i64>>,
}

impl History {
    pub fn new(db_pool: SqlitePool) -> Self {
        History {
            db_pool,
            last_millis: Mutex::new(None),
        }
    }

    pub async fn append(&self, room_id: &str, sender_id: &str, text: &str) -> RelayResult<ChatMessage> {
        if room_id.trim().is_empty() {
            return Err(RelayError::validation("roomId is required"));
        }
        if text.trim().is_empty() {
            return Err(RelayError::validation("text is required"));
        }

        let mut last_millis = self.last_millis.lock().await;
        let floor = match *last_millis {
            Some(millis) => millis,
            None => self.newest_stored().await?,
        };
        let millis = now_millis().max(floor);
        let created_at = from_millis(millis)?;

        let id = Uuid::now_v7();
        sqlx::query("INSERT INTO messages (id,room_id,sender_id,text,created_at) VALUES (?,?,?,?,?)")
            .bind(id.to_string())
            .bind(room_id)
            .bind(sender_id)
            .bind(text)
            .bind(millis)
            .execute(&self.db_pool)
            .await?;
        *last_millis = Some(millis);

        Ok(ChatMessage {
            id,
            room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            text: text.to_owned(),
            created_at,
        })
    }

    async fn newest_stored(&self) -> RelayResult<i64> {
        let (newest,): (Option<i64>,) = sqlx::query_as("SELECT MAX(created_at) FROM messages")
            .fetch_one(&self.db_pool)
            .await?;
        Ok(newest.unwrap_or(i64::MIN))
    }

    /// Oldest-first, at most `limit` messages (default 50, capped at 200).
    pub async fn query(&self, room_id: &str, limit: Option<i64>) -> RelayResult<Vec<ChatMessage>> {
        if room_id.trim().is_empty() {
            return Err(RelayError::validation("roomId is required"));
        }

        let rows: Vec<(String, String, String, String, i64)> = sqlx::query_as(
            "SELECT id,room_id,sender_id,text,created_at FROM messages WHERE room_id=? ORDER BY seq ASC LIMIT ?",
        )
        .bind(room_id)
        .bind(clamp_limit(limit))
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter()
            .map(|(id, room_id, sender_id, text, created_at)| -> RelayResult<ChatMessage> {
                Ok(ChatMessage {
                    id: Uuid::parse_str(&id).map_err(|err| sqlx::Error::Decode(Box::new(err)))?,
                    room_id,
                    sender_id,
                    text,
                    created_at: from_millis(created_at)?,
                })
            })
            .collect()
    }
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64) -> RelayResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| sqlx::Error::Decode(Box::new(err)).into())
}
