use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::{auth::Identity, rooms::msg::{ChatMessage, HistoryEntry}, RelayResult};

/// Display fields for a user. Never used for routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Display profiles of users that have connected.
#[derive(Debug, Clone)]
pub struct UserDirectory {
    db_pool: SqlitePool,
}

impl UserDirectory {
    pub fn new(db_pool: SqlitePool) -> Self {
        UserDirectory { db_pool }
    }

    pub async fn resolve(&self, user_id: &str) -> RelayResult<Option<Profile>> {
        let row: Option<(String, Option<String>, Option<String>)> =
            sqlx::query_as("SELECT user_id,name,email FROM profiles WHERE user_id=?")
                .bind(user_id)
                .fetch_optional(&self.db_pool)
                .await?;

        Ok(row.map(|(user_id, name, email)| Profile { user_id, name, email }))
    }

    /// Overwrites every display field, for imports from an external user store.
    pub async fn upsert(&self, profile: &Profile) -> RelayResult<()> {
        sqlx::query(
            "INSERT INTO profiles (user_id,name,email) VALUES (?,?,?)
             ON CONFLICT(user_id) DO UPDATE SET name=excluded.name, email=excluded.email",
        )
        .bind(&profile.user_id)
        .bind(&profile.name)
        .bind(&profile.email)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    /// Records a verified identity. A name already on file is kept; the email
    /// from the token wins when it has one.
    pub async fn remember(&self, identity: &Identity) -> RelayResult<()> {
        let email = Some(identity.email.as_str()).filter(|email| !email.is_empty());
        sqlx::query(
            "INSERT INTO profiles (user_id,name,email) VALUES (?,NULL,?)
             ON CONFLICT(user_id) DO UPDATE SET email=COALESCE(excluded.email, profiles.email)",
        )
        .bind(&identity.user_id)
        .bind(email)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    /// Attaches sender profiles to history. Lookup failures only cost the
    /// enrichment, never the history itself.
    pub async fn enrich(&self, messages: Vec<ChatMessage>) -> Vec<HistoryEntry> {
        let mut profiles: HashMap<String, Option<Profile>> = HashMap::new();
        for msg in &messages {
            if profiles.contains_key(&msg.sender_id) {
                continue;
            }

            let profile = self.resolve(&msg.sender_id).await.unwrap_or_else(|err| {
                tracing::warn!(user_id = %msg.sender_id, error = %err, "profile lookup failed");
                None
            });
            profiles.insert(msg.sender_id.clone(), profile);
        }

        messages
            .into_iter()
            .map(|message| HistoryEntry {
                sender: profiles.get(&message.sender_id).cloned().flatten(),
                message,
            })
            .collect()
    }
}
