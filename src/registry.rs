use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore;
use sqlx::{
    Row,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool},
};
use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::models::{Webhook, WebhookSummary};

/// Random bytes behind every token; 256 bits makes guessing infeasible.
const TOKEN_BYTES: usize = 32;

/// Length of a base64url (unpadded) encoded token.
pub const TOKEN_LEN: usize = 43;

/// Mints a fresh bearer token from the thread-local CSPRNG.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Cheap shape check so obviously bogus paths never reach the database.
pub fn is_well_formed_token(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Persistent store of webhook definitions.
///
/// Removed webhooks are kept as tombstones (`removed_at` set) so their token
/// stays reserved by the primary key and lookups can tell "removed" apart
/// from "never existed".
pub struct Registry {
    pool: SqlitePool,
}

impl Registry {
    pub async fn connect(database_url: &str) -> Result<Self, AppError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                token TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                name TEXT NOT NULL,
                template TEXT,
                created_at TEXT NOT NULL,
                removed_at TEXT
            )
            "#,
        )
        .execute(&pool)
        .await?;

        // Only live webhooks compete for a name.
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_webhooks_live_name \
             ON webhooks (conversation_id, name) WHERE removed_at IS NULL",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    /// Inserts a new webhook and returns its token. Uniqueness of the
    /// `(conversation_id, name)` pair is enforced by the index, so racing
    /// creates resolve to a single winner.
    pub async fn create(
        &self,
        conversation_id: &str,
        name: &str,
        template: Option<&str>,
    ) -> Result<String, AppError> {
        let token = generate_token();
        let result = sqlx::query(
            "INSERT INTO webhooks (token, conversation_id, name, template, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&token)
        .bind(conversation_id)
        .bind(name)
        .bind(non_blank(template))
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(token),
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                Err(AppError::Conflict(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Replaces the template of a live webhook. A blank template reverts to
    /// default rendering.
    pub async fn update_template(
        &self,
        conversation_id: &str,
        name: &str,
        template: Option<&str>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE webhooks SET template = ? \
             WHERE conversation_id = ? AND name = ? AND removed_at IS NULL",
        )
        .bind(non_blank(template))
        .bind(conversation_id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    /// Retires a live webhook. Its token never resolves again.
    pub async fn remove(&self, conversation_id: &str, name: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE webhooks SET removed_at = ?, template = NULL \
             WHERE conversation_id = ? AND name = ? AND removed_at IS NULL",
        )
        .bind(Utc::now())
        .bind(conversation_id)
        .bind(name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }

    pub async fn list(&self, conversation_id: &str) -> Result<Vec<WebhookSummary>, AppError> {
        let rows = sqlx::query(
            "SELECT name, template IS NOT NULL AS has_template, created_at FROM webhooks \
             WHERE conversation_id = ? AND removed_at IS NULL ORDER BY name",
        )
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;

        let hooks = rows
            .into_iter()
            .map(|row| WebhookSummary {
                name: row.get("name"),
                has_template: row.get::<i64, _>("has_template") != 0,
                created_at: row.get("created_at"),
            })
            .collect();

        Ok(hooks)
    }

    /// Point lookup on the token primary key; the hot path of every callback.
    pub async fn resolve(&self, token: &str) -> Result<Webhook, AppError> {
        let row = sqlx::query(
            "SELECT conversation_id, name, template, removed_at \
             FROM webhooks WHERE token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(AppError::NotFound);
        };
        let removed_at: Option<DateTime<Utc>> = row.get("removed_at");
        if removed_at.is_some() {
            return Err(AppError::Retired);
        }

        Ok(Webhook {
            conversation_id: row.get("conversation_id"),
            name: row.get("name"),
            template: row.get("template"),
        })
    }

    /// Waits for pooled connections to finish and closes them.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn non_blank(template: Option<&str>) -> Option<&str> {
    template.filter(|t| !t.trim().is_empty())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::Registry;
    use tempfile::TempDir;

    /// A registry backed by a throwaway database file. Keep the `TempDir`
    /// alive for as long as the registry is used.
    pub async fn temp_registry() -> (Registry, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("webhooks.db").display());
        let registry = Registry::connect(&url).await.unwrap();
        (registry, dir)
    }

    /// Overwrites a stored template without validation, the way a bad
    /// migration or manual edit might.
    pub async fn force_template(registry: &Registry, token: &str, template: &str) {
        sqlx::query("UPDATE webhooks SET template = ? WHERE token = ?")
            .bind(template)
            .bind(token)
            .execute(&registry.pool)
            .await
            .unwrap();
    }
}
