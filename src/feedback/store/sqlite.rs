/// SQLite-backed feedback store
///
/// Uses sqlx with WAL mode for cross-restart persistence.
/// Runs migrations automatically on initialization.
/// Each save/delete runs in a single transaction so a session row and its
/// entries never disagree.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteSynchronous},
    Row,
};

use super::FeedbackStore;
use crate::errors::GroundrankError;
use crate::feedback::{EntryRecord, FeedbackEntry, FeedbackState, FeedbackType};

pub struct SqliteFeedbackStore {
    pool: SqlitePool,
}

impl SqliteFeedbackStore {
    /// Open (or create) the database at db_path and run pending migrations.
    pub async fn new(db_path: &str) -> Result<Self, GroundrankError> {
        // Strip "sqlite://" prefix if present for SqliteConnectOptions
        let path = db_path.strip_prefix("sqlite://").unwrap_or(db_path);

        let opts = path
            .parse::<SqliteConnectOptions>()
            .map_err(|e| GroundrankError::Storage(format!("Invalid db_path '{}': {}", db_path, e)))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        let pool = SqlitePool::connect_with(opts)
            .await
            .map_err(|e| GroundrankError::Storage(format!("Failed to connect to database: {}", e)))?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, running migrations on it.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, GroundrankError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| GroundrankError::Storage(format!("Migration failed: {}", e)))?;
        Ok(SqliteFeedbackStore { pool })
    }
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, GroundrankError> {
    serde_json::from_str(raw)
        .map_err(|e| GroundrankError::Storage(format!("Corrupt {} column: {}", column, e)))
}

fn to_json<T: serde::Serialize>(column: &str, value: &T) -> Result<String, GroundrankError> {
    serde_json::to_string(value)
        .map_err(|e| GroundrankError::Internal(format!("Failed to serialize {}: {}", column, e)))
}

fn parse_timestamp(column: &str, raw: &str) -> Result<DateTime<Utc>, GroundrankError> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|e| GroundrankError::Storage(format!("Parse {} '{}': {}", column, raw, e)))
}

/// Map a feedback_entries row back into a typed entry.
fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<FeedbackEntry, GroundrankError> {
    let feedback_type: String = row.try_get("feedback_type")?;
    let feedback_data: String = row.try_get("feedback_data")?;
    let timestamp: String = row.try_get("timestamp")?;

    let record = EntryRecord {
        feedback_id: row.try_get("feedback_id")?,
        session_id: row.try_get("session_id")?,
        recommendation_id: row.try_get("recommendation_id")?,
        feedback_type: feedback_type
            .parse::<FeedbackType>()
            .map_err(GroundrankError::Storage)?,
        feedback_data: from_json("feedback_data", &feedback_data)?,
        comment: row.try_get("comment")?,
        timestamp: parse_timestamp("timestamp", &timestamp)?,
    };
    FeedbackEntry::try_from(record)
}

#[async_trait]
impl FeedbackStore for SqliteFeedbackStore {
    async fn load(&self, session_id: &str) -> Result<Option<FeedbackState>, GroundrankError> {
        let Some(row) = sqlx::query(
            "SELECT session_id, preferences, blocked_codes, blocked_items, preferred_sources, last_updated \
             FROM feedback_sessions WHERE session_id = ?",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let preferences: String = row.try_get("preferences")?;
        let blocked_codes: String = row.try_get("blocked_codes")?;
        let blocked_items: String = row.try_get("blocked_items")?;
        let preferred_sources: String = row.try_get("preferred_sources")?;
        let last_updated: String = row.try_get("last_updated")?;

        let entry_rows = sqlx::query(
            "SELECT feedback_id, session_id, recommendation_id, feedback_type, feedback_data, comment, timestamp \
             FROM feedback_entries WHERE session_id = ? ORDER BY seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let feedback_entries = entry_rows
            .iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(FeedbackState {
            session_id: row.try_get("session_id")?,
            feedback_entries,
            preferences: from_json("preferences", &preferences)?,
            blocked_codes: from_json("blocked_codes", &blocked_codes)?,
            blocked_items: from_json("blocked_items", &blocked_items)?,
            preferred_sources: from_json("preferred_sources", &preferred_sources)?,
            last_updated: parse_timestamp("last_updated", &last_updated)?,
        }))
    }

    async fn save(&self, state: &FeedbackState) -> Result<(), GroundrankError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO feedback_sessions \
             (session_id, preferences, blocked_codes, blocked_items, preferred_sources, last_updated) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(session_id) DO UPDATE SET \
             preferences = excluded.preferences, \
             blocked_codes = excluded.blocked_codes, \
             blocked_items = excluded.blocked_items, \
             preferred_sources = excluded.preferred_sources, \
             last_updated = excluded.last_updated",
        )
        .bind(&state.session_id)
        .bind(to_json("preferences", &state.preferences)?)
        .bind(to_json("blocked_codes", &state.blocked_codes)?)
        .bind(to_json("blocked_items", &state.blocked_items)?)
        .bind(to_json("preferred_sources", &state.preferred_sources)?)
        .bind(state.last_updated.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        // Entries are append-only: rows already present are left as they are.
        for (seq, entry) in state.feedback_entries.iter().enumerate() {
            sqlx::query(
                "INSERT OR IGNORE INTO feedback_entries \
                 (feedback_id, session_id, seq, recommendation_id, feedback_type, feedback_data, comment, timestamp) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&entry.feedback_id)
            .bind(&state.session_id)
            .bind(seq as i64)
            .bind(&entry.recommendation_id)
            .bind(entry.feedback.feedback_type().as_str())
            .bind(to_json("feedback_data", &entry.feedback.data())?)
            .bind(&entry.comment)
            .bind(entry.timestamp.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<(), GroundrankError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM feedback_entries WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM feedback_sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
