//! PostgreSQL-backed session store
//!
//! Durable side of the relay: session metadata upserts, append-only event and
//! error rows, the historical query surface, and age-based cleanup. Event
//! rows hold whole batches, so event-level pagination reads the batch rows in
//! insertion order and slices the concatenated stream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::batcher::{BatchWriter, SessionBatch};
use crate::config::DatabaseConfig;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One persisted session with its aggregate counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSession {
    pub session_id: String,
    pub user_id: String,
    pub metadata: Value,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub event_count: i64,
    pub error_count: i64,
}

/// A slice of a session's event stream plus the stream length.
#[derive(Debug, Clone, Default)]
pub struct EventsPage {
    pub events: Vec<Value>,
    pub total_events: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub total_sessions: i64,
    pub active_sessions: i64,
    pub total_events: i64,
}

/// Read access to persisted replay history. Split out so the hub can be
/// exercised without a live database.
#[async_trait]
pub trait HistoryReader: Send + Sync {
    async fn events_page(
        &self,
        session_id: &str,
        from_index: usize,
        limit: usize,
    ) -> Result<EventsPage, StoreError>;

    async fn session_detail(&self, session_id: &str) -> Result<Option<StoredSession>, StoreError>;
}

/// Store surface the HTTP layer depends on. Same seam pattern as
/// [`HistoryReader`], so the handlers can be exercised without a live
/// database.
#[async_trait]
pub trait ReplayStore: Send + Sync {
    async fn active_sessions(&self) -> Result<Vec<StoredSession>, StoreError>;

    async fn all_sessions(&self, limit: i64, offset: i64)
        -> Result<Vec<StoredSession>, StoreError>;

    async fn session_events_page(
        &self,
        session_id: &str,
        from_index: usize,
        limit: usize,
    ) -> Result<EventsPage, StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;

    async fn cleanup_old_sessions(&self, max_age_hours: i64) -> Result<u64, StoreError>;
}

#[derive(Clone)]
pub struct SessionStore {
    pool: PgPool,
}

impl SessionStore {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.connection_timeout)
            .idle_timeout(config.idle_timeout)
            .connect(&config.url())
            .await?;

        info!(
            host = %config.host,
            database = %config.name,
            max_connections = config.max_connections,
            "connected to PostgreSQL"
        );
        Ok(Self { pool })
    }

    /// Wrap an existing pool (useful for tests).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                metadata JSONB NOT NULL DEFAULT '{}',
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_events (
                id BIGSERIAL PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
                events JSONB NOT NULL,
                event_count INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS session_errors (
                id BIGSERIAL PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(session_id) ON DELETE CASCADE,
                error_data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id)",
            "CREATE INDEX IF NOT EXISTS idx_sessions_created_at ON sessions(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_session_events_session_id ON session_events(session_id)",
            "CREATE INDEX IF NOT EXISTS idx_session_events_created_at ON session_events(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_session_errors_session_id ON session_errors(session_id)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        info!("session store schema initialized");
        Ok(())
    }

    /// Active sessions with counts, most recently updated first.
    pub async fn active_sessions(&self) -> Result<Vec<StoredSession>, StoreError> {
        let rows = sqlx::query(&session_query("WHERE s.is_active = TRUE", true))
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(stored_session_from_row).collect()
    }

    /// Full session index, paginated.
    pub async fn all_sessions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredSession>, StoreError> {
        let sql = format!("{} LIMIT $1 OFFSET $2", session_query("", true));
        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(stored_session_from_row).collect()
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<StoredSession>, StoreError> {
        let sql = session_query("WHERE s.session_id = $1", false);
        let row = sqlx::query(&sql)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(stored_session_from_row).transpose()
    }

    /// Concatenate the session's batch rows in insertion order and return the
    /// slice `[from_index, from_index + limit)`. An unknown session or an
    /// offset past the end of the stream yields an empty page, not an error.
    pub async fn session_events_page(
        &self,
        session_id: &str,
        from_index: usize,
        limit: usize,
    ) -> Result<EventsPage, StoreError> {
        let rows = sqlx::query(
            "SELECT events FROM session_events WHERE session_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stream: Vec<Value> = Vec::new();
        for row in rows {
            let batch: Value = row.try_get("events")?;
            if let Value::Array(items) = batch {
                stream.extend(items);
            }
        }

        let total_events = stream.len() as u64;
        let events: Vec<Value> = stream.into_iter().skip(from_index).take(limit).collect();
        debug!(
            session_id,
            from_index,
            returned = events.len(),
            total_events,
            "served event page"
        );
        Ok(EventsPage { events, total_events })
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_sessions,
                COUNT(*) FILTER (WHERE is_active) AS active_sessions,
                COALESCE((SELECT SUM(event_count) FROM session_events), 0)::BIGINT AS total_events
            FROM sessions
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            total_sessions: row.try_get("total_sessions")?,
            active_sessions: row.try_get("active_sessions")?,
            total_events: row.try_get("total_events")?,
        })
    }

    /// Delete inactive sessions strictly older than the threshold. Event and
    /// error rows go with them via the FK cascade.
    pub async fn cleanup_old_sessions(&self, max_age_hours: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE is_active = FALSE AND updated_at < NOW() - ($1::DOUBLE PRECISION * INTERVAL '1 hour')",
        )
        .bind(max_age_hours)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            info!(deleted, max_age_hours, "cleaned up aged sessions");
        }
        Ok(deleted)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl BatchWriter for SessionStore {
    /// Apply a drained prefix of the batch queue in one transaction: upsert
    /// the session row, then the event row (if any), then one row per error.
    async fn apply_batches(&self, batches: &[SessionBatch]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for batch in batches {
            sqlx::query(
                r#"
                INSERT INTO sessions (session_id, user_id, metadata, is_active)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (session_id) DO UPDATE
                SET user_id = EXCLUDED.user_id,
                    metadata = EXCLUDED.metadata,
                    is_active = EXCLUDED.is_active,
                    updated_at = NOW()
                "#,
            )
            .bind(&batch.session_id)
            .bind(&batch.user_id)
            .bind(&batch.metadata)
            .bind(batch.is_active)
            .execute(&mut *tx)
            .await?;

            if !batch.events.is_empty() {
                sqlx::query(
                    "INSERT INTO session_events (session_id, events, event_count) VALUES ($1, $2, $3)",
                )
                .bind(&batch.session_id)
                .bind(Value::Array(batch.events.clone()))
                .bind(batch.events.len() as i32)
                .execute(&mut *tx)
                .await?;
            }

            for error in &batch.errors {
                sqlx::query("INSERT INTO session_errors (session_id, error_data) VALUES ($1, $2)")
                    .bind(&batch.session_id)
                    .bind(error)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryReader for SessionStore {
    async fn events_page(
        &self,
        session_id: &str,
        from_index: usize,
        limit: usize,
    ) -> Result<EventsPage, StoreError> {
        self.session_events_page(session_id, from_index, limit).await
    }

    async fn session_detail(&self, session_id: &str) -> Result<Option<StoredSession>, StoreError> {
        self.get_session(session_id).await
    }
}

#[async_trait]
impl ReplayStore for SessionStore {
    async fn active_sessions(&self) -> Result<Vec<StoredSession>, StoreError> {
        SessionStore::active_sessions(self).await
    }

    async fn all_sessions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StoredSession>, StoreError> {
        SessionStore::all_sessions(self, limit, offset).await
    }

    async fn session_events_page(
        &self,
        session_id: &str,
        from_index: usize,
        limit: usize,
    ) -> Result<EventsPage, StoreError> {
        SessionStore::session_events_page(self, session_id, from_index, limit).await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        SessionStore::stats(self).await
    }

    async fn cleanup_old_sessions(&self, max_age_hours: i64) -> Result<u64, StoreError> {
        SessionStore::cleanup_old_sessions(self, max_age_hours).await
    }
}

fn session_query(where_clause: &str, ordered: bool) -> String {
    let order = if ordered { "ORDER BY s.updated_at DESC" } else { "" };
    format!(
        r#"
        SELECT s.session_id, s.user_id, s.metadata, s.is_active, s.created_at, s.updated_at,
               COALESCE((SELECT SUM(e.event_count) FROM session_events e
                         WHERE e.session_id = s.session_id), 0)::BIGINT AS event_count,
               (SELECT COUNT(*) FROM session_errors er
                WHERE er.session_id = s.session_id)::BIGINT AS error_count
        FROM sessions s
        {where_clause}
        {order}
        "#
    )
}

fn stored_session_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredSession, StoreError> {
    Ok(StoredSession {
        session_id: row.try_get("session_id")?,
        user_id: row.try_get("user_id")?,
        metadata: row.try_get("metadata")?,
        is_active: row.try_get("is_active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        event_count: row.try_get("event_count")?,
        error_count: row.try_get("error_count")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_query_shapes() {
        let active = session_query("WHERE s.is_active = TRUE", true);
        assert!(active.contains("WHERE s.is_active = TRUE"));
        assert!(active.contains("ORDER BY s.updated_at DESC"));

        let by_id = session_query("WHERE s.session_id = $1", false);
        assert!(!by_id.contains("ORDER BY"));
    }

    #[test]
    fn test_stored_session_serializes_camel_case() {
        let session = StoredSession {
            session_id: "s1".to_string(),
            user_id: "u1".to_string(),
            metadata: serde_json::json!({"url": "/a"}),
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            event_count: 3,
            error_count: 0,
        };

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["sessionId"], "s1");
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["isActive"], true);
        assert_eq!(value["eventCount"], 3);
        assert!(value.get("session_id").is_none());
    }
}
