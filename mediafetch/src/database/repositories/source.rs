//! Monitored source repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::MonitoredSourceDbModel;
use crate::domain::Cursor;
use crate::{Error, Result};

#[async_trait]
pub trait SourceRepository: Send + Sync {
    /// Insert the source if it is not monitored yet. Returns `true` if created.
    async fn ensure_source(
        &self,
        source_id: &str,
        poll_interval_ms: i64,
        now_ms: i64,
    ) -> Result<bool>;
    async fn get_source(&self, source_id: &str) -> Result<MonitoredSourceDbModel>;
    async fn list_enabled(&self) -> Result<Vec<MonitoredSourceDbModel>>;
    async fn set_enabled(&self, source_id: &str, enabled: bool) -> Result<()>;
    async fn set_poll_interval(&self, source_id: &str, poll_interval_ms: i64) -> Result<()>;
    /// Move the cursor forward. A cursor at or behind the stored one is
    /// ignored; returns `true` if the stored cursor changed.
    async fn advance_cursor(&self, source_id: &str, cursor: &Cursor) -> Result<bool>;
    /// Record a completed poll and clear the failure streak.
    async fn mark_checked(&self, source_id: &str, now_ms: i64) -> Result<()>;
    /// Record a failed poll. Returns the new failure streak length.
    async fn record_poll_failure(&self, source_id: &str, error: &str, now_ms: i64)
    -> Result<i64>;
}

/// SQLx implementation of SourceRepository.
pub struct SqlxSourceRepository {
    pool: SqlitePool,
}

impl SqlxSourceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceRepository for SqlxSourceRepository {
    async fn ensure_source(
        &self,
        source_id: &str,
        poll_interval_ms: i64,
        now_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO monitored_sources (source_id, poll_interval_ms, enabled, created_at)
            VALUES (?, ?, 1, ?)
            "#,
        )
        .bind(source_id)
        .bind(poll_interval_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_source(&self, source_id: &str) -> Result<MonitoredSourceDbModel> {
        sqlx::query_as::<_, MonitoredSourceDbModel>(
            "SELECT * FROM monitored_sources WHERE source_id = ?",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("MonitoredSource", source_id))
    }

    async fn list_enabled(&self) -> Result<Vec<MonitoredSourceDbModel>> {
        let sources = sqlx::query_as::<_, MonitoredSourceDbModel>(
            "SELECT * FROM monitored_sources WHERE enabled = 1 ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sources)
    }

    async fn set_enabled(&self, source_id: &str, enabled: bool) -> Result<()> {
        let result = sqlx::query("UPDATE monitored_sources SET enabled = ? WHERE source_id = ?")
            .bind(enabled)
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("MonitoredSource", source_id));
        }
        Ok(())
    }

    async fn set_poll_interval(&self, source_id: &str, poll_interval_ms: i64) -> Result<()> {
        if poll_interval_ms <= 0 {
            return Err(Error::validation("poll interval must be positive"));
        }
        let result =
            sqlx::query("UPDATE monitored_sources SET poll_interval_ms = ? WHERE source_id = ?")
                .bind(poll_interval_ms)
                .bind(source_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("MonitoredSource", source_id));
        }
        Ok(())
    }

    async fn advance_cursor(&self, source_id: &str, cursor: &Cursor) -> Result<bool> {
        // Lexicographic (position, item_id) comparison keeps the cursor monotonic
        // even if a late writer shows up with an older batch.
        let result = sqlx::query(
            r#"
            UPDATE monitored_sources
            SET cursor_position = ?, cursor_item_id = ?
            WHERE source_id = ?
              AND (
                cursor_position IS NULL
                OR cursor_item_id IS NULL
                OR cursor_position < ?
                OR (cursor_position = ? AND cursor_item_id < ?)
              )
            "#,
        )
        .bind(cursor.position)
        .bind(&cursor.item_id)
        .bind(source_id)
        .bind(cursor.position)
        .bind(cursor.position)
        .bind(&cursor.item_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_checked(&self, source_id: &str, now_ms: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE monitored_sources
            SET last_checked_at = ?, consecutive_failures = 0, last_error = NULL
            WHERE source_id = ?
            "#,
        )
        .bind(now_ms)
        .bind(source_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_poll_failure(
        &self,
        source_id: &str,
        error: &str,
        now_ms: i64,
    ) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE monitored_sources
            SET last_checked_at = ?, consecutive_failures = consecutive_failures + 1, last_error = ?
            WHERE source_id = ?
            RETURNING consecutive_failures
            "#,
        )
        .bind(now_ms)
        .bind(error)
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(n,)| n)
            .ok_or_else(|| Error::not_found("MonitoredSource", source_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::setup_test_db;

    #[tokio::test]
    async fn test_ensure_source_once() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxSourceRepository::new(pool);
        assert!(repo.ensure_source("s1", 1_000, 0).await.unwrap());
        assert!(!repo.ensure_source("s1", 5_000, 0).await.unwrap());
        assert_eq!(repo.get_source("s1").await.unwrap().poll_interval_ms, 1_000);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_backward() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxSourceRepository::new(pool);
        repo.ensure_source("s1", 1_000, 0).await.unwrap();

        assert!(repo.advance_cursor("s1", &Cursor::new(10, "p1")).await.unwrap());
        assert!(repo.advance_cursor("s1", &Cursor::new(10, "p2")).await.unwrap());
        assert!(!repo.advance_cursor("s1", &Cursor::new(10, "p1")).await.unwrap());
        assert!(!repo.advance_cursor("s1", &Cursor::new(9, "z")).await.unwrap());
        assert!(!repo.advance_cursor("s1", &Cursor::new(10, "p2")).await.unwrap());

        let source = repo.get_source("s1").await.unwrap();
        assert_eq!(source.cursor(), Some(Cursor::new(10, "p2")));
    }

    #[tokio::test]
    async fn test_poll_failure_streak() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxSourceRepository::new(pool);
        repo.ensure_source("s1", 1_000, 0).await.unwrap();

        assert_eq!(repo.record_poll_failure("s1", "timeout", 10).await.unwrap(), 1);
        assert_eq!(repo.record_poll_failure("s1", "timeout", 20).await.unwrap(), 2);
        repo.mark_checked("s1", 30).await.unwrap();

        let source = repo.get_source("s1").await.unwrap();
        assert_eq!(source.consecutive_failures, 0);
        assert_eq!(source.last_checked_at, Some(30));
        assert!(source.last_error.is_none());
    }

    #[tokio::test]
    async fn test_disabled_sources_are_not_listed() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxSourceRepository::new(pool);
        repo.ensure_source("s1", 1_000, 0).await.unwrap();
        repo.ensure_source("s2", 1_000, 0).await.unwrap();
        repo.set_enabled("s1", false).await.unwrap();

        let enabled: Vec<String> = repo
            .list_enabled()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.source_id)
            .collect();
        assert_eq!(enabled, vec!["s2".to_string()]);
        assert!(repo.set_enabled("missing", true).await.is_err());
    }
}
