//! Binding repository.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::begin_immediate;
use crate::database::models::{BindingDbModel, DeactivationReason};
use crate::database::retry::retry_on_sqlite_busy;
use crate::{Error, Result};

/// Binding repository trait.
#[async_trait]
pub trait BindingRepository: Send + Sync {
    async fn get_binding(&self, id: i64) -> Result<BindingDbModel>;
    /// Active bindings for a source, in insertion order.
    async fn list_active_for_source(&self, source_id: &str) -> Result<Vec<BindingDbModel>>;
    async fn list_for_recipient(&self, recipient_id: &str) -> Result<Vec<BindingDbModel>>;
    /// Returns `true` if the binding was active before the call.
    async fn deactivate(
        &self,
        id: i64,
        reason: DeactivationReason,
        now_ms: i64,
    ) -> Result<bool>;
    async fn update_preferences(&self, id: i64, preferences: &str) -> Result<()>;
    /// Reset the failure streak after a successful delivery.
    async fn record_delivery_success(&self, id: i64, now_ms: i64) -> Result<()>;
    /// Extend the failure streak; deactivates the binding once it reaches
    /// `threshold`. Returns `true` if this call deactivated it.
    async fn record_delivery_failure(&self, id: i64, threshold: i64, now_ms: i64)
    -> Result<bool>;
}

/// SQLx implementation of BindingRepository.
pub struct SqlxBindingRepository {
    pool: SqlitePool,
}

impl SqlxBindingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn record_failure_once(&self, id: i64, threshold: i64, now_ms: i64) -> Result<bool> {
        let mut tx = begin_immediate(&self.pool).await?;

        let row: Option<(i64, bool)> = sqlx::query_as(
            r#"
            UPDATE bindings SET consecutive_failures = consecutive_failures + 1
            WHERE id = ?
            RETURNING consecutive_failures, active
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((failures, active)) = row else {
            tx.rollback().await?;
            return Err(Error::not_found("Binding", id.to_string()));
        };

        let deactivated = if active && failures >= threshold {
            sqlx::query(
                r#"
                UPDATE bindings SET active = 0, deactivated_at = ?, deactivated_reason = ?
                WHERE id = ? AND active = 1
                "#,
            )
            .bind(now_ms)
            .bind(DeactivationReason::DeliveryFailures.as_str())
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected()
                == 1
        } else {
            false
        };

        tx.commit().await?;
        Ok(deactivated)
    }
}

#[async_trait]
impl BindingRepository for SqlxBindingRepository {
    async fn get_binding(&self, id: i64) -> Result<BindingDbModel> {
        sqlx::query_as::<_, BindingDbModel>("SELECT * FROM bindings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Binding", id.to_string()))
    }

    async fn list_active_for_source(&self, source_id: &str) -> Result<Vec<BindingDbModel>> {
        let bindings = sqlx::query_as::<_, BindingDbModel>(
            "SELECT * FROM bindings WHERE source_id = ? AND active = 1 ORDER BY id",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bindings)
    }

    async fn list_for_recipient(&self, recipient_id: &str) -> Result<Vec<BindingDbModel>> {
        let bindings = sqlx::query_as::<_, BindingDbModel>(
            "SELECT * FROM bindings WHERE recipient_id = ? ORDER BY id",
        )
        .bind(recipient_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(bindings)
    }

    async fn deactivate(
        &self,
        id: i64,
        reason: DeactivationReason,
        now_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bindings SET active = 0, deactivated_at = ?, deactivated_reason = ?
            WHERE id = ? AND active = 1
            "#,
        )
        .bind(now_ms)
        .bind(reason.as_str())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_preferences(&self, id: i64, preferences: &str) -> Result<()> {
        let result = sqlx::query("UPDATE bindings SET preferences = ? WHERE id = ?")
            .bind(preferences)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found("Binding", id.to_string()));
        }
        Ok(())
    }

    async fn record_delivery_success(&self, id: i64, now_ms: i64) -> Result<()> {
        sqlx::query(
            "UPDATE bindings SET consecutive_failures = 0, last_activity_at = ? WHERE id = ?",
        )
        .bind(now_ms)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_delivery_failure(
        &self,
        id: i64,
        threshold: i64,
        now_ms: i64,
    ) -> Result<bool> {
        retry_on_sqlite_busy("record_delivery_failure", || {
            self.record_failure_once(id, threshold, now_ms)
        })
        .await
    }
}
