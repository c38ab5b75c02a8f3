//! Delivery task repository.
//!
//! Every state change is a compare-and-set on `(id, state, claim_token)`.
//! `claim_next` stamps a fresh token on each claim, so a worker whose update
//! matches zero rows has lost the task (cancelled, or reclaimed after its
//! lease expired) and must drop it.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{DeliveryStatusCounts, DeliveryTaskDbModel, NewDeliveryTask};
use crate::database::retry::retry_on_sqlite_busy;
use crate::domain::{DeliveryState, FailureReason};
use crate::{Error, Result};

/// Attempt counters to bump alongside a transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptDelta {
    pub fetch: i64,
    pub send: i64,
}

impl AttemptDelta {
    pub const NONE: Self = Self { fetch: 0, send: 0 };
    pub const FETCH: Self = Self { fetch: 1, send: 0 };
    pub const SEND: Self = Self { fetch: 0, send: 1 };
}

/// The claim a worker believes it holds: the state it moved the task to and
/// the token `claim_next` handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim<'a> {
    pub state: DeliveryState,
    pub token: &'a str,
}

impl<'a> Claim<'a> {
    pub fn new(state: DeliveryState, token: &'a str) -> Self {
        Self { state, token }
    }
}

#[async_trait]
pub trait DeliveryTaskRepository: Send + Sync {
    /// Insert unless a live task for the same (binding, item) exists or the
    /// pair was already delivered. Returns the new id, `None` for a duplicate.
    async fn insert_if_absent(&self, task: &NewDeliveryTask, now_ms: i64)
    -> Result<Option<String>>;
    /// Atomically move the oldest due `PENDING` task to `FETCHING` under a
    /// new claim token.
    async fn claim_next(&self, now_ms: i64, lease_ms: i64) -> Result<Option<DeliveryTaskDbModel>>;
    /// `FETCHING -> PROCESSING`.
    async fn mark_processing(&self, id: &str, token: &str, now_ms: i64) -> Result<bool>;
    /// `PROCESSING -> DELIVERED`.
    async fn mark_delivered(&self, id: &str, token: &str, ack_id: &str, now_ms: i64)
    -> Result<bool>;
    /// Return a claimed task to `PENDING` until `next_attempt_at`.
    async fn park(
        &self,
        id: &str,
        claim: Claim<'_>,
        next_attempt_at: i64,
        delta: AttemptDelta,
        last_error: Option<&str>,
        now_ms: i64,
    ) -> Result<bool>;
    /// Move to `FAILED`. Without a claim any live state matches.
    async fn mark_failed(
        &self,
        id: &str,
        claim: Option<Claim<'_>>,
        reason: FailureReason,
        delta: AttemptDelta,
        error: &str,
        now_ms: i64,
    ) -> Result<bool>;
    async fn get_task(&self, id: &str) -> Result<DeliveryTaskDbModel>;
    async fn list_for_binding(&self, binding_id: i64, limit: i64)
    -> Result<Vec<DeliveryTaskDbModel>>;
    async fn count_live_for_pair(&self, binding_id: i64, item_id: &str) -> Result<i64>;
    async fn status_counts(&self) -> Result<DeliveryStatusCounts>;
    /// Earliest `next_attempt_at` among pending tasks.
    async fn next_due_at(&self) -> Result<Option<i64>>;
    /// Return claims whose lease ran out to `PENDING`.
    async fn reset_expired_leases(&self, now_ms: i64) -> Result<u64>;
    /// Delete terminal tasks that finished before `before_ms`.
    async fn purge_terminal(&self, before_ms: i64) -> Result<u64>;
}

/// SQLx implementation of DeliveryTaskRepository.
pub struct SqlxDeliveryTaskRepository {
    pool: SqlitePool,
}

impl SqlxDeliveryTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn claim_next_once(
        &self,
        now_ms: i64,
        lease_ms: i64,
    ) -> Result<Option<DeliveryTaskDbModel>> {
        let task = sqlx::query_as::<_, DeliveryTaskDbModel>(
            r#"
            UPDATE delivery_tasks
            SET state = 'FETCHING', claim_token = ?, lease_until = ?, updated_at = ?
            WHERE id = (
                SELECT id FROM delivery_tasks
                WHERE state = 'PENDING' AND next_attempt_at <= ?
                ORDER BY next_attempt_at, created_at
                LIMIT 1
            )
            AND state = 'PENDING'
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(now_ms.saturating_add(lease_ms))
        .bind(now_ms)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(task)
    }
}

#[async_trait]
impl DeliveryTaskRepository for SqlxDeliveryTaskRepository {
    async fn insert_if_absent(
        &self,
        task: &NewDeliveryTask,
        now_ms: i64,
    ) -> Result<Option<String>> {
        let id = uuid::Uuid::new_v4().to_string();
        // Only a conflict on the live-pair index is a duplicate. Any other
        // constraint violation is an error.
        let result = sqlx::query(
            r#"
            INSERT INTO delivery_tasks (
                id, binding_id, source_id, recipient_id, item_id, content_kind,
                payload_ref, caption, permalink, state, fetch_attempts, send_attempts,
                max_retries, next_attempt_at, created_at, updated_at
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, 'PENDING', 0, 0, ?, ?, ?, ?
            WHERE NOT EXISTS (
                SELECT 1 FROM delivery_tasks
                WHERE binding_id = ? AND item_id = ? AND state = 'DELIVERED'
            )
            ON CONFLICT (binding_id, item_id) WHERE state NOT IN ('DELIVERED', 'FAILED')
            DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(task.binding_id)
        .bind(task.source_id.as_str())
        .bind(task.recipient_id.as_str())
        .bind(&task.item_id)
        .bind(task.kind.as_str())
        .bind(&task.payload_ref)
        .bind(&task.caption)
        .bind(&task.permalink)
        .bind(i64::from(task.max_retries))
        .bind(task.not_before)
        .bind(now_ms)
        .bind(now_ms)
        .bind(task.binding_id)
        .bind(&task.item_id)
        .execute(&self.pool)
        .await?;

        Ok((result.rows_affected() == 1).then_some(id))
    }

    async fn claim_next(&self, now_ms: i64, lease_ms: i64) -> Result<Option<DeliveryTaskDbModel>> {
        retry_on_sqlite_busy("claim_next_delivery_task", || {
            self.claim_next_once(now_ms, lease_ms)
        })
        .await
    }

    async fn mark_processing(&self, id: &str, token: &str, now_ms: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks SET state = 'PROCESSING', updated_at = ?
            WHERE id = ? AND state = 'FETCHING' AND claim_token = ?
            "#,
        )
        .bind(now_ms)
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_delivered(
        &self,
        id: &str,
        token: &str,
        ack_id: &str,
        now_ms: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET state = 'DELIVERED', ack_id = ?, claim_token = NULL, lease_until = NULL,
                last_error = NULL, updated_at = ?, terminal_at = ?
            WHERE id = ? AND state = 'PROCESSING' AND claim_token = ?
            "#,
        )
        .bind(ack_id)
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .bind(token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn park(
        &self,
        id: &str,
        claim: Claim<'_>,
        next_attempt_at: i64,
        delta: AttemptDelta,
        last_error: Option<&str>,
        now_ms: i64,
    ) -> Result<bool> {
        claim.state.transition_to(DeliveryState::Pending)?;
        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET state = 'PENDING',
                next_attempt_at = ?,
                claim_token = NULL,
                lease_until = NULL,
                fetch_attempts = fetch_attempts + ?,
                send_attempts = send_attempts + ?,
                last_error = COALESCE(?, last_error),
                updated_at = ?
            WHERE id = ? AND state = ? AND claim_token = ?
            "#,
        )
        .bind(next_attempt_at)
        .bind(delta.fetch)
        .bind(delta.send)
        .bind(last_error)
        .bind(now_ms)
        .bind(id)
        .bind(claim.state.as_str())
        .bind(claim.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: &str,
        claim: Option<Claim<'_>>,
        reason: FailureReason,
        delta: AttemptDelta,
        error: &str,
        now_ms: i64,
    ) -> Result<bool> {
        if let Some(claim) = claim {
            claim.state.transition_to(DeliveryState::Failed)?;
        }
        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET state = 'FAILED',
                failure_reason = ?,
                last_error = ?,
                fetch_attempts = fetch_attempts + ?,
                send_attempts = send_attempts + ?,
                claim_token = NULL,
                lease_until = NULL,
                updated_at = ?,
                terminal_at = ?
            WHERE id = ?
              AND state NOT IN ('DELIVERED', 'FAILED')
              AND (? IS NULL OR (state = ? AND claim_token = ?))
            "#,
        )
        .bind(reason.as_str())
        .bind(error)
        .bind(delta.fetch)
        .bind(delta.send)
        .bind(now_ms)
        .bind(now_ms)
        .bind(id)
        .bind(claim.map(|c| c.state.as_str()))
        .bind(claim.map(|c| c.state.as_str()))
        .bind(claim.map(|c| c.token))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_task(&self, id: &str) -> Result<DeliveryTaskDbModel> {
        sqlx::query_as::<_, DeliveryTaskDbModel>("SELECT * FROM delivery_tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("DeliveryTask", id))
    }

    async fn list_for_binding(
        &self,
        binding_id: i64,
        limit: i64,
    ) -> Result<Vec<DeliveryTaskDbModel>> {
        let tasks = sqlx::query_as::<_, DeliveryTaskDbModel>(
            "SELECT * FROM delivery_tasks WHERE binding_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(binding_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(tasks)
    }

    async fn count_live_for_pair(&self, binding_id: i64, item_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM delivery_tasks
            WHERE binding_id = ? AND item_id = ? AND state NOT IN ('DELIVERED', 'FAILED')
            "#,
        )
        .bind(binding_id)
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn status_counts(&self) -> Result<DeliveryStatusCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM delivery_tasks GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = DeliveryStatusCounts::default();
        for (state, count) in rows {
            match DeliveryState::parse(&state) {
                Some(DeliveryState::Pending) => counts.pending = count,
                Some(DeliveryState::Fetching) => counts.fetching = count,
                Some(DeliveryState::Processing) => counts.processing = count,
                Some(DeliveryState::Delivered) => counts.delivered = count,
                Some(DeliveryState::Failed) => counts.failed = count,
                None => tracing::warn!(state = %state, "Unknown delivery task state"),
            }
        }
        Ok(counts)
    }

    async fn next_due_at(&self) -> Result<Option<i64>> {
        let (next,): (Option<i64>,) = sqlx::query_as(
            "SELECT MIN(next_attempt_at) FROM delivery_tasks WHERE state = 'PENDING'",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(next)
    }

    async fn reset_expired_leases(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET state = 'PENDING', claim_token = NULL, lease_until = NULL,
                next_attempt_at = ?, updated_at = ?
            WHERE state IN ('FETCHING', 'PROCESSING') AND lease_until IS NOT NULL AND lease_until < ?
            "#,
        )
        .bind(now_ms)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn purge_terminal(&self, before_ms: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM delivery_tasks
            WHERE state IN ('DELIVERED', 'FAILED') AND terminal_at IS NOT NULL AND terminal_at < ?
            "#,
        )
        .bind(before_ms)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
