//! Pairing code repository.
//!
//! Redeeming a code touches three tables (the code, the binding and the
//! monitored source). That happens in one `BEGIN IMMEDIATE` transaction so a
//! code can never be consumed twice and two concurrent confirmations for the
//! same pair cannot both create a binding.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::database::models::{BindingDbModel, PairingCodeDbModel};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::begin_immediate;
use crate::error::PairingError;
use crate::Result;

/// Result of trying to store a freshly generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertCodeOutcome {
    Inserted,
    /// The generated code already exists; generate another.
    Collision,
    /// The owner already holds the maximum number of outstanding codes.
    OwnerAtLimit,
}

/// Result of presenting a code.
#[derive(Debug, Clone)]
pub enum RedeemOutcome {
    /// Binding created (`created == true`) or reactivated.
    Bound {
        binding: BindingDbModel,
        created: bool,
    },
    Rejected(PairingError),
}

/// Parameters for the binding created by a successful redemption.
#[derive(Debug, Clone)]
pub struct RedeemRequest<'a> {
    pub code: &'a str,
    pub counterpart: &'a str,
    pub now_ms: i64,
    /// Poll interval used if the source is not monitored yet.
    pub default_poll_interval_ms: i64,
    /// Preferences JSON for a brand-new binding.
    pub default_preferences: &'a str,
}

#[async_trait]
pub trait PairingCodeRepository: Send + Sync {
    async fn insert_code(
        &self,
        code: &PairingCodeDbModel,
        max_outstanding: i64,
    ) -> Result<InsertCodeOutcome>;
    async fn get_code(&self, code: &str) -> Result<Option<PairingCodeDbModel>>;
    async fn count_outstanding(&self, owner_id: &str, now_ms: i64) -> Result<i64>;
    async fn redeem(&self, request: RedeemRequest<'_>) -> Result<RedeemOutcome>;
    /// Delete codes that expired before `before_ms`.
    async fn purge_expired(&self, before_ms: i64) -> Result<u64>;
}

/// SQLx implementation of PairingCodeRepository.
pub struct SqlxPairingCodeRepository {
    pool: SqlitePool,
}

impl SqlxPairingCodeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn insert_code_once(
        &self,
        code: &PairingCodeDbModel,
        max_outstanding: i64,
    ) -> Result<InsertCodeOutcome> {
        let mut tx = begin_immediate(&self.pool).await?;

        let (outstanding,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM pairing_codes
            WHERE owner_id = ? AND used = 0 AND expires_at > ? AND attempts < max_attempts
            "#,
        )
        .bind(&code.owner_id)
        .bind(code.created_at)
        .fetch_one(&mut *tx)
        .await?;

        if outstanding >= max_outstanding {
            tx.rollback().await?;
            return Ok(InsertCodeOutcome::OwnerAtLimit);
        }

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO pairing_codes (
                code, owner_id, expected_source, created_at, expires_at,
                used, used_at, used_by, attempts, max_attempts
            ) VALUES (?, ?, ?, ?, ?, 0, NULL, NULL, 0, ?)
            "#,
        )
        .bind(&code.code)
        .bind(&code.owner_id)
        .bind(&code.expected_source)
        .bind(code.created_at)
        .bind(code.expires_at)
        .bind(code.max_attempts)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;

        Ok(if inserted == 1 {
            InsertCodeOutcome::Inserted
        } else {
            InsertCodeOutcome::Collision
        })
    }

    async fn redeem_once(&self, req: &RedeemRequest<'_>) -> Result<RedeemOutcome> {
        let mut tx = begin_immediate(&self.pool).await?;

        let Some(code) =
            sqlx::query_as::<_, PairingCodeDbModel>("SELECT * FROM pairing_codes WHERE code = ?")
                .bind(req.code)
                .fetch_optional(&mut *tx)
                .await?
        else {
            tx.rollback().await?;
            return Ok(RedeemOutcome::Rejected(PairingError::InvalidCode));
        };

        let rejection = if code.attempts_exhausted() {
            Some(PairingError::AttemptsExceeded)
        } else if code.used {
            Some(PairingError::InvalidCode)
        } else if code.is_expired(req.now_ms) {
            Some(PairingError::CodeExpired)
        } else if code
            .expected_source
            .as_deref()
            .is_some_and(|expected| expected != req.counterpart)
        {
            Some(PairingError::InvalidCode)
        } else {
            None
        };

        if let Some(rejection) = rejection {
            sqlx::query("UPDATE pairing_codes SET attempts = attempts + 1 WHERE code = ?")
                .bind(req.code)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(RedeemOutcome::Rejected(rejection));
        }

        let consumed = sqlx::query(
            "UPDATE pairing_codes SET used = 1, used_at = ?, used_by = ? WHERE code = ? AND used = 0",
        )
        .bind(req.now_ms)
        .bind(req.counterpart)
        .bind(req.code)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if consumed != 1 {
            tx.rollback().await?;
            return Ok(RedeemOutcome::Rejected(PairingError::InvalidCode));
        }

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO monitored_sources (source_id, poll_interval_ms, enabled, created_at)
            VALUES (?, ?, 1, ?)
            "#,
        )
        .bind(req.counterpart)
        .bind(req.default_poll_interval_ms)
        .bind(req.now_ms)
        .execute(&mut *tx)
        .await?;

        let existed: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM bindings WHERE source_id = ? AND recipient_id = ?")
                .bind(req.counterpart)
                .bind(&code.owner_id)
                .fetch_optional(&mut *tx)
                .await?;

        let binding = sqlx::query_as::<_, BindingDbModel>(
            r#"
            INSERT INTO bindings (
                source_id, recipient_id, active, confirmed_at, last_activity_at,
                preferences, consecutive_failures
            ) VALUES (?, ?, 1, ?, ?, ?, 0)
            ON CONFLICT (source_id, recipient_id) DO UPDATE SET
                active = 1,
                confirmed_at = excluded.confirmed_at,
                last_activity_at = excluded.last_activity_at,
                consecutive_failures = 0,
                deactivated_at = NULL,
                deactivated_reason = NULL
            RETURNING *
            "#,
        )
        .bind(req.counterpart)
        .bind(&code.owner_id)
        .bind(req.now_ms)
        .bind(req.now_ms)
        .bind(req.default_preferences)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RedeemOutcome::Bound {
            binding,
            created: existed.is_none(),
        })
    }
}

#[async_trait]
impl PairingCodeRepository for SqlxPairingCodeRepository {
    async fn insert_code(
        &self,
        code: &PairingCodeDbModel,
        max_outstanding: i64,
    ) -> Result<InsertCodeOutcome> {
        retry_on_sqlite_busy("insert_pairing_code", || {
            self.insert_code_once(code, max_outstanding)
        })
        .await
    }

    async fn get_code(&self, code: &str) -> Result<Option<PairingCodeDbModel>> {
        let row =
            sqlx::query_as::<_, PairingCodeDbModel>("SELECT * FROM pairing_codes WHERE code = ?")
                .bind(code)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row)
    }

    async fn count_outstanding(&self, owner_id: &str, now_ms: i64) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM pairing_codes
            WHERE owner_id = ? AND used = 0 AND expires_at > ? AND attempts < max_attempts
            "#,
        )
        .bind(owner_id)
        .bind(now_ms)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn redeem(&self, request: RedeemRequest<'_>) -> Result<RedeemOutcome> {
        retry_on_sqlite_busy("redeem_pairing_code", || self.redeem_once(&request)).await
    }

    async fn purge_expired(&self, before_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM pairing_codes WHERE expires_at < ?")
            .bind(before_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::setup_test_db;

    const HOUR_MS: i64 = 3_600_000;

    fn redeem_request<'a>(code: &'a str, counterpart: &'a str, now_ms: i64) -> RedeemRequest<'a> {
        RedeemRequest {
            code,
            counterpart,
            now_ms,
            default_poll_interval_ms: 300_000,
            default_preferences: "{}",
        }
    }

    #[tokio::test]
    async fn test_insert_respects_owner_limit() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxPairingCodeRepository::new(pool);

        for code in ["AAAA2222", "BBBB3333"] {
            let model = PairingCodeDbModel::new(code, "u1", None, 1_000, HOUR_MS, 3);
            assert_eq!(
                repo.insert_code(&model, 2).await.unwrap(),
                InsertCodeOutcome::Inserted
            );
        }

        let third = PairingCodeDbModel::new("CCCC4444", "u1", None, 1_000, HOUR_MS, 3);
        assert_eq!(
            repo.insert_code(&third, 2).await.unwrap(),
            InsertCodeOutcome::OwnerAtLimit
        );

        let dup = PairingCodeDbModel::new("AAAA2222", "u2", None, 1_000, HOUR_MS, 3);
        assert_eq!(
            repo.insert_code(&dup, 2).await.unwrap(),
            InsertCodeOutcome::Collision
        );
        assert_eq!(repo.count_outstanding("u1", 1_000).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_redeem_once_then_invalid() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxPairingCodeRepository::new(pool);
        let model = PairingCodeDbModel::new("AB12CDEF", "u1", None, 1_000, HOUR_MS, 3);
        repo.insert_code(&model, 5).await.unwrap();

        let first = repo.redeem(redeem_request("AB12CDEF", "s1", 2_000)).await.unwrap();
        let RedeemOutcome::Bound { binding, created } = first else {
            panic!("expected binding, got {first:?}");
        };
        assert!(created);
        assert!(binding.active);
        assert_eq!(binding.source_id, "s1");
        assert_eq!(binding.recipient_id, "u1");

        let second = repo.redeem(redeem_request("AB12CDEF", "s1", 3_000)).await.unwrap();
        assert!(matches!(
            second,
            RedeemOutcome::Rejected(PairingError::InvalidCode)
        ));

        let stored = repo.get_code("AB12CDEF").await.unwrap().unwrap();
        assert!(stored.used);
        assert_eq!(stored.used_by.as_deref(), Some("s1"));
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_expired_and_exhausted_codes() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxPairingCodeRepository::new(pool);
        let model = PairingCodeDbModel::new("EXPD2345", "u1", None, 0, 1_000, 2);
        repo.insert_code(&model, 5).await.unwrap();

        let outcome = repo.redeem(redeem_request("EXPD2345", "s1", 5_000)).await.unwrap();
        assert!(matches!(
            outcome,
            RedeemOutcome::Rejected(PairingError::CodeExpired)
        ));
        repo.redeem(redeem_request("EXPD2345", "s1", 5_000)).await.unwrap();

        let outcome = repo.redeem(redeem_request("EXPD2345", "s1", 5_000)).await.unwrap();
        assert!(matches!(
            outcome,
            RedeemOutcome::Rejected(PairingError::AttemptsExceeded)
        ));
    }

    #[tokio::test]
    async fn test_unknown_code_is_generic() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxPairingCodeRepository::new(pool);
        let outcome = repo.redeem(redeem_request("NOPE2345", "s1", 0)).await.unwrap();
        assert!(matches!(
            outcome,
            RedeemOutcome::Rejected(PairingError::InvalidCode)
        ));
    }

    #[tokio::test]
    async fn test_expected_source_mismatch() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxPairingCodeRepository::new(pool);
        let model =
            PairingCodeDbModel::new("TGT23456", "u1", Some("alice".into()), 0, HOUR_MS, 3);
        repo.insert_code(&model, 5).await.unwrap();

        let outcome = repo.redeem(redeem_request("TGT23456", "mallory", 10)).await.unwrap();
        assert!(matches!(
            outcome,
            RedeemOutcome::Rejected(PairingError::InvalidCode)
        ));

        // Handles arrive normalized; the comparison is exact.
        let outcome = repo.redeem(redeem_request("TGT23456", "Alice", 10)).await.unwrap();
        assert!(matches!(
            outcome,
            RedeemOutcome::Rejected(PairingError::InvalidCode)
        ));

        let outcome = repo.redeem(redeem_request("TGT23456", "alice", 10)).await.unwrap();
        assert!(matches!(outcome, RedeemOutcome::Bound { .. }));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (pool, _dir) = setup_test_db().await;
        let repo = SqlxPairingCodeRepository::new(pool);
        repo.insert_code(&PairingCodeDbModel::new("OLD23456", "u1", None, 0, 10, 3), 5)
            .await
            .unwrap();
        repo.insert_code(&PairingCodeDbModel::new("NEW23456", "u1", None, 0, HOUR_MS, 3), 5)
            .await
            .unwrap();

        assert_eq!(repo.purge_expired(100).await.unwrap(), 1);
        assert!(repo.get_code("OLD23456").await.unwrap().is_none());
        assert!(repo.get_code("NEW23456").await.unwrap().is_some());
    }
}
