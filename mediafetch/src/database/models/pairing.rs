//! Pairing code database model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One-time code issued to a recipient and redeemed by a source account.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PairingCodeDbModel {
    pub code: String,
    /// Recipient-side identity that requested the code.
    pub owner_id: String,
    /// When set, only this source account may redeem the code.
    pub expected_source: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub used: bool,
    pub used_at: Option<i64>,
    pub used_by: Option<String>,
    pub attempts: i64,
    pub max_attempts: i64,
}

impl PairingCodeDbModel {
    pub fn new(
        code: impl Into<String>,
        owner_id: impl Into<String>,
        expected_source: Option<String>,
        now_ms: i64,
        ttl_ms: i64,
        max_attempts: i64,
    ) -> Self {
        Self {
            code: code.into(),
            owner_id: owner_id.into(),
            expected_source,
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl_ms),
            used: false,
            used_at: None,
            used_by: None,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// Unused, unexpired and under its attempt limit.
    pub fn is_redeemable(&self, now_ms: i64) -> bool {
        !self.used && !self.is_expired(now_ms) && !self.attempts_exhausted()
    }
}
