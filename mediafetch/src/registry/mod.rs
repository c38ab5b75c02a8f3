//! Binding registry: pairing codes and confirmed source/recipient links.

pub mod code;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alert::{Alert, AlertSink, TracingAlertSink};
use crate::database::models::{BindingDbModel, DeactivationReason, PairingCodeDbModel};
use crate::database::repositories::{
    BindingRepository, InsertCodeOutcome, PairingCodeRepository, RedeemOutcome, RedeemRequest,
};
use crate::database::time::{duration_to_ms, now_ms};
use crate::domain::{BindingPreferences, RecipientId, SourceId};
use crate::error::PairingError;
use crate::{Error, Result};

use code::{generate_code, normalize_code};

/// Fresh codes tried before giving up on collisions.
const MAX_CODE_COLLISIONS: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub code_length: usize,
    pub code_ttl: Duration,
    /// Failed confirmations before a code is burned.
    pub max_attempts: u32,
    /// Live codes one owner may hold at once.
    pub max_outstanding: u32,
    /// Poll interval for a source first seen through a confirmation.
    pub default_poll_interval: Duration,
    /// Preferences given to brand-new bindings.
    pub default_preferences: BindingPreferences,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            code_length: 8,
            code_ttl: Duration::from_secs(24 * 60 * 60),
            max_attempts: 3,
            max_outstanding: 5,
            default_poll_interval: Duration::from_secs(300),
            default_preferences: BindingPreferences::default(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if !(6..=32).contains(&self.code_length) {
            return Err(Error::config("pairing code length must be between 6 and 32"));
        }
        if self.code_ttl.is_zero() {
            return Err(Error::config("pairing code TTL must be positive"));
        }
        if self.max_attempts == 0 || self.max_outstanding == 0 {
            return Err(Error::config(
                "pairing attempt and outstanding limits must be at least 1",
            ));
        }
        Ok(())
    }
}

pub struct BindingRegistry {
    codes: Arc<dyn PairingCodeRepository>,
    bindings: Arc<dyn BindingRepository>,
    alerts: Arc<dyn AlertSink>,
    config: RegistryConfig,
}

impl BindingRegistry {
    pub fn new(
        codes: Arc<dyn PairingCodeRepository>,
        bindings: Arc<dyn BindingRepository>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            codes,
            bindings,
            alerts: Arc::new(TracingAlertSink),
            config,
        }
    }

    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    /// Issue a one-time code any source account may confirm.
    pub async fn issue_pairing_code(
        &self,
        owner: &RecipientId,
        ttl: Option<Duration>,
    ) -> Result<PairingCodeDbModel> {
        self.issue(owner, None, ttl).await
    }

    /// Issue a code only `expected_source` may confirm. The handle is
    /// normalized the same way [`Self::confirm_binding`] normalizes its
    /// counterpart.
    pub async fn issue_pairing_code_for(
        &self,
        owner: &RecipientId,
        expected_source: &SourceId,
        ttl: Option<Duration>,
    ) -> Result<PairingCodeDbModel> {
        self.issue(owner, Some(expected_source), ttl).await
    }

    async fn issue(
        &self,
        owner: &RecipientId,
        expected_source: Option<&SourceId>,
        ttl: Option<Duration>,
    ) -> Result<PairingCodeDbModel> {
        let ttl = ttl.unwrap_or(self.config.code_ttl);
        if ttl.is_zero() {
            return Err(Error::validation("pairing code TTL must be positive"));
        }
        let owner = &RecipientId::parse(owner.as_str())?;
        let expected_source = expected_source
            .map(|s| SourceId::parse(s.as_str()))
            .transpose()?;
        let expected_source = expected_source.as_ref();

        for _ in 0..MAX_CODE_COLLISIONS {
            let code = PairingCodeDbModel::new(
                generate_code(self.config.code_length),
                owner.as_str(),
                expected_source.map(|s| s.as_str().to_string()),
                now_ms(),
                duration_to_ms(ttl),
                i64::from(self.config.max_attempts),
            );

            match self
                .codes
                .insert_code(&code, i64::from(self.config.max_outstanding))
                .await?
            {
                InsertCodeOutcome::Inserted => {
                    info!(owner = %owner, expected_source = ?expected_source.map(SourceId::as_str), "Pairing code issued");
                    return Ok(code);
                }
                InsertCodeOutcome::Collision => {
                    debug!("Pairing code collision, regenerating");
                }
                InsertCodeOutcome::OwnerAtLimit => {
                    info!(owner = %owner, "Owner holds too many outstanding codes");
                    return Err(PairingError::RateLimitExceeded.into());
                }
            }
        }

        Err(Error::Other(
            "could not generate a unique pairing code".to_string(),
        ))
    }

    /// Redeem `code` on behalf of `counterpart`, creating or reactivating the
    /// binding. Rejections come back as [`Error::Pairing`]; a malformed
    /// handle is an [`Error::Validation`] and leaves the code untouched.
    pub async fn confirm_binding(
        &self,
        code: &str,
        counterpart: &SourceId,
    ) -> Result<BindingDbModel> {
        let counterpart = &SourceId::parse(counterpart.as_str())?;
        let code = normalize_code(code);
        let default_preferences = serde_json::to_string(&self.config.default_preferences)?;

        let outcome = self
            .codes
            .redeem(RedeemRequest {
                code: &code,
                counterpart: counterpart.as_str(),
                now_ms: now_ms(),
                default_poll_interval_ms: duration_to_ms(self.config.default_poll_interval),
                default_preferences: &default_preferences,
            })
            .await?;

        match outcome {
            RedeemOutcome::Bound { binding, created } => {
                info!(
                    binding_id = binding.id,
                    source = %binding.source_id,
                    recipient = %binding.recipient_id,
                    created,
                    "Binding confirmed"
                );
                Ok(binding)
            }
            RedeemOutcome::Rejected(reason) => {
                info!(counterpart = %counterpart, %reason, "Pairing code rejected");
                Err(reason.into())
            }
        }
    }

    /// Deactivate a binding. Only its recipient may do this; revoking an
    /// inactive binding is a no-op. Returns `true` if it was active.
    pub async fn revoke_binding(&self, binding_id: i64, requester: &RecipientId) -> Result<bool> {
        let binding = self.bindings.get_binding(binding_id).await?;
        if binding.recipient_id != requester.as_str() {
            warn!(binding_id, requester = %requester, "Revoke attempted by non-recipient");
            return Err(Error::not_permitted(
                "only the binding's recipient may revoke it",
            ));
        }

        let was_active = self
            .bindings
            .deactivate(binding_id, DeactivationReason::Revoked, now_ms())
            .await?;
        if was_active {
            info!(binding_id, "Binding revoked");
            self.alerts
                .alert(Alert::BindingDeactivated {
                    binding_id,
                    source_id: binding.source(),
                    recipient_id: binding.recipient(),
                    reason: DeactivationReason::Revoked,
                })
                .await;
        }
        Ok(was_active)
    }

    /// Active bindings for `source` in confirmation order.
    pub async fn list_active_bindings(&self, source: &SourceId) -> Result<Vec<BindingDbModel>> {
        self.bindings.list_active_for_source(source.as_str()).await
    }

    pub async fn get_binding(&self, binding_id: i64) -> Result<BindingDbModel> {
        self.bindings.get_binding(binding_id).await
    }

    pub async fn list_bindings_for_recipient(
        &self,
        recipient: &RecipientId,
    ) -> Result<Vec<BindingDbModel>> {
        self.bindings.list_for_recipient(recipient.as_str()).await
    }

    /// Replace a binding's preferences. Same permission rule as revoking.
    pub async fn update_preferences(
        &self,
        binding_id: i64,
        requester: &RecipientId,
        preferences: &BindingPreferences,
    ) -> Result<BindingDbModel> {
        let binding = self.bindings.get_binding(binding_id).await?;
        if binding.recipient_id != requester.as_str() {
            return Err(Error::not_permitted(
                "only the binding's recipient may change its preferences",
            ));
        }
        let json = serde_json::to_string(preferences)?;
        self.bindings.update_preferences(binding_id, &json).await?;
        debug!(binding_id, "Binding preferences updated");
        self.bindings.get_binding(binding_id).await
    }

    /// The stored code, for status displays.
    pub async fn get_code(&self, code: &str) -> Result<Option<PairingCodeDbModel>> {
        self.codes.get_code(&normalize_code(code)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::{SqlxBindingRepository, SqlxPairingCodeRepository};
    use crate::database::test_support::setup_test_db;
    use crate::domain::ContentKind;

    async fn registry(config: RegistryConfig) -> (BindingRegistry, tempfile::TempDir) {
        let (pool, dir) = setup_test_db().await;
        let registry = BindingRegistry::new(
            Arc::new(SqlxPairingCodeRepository::new(pool.clone())),
            Arc::new(SqlxBindingRepository::new(pool)),
            config,
        );
        (registry, dir)
    }

    #[tokio::test]
    async fn test_issue_and_confirm() {
        let (registry, _dir) = registry(RegistryConfig::default()).await;
        let owner = RecipientId::new("u1");
        let code = registry.issue_pairing_code(&owner, None).await.unwrap();
        assert_eq!(code.code.len(), 8);

        let binding = registry
            .confirm_binding(&code.code.to_lowercase(), &SourceId::new("s1"))
            .await
            .unwrap();
        assert!(binding.active);
        assert_eq!(binding.recipient_id, "u1");

        let err = registry
            .confirm_binding(&code.code, &SourceId::new("s1"))
            .await
            .unwrap_err();
        assert_eq!(err.pairing(), Some(PairingError::InvalidCode));
    }

    #[tokio::test]
    async fn test_outstanding_limit() {
        let (registry, _dir) = registry(RegistryConfig {
            max_outstanding: 2,
            ..Default::default()
        })
        .await;
        let owner = RecipientId::new("u1");
        registry.issue_pairing_code(&owner, None).await.unwrap();
        registry.issue_pairing_code(&owner, None).await.unwrap();
        let err = registry.issue_pairing_code(&owner, None).await.unwrap_err();
        assert_eq!(err.pairing(), Some(PairingError::RateLimitExceeded));

        // Other owners are unaffected.
        assert!(registry.issue_pairing_code(&RecipientId::new("u2"), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_expected_source_is_enforced() {
        let (registry, _dir) = registry(RegistryConfig::default()).await;
        let code = registry
            .issue_pairing_code_for(&RecipientId::new("u1"), &SourceId::new("alice"), None)
            .await
            .unwrap();

        let err = registry
            .confirm_binding(&code.code, &SourceId::new("mallory"))
            .await
            .unwrap_err();
        assert_eq!(err.pairing(), Some(PairingError::InvalidCode));

        let binding = registry
            .confirm_binding(&code.code, &SourceId::new("ALICE"))
            .await
            .unwrap();
        assert_eq!(binding.source_id, "alice");
    }

    #[tokio::test]
    async fn test_only_recipient_may_revoke() {
        let (registry, _dir) = registry(RegistryConfig::default()).await;
        let owner = RecipientId::new("u1");
        let code = registry.issue_pairing_code(&owner, None).await.unwrap();
        let binding = registry
            .confirm_binding(&code.code, &SourceId::new("s1"))
            .await
            .unwrap();

        let err = registry
            .revoke_binding(binding.id, &RecipientId::new("u2"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotPermitted(_)));

        assert!(registry.revoke_binding(binding.id, &owner).await.unwrap());
        assert!(!registry.revoke_binding(binding.id, &owner).await.unwrap());
        assert!(
            registry
                .list_active_bindings(&SourceId::new("s1"))
                .await
                .unwrap()
                .is_empty()
        );

        // Re-binding reactivates the same row.
        let code = registry.issue_pairing_code(&owner, None).await.unwrap();
        let again = registry
            .confirm_binding(&code.code, &SourceId::new("s1"))
            .await
            .unwrap();
        assert_eq!(again.id, binding.id);
        assert!(again.active);
    }

    #[tokio::test]
    async fn test_update_preferences() {
        let (registry, _dir) = registry(RegistryConfig::default()).await;
        let owner = RecipientId::new("u1");
        let code = registry.issue_pairing_code(&owner, None).await.unwrap();
        let binding = registry
            .confirm_binding(&code.code, &SourceId::new("s1"))
            .await
            .unwrap();

        let prefs = BindingPreferences {
            content_kinds: vec![ContentKind::Story],
            ..Default::default()
        };
        let updated = registry
            .update_preferences(binding.id, &owner, &prefs)
            .await
            .unwrap();
        assert_eq!(updated.preferences(), prefs);
        assert_eq!(
            registry.list_bindings_for_recipient(&owner).await.unwrap().len(),
            1
        );
    }

    #[test]
    fn test_config_validation() {
        assert!(RegistryConfig::default().validate().is_ok());
        let bad = RegistryConfig {
            code_length: 3,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
