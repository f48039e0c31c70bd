use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditRecorder;
use crate::auth::registry::ApiKeyRegistry;
use crate::domain::{
    ApiKey, AuditCategory, InvalidReason, KeyValidation, Permission, PermissionSet, RequestContext,
};
use crate::errors::{AppError, Result};
use crate::observability::MetricsRecorder;

/// Caller identity attached to a request once its key validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatedIdentity {
    pub account_id: Uuid,
    pub key_id: Uuid,
    pub key_name: String,
    pub permissions: PermissionSet,
}

impl ValidatedIdentity {
    pub fn can(&self, permission: Permission) -> bool {
        self.permissions.contains(permission)
    }

    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.can(permission) {
            Ok(())
        } else {
            warn!(
                account_id = %self.account_id,
                key_id = %self.key_id,
                permission = permission.as_str(),
                "Permission denied"
            );
            Err(AppError::InsufficientPermissions(permission))
        }
    }
}

impl From<&ApiKey> for ValidatedIdentity {
    fn from(key: &ApiKey) -> Self {
        Self {
            account_id: key.account_id,
            key_id: key.id,
            key_name: key.name.clone(),
            permissions: key.permissions.clone(),
        }
    }
}

/// Front door for every credential presented to the service.
///
/// Wraps the registry so that each attempt, successful or not, produces one
/// `authentication` audit event and one metric sample.
#[derive(Clone)]
pub struct Authenticator {
    registry: ApiKeyRegistry,
    audit: AuditRecorder,
}

impl Authenticator {
    pub fn new(registry: ApiKeyRegistry, audit: AuditRecorder) -> Self {
        Self { registry, audit }
    }

    /// Validates the presented secret, if any.
    ///
    /// Returns `Err` only when a store could not answer; the caller must then
    /// refuse the request.
    pub async fn authenticate(
        &self,
        raw: Option<&str>,
        context: &RequestContext,
    ) -> Result<KeyValidation> {
        let validation = match raw {
            None => KeyValidation::invalid(None, InvalidReason::Missing),
            Some(raw) => match self.registry.validate_by_raw_secret(raw).await {
                Ok(validation) => validation,
                Err(e) => {
                    let _ = self.audit.record(
                        self.audit
                            .entry(AuditCategory::Authentication, context)
                            .with_success(false)
                            .with_detail("reason", "store_unavailable"),
                    );
                    MetricsRecorder::record_authentication("error");
                    return Err(e);
                }
            },
        };

        self.record_attempt(&validation, context);
        Ok(validation)
    }

    /// Validates and converts into an identity, mapping rejections to 401s.
    pub async fn identify(
        &self,
        raw: Option<&str>,
        context: &RequestContext,
    ) -> Result<ValidatedIdentity> {
        let validation = self.authenticate(raw, context).await?;
        match (validation.outcome, validation.key) {
            (Ok(()), Some(key)) => Ok(ValidatedIdentity::from(&key)),
            (Err(InvalidReason::Missing), _) => Err(AppError::MissingApiKey),
            _ => Err(AppError::InvalidApiKey),
        }
    }

    fn record_attempt(&self, validation: &KeyValidation, context: &RequestContext) {
        let mut entry = self
            .audit
            .entry(AuditCategory::Authentication, context)
            .with_success(validation.is_valid());
        if let Some(key) = &validation.key {
            entry = entry
                .with_account(key.account_id)
                .with_key(key.id, key.name.clone());
        }

        match validation.reason() {
            None => {
                MetricsRecorder::record_authentication("success");
                debug!(
                    key_id = ?validation.key.as_ref().map(|k| k.id),
                    source_ip = %context.source_ip,
                    "API key authenticated"
                );
            }
            Some(reason) => {
                entry = entry.with_detail("reason", reason.as_str());
                MetricsRecorder::record_authentication(reason.as_str());
                warn!(
                    reason = reason.as_str(),
                    key_id = ?validation.key.as_ref().map(|k| k.id),
                    source_ip = %context.source_ip,
                    "API key rejected"
                );
            }
        }

        let _ = self.audit.record(entry);
    }
}
