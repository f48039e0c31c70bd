pub mod account;
pub mod api_key;
pub mod audit;
pub mod idempotency;

pub use account::{Account, AccountStatus};
pub use api_key::{
    ApiKey, ApiKeyStatus, InvalidReason, KeyValidation, Permission, PermissionSet, RawSecret,
};
pub use audit::{AuditCategory, AuditEntry, AuditEvent, AuditQuery, RequestContext};
pub use idempotency::{CachedResponse, IdempotencyCheck, IdempotencyRecord, IdempotencyStatus};
