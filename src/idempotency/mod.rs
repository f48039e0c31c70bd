//! Exactly-once handling of client-retried writes.

pub mod fingerprint;
pub mod ledger;
pub mod middleware;

pub use fingerprint::{extract_idempotency_key, RequestFingerprint};
pub use ledger::{Begin, IdempotencyLedger};
pub use middleware::idempotency_middleware;
