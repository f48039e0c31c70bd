pub mod recorder;
pub mod storage;
pub mod tamper_proof;

pub use recorder::AuditRecorder;
pub use storage::PostgresAuditStore;
pub use tamper_proof::HashChain;
