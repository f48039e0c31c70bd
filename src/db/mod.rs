pub mod accounts;
pub mod api_keys;
pub mod pool;
pub mod schema;

pub use accounts::PostgresAccountStore;
pub use api_keys::PostgresApiKeyStore;
pub use pool::{create_pool, health_check, run_migrations};
