// Keygate: API key issuance and request authentication

pub mod accounts;
pub mod api;
pub mod audit;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod domain;
pub mod errors;
pub mod idempotency;
pub mod maintenance;
pub mod observability;
pub mod rate_limit;
pub mod redis;
pub mod store;

pub use config::Config;
pub use errors::{AppError, Result};
