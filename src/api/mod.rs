pub mod accounts;
pub mod api_keys;
pub mod audit;
pub mod auth;
pub mod extract;
pub mod health;
pub mod routes;

pub use routes::{create_router, AppState, Stores};
