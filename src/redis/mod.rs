pub mod client;
pub mod counters;
pub mod idempotency;

pub use client::{create_client, ping};
pub use counters::RedisRateLimitStore;
pub use idempotency::RedisIdempotencyStore;
