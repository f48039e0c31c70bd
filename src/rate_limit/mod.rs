pub mod limiter;
pub mod middleware;

pub use limiter::{Dimension, RateLimitDecision, RateLimiter};
pub use middleware::{account_rate_limit, endpoint_rate_limit, ip_rate_limit};
