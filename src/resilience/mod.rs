//! 容错层：熔断器、熔断键、重试、限流

pub mod circuit_breaker;
pub mod domain;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{BreakerState, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use domain::domain_key;
pub use rate_limit::{RateLimit, RollingWindowLimiter};
pub use retry::{exponential_backoff, retry_with_backoff, Retried, RetryPolicy};
