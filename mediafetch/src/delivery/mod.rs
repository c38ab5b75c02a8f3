//! Exactly-once delivery of discovered items to bound recipients.

pub mod events;
pub mod pipeline;
pub mod rate_limiter;
pub mod resilience;
pub mod transform;
pub mod worker_pool;

pub use events::{DeliveryEvent, ParkReason};
pub use pipeline::{DeliveryPipeline, PipelineConfig, ProcessOutcome, Processed, SubmitOutcome};
pub use rate_limiter::{Acquire, RateLimiter, RateLimiterConfig};
pub use resilience::{
    BreakerConfig, BreakerStats, BreakerTransition, CircuitBreaker, CircuitBreakerManager,
    CircuitState, Dependency, DependencyUnavailable, RetryConfig,
};
pub use transform::TransformConfig;
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
