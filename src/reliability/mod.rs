pub mod metrics;
pub mod retry;
pub mod timeout;

pub use metrics::{ConnectionMetrics, MetricsError, MetricsSnapshot};
pub use retry::{RetryPolicy, RetryStrategy};
pub use timeout::TimeoutChecker;
