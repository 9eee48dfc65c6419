//! QPS-throttled transform stage for concurrent async pipelines.
//!
//! A [`Throttler`] starts at most `qps` transformations per one-second
//! window and queues the rest in arrival order. [`ThrottledStreamExt`] plugs
//! it into any `Stream`.

pub mod completion;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod scheduler;
pub mod stream;
pub mod throttler;
pub mod window;

pub use completion::{Completion, ItemResult, Pending};
pub use config::{Config, ThrottlerConfig};
pub use error::{ItemError, Result, ThrottleError};
pub use metrics::ThrottleMetrics;
pub use scheduler::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
pub use stream::{throttled_stream, ThrottledStreamExt};
pub use throttler::{Admission, Throttler, ThrottlerBuilder};
