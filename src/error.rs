use thiserror::Error;

/// Boxed error type carried by per-item failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised synchronously by the throttler itself.
#[derive(Debug, Error)]
pub enum ThrottleError {
    #[error("Not implemented: no transformation function was supplied")]
    NotImplemented,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("No tokio runtime available to drive the window timer")]
    NoRuntime,

    #[error("Throttler has been shut down")]
    ShutDown,
}

impl From<validator::ValidationErrors> for ThrottleError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottleError::InvalidConfig(err.to_string())
    }
}

/// Failure delivered to the consumer of a single item.
///
/// Per-item errors never affect throttling state or other items.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("Transformation failed: {0}")]
    Transform(#[source] BoxError),

    #[error("Not implemented: no transformation function was supplied")]
    NotImplemented,

    #[error("Completion handle dropped before a result was delivered")]
    Abandoned,

    #[error("Item was still queued when the throttler shut down")]
    ShutDown,

    #[error("End-of-stream flush failed: {0}")]
    Flush(#[source] BoxError),
}

impl ItemError {
    /// Wrap any error as a transformation failure.
    pub fn transform<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ItemError::Transform(err.into())
    }

    /// Wrap any error as a flush failure.
    pub fn flush<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        ItemError::Flush(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ThrottleError>;
