//! Error taxonomy shared by the handlers.
//!
//! Step bodies fail with a [`StepError`]; the tags on it drive the retry
//! decision in the step handler. Workflow-level failures are persisted as a
//! [`WorkflowError`] with the (remapped) stack of the original error.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Terminal error recorded for a failed run, and the shape a rejected step
/// `await` carries back into workflow code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    /// Error message.
    pub message: String,

    /// Stack trace, remapped to user source where a source map is available.
    pub stack: Option<String>,
}

impl WorkflowError {
    /// Create a new workflow error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// Error raised by a step body.
///
/// The `fatal` and `retryable` tags are user intent; an error carrying
/// neither is retried under the step's [`RetryPolicy`](crate::RetryPolicy)
/// with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message.
    pub message: String,

    /// Stack trace of the failure site, if captured.
    pub stack: Option<String>,

    /// Bypass the retry policy and fail the step on first occurrence.
    pub fatal: bool,

    /// Explicitly marked transient.
    pub retryable: bool,

    /// Redelivery delay requested by a retryable error, overriding the
    /// policy's computed backoff.
    #[serde(with = "option_duration_millis")]
    pub retry_after: Option<Duration>,
}

impl StepError {
    /// Create an untagged error; the retry policy decides what happens.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            fatal: false,
            retryable: false,
            retry_after: None,
        }
    }

    /// Create a fatal error. Fails the step immediately, no retries.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            fatal: true,
            ..Self::new(message)
        }
    }

    /// Create an explicitly retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(message)
        }
    }

    /// Request a specific redelivery delay for the next attempt.
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Attach a stack trace.
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Serde support for `Option<Duration>` as milliseconds.
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
