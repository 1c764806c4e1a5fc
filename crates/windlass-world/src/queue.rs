//! The queue trait: at-least-once topics with per-key idempotency.
//!
//! The queue is the only source of wall-clock scheduling in the runtime.
//! Handlers may request redelivery at a deadline (waits, retries); handler
//! errors also redeliver. For a given message key at most one handler
//! execution is active at a time, which is what serializes all event-log
//! appends for a run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

/// One delivery of a queue message.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Full topic the message was enqueued on.
    pub topic: String,

    /// Message payload (JSON bytes).
    pub payload: Vec<u8>,

    /// Delivery attempt for this message, 1-based. Increments on every
    /// redelivery, whether requested or caused by a handler error.
    pub attempt: u32,
}

/// What a handler asks the queue to do next: `None` completes the message,
/// `Some(delay)` requests redelivery at or after the delay.
pub type HandlerOutcome = Option<Duration>;

/// Handler invoked for each delivery on a registered topic prefix.
pub type QueueHandler =
    Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<HandlerOutcome, QueueError>> + Send + Sync>;

/// Error type for queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// No handler registered for the topic.
    #[error("no handler registered for topic {0:?}")]
    NoHandler(String),

    /// Handler failed; the delivery will be retried.
    #[error("handler error: {0}")]
    Handler(String),

    /// Backend failure.
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Named-topic message bus.
///
/// Contract: **at-least-once** delivery; **idempotent by message key** —
/// duplicate enqueues with the same `(topic, message_key)` coalesce while a
/// delivery is scheduled, and an enqueue during an active execution schedules
/// exactly one follow-up delivery.
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Register a handler for every topic starting with `topic_prefix`.
    /// Registering the same prefix again replaces the handler.
    async fn create_handler(
        &self,
        topic_prefix: &str,
        handler: QueueHandler,
    ) -> Result<(), QueueError>;

    /// Enqueue a message.
    async fn enqueue(
        &self,
        topic: &str,
        message_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError>;
}
