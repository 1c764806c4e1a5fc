//! In-memory queue with at-least-once delivery and per-key idempotency.
//!
//! One tokio task owns each active `(topic, message_key)` slot, which gives
//! the per-key single-active-execution guarantee for free: a run's workflow
//! handler can never run concurrently with itself. Enqueues while a slot is
//! scheduled coalesce; enqueues while a delivery is executing schedule
//! exactly one follow-up round so a wake arriving mid-replay is not lost.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::queue::{Delivery, Queue, QueueError, QueueHandler};

/// Backoff applied after a handler error, doubling up to [`MAX_ERROR_BACKOFF`].
const INITIAL_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotStatus {
    /// A delivery round will start; further enqueues coalesce.
    Scheduled,
    /// A handler is executing.
    Running,
    /// A handler is executing and another round was requested.
    Rescheduled,
}

struct Slot {
    status: SlotStatus,
    /// Latest enqueued payload; the follow-up round delivers this.
    payload: Vec<u8>,
}

struct Inner {
    handlers: Mutex<Vec<(String, QueueHandler)>>,
    slots: Mutex<HashMap<(String, String), Slot>>,
}

impl Inner {
    fn handler_for(&self, topic: &str) -> Option<QueueHandler> {
        let handlers = self.handlers.lock();
        handlers
            .iter()
            .filter(|(prefix, _)| topic.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, handler)| Arc::clone(handler))
    }
}

/// In-process queue backed by tokio tasks and timers.
#[derive(Clone)]
pub struct InMemoryQueue {
    inner: Arc<Inner>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                handlers: Mutex::new(Vec::new()),
                slots: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of active `(topic, key)` slots (for tests).
    #[must_use]
    pub fn active_slots(&self) -> usize {
        self.inner.slots.lock().len()
    }

    fn spawn_slot(&self, topic: String, key: String, handler: QueueHandler) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let slot_key = (topic.clone(), key.clone());
            loop {
                // Claim this round's payload.
                let payload = {
                    let mut slots = inner.slots.lock();
                    let Some(slot) = slots.get_mut(&slot_key) else {
                        return;
                    };
                    slot.status = SlotStatus::Running;
                    slot.payload.clone()
                };

                run_delivery_rounds(&topic, payload, &handler).await;

                // Another enqueue landed while we were running?
                let again = {
                    let mut slots = inner.slots.lock();
                    match slots.get(&slot_key).map(|s| s.status) {
                        Some(SlotStatus::Rescheduled) => {
                            slots.get_mut(&slot_key).expect("slot present").status =
                                SlotStatus::Scheduled;
                            true
                        }
                        _ => {
                            slots.remove(&slot_key);
                            false
                        }
                    }
                };
                if !again {
                    break;
                }
            }
        });
    }
}

/// Drives one logical message to completion: redeliveries requested by the
/// handler (waits, retries) and error redeliveries all happen here, with the
/// attempt counter increasing each round.
async fn run_delivery_rounds(topic: &str, payload: Vec<u8>, handler: &QueueHandler) {
    let mut attempt: u32 = 1;
    let mut error_backoff = INITIAL_ERROR_BACKOFF;

    loop {
        let delivery = Delivery {
            topic: topic.to_string(),
            payload: payload.clone(),
            attempt,
        };

        match handler(delivery).await {
            Ok(None) => return,
            Ok(Some(delay)) => {
                debug!(topic, attempt, ?delay, "redelivery requested");
                tokio::time::sleep(delay).await;
                attempt += 1;
                error_backoff = INITIAL_ERROR_BACKOFF;
            }
            Err(err) => {
                warn!(topic, attempt, %err, "delivery failed, will redeliver");
                tokio::time::sleep(error_backoff).await;
                error_backoff = (error_backoff * 2).min(MAX_ERROR_BACKOFF);
                attempt += 1;
            }
        }
    }
}

#[async_trait::async_trait]
impl Queue for InMemoryQueue {
    async fn create_handler(
        &self,
        topic_prefix: &str,
        handler: QueueHandler,
    ) -> Result<(), QueueError> {
        let mut handlers = self.inner.handlers.lock();
        if let Some(entry) = handlers.iter_mut().find(|(p, _)| p == topic_prefix) {
            entry.1 = handler;
        } else {
            handlers.push((topic_prefix.to_string(), handler));
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        topic: &str,
        message_key: &str,
        payload: Vec<u8>,
    ) -> Result<(), QueueError> {
        let handler = self
            .inner
            .handler_for(topic)
            .ok_or_else(|| QueueError::NoHandler(topic.to_string()))?;

        let slot_key = (topic.to_string(), message_key.to_string());
        let should_spawn = {
            let mut slots = self.inner.slots.lock();
            match slots.get_mut(&slot_key) {
                None => {
                    slots.insert(
                        slot_key.clone(),
                        Slot {
                            status: SlotStatus::Scheduled,
                            payload,
                        },
                    );
                    true
                }
                Some(slot) => {
                    // Coalesce, keeping the newest payload. A running slot
                    // gets exactly one follow-up round.
                    slot.payload = payload;
                    if slot.status == SlotStatus::Running {
                        slot.status = SlotStatus::Rescheduled;
                    }
                    false
                }
            }
        };

        if should_spawn {
            self.spawn_slot(slot_key.0, slot_key.1, handler);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn counting_handler(
        calls: Arc<AtomicU32>,
        done: Arc<Notify>,
    ) -> QueueHandler {
        Arc::new(move |_delivery| {
            let calls = Arc::clone(&calls);
            let done = Arc::clone(&done);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                done.notify_waiters();
                Ok(None)
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn delivers_to_matching_prefix() {
        let queue = InMemoryQueue::new();
        let calls = Arc::new(AtomicU32::new(0));
        let done = Arc::new(Notify::new());

        queue
            .create_handler("__wkf_workflow_", counting_handler(calls.clone(), done.clone()))
            .await
            .expect("register");

        let wait = done.notified();
        queue
            .enqueue("__wkf_workflow_x", "key-1", b"{}".to_vec())
            .await
            .expect("enqueue");
        wait.await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_handler_is_an_error() {
        let queue = InMemoryQueue::new();
        let err = queue.enqueue("__wkf_step_y", "k", vec![]).await.unwrap_err();
        assert!(matches!(err, QueueError::NoHandler(_)));
    }

    #[tokio::test]
    async fn scheduled_enqueues_coalesce() {
        let queue = InMemoryQueue::new();
        let calls = Arc::new(AtomicU32::new(0));
        let release = Arc::new(Notify::new());

        // Handler blocks until released, so repeated enqueues land while the
        // first is scheduled/running.
        let handler: QueueHandler = {
            let calls = Arc::clone(&calls);
            let release = Arc::clone(&release);
            Arc::new(move |_delivery| {
                let calls = Arc::clone(&calls);
                let release = Arc::clone(&release);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    release.notified().await;
                    Ok(None)
                }
                .boxed()
            })
        };
        queue.create_handler("t_", handler).await.expect("register");

        for _ in 0..5 {
            queue.enqueue("t_a", "same-key", vec![]).await.expect("enqueue");
        }

        // Let the first delivery start, then release all rounds.
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // One initial round plus at most one follow-up for the coalesced
        // enqueues that arrived mid-execution.
        let total = calls.load(Ordering::SeqCst);
        assert!((1..=2).contains(&total), "expected 1-2 rounds, got {total}");
        assert_eq!(queue.active_slots(), 0);
    }

    #[tokio::test]
    async fn redelivery_requested_by_handler() {
        let queue = InMemoryQueue::new();
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(Notify::new());

        let handler: QueueHandler = {
            let attempts = Arc::clone(&attempts);
            let done = Arc::clone(&done);
            Arc::new(move |delivery: Delivery| {
                let attempts = Arc::clone(&attempts);
                let done = Arc::clone(&done);
                async move {
                    attempts.lock().push(delivery.attempt);
                    if delivery.attempt < 3 {
                        Ok(Some(Duration::from_millis(10)))
                    } else {
                        done.notify_waiters();
                        Ok(None)
                    }
                }
                .boxed()
            })
        };
        queue.create_handler("t_", handler).await.expect("register");

        let wait = done.notified();
        queue.enqueue("t_b", "k", vec![]).await.expect("enqueue");
        wait.await;

        assert_eq!(attempts.lock().clone(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn handler_errors_redeliver() {
        let queue = InMemoryQueue::new();
        let calls = Arc::new(AtomicU32::new(0));
        let done = Arc::new(Notify::new());

        let handler: QueueHandler = {
            let calls = Arc::clone(&calls);
            let done = Arc::clone(&done);
            Arc::new(move |_delivery| {
                let calls = Arc::clone(&calls);
                let done = Arc::clone(&done);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 2 {
                        Err(QueueError::Handler("transient".to_string()))
                    } else {
                        done.notify_waiters();
                        Ok(None)
                    }
                }
                .boxed()
            })
        };
        queue.create_handler("t_", handler).await.expect("register");

        let wait = done.notified();
        queue.enqueue("t_c", "k", vec![]).await.expect("enqueue");
        wait.await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let queue = InMemoryQueue::new();
        let generic = Arc::new(AtomicU32::new(0));
        let specific = Arc::new(AtomicU32::new(0));
        let done = Arc::new(Notify::new());

        queue
            .create_handler("t_", counting_handler(generic.clone(), Arc::new(Notify::new())))
            .await
            .expect("register generic");
        queue
            .create_handler("t_special_", counting_handler(specific.clone(), done.clone()))
            .await
            .expect("register specific");

        let wait = done.notified();
        queue
            .enqueue("t_special_topic", "k", vec![])
            .await
            .expect("enqueue");
        wait.await;

        assert_eq!(specific.load(Ordering::SeqCst), 1);
        assert_eq!(generic.load(Ordering::SeqCst), 0);
    }
}
