//! Cursor over a run's event log.
//!
//! The consumer feeds exactly one event at a time to the primitives
//! subscribed during replay. A subscriber's verdict controls advancement:
//! `Consumed` advances the cursor and keeps the subscription, `NotConsumed`
//! offers the same event to the next subscriber, `Finished` advances and
//! drops the subscription. When the cursor reaches the end, primitives that
//! still expect events are what turns the pass into a suspension.

use windlass_core::Event;

/// A subscriber's decision about one delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Event belongs to this subscriber and is absorbed; keep subscribing.
    Consumed,

    /// Event belongs to someone else; offer it to the next subscriber.
    NotConsumed,

    /// Event terminates this subscriber's correlation; unsubscribe.
    Finished,
}

/// Stateful cursor over the correlation events of one run, in append order.
#[derive(Debug)]
pub struct EventsConsumer {
    events: Vec<Event>,
    cursor: usize,
}

impl EventsConsumer {
    /// Creates a consumer positioned before the first event.
    #[must_use]
    pub fn new(events: Vec<Event>) -> Self {
        Self { events, cursor: 0 }
    }

    /// The event at the cursor, or `None` once the log is exhausted.
    #[must_use]
    pub fn peek(&self) -> Option<&Event> {
        self.events.get(self.cursor)
    }

    /// Advances past the current event.
    pub fn advance(&mut self) {
        if self.cursor < self.events.len() {
            self.cursor += 1;
        }
    }

    /// Whether every event has been consumed.
    #[must_use]
    pub fn at_end(&self) -> bool {
        self.cursor >= self.events.len()
    }

    /// Events consumed so far.
    #[must_use]
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Total number of events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_core::{CorrelationId, EventId, EventType, RunId};

    fn event(event_type: EventType, correlation: CorrelationId) -> Event {
        Event {
            event_id: EventId::new(),
            run_id: RunId::new(),
            event_type,
            correlation_id: Some(correlation),
            created_at: chrono::Utc::now(),
            spec_version: 2,
            event_data: None,
        }
    }

    #[test]
    fn cursor_walks_in_order() {
        let c1 = CorrelationId::step(ulid::Ulid::new());
        let events = vec![
            event(EventType::StepCreated, c1),
            event(EventType::StepStarted, c1),
            event(EventType::StepCompleted, c1),
        ];
        let mut consumer = EventsConsumer::new(events);

        assert_eq!(consumer.len(), 3);
        assert_eq!(
            consumer.peek().map(|e| e.event_type),
            Some(EventType::StepCreated)
        );
        consumer.advance();
        assert_eq!(
            consumer.peek().map(|e| e.event_type),
            Some(EventType::StepStarted)
        );
        consumer.advance();
        consumer.advance();
        assert!(consumer.at_end());
        assert!(consumer.peek().is_none());
        assert_eq!(consumer.position(), 3);
    }

    #[test]
    fn advance_past_end_is_a_no_op() {
        let mut consumer = EventsConsumer::new(vec![]);
        assert!(consumer.at_end());
        consumer.advance();
        assert_eq!(consumer.position(), 0);
    }
}
