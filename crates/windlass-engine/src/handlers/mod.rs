//! Queue delivery handlers.
//!
//! The workflow handler replays runs, the step handler executes effectful
//! work with retries, and the suspension handler converts a replay pass's
//! pending queue into durable `*_created` events and queue messages.

mod step;
mod suspend;
mod workflow;
