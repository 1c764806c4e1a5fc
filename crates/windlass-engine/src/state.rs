//! Shared mutable state of one replay pass.
//!
//! The pass is single-threaded and synchronous: the engine polls the workflow
//! future with a no-op waker and interleaves event delivery between polls, so
//! `Rc<RefCell<...>>` is the whole concurrency story. Subscriptions live next
//! to (not inside) the core so a handler can mutate the pending queue while
//! the subscription list is being iterated.

use std::cell::RefCell;
use std::rc::Rc;

use windlass_core::{CorrelationId, Event, IdSource};

use crate::consumer::Verdict;
use crate::engine::EngineError;
use crate::pending::PendingQueue;

/// A primitive's event subscription. Receives every event at the cursor until
/// it finishes or the pass ends.
pub(crate) type SubscriptionHandler = Box<dyn FnMut(&Event, &mut EngineCore) -> Verdict>;

pub(crate) struct Subscription {
    pub handler: SubscriptionHandler,
}

/// Everything subscriptions may mutate.
pub(crate) struct EngineCore {
    pub spec_version: u32,
    pub ids: IdSource,
    pub pending: PendingQueue,
    /// Hook disposal requests recorded by user code this pass.
    pub disposals: Vec<CorrelationId>,
    /// Fatal log-corruption error discovered by a subscription.
    pub corruption: Option<EngineError>,
}

pub(crate) struct EngineState {
    pub core: EngineCore,
    pub subs: Vec<Subscription>,
}

pub(crate) type SharedState = Rc<RefCell<EngineState>>;
