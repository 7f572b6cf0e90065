//! Subscription registry: event filter -> server subscription id + ordered local handlers.
//!
//! The registry only keeps the bookkeeping. Subscribe/unsubscribe round-trips are driven by
//! [`HubConnection`](crate::HubConnection), which serializes them per filter through each
//! slot's async gate.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::HubEvent;

/// Caller-supplied event callback. Identity is the allocation, compared by address.
pub type EventHandler = Arc<dyn Fn(&HubEvent) + Send + Sync>;

/// Wrap a closure into an [`EventHandler`].
pub fn event_handler<F>(f: F) -> EventHandler
where
    F: Fn(&HubEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[inline]
pub(crate) fn same_handler(a: &EventHandler, b: &EventHandler) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Logical event selector a caller subscribes to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum EventFilter {
    /// Reserved filter matching every event.
    #[default]
    Any,
    EventType(String),
}

impl EventFilter {
    pub fn event_type(event_type: impl Into<String>) -> Self {
        EventFilter::EventType(event_type.into())
    }

    pub fn as_event_type(&self) -> Option<&str> {
        match self {
            EventFilter::Any => None,
            EventFilter::EventType(event_type) => Some(event_type),
        }
    }
}

impl From<&str> for EventFilter {
    fn from(event_type: &str) -> Self {
        EventFilter::event_type(event_type)
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventFilter::Any => f.write_str("*"),
            EventFilter::EventType(event_type) => f.write_str(event_type),
        }
    }
}

#[derive(Default)]
struct SlotState {
    server_id: Option<u64>,
    handlers: Vec<EventHandler>,
    /// The hub acknowledged a subscribe for this filter at least once.
    established: bool,
    /// Removed from the registry; holders must look the filter up again.
    retired: bool,
}

/// Per-filter subscription record.
pub(crate) struct Slot {
    filter: EventFilter,
    /// Serializes subscribe/unsubscribe/restore round-trips for this filter.
    pub(crate) gate: tokio::sync::Mutex<()>,
    state: Mutex<SlotState>,
}

impl Slot {
    fn new(filter: EventFilter) -> Self {
        Self {
            filter,
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(SlotState::default()),
        }
    }

    pub(crate) fn filter(&self) -> &EventFilter {
        &self.filter
    }

    pub(crate) fn server_id(&self) -> Option<u64> {
        self.state.lock().server_id
    }

    pub(crate) fn is_established(&self) -> bool {
        self.state.lock().established
    }

    pub(crate) fn is_retired(&self) -> bool {
        self.state.lock().retired
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.state.lock().handlers.len()
    }

    pub(crate) fn push_handler(&self, handler: EventHandler) {
        self.state.lock().handlers.push(handler);
    }

    /// Remove one occurrence of `handler` (the most recently added one).
    pub(crate) fn remove_handler(&self, handler: &EventHandler) -> bool {
        let mut state = self.state.lock();
        match state.handlers.iter().rposition(|h| same_handler(h, handler)) {
            Some(index) => {
                state.handlers.remove(index);
                true
            }
            None => false,
        }
    }

    pub(crate) fn mark_established(&self) {
        self.state.lock().established = true;
    }

    fn handlers(&self) -> Vec<EventHandler> {
        self.state.lock().handlers.clone()
    }
}

#[derive(Default)]
struct Index {
    by_filter: HashMap<EventFilter, Arc<Slot>>,
    by_server_id: HashMap<u64, Arc<Slot>>,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    index: Mutex<Index>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, filter: &EventFilter) -> Option<Arc<Slot>> {
        self.index.lock().by_filter.get(filter).cloned()
    }

    pub(crate) fn get_or_insert(&self, filter: &EventFilter) -> Arc<Slot> {
        let mut index = self.index.lock();
        Arc::clone(
            index
                .by_filter
                .entry(filter.clone())
                .or_insert_with(|| Arc::new(Slot::new(filter.clone()))),
        )
    }

    /// Route events for `server_id` to `slot`, replacing any previous binding of the slot.
    pub(crate) fn bind(&self, slot: &Arc<Slot>, server_id: u64) {
        let mut index = self.index.lock();
        let mut state = slot.state.lock();
        if state.retired {
            return;
        }
        if let Some(previous) = state.server_id.replace(server_id) {
            index.by_server_id.remove(&previous);
        }
        index.by_server_id.insert(server_id, Arc::clone(slot));
    }

    pub(crate) fn unbind(&self, slot: &Arc<Slot>) {
        let mut index = self.index.lock();
        if let Some(previous) = slot.state.lock().server_id.take() {
            index.by_server_id.remove(&previous);
        }
    }

    /// Remove the slot entirely. Later holders observe `is_retired`.
    pub(crate) fn retire(&self, slot: &Arc<Slot>) {
        let mut index = self.index.lock();
        let mut state = slot.state.lock();
        state.retired = true;
        if let Some(previous) = state.server_id.take() {
            index.by_server_id.remove(&previous);
        }
        if index
            .by_filter
            .get(&slot.filter)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            index.by_filter.remove(&slot.filter);
        }
    }

    /// Snapshot of the handlers routed from `server_id`, in registration order.
    pub fn handlers_for(&self, server_id: u64) -> Option<Vec<EventHandler>> {
        let slot = self.index.lock().by_server_id.get(&server_id).cloned()?;
        Some(slot.handlers())
    }

    /// Every filter the hub acknowledged at least once, for restoration after reconnect.
    pub(crate) fn established_slots(&self) -> Vec<Arc<Slot>> {
        self.index
            .lock()
            .by_filter
            .values()
            .filter(|slot| slot.is_established())
            .cloned()
            .collect()
    }

    /// Forget all server ids (the session they belonged to is gone). Filters and handlers
    /// are kept.
    pub fn clear_server_ids(&self) {
        let mut index = self.index.lock();
        index.by_server_id.clear();
        for slot in index.by_filter.values() {
            slot.state.lock().server_id = None;
        }
    }

    /// Number of established subscriptions.
    pub fn len(&self) -> usize {
        self.index
            .lock()
            .by_filter
            .values()
            .filter(|slot| slot.is_established())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handler_count(&self, filter: &EventFilter) -> usize {
        self.get(filter).map_or(0, |slot| slot.handler_count())
    }

    /// Server id currently bound for `filter`.
    pub fn server_id(&self, filter: &EventFilter) -> Option<u64> {
        self.get(filter).and_then(|slot| slot.server_id())
    }
}
