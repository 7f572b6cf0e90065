//! Event dispatch pipeline: the read loop enqueues, a separate loop invokes handlers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::codec::HubEvent;
use crate::ws::subscriptions::SubscriptionRegistry;

/// Producer side of the bounded event queue. Never blocks the read loop.
pub(crate) struct EventQueue {
    tx: mpsc::Sender<HubEvent>,
    dropped: Arc<AtomicU64>,
}

pub(crate) fn event_queue(
    capacity: usize,
    dropped: Arc<AtomicU64>,
) -> (EventQueue, mpsc::Receiver<HubEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventQueue { tx, dropped }, rx)
}

impl EventQueue {
    /// Enqueue `event`, dropping it when the queue is full.
    pub(crate) fn push(&self, event: HubEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    subscription = event.subscription_id,
                    dropped_total = dropped,
                    "event queue full; dropping newest event"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

/// Invoke every handler routed from the event's subscription id, in registration order.
///
/// A panicking handler is logged and does not prevent later handlers from running.
pub(crate) fn dispatch_event(registry: &SubscriptionRegistry, event: &HubEvent) -> usize {
    let Some(handlers) = registry.handlers_for(event.subscription_id) else {
        debug!(
            subscription = event.subscription_id,
            "event for unknown subscription; dropped"
        );
        return 0;
    };
    for handler in &handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
            error!(
                subscription = event.subscription_id,
                event_type = event.event_type().unwrap_or("?"),
                "event handler panicked"
            );
        }
    }
    handlers.len()
}

/// Drain the queue until the session shuts down. Queued events are discarded on shutdown.
pub(crate) async fn run_dispatch_loop(
    mut rx: mpsc::Receiver<HubEvent>,
    registry: Arc<SubscriptionRegistry>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Some(event) => {
                dispatch_event(&registry, &event);
            }
            None => break,
        }
    }
    debug!("event dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use sonic_rs::Value;

    use super::*;
    use crate::ws::subscriptions::{EventFilter, event_handler};

    fn event(subscription_id: u64) -> HubEvent {
        HubEvent {
            subscription_id,
            payload: Value::default(),
        }
    }

    fn registry_with(id: u64, handlers: Vec<crate::ws::subscriptions::EventHandler>) -> Arc<SubscriptionRegistry> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let slot = registry.get_or_insert(&EventFilter::Any);
        registry.bind(&slot, id);
        slot.mark_established();
        for handler in handlers {
            slot.push_handler(handler);
        }
        registry
    }

    #[test]
    fn full_queue_drops_newest_and_counts() {
        let dropped = Arc::new(AtomicU64::new(0));
        let (queue, mut rx) = event_queue(2, Arc::clone(&dropped));
        assert!(queue.push(event(1)));
        assert!(queue.push(event(2)));
        assert!(!queue.push(event(3)));
        assert_eq!(dropped.load(Ordering::Relaxed), 1);

        assert_eq!(rx.try_recv().expect("first").subscription_id, 1);
        assert_eq!(rx.try_recv().expect("second").subscription_id, 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let handlers = (0..3)
            .map(|i| {
                let order = Arc::clone(&order);
                event_handler(move |_| order.lock().push(i))
            })
            .collect();
        let registry = registry_with(5, handlers);

        assert_eq!(dispatch_event(&registry, &event(5)), 3);
        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(dispatch_event(&registry, &event(6)), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = registry_with(
            1,
            vec![
                event_handler(|_| panic!("handler bug")),
                event_handler(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            ],
        );
        dispatch_event(&registry, &event(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dispatch_loop_drains_until_shutdown() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = registry_with(
            9,
            vec![event_handler(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })],
        );
        let (queue, rx) = event_queue(16, Arc::new(AtomicU64::new(0)));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_dispatch_loop(rx, registry, shutdown.clone()));

        for _ in 0..4 {
            queue.push(event(9));
        }
        while calls.load(Ordering::SeqCst) < 4 {
            tokio::task::yield_now().await;
        }
        shutdown.cancel();
        task.await.expect("dispatch loop");
    }
}
