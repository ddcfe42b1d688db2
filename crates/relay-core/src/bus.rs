//! Process-wide publish/subscribe registry.
//!
//! `publish` fans an event out synchronously to every subscriber registered
//! at call time. The subscriber list is snapshotted before dispatch, so
//! callbacks may subscribe or unsubscribe (themselves or others) without
//! deadlocking, and registrations made during a fan-out only see later
//! events. Each dispatch is isolated: a panicking callback is logged and
//! the remaining subscribers still receive the event.
//!
//! Each subscriber carries a dispatch gate. Publishers hold it shared while
//! they check the subscriber is active and run its callback; `unsubscribe`
//! takes it exclusively, so once it returns no callback for that
//! registration is running or can start. A callback that unsubscribes a
//! registration already being dispatched on its own thread (itself, or an
//! outer publish further up the stack) only clears the flag; the running
//! callback finishes and nothing new starts.
//!
//! Callbacks run on the publisher's thread and must not block. Connection
//! handlers enqueue onto their own outbound channel and return immediately.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use metrics::counter;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::events::Event;
use crate::ids::SubscriptionId;

type Callback = dyn Fn(&Event) + Send + Sync;

thread_local! {
    /// Subscribers whose callback is running on this thread, innermost last.
    static DISPATCHING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

struct Subscriber {
    id: SubscriptionId,
    /// Cleared under the exclusive gate so no callback starts after `unsubscribe` returns.
    active: AtomicBool,
    gate: RwLock<()>,
    callback: Box<Callback>,
}

impl Subscriber {
    fn key(&self) -> usize {
        self as *const Self as usize
    }

    fn dispatching_here(&self) -> bool {
        let key = self.key();
        DISPATCHING.with(|stack| stack.borrow().contains(&key))
    }
}

/// Marks a subscriber as running on the current thread until dropped.
struct DispatchMark;

impl DispatchMark {
    fn enter(subscriber: &Subscriber) -> Self {
        DISPATCHING.with(|stack| stack.borrow_mut().push(subscriber.key()));
        Self
    }
}

impl Drop for DispatchMark {
    fn drop(&mut self) {
        DISPATCHING.with(|stack| {
            let _ = stack.borrow_mut().pop();
        });
    }
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
}

impl BusInner {
    fn remove(&self, id: &SubscriptionId) {
        self.subscribers.write().retain(|s| s.id != *id);
    }
}

/// In-memory event bus. Cloning yields another handle to the same registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a callback. Dropping the returned handle unsubscribes it.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(Subscriber {
            id: SubscriptionId::new(),
            active: AtomicBool::new(true),
            gate: RwLock::new(()),
            callback: Box::new(callback),
        });
        self.inner.subscribers.write().push(Arc::clone(&subscriber));
        debug!(subscription_id = %subscriber.id, "subscriber registered");

        Subscription {
            bus: Arc::downgrade(&self.inner),
            subscriber,
        }
    }

    /// Deliver `event` to every active subscriber, in registration order.
    ///
    /// Returns the number of callbacks that completed without panicking.
    pub fn publish(&self, event: &Event) -> usize {
        let snapshot: Vec<Arc<Subscriber>> = self.inner.subscribers.read().clone();
        let mut delivered = 0;

        for subscriber in &snapshot {
            // Recursive so a nested publish on this thread cannot queue behind
            // a waiting unsubscribe.
            let _gate = subscriber.gate.read_recursive();
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            let _mark = DispatchMark::enter(subscriber);
            match panic::catch_unwind(AssertUnwindSafe(|| (subscriber.callback)(event))) {
                Ok(()) => delivered += 1,
                Err(payload) => {
                    counter!("relay_subscriber_panics_total").increment(1);
                    warn!(
                        subscription_id = %subscriber.id,
                        event_type = %event.event_type,
                        panic = panic_message(payload.as_ref()),
                        "subscriber callback panicked"
                    );
                }
            }
        }

        counter!("relay_events_published_total").increment(1);
        debug!(
            event_type = %event.event_type,
            recipients = snapshot.len(),
            delivered,
            "event published"
        );
        delivered
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle for one bus registration.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    bus: Weak<BusInner>,
    subscriber: Arc<Subscriber>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriptionId {
        &self.subscriber.id
    }

    pub fn is_active(&self) -> bool {
        self.subscriber.active.load(Ordering::Acquire)
    }

    /// Remove the registration. Equivalent to dropping the handle.
    pub fn unsubscribe(self) {
        drop(self);
    }

    fn detach(&self) {
        // Waits out callbacks running on other threads. Taking the gate from
        // inside one of this subscriber's own callbacks would deadlock.
        let _gate = (!self.subscriber.dispatching_here()).then(|| self.subscriber.gate.write());
        if self.subscriber.active.swap(false, Ordering::AcqRel) {
            if let Some(bus) = self.bus.upgrade() {
                bus.remove(&self.subscriber.id);
            }
            debug!(subscription_id = %self.subscriber.id, "subscriber removed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.subscriber.id)
            .field("active", &self.is_active())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
