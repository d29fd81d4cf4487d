//! Publish/subscribe plumbing
//!
//! [`EventHub`] is a synchronous, thread-safe event source. The hub stores
//! listeners as weak references; the strong reference lives in the
//! [`Subscription`] guard handed back to the subscriber, so dropping the guard
//! is all it takes to unsubscribe. Dead entries are pruned on the next emit.
//!
//! Listeners are always invoked with no hub lock held, so a listener may
//! subscribe, unsubscribe or emit on the same hub.

use crate::instance::Instance;
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::{Arc, Weak};

type ListenerArc<E> = Arc<dyn Fn(&E) + Send + Sync>;
type ListenerWeak<E> = Weak<dyn Fn(&E) + Send + Sync>;

pub struct EventHub<E> {
    listeners: Arc<Mutex<Vec<ListenerWeak<E>>>>,
}

// Manual Clone: handles share one listener list.
impl<E> Clone for EventHub<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<E> Default for EventHub<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E> std::fmt::Debug for EventHub<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl<E: 'static> EventHub<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let strong: ListenerArc<E> = Arc::new(listener);
        self.listeners.lock().push(Arc::downgrade(&strong));
        Subscription {
            _guard: Some(Box::new(strong)),
        }
    }

    /// Deliver `event` to every live listener in registration order.
    pub fn emit(&self, event: &E) {
        let live: Vec<ListenerArc<E>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener(event);
        }
    }

    /// Live listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .iter()
            .filter(|l| l.strong_count() > 0)
            .count()
    }
}

/// Guard keeping a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    _guard: Option<Box<dyn Any + Send + Sync>>,
}

impl Subscription {
    /// A guard that owns nothing.
    pub fn empty() -> Self {
        Self { _guard: None }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

// ============================================================================
// Model lifecycle events
// ============================================================================

#[derive(Clone)]
pub enum ModelEvent {
    Created(Arc<Instance>),
    Updated(Arc<Instance>),
    Destroyed(Arc<Instance>),
    /// The instance lost the relation that kept it alive on the backend.
    Orphaned(Arc<Instance>),
}

impl ModelEvent {
    pub fn instance(&self) -> &Arc<Instance> {
        match self {
            Self::Created(i) | Self::Updated(i) | Self::Destroyed(i) | Self::Orphaned(i) => i,
        }
    }

    /// `Destroyed` or `Orphaned`.
    pub const fn is_removal(&self) -> bool {
        matches!(self, Self::Destroyed(_) | Self::Orphaned(_))
    }
}

impl std::fmt::Debug for ModelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Created(_) => "Created",
            Self::Updated(_) => "Updated",
            Self::Destroyed(_) => "Destroyed",
            Self::Orphaned(_) => "Orphaned",
        };
        write!(f, "{kind}({})", self.instance().key())
    }
}

/// One lifecycle hub per model type.
#[derive(Debug, Default)]
pub struct ModelEvents {
    hubs: RwLock<AHashMap<String, EventHub<ModelEvent>>>,
}

impl ModelEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self, model: &str) -> EventHub<ModelEvent> {
        if let Some(hub) = self.hubs.read().get(model) {
            return hub.clone();
        }
        self.hubs
            .write()
            .entry(model.to_string())
            .or_default()
            .clone()
    }

    pub fn subscribe(
        &self,
        model: &str,
        listener: impl Fn(&ModelEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.hub(model).subscribe(listener)
    }

    pub fn emit(&self, event: ModelEvent) {
        let hub = self.hubs.read().get(event.instance().model()).cloned();
        if let Some(hub) = hub {
            tracing::trace!(event = ?event, "model event");
            hub.emit(&event);
        }
    }

    pub fn created(&self, instance: &Arc<Instance>) {
        self.emit(ModelEvent::Created(Arc::clone(instance)));
    }

    pub fn updated(&self, instance: &Arc<Instance>) {
        self.emit(ModelEvent::Updated(Arc::clone(instance)));
    }

    pub fn destroyed(&self, instance: &Arc<Instance>) {
        self.emit(ModelEvent::Destroyed(Arc::clone(instance)));
    }

    pub fn orphaned(&self, instance: &Arc<Instance>) {
        self.emit(ModelEvent::Orphaned(Arc::clone(instance)));
    }

    pub fn listener_count(&self, model: &str) -> usize {
        self.hubs
            .read()
            .get(model)
            .map_or(0, EventHub::listener_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dropping_subscription_unsubscribes() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let sub = hub.subscribe(move |v| {
            counter.fetch_add(*v as usize, Ordering::SeqCst);
        });

        hub.emit(&2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(hub.listener_count(), 1);

        drop(sub);
        hub.emit(&5);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(hub.listener_count(), 0);
    }

    #[test]
    fn listener_may_subscribe_during_emit() {
        let hub = EventHub::<()>::new();
        let inner_hub = hub.clone();
        let extra = Arc::new(Mutex::new(Vec::new()));
        let keep = Arc::clone(&extra);
        let _sub = hub.subscribe(move |_| {
            keep.lock().push(inner_hub.subscribe(|_| {}));
        });

        hub.emit(&());
        assert_eq!(extra.lock().len(), 1);
        assert_eq!(hub.listener_count(), 2);
    }

    #[test]
    fn model_events_are_routed_by_type() {
        use crate::instance::InstanceKey;

        let events = ModelEvents::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = events.subscribe("Audit", move |event| {
            assert!(!event.is_removal());
            counter.fetch_add(1, Ordering::SeqCst);
        });

        events.created(&Arc::new(Instance::stub(InstanceKey::new("Audit", 1))));
        events.created(&Arc::new(Instance::stub(InstanceKey::new("Issue", 1))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(events.listener_count("Audit"), 1);
        assert_eq!(events.listener_count("Issue"), 0);
    }
}
