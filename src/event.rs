//! Lifecycle, error and backpressure events.
//!
//! Every event is a `(name path, measurements, metadata)` triple. Sinks receive
//! all events; the [`EventBus`] fans them out to handlers subscribed by name
//! prefix. An event nobody subscribed to is simply dropped.

use crate::metrics;
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// Hierarchical event name, e.g. `["pipeline", "stage", "stop"]`
pub type EventName = &'static [&'static str];

pub const FLOW_START: EventName = &["pipeline", "flow", "start"];
pub const FLOW_STOP: EventName = &["pipeline", "flow", "stop"];
pub const PIPELINE_START: EventName = &["pipeline", "start"];
pub const PIPELINE_COMPLETE: EventName = &["pipeline", "complete"];
pub const STAGE_STOP: EventName = &["pipeline", "stage", "stop"];
pub const STAGE_ERROR: EventName = &["pipeline", "stage", "error"];
pub const BACKPRESSURE: EventName = &["pipeline", "backpressure"];
pub const RUNNER_START: EventName = &["supervisor", "runner", "start"];
pub const RUNNER_EXIT: EventName = &["supervisor", "runner", "exit"];
pub const RUNNER_RESTART: EventName = &["supervisor", "runner", "restart"];

/// A single observability event
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: EventName,
    pub measurements: Map<String, Value>,
    pub metadata: Map<String, Value>,
}

impl Event {
    pub fn new(name: EventName) -> Self {
        Self {
            name,
            measurements: Map::new(),
            metadata: Map::new(),
        }
    }

    /// Add a measurement
    pub fn measure(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.measurements.insert(key.to_string(), value.into());
        self
    }

    /// Add a metadata entry
    pub fn meta(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Whether this event's name starts with `prefix`
    pub fn matches<S: AsRef<str>>(&self, prefix: &[S]) -> bool {
        prefix.len() <= self.name.len()
            && prefix
                .iter()
                .zip(self.name.iter())
                .all(|(p, n)| p.as_ref() == *n)
    }

    /// Read an integral measurement
    pub fn measurement_u64(&self, key: &str) -> Option<u64> {
        self.measurements.get(key).and_then(Value::as_u64)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name.join("."))
    }
}

/// Receiver of pipeline events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Event handler registered on a bus
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifies a bus subscription so it can be removed again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    prefix: Vec<String>,
    handler: Handler,
}

/// Prefix-routed fan-out of events to subscribed handlers
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Subscribe `handler` to every event whose name starts with `prefix`.
    /// An empty prefix receives everything.
    pub fn subscribe<F>(&self, prefix: &[&str], handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Subscription {
            id,
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &Event) {
        // Handlers run outside the lock so they may (un)subscribe.
        let handlers: Vec<Handler> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| event.matches(s.prefix.as_slice()))
            .map(|s| Arc::clone(&s.handler))
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}

static GLOBAL_BUS: OnceLock<Arc<EventBus>> = OnceLock::new();

/// The process-wide event bus pipelines emit to by default.
///
/// The global counter store in [`crate::metrics`] is subscribed as the bus is
/// created.
pub fn global_bus() -> Arc<EventBus> {
    GLOBAL_BUS
        .get_or_init(|| {
            let bus = Arc::new(EventBus::new());
            metrics::attach(&bus);
            bus
        })
        .clone()
}

/// A sink that keeps every event it receives, mostly useful in tests
#[derive(Default)]
pub struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, in emission order
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Recorded events whose name starts with `prefix`
    pub fn named(&self, prefix: &[&str]) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.matches(prefix))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for EventRecorder {
    fn emit(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// Emits events on behalf of one pipeline run, tagging them with the pipeline name
#[derive(Clone)]
pub struct Emitter {
    sink: Arc<dyn EventSink>,
    pipeline: Arc<str>,
}

impl Emitter {
    pub fn new(sink: Arc<dyn EventSink>, pipeline: impl Into<Arc<str>>) -> Self {
        Self {
            sink,
            pipeline: pipeline.into(),
        }
    }

    /// Emit `event`, tagged with the pipeline name
    pub fn emit(&self, event: Event) {
        let event = event.meta("pipeline", self.pipeline.as_ref());
        self.sink.emit(&event);
    }

    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_prefix_matching() {
        let event = Event::new(STAGE_STOP);
        assert!(event.matches(&["pipeline"]));
        assert!(event.matches(&["pipeline", "stage"]));
        assert!(event.matches::<&str>(&[]));
        assert!(!event.matches(&["pipeline", "flow"]));
        assert!(!event.matches(&["pipeline", "stage", "stop", "extra"]));
    }

    #[test]
    fn test_bus_routes_by_prefix() {
        let bus = EventBus::new();
        let stage_events = Arc::new(AtomicUsize::new(0));
        let all_events = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&stage_events);
        bus.subscribe(&["pipeline", "stage"], move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });
        let counter = Arc::clone(&all_events);
        bus.subscribe(&["pipeline"], move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(&Event::new(STAGE_STOP));
        bus.emit(&Event::new(PIPELINE_START));
        bus.emit(&Event::new(RUNNER_START));

        assert_eq!(stage_events.load(Ordering::Relaxed), 1);
        assert_eq!(all_events.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(&["pipeline"], |_| {});
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        // Unobserved events are not an error
        bus.emit(&Event::new(PIPELINE_START));
    }

    #[test]
    fn test_emitter_tags_pipeline() {
        let recorder = Arc::new(EventRecorder::new());
        let emitter = Emitter::new(recorder.clone(), "orders");
        emitter.emit(Event::new(BACKPRESSURE).measure("buffer_size", 4));

        let events = recorder.named(&["pipeline", "backpressure"]);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].measurement_u64("buffer_size"), Some(4));
        assert_eq!(events[0].metadata["pipeline"], "orders");
    }

    #[test]
    fn test_global_bus_is_shared() {
        assert!(Arc::ptr_eq(&global_bus(), &global_bus()));
    }
}
