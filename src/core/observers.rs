//! Observer registry for pipeline events.
//!
//! Observers subscribe to every event or to a single [`EventKind`]. Each
//! call is isolated: a panicking observer is logged and the remaining
//! observers (and the pipeline) carry on.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::batch::panic_message;
use crate::domain::{EventKind, StageEvent};

/// Event callback
pub type ObserverFn = Arc<dyn Fn(&StageEvent) + Send + Sync>;

/// Handle returned by registration, used to unregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Registration {
    id: ObserverId,
    kind: Option<EventKind>,
    observer: ObserverFn,
}

/// Registered observers
#[derive(Default)]
pub struct Observers {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, kind: Option<EventKind>, observer: ObserverFn) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.write().push(Registration { id, kind, observer });
        id
    }

    /// Observe every event
    pub fn register(&self, observer: ObserverFn) -> ObserverId {
        self.add(None, observer)
    }

    /// Observe only events of `kind`
    pub fn register_for(&self, kind: EventKind, observer: ObserverFn) -> ObserverId {
        self.add(Some(kind), observer)
    }

    pub fn unregister(&self, id: ObserverId) -> bool {
        let mut registrations = self.registrations.write();
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub fn len(&self) -> usize {
        self.registrations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every matching observer
    pub fn notify(&self, event: &StageEvent) {
        // Snapshot so observers may register or unregister from a callback
        let targets: Vec<(ObserverId, ObserverFn)> = self
            .registrations
            .read()
            .iter()
            .filter(|r| r.kind.map_or(true, |k| k == event.kind))
            .map(|r| (r.id, Arc::clone(&r.observer)))
            .collect();

        for (id, observer) in targets {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| observer(event))) {
                error!(
                    observer = id.0,
                    kind = ?event.kind,
                    error = %panic_message(panic.as_ref()),
                    "Observer panicked"
                );
            }
        }
    }
}

/// Observer that mirrors events into the tracing log
pub fn logging_observer() -> ObserverFn {
    Arc::new(|event: &StageEvent| match event.kind {
        EventKind::Error => warn!(run_id = %event.run_id, stage = %event.stage, payload = %event.payload, "Pipeline error"),
        EventKind::Warning => warn!(run_id = %event.run_id, stage = %event.stage, payload = %event.payload, "Pipeline warning"),
        EventKind::Started | EventKind::Completed => {
            info!(run_id = %event.run_id, kind = ?event.kind, "Pipeline {:?}", event.kind)
        }
        _ => debug!(run_id = %event.run_id, seq = event.seq, kind = ?event.kind, stage = %event.stage, "Pipeline event"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Stage;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn event(kind: EventKind) -> StageEvent {
        StageEvent::new(0, Uuid::new_v4(), kind, Stage::Detect, json!({}))
    }

    fn counter() -> (Arc<AtomicUsize>, ObserverFn) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = Arc::clone(&count);
        (count, Arc::new(move |_: &StageEvent| {
            inner.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_kind_filter() {
        let observers = Observers::new();
        let (all, all_fn) = counter();
        let (warnings, warnings_fn) = counter();
        observers.register(all_fn);
        observers.register_for(EventKind::Warning, warnings_fn);

        observers.notify(&event(EventKind::Started));
        observers.notify(&event(EventKind::Warning));

        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let observers = Observers::new();
        observers.register(Arc::new(|_: &StageEvent| panic!("bad observer")));
        let (count, count_fn) = counter();
        observers.register(count_fn);

        observers.notify(&event(EventKind::Started));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister() {
        let observers = Observers::new();
        let (count, count_fn) = counter();
        let id = observers.register(count_fn);

        assert!(observers.unregister(id));
        assert!(!observers.unregister(id));
        observers.notify(&event(EventKind::Started));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(observers.is_empty());
    }
}
