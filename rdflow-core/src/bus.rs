use crate::error::EngineError;
use crate::events::{EventKind, ExecutionEvent};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

pub type EventHandler = Arc<dyn Fn(&ExecutionEvent) -> Result<(), EngineError> + Send + Sync>;

struct Subscription {
    name: String,
    handler: EventHandler,
}

/// Synchronous, typed publish/subscribe over execution events (C5).
///
/// Delivery contract: global subscribers run before kind-specific ones, each
/// list in subscription order. A handler error aborts the publish and
/// propagates to the caller; no later subscriber runs and nothing is rolled
/// back. Handlers may publish further events; nested publishes complete
/// before the outer one returns.
///
/// Handler identity is the subscription name: subscribing the same name to
/// the same kind again is a no-op.
#[derive(Default)]
pub struct EventBus {
    global: RwLock<Vec<Subscription>>,
    by_kind: RwLock<HashMap<EventKind, Vec<Subscription>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        name: impl Into<String>,
        handler: impl Fn(&ExecutionEvent) -> Result<(), EngineError> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let mut map = self.by_kind.write().expect("bus lock poisoned");
        let list = map.entry(kind).or_default();
        if list.iter().any(|s| s.name == name) {
            return;
        }
        debug!(subscriber = %name, kind = kind.as_str(), "subscribed");
        list.push(Subscription {
            name,
            handler: Arc::new(handler),
        });
    }

    /// Subscribe to every event kind. Used by the audit log and by metrics
    /// or debugging hooks.
    pub fn subscribe_all(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&ExecutionEvent) -> Result<(), EngineError> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let mut list = self.global.write().expect("bus lock poisoned");
        if list.iter().any(|s| s.name == name) {
            return;
        }
        debug!(subscriber = %name, "subscribed to all events");
        list.push(Subscription {
            name,
            handler: Arc::new(handler),
        });
    }

    /// Returns true if a subscription with that name existed.
    pub fn unsubscribe(&self, kind: EventKind, name: &str) -> bool {
        let mut map = self.by_kind.write().expect("bus lock poisoned");
        if let Some(list) = map.get_mut(&kind) {
            let before = list.len();
            list.retain(|s| s.name != name);
            return list.len() != before;
        }
        false
    }

    pub fn unsubscribe_all(&self, name: &str) -> bool {
        let mut list = self.global.write().expect("bus lock poisoned");
        let before = list.len();
        list.retain(|s| s.name != name);
        list.len() != before
    }

    pub fn has_subscribers(&self, kind: EventKind) -> bool {
        if !self.global.read().expect("bus lock poisoned").is_empty() {
            return true;
        }
        self.by_kind
            .read()
            .expect("bus lock poisoned")
            .get(&kind)
            .is_some_and(|l| !l.is_empty())
    }

    /// Subscriber count for one kind (including globals), or the total when
    /// `kind` is `None`.
    pub fn subscriber_count(&self, kind: Option<EventKind>) -> usize {
        let globals = self.global.read().expect("bus lock poisoned").len();
        let map = self.by_kind.read().expect("bus lock poisoned");
        match kind {
            Some(k) => globals + map.get(&k).map_or(0, |l| l.len()),
            None => globals + map.values().map(|l| l.len()).sum::<usize>(),
        }
    }

    /// Remove all subscribers. Test/reset hook.
    pub fn clear(&self) {
        self.global.write().expect("bus lock poisoned").clear();
        self.by_kind.write().expect("bus lock poisoned").clear();
    }

    /// Deliver an event synchronously. The handler list is snapshotted
    /// before delivery, so handlers may subscribe or publish re-entrantly
    /// without deadlocking; such changes affect the next publish.
    pub fn publish(&self, event: &ExecutionEvent) -> Result<(), EngineError> {
        let kind = event.kind();
        debug!(kind = kind.as_str(), "publishing event");

        let handlers: Vec<(String, EventHandler)> = {
            let global = self.global.read().expect("bus lock poisoned");
            let map = self.by_kind.read().expect("bus lock poisoned");
            global
                .iter()
                .chain(map.get(&kind).into_iter().flatten())
                .map(|s| (s.name.clone(), s.handler.clone()))
                .collect()
        };

        for (name, handler) in handlers {
            handler(event).map_err(|e| EngineError::Subscriber {
                name,
                source: Box::new(e),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxigraph::model::NamedNode;
    use std::sync::Mutex;

    fn node(iri: &str) -> NamedNode {
        NamedNode::new_unchecked(iri)
    }

    fn token_moved() -> ExecutionEvent {
        ExecutionEvent::TokenMoved {
            token: node("http://ex.org/token/1"),
            targets: vec![node("http://ex.org/node/2")],
            instance: node("http://ex.org/instance/1"),
            consume_original: true,
        }
    }

    fn token_consumed() -> ExecutionEvent {
        ExecutionEvent::TokenConsumed {
            token: node("http://ex.org/token/1"),
            instance: node("http://ex.org/instance/1"),
        }
    }

    #[test]
    fn test_subscribe_and_publish() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        bus.subscribe(EventKind::TokenMoved, "collector", move |e| {
            log.lock().unwrap().push(e.kind());
            Ok(())
        });

        bus.publish(&token_moved()).unwrap();
        bus.publish(&token_consumed()).unwrap();

        assert_eq!(&*seen.lock().unwrap(), &[EventKind::TokenMoved]);
    }

    #[test]
    fn test_global_subscribers_run_first_in_subscription_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for name in ["global-1", "global-2"] {
            let order = order.clone();
            bus.subscribe_all(name, move |_| {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        let typed_order = order.clone();
        bus.subscribe(EventKind::TokenMoved, "typed", move |_| {
            typed_order.lock().unwrap().push("typed");
            Ok(())
        });

        bus.publish(&token_moved()).unwrap();
        assert_eq!(&*order.lock().unwrap(), &["global-1", "global-2", "typed"]);
    }

    #[test]
    fn test_duplicate_subscription_is_noop() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe(EventKind::TokenMoved, "dup", move |_| {
                *count.lock().unwrap() += 1;
                Ok(())
            });
        }
        bus.publish(&token_moved()).unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
        assert_eq!(bus.subscriber_count(Some(EventKind::TokenMoved)), 1);
    }

    #[test]
    fn test_error_aborts_publish_and_propagates() {
        let bus = EventBus::new();
        let reached = Arc::new(Mutex::new(false));

        bus.subscribe(EventKind::TokenMoved, "failing", |_| {
            Err(EngineError::Value("boom".to_string()))
        });
        let reached_flag = reached.clone();
        bus.subscribe(EventKind::TokenMoved, "after", move |_| {
            *reached_flag.lock().unwrap() = true;
            Ok(())
        });

        let err = bus.publish(&token_moved()).unwrap_err();
        assert!(matches!(err, EngineError::Subscriber { ref name, .. } if name == "failing"));
        assert!(!*reached.lock().unwrap());
    }

    #[test]
    fn test_reentrant_publish_completes_before_outer_returns() {
        let bus = Arc::new(EventBus::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let inner_order = order.clone();
        bus.subscribe(EventKind::TokenConsumed, "inner", move |_| {
            inner_order.lock().unwrap().push("inner");
            Ok(())
        });

        let reentrant_bus = bus.clone();
        let outer_order = order.clone();
        bus.subscribe(EventKind::TokenMoved, "outer", move |_| {
            outer_order.lock().unwrap().push("outer-before");
            reentrant_bus.publish(&token_consumed())?;
            outer_order.lock().unwrap().push("outer-after");
            Ok(())
        });

        bus.publish(&token_moved()).unwrap();
        assert_eq!(
            &*order.lock().unwrap(),
            &["outer-before", "inner", "outer-after"]
        );
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();
        bus.subscribe(EventKind::TokenMoved, "c", move |_| {
            *counter.lock().unwrap() += 1;
            Ok(())
        });

        bus.publish(&token_moved()).unwrap();
        assert!(bus.unsubscribe(EventKind::TokenMoved, "c"));
        assert!(!bus.unsubscribe(EventKind::TokenMoved, "c"));
        bus.publish(&token_moved()).unwrap();

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_has_subscribers_and_clear() {
        let bus = EventBus::new();
        assert!(!bus.has_subscribers(EventKind::TokenMoved));
        bus.subscribe_all("any", |_| Ok(()));
        assert!(bus.has_subscribers(EventKind::TokenMoved));
        bus.clear();
        assert!(!bus.has_subscribers(EventKind::TokenMoved));
        assert_eq!(bus.subscriber_count(None), 0);
    }
}
