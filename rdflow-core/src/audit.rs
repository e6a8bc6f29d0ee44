use crate::bus::EventBus;
use crate::error::EngineError;
use crate::events::ExecutionEvent;
use crate::scheduler::Clock;
use crate::store::GraphStore;
use crate::types::AuditEntry;
use crate::vocab::{class, pred, Vocab};
use chrono::{DateTime, Utc};
use oxigraph::model::vocab::{rdf, xsd};
use oxigraph::model::{Literal, NamedNode, Term};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Append-only audit trail (C10). Subscribes globally to the bus and records
/// one entry per event: instance, event type, node, wall timestamp plus a
/// per-instance monotonic sequence, serialized detail map, and user.
pub struct AuditService {
    store: Arc<dyn GraphStore>,
    vocab: Arc<Vocab>,
    clock: Arc<dyn Clock>,
    seqs: Mutex<HashMap<String, u64>>,
}

impl AuditService {
    pub fn new(store: Arc<dyn GraphStore>, vocab: Arc<Vocab>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            vocab,
            clock,
            seqs: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe this service to every event on the bus.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let audit = self.clone();
        bus.subscribe_all("audit-log", move |event| audit.record(event));
    }

    fn next_seq(&self, instance: &NamedNode) -> u64 {
        let mut seqs = self.seqs.lock().expect("audit lock poisoned");
        let seq = seqs.entry(instance.as_str().to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    /// Record one event. Events without an owning instance are skipped.
    pub fn record(&self, event: &ExecutionEvent) -> Result<(), EngineError> {
        let Some(instance) = event.instance().cloned() else {
            return Ok(());
        };
        // The generic AuditLog wrapper carries its own event type and user.
        let (event_type, user) = match event {
            ExecutionEvent::AuditLog {
                event_type, user, ..
            } => (event_type.clone(), user.clone()),
            other => (other.kind().as_str().to_string(), None),
        };

        let entry = self.vocab.mint("audit");
        let v = &self.vocab;
        let seq = self.next_seq(&instance);

        self.store.add(
            &entry,
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(v.class(class::AUDIT_ENTRY)),
        )?;
        self.store
            .add(&entry, &v.prop(pred::INSTANCE), &Term::NamedNode(instance))?;
        self.store.add(
            &entry,
            &v.prop(pred::SEQ),
            &Term::Literal(Literal::new_typed_literal(seq.to_string(), xsd::INTEGER)),
        )?;
        self.store.add(
            &entry,
            &v.prop(pred::EVENT_TYPE),
            &Term::Literal(Literal::new_simple_literal(&event_type)),
        )?;
        if let Some(node) = event.node() {
            self.store
                .add(&entry, &v.prop(pred::NODE), &Term::NamedNode(node.clone()))?;
        }
        self.store.add(
            &entry,
            &v.prop(pred::AT_TIME),
            &Term::Literal(Literal::new_typed_literal(
                self.clock.now().to_rfc3339(),
                xsd::DATE_TIME,
            )),
        )?;
        self.store.add(
            &entry,
            &v.prop(pred::DETAILS),
            &Term::Literal(Literal::new_simple_literal(event.details().to_string())),
        )?;
        if let Some(user) = user {
            self.store.add(
                &entry,
                &v.prop(pred::USER),
                &Term::Literal(Literal::new_simple_literal(&user)),
            )?;
        }
        Ok(())
    }

    /// The full trail for an instance, ordered by sequence.
    pub fn entries_for(&self, instance: &NamedNode) -> Result<Vec<AuditEntry>, EngineError> {
        let v = &self.vocab;
        let mut entries = Vec::new();
        for entry in self
            .store
            .subjects_with(&v.prop(pred::INSTANCE), &Term::NamedNode(instance.clone()))?
        {
            let is_entry = self
                .store
                .value_node(&entry, &rdf::TYPE.into_owned())?
                .is_some_and(|t| t == v.class(class::AUDIT_ENTRY));
            if !is_entry {
                continue;
            }
            let seq = self
                .store
                .value_str(&entry, &v.prop(pred::SEQ))?
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let event_type = self
                .store
                .value_str(&entry, &v.prop(pred::EVENT_TYPE))?
                .unwrap_or_default();
            let at = self
                .store
                .value_str(&entry, &v.prop(pred::AT_TIME))?
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|| DateTime::<Utc>::MIN_UTC);
            let details = self
                .store
                .value_str(&entry, &v.prop(pred::DETAILS))?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null);
            entries.push(AuditEntry {
                uri: entry.clone(),
                instance: instance.clone(),
                seq,
                event_type,
                node: self.store.value_node(&entry, &v.prop(pred::NODE))?,
                at,
                details,
                user: self.store.value_str(&entry, &v.prop(pred::USER))?,
            });
        }
        entries.sort_by_key(|e| e.seq);
        Ok(entries)
    }

    /// Event types in trail order. Convenience for assertions and demos.
    pub fn event_types_for(&self, instance: &NamedNode) -> Result<Vec<String>, EngineError> {
        Ok(self
            .entries_for(instance)?
            .into_iter()
            .map(|e| e.event_type)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SystemClock;
    use crate::store::OxiGraphStore;
    use crate::types::{InstanceState, VariableValue};

    fn setup() -> (Arc<EventBus>, Arc<AuditService>, NamedNode) {
        let store: Arc<OxiGraphStore> = Arc::new(OxiGraphStore::new().unwrap());
        let bus = Arc::new(EventBus::new());
        let audit = Arc::new(AuditService::new(
            store,
            Arc::new(Vocab::default()),
            Arc::new(SystemClock),
        ));
        audit.attach(&bus);
        let instance = NamedNode::new_unchecked("http://rdflow.dev/instance/1");
        (bus, audit, instance)
    }

    #[test]
    fn test_records_everything_in_order() {
        let (bus, audit, instance) = setup();

        bus.publish(&ExecutionEvent::InstanceStateChanged {
            instance: instance.clone(),
            old_state: None,
            new_state: InstanceState::Active,
            reason: None,
        })
        .unwrap();
        bus.publish(&ExecutionEvent::VariableSet {
            instance: instance.clone(),
            name: "x".to_string(),
            value: VariableValue::Integer(1),
            scope_token: None,
            loop_index: None,
        })
        .unwrap();

        let entries = audit.entries_for(&instance).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].event_type, "InstanceStateChanged");
        assert_eq!(entries[1].seq, 2);
        assert_eq!(entries[1].event_type, "VariableSet");
        assert_eq!(entries[1].details["name"], "x");
        assert!(entries[0].at <= entries[1].at);
    }

    #[test]
    fn test_audit_log_wrapper_keeps_its_own_type_and_user() {
        let (bus, audit, instance) = setup();
        bus.publish(&ExecutionEvent::AuditLog {
            instance: instance.clone(),
            event_type: "nodeEntered".to_string(),
            node: Some(NamedNode::new_unchecked("http://rdflow.dev/node/p/t")),
            details: serde_json::json!({"token": "t-1"}),
            user: Some("alice".to_string()),
        })
        .unwrap();

        let entries = audit.entries_for(&instance).unwrap();
        assert_eq!(entries[0].event_type, "nodeEntered");
        assert_eq!(entries[0].user.as_deref(), Some("alice"));
        assert!(entries[0].node.is_some());
    }

    #[test]
    fn test_events_without_instance_are_skipped() {
        let (bus, audit, instance) = setup();
        bus.publish(&ExecutionEvent::MessageSent {
            name: "ping".to_string(),
            correlation_key: None,
            payload: Default::default(),
            source_instance: None,
            source_node: None,
        })
        .unwrap();
        assert!(audit.entries_for(&instance).unwrap().is_empty());
    }
}
