use crate::bus::EventBus;
use crate::error::EngineError;
use crate::events::ExecutionEvent;
use crate::scheduler::Clock;
use crate::store::GraphStore;
use crate::types::{InstanceState, VariableValue};
use crate::vocab::{class, pred, Vocab};
use chrono::{DateTime, Utc};
use oxigraph::model::vocab::{rdf, xsd};
use oxigraph::model::{Literal, NamedNode, Term};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Instance lifecycle and the per-instance variable namespace (C3).
///
/// Variables are flat per instance, optionally shadowed by token scopes:
/// lookup resolves the innermost scope first by walking the token's parent
/// chain, then falls back to the instance level. Setting a variable replaces
/// any prior binding for the same (instance, name, scope); the live graph
/// keeps no history, the audit log does.
pub struct InstanceService {
    store: Arc<dyn GraphStore>,
    vocab: Arc<Vocab>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl InstanceService {
    pub fn new(
        store: Arc<dyn GraphStore>,
        vocab: Arc<Vocab>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            vocab,
            bus,
            clock,
        }
    }

    fn datetime_term(t: DateTime<Utc>) -> Term {
        Term::Literal(Literal::new_typed_literal(t.to_rfc3339(), xsd::DATE_TIME))
    }

    // ── Lifecycle ──

    pub fn create_instance(
        &self,
        process: &NamedNode,
        initial_variables: &BTreeMap<String, VariableValue>,
        parent_token: Option<&NamedNode>,
    ) -> Result<NamedNode, EngineError> {
        let instance = self.vocab.mint("instance");
        let v = &self.vocab;
        self.store.add(
            &instance,
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(v.class(class::INSTANCE)),
        )?;
        self.store.add(
            &instance,
            &v.prop(pred::PROCESS),
            &Term::NamedNode(process.clone()),
        )?;
        self.store.add(
            &instance,
            &v.prop(pred::STATE),
            &Term::Literal(Literal::new_simple_literal(InstanceState::Active.as_str())),
        )?;
        self.store.add(
            &instance,
            &v.prop(pred::STARTED_AT),
            &Self::datetime_term(self.clock.now()),
        )?;
        if let Some(parent) = parent_token {
            self.store.add(
                &instance,
                &v.prop(pred::PARENT_TOKEN),
                &Term::NamedNode(parent.clone()),
            )?;
        }
        debug!(instance = instance.as_str(), process = process.as_str(), "instance created");

        self.bus.publish(&ExecutionEvent::InstanceStateChanged {
            instance: instance.clone(),
            old_state: None,
            new_state: InstanceState::Active,
            reason: None,
        })?;
        for (name, value) in initial_variables {
            self.set_variable(&instance, name, value.clone(), None)?;
        }
        Ok(instance)
    }

    pub fn state(&self, instance: &NamedNode) -> Result<InstanceState, EngineError> {
        let raw = self
            .store
            .value_str(instance, &self.vocab.prop(pred::STATE))?
            .ok_or_else(|| EngineError::UnknownInstance(instance.as_str().to_string()))?;
        InstanceState::from_str(&raw)
    }

    pub fn set_state(
        &self,
        instance: &NamedNode,
        state: InstanceState,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        let old = self.state(instance)?;
        if old == state {
            return Ok(());
        }
        let v = &self.vocab;
        self.store.set(
            instance,
            &v.prop(pred::STATE),
            &Term::Literal(Literal::new_simple_literal(state.as_str())),
        )?;
        match reason {
            Some(reason) => self.store.set(
                instance,
                &v.prop(pred::STATE_REASON),
                &Term::Literal(Literal::new_simple_literal(reason)),
            )?,
            None => {
                self.store.remove(instance, &v.prop(pred::STATE_REASON), None)?;
            }
        }
        if state.is_terminal() {
            self.store.set(
                instance,
                &v.prop(pred::COMPLETED_AT),
                &Self::datetime_term(self.clock.now()),
            )?;
        }
        debug!(instance = instance.as_str(), from = old.as_str(), to = state.as_str(), "instance state changed");
        self.bus.publish(&ExecutionEvent::InstanceStateChanged {
            instance: instance.clone(),
            old_state: Some(old),
            new_state: state,
            reason: reason.map(str::to_string),
        })
    }

    pub fn process_of(&self, instance: &NamedNode) -> Result<NamedNode, EngineError> {
        self.store
            .value_node(instance, &self.vocab.prop(pred::PROCESS))?
            .ok_or_else(|| EngineError::UnknownInstance(instance.as_str().to_string()))
    }

    pub fn parent_token_of(&self, instance: &NamedNode) -> Result<Option<NamedNode>, EngineError> {
        self.store
            .value_node(instance, &self.vocab.prop(pred::PARENT_TOKEN))
    }

    /// All instances currently in the given state.
    pub fn instances_in_state(
        &self,
        state: InstanceState,
    ) -> Result<Vec<NamedNode>, EngineError> {
        let v = &self.vocab;
        let mut out = Vec::new();
        for subject in self.store.subjects_with(
            &v.prop(pred::STATE),
            &Term::Literal(Literal::new_simple_literal(state.as_str())),
        )? {
            let is_instance = self
                .store
                .value_node(&subject, &rdf::TYPE.into_owned())?
                .is_some_and(|t| t == v.class(class::INSTANCE));
            if is_instance {
                out.push(subject);
            }
        }
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(out)
    }

    // ── Variables ──

    /// Binding nodes for (instance, name), any scope.
    fn bindings_for(
        &self,
        instance: &NamedNode,
        name: &str,
    ) -> Result<Vec<NamedNode>, EngineError> {
        let v = &self.vocab;
        let named = self.store.subjects_with(
            &v.prop(pred::VAR_NAME),
            &Term::Literal(Literal::new_simple_literal(name)),
        )?;
        let mut out = Vec::new();
        for binding in named {
            if self.store.value_node(&binding, &v.prop(pred::INSTANCE))?.as_ref()
                == Some(instance)
            {
                out.push(binding);
            }
        }
        Ok(out)
    }

    fn binding_scope(&self, binding: &NamedNode) -> Result<Option<NamedNode>, EngineError> {
        self.store
            .value_node(binding, &self.vocab.prop(pred::SCOPE_TOKEN))
    }

    fn binding_value(&self, binding: &NamedNode) -> Result<Option<VariableValue>, EngineError> {
        match self
            .store
            .value_literal(binding, &self.vocab.prop(pred::VAR_VALUE))?
        {
            Some(lit) => Ok(Some(VariableValue::from_literal(&lit)?)),
            None => Ok(None),
        }
    }

    /// Resolve a variable: the scope token's own binding wins, then each
    /// ancestor token scope, then the instance level.
    pub fn get_variable(
        &self,
        instance: &NamedNode,
        name: &str,
        scope_token: Option<&NamedNode>,
    ) -> Result<Option<VariableValue>, EngineError> {
        let bindings = self.bindings_for(instance, name)?;
        if bindings.is_empty() {
            return Ok(None);
        }

        let mut scope = scope_token.cloned();
        while let Some(token) = scope {
            for binding in &bindings {
                if self.binding_scope(binding)?.as_ref() == Some(&token) {
                    return self.binding_value(binding);
                }
            }
            scope = self
                .store
                .value_node(&token, &self.vocab.prop(pred::PARENT_TOKEN))?;
        }

        for binding in &bindings {
            if self.binding_scope(binding)?.is_none() {
                return self.binding_value(binding);
            }
        }
        Ok(None)
    }

    /// Set a variable, atomically replacing any prior binding with the same
    /// (instance, name, scope).
    pub fn set_variable(
        &self,
        instance: &NamedNode,
        name: &str,
        value: VariableValue,
        scope_token: Option<&NamedNode>,
    ) -> Result<(), EngineError> {
        let v = &self.vocab;
        for binding in self.bindings_for(instance, name)? {
            let same_scope = match (self.binding_scope(&binding)?, scope_token) {
                (None, None) => true,
                (Some(a), Some(b)) => &a == b,
                _ => false,
            };
            if same_scope {
                self.store.remove_subject(&binding)?;
            }
        }

        let binding = self.vocab.mint("variable");
        self.store.add(
            &binding,
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(v.class(class::VARIABLE_BINDING)),
        )?;
        self.store.add(
            &binding,
            &v.prop(pred::INSTANCE),
            &Term::NamedNode(instance.clone()),
        )?;
        self.store.add(
            &binding,
            &v.prop(pred::VAR_NAME),
            &Term::Literal(Literal::new_simple_literal(name)),
        )?;
        self.store
            .add(&binding, &v.prop(pred::VAR_VALUE), &value.to_term())?;
        if let Some(scope) = scope_token {
            self.store.add(
                &binding,
                &v.prop(pred::SCOPE_TOKEN),
                &Term::NamedNode(scope.clone()),
            )?;
        }

        let loop_index = match scope_token {
            Some(token) => self
                .store
                .value_str(token, &v.prop(pred::LOOP_INDEX))?
                .and_then(|s| s.parse::<u32>().ok()),
            None => None,
        };

        self.bus.publish(&ExecutionEvent::VariableSet {
            instance: instance.clone(),
            name: name.to_string(),
            value,
            scope_token: scope_token.cloned(),
            loop_index,
        })
    }

    /// Instance-level bindings only (no token scope).
    pub fn snapshot_variables(
        &self,
        instance: &NamedNode,
    ) -> Result<BTreeMap<String, VariableValue>, EngineError> {
        let v = &self.vocab;
        let mut out = BTreeMap::new();
        for binding in self
            .store
            .subjects_with(&v.prop(pred::INSTANCE), &Term::NamedNode(instance.clone()))?
        {
            let is_binding = self
                .store
                .value_node(&binding, &rdf::TYPE.into_owned())?
                .is_some_and(|t| t == v.class(class::VARIABLE_BINDING));
            if !is_binding || self.binding_scope(&binding)?.is_some() {
                continue;
            }
            if let (Some(name), Some(value)) = (
                self.store.value_str(&binding, &v.prop(pred::VAR_NAME))?,
                self.binding_value(&binding)?,
            ) {
                out.insert(name, value);
            }
        }
        Ok(out)
    }

    /// The variables visible from a token scope: the instance snapshot with
    /// scope-chain bindings shadowing it, innermost last.
    pub fn visible_variables(
        &self,
        instance: &NamedNode,
        scope_token: Option<&NamedNode>,
    ) -> Result<BTreeMap<String, VariableValue>, EngineError> {
        let mut out = self.snapshot_variables(instance)?;
        let mut chain = Vec::new();
        let mut scope = scope_token.cloned();
        while let Some(token) = scope {
            chain.push(token.clone());
            scope = self
                .store
                .value_node(&token, &self.vocab.prop(pred::PARENT_TOKEN))?;
        }
        // outermost first so inner scopes overwrite
        for token in chain.iter().rev() {
            for binding in self.store.subjects_with(
                &self.vocab.prop(pred::SCOPE_TOKEN),
                &Term::NamedNode(token.clone()),
            )? {
                if let (Some(name), Some(value)) = (
                    self.store
                        .value_str(&binding, &self.vocab.prop(pred::VAR_NAME))?,
                    self.binding_value(&binding)?,
                ) {
                    out.insert(name, value);
                }
            }
        }
        Ok(out)
    }

    // ── Scheduler cadence ──

    pub fn next_run_at(&self, instance: &NamedNode) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self
            .store
            .value_str(instance, &self.vocab.prop(pred::NEXT_RUN_AT))?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    pub fn set_next_run_at(
        &self,
        instance: &NamedNode,
        at: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.store.set(
            instance,
            &self.vocab.prop(pred::NEXT_RUN_AT),
            &Self::datetime_term(at),
        )
    }

    pub fn cadence_seconds(&self, instance: &NamedNode) -> Result<Option<u64>, EngineError> {
        Ok(self
            .store
            .value_str(instance, &self.vocab.prop(pred::CADENCE_SECONDS))?
            .and_then(|s| s.parse().ok()))
    }

    pub fn set_cadence_seconds(
        &self,
        instance: &NamedNode,
        seconds: u64,
    ) -> Result<(), EngineError> {
        self.store.set(
            instance,
            &self.vocab.prop(pred::CADENCE_SECONDS),
            &Term::Literal(Literal::new_typed_literal(
                seconds.to_string(),
                xsd::INTEGER,
            )),
        )
    }

    /// Record a completed cadence run and arm the next one.
    pub fn mark_ran(&self, instance: &NamedNode, next: DateTime<Utc>) -> Result<(), EngineError> {
        self.store.set(
            instance,
            &self.vocab.prop(pred::LAST_RUN_AT),
            &Self::datetime_term(self.clock.now()),
        )?;
        self.set_next_run_at(instance, next)
    }

    /// Instances whose `nextRunAt` is due.
    pub fn due_instances(&self, now: DateTime<Utc>) -> Result<Vec<NamedNode>, EngineError> {
        let v = &self.vocab;
        let mut due = Vec::new();
        for triple in self.store.triples(None, Some(&v.prop(pred::NEXT_RUN_AT)), None)? {
            let at = match &triple.object {
                Term::Literal(lit) => match DateTime::parse_from_rfc3339(lit.value()) {
                    Ok(t) => t.with_timezone(&Utc),
                    Err(_) => continue,
                },
                _ => continue,
            };
            if at <= now {
                if let oxigraph::model::Subject::NamedNode(instance) = triple.subject {
                    due.push(instance);
                }
            }
        }
        Ok(due)
    }
}
