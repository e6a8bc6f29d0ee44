use crate::bus::EventBus;
use crate::error::EngineError;
use crate::events::ExecutionEvent;
use crate::store::GraphStore;
use crate::types::{TokenState, VariableValue, WaitKind};
use crate::vocab::{class, pred, Vocab};
use oxigraph::model::vocab::{rdf, xsd};
use oxigraph::model::{Literal, NamedNode, Term};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Token creation, movement, consumption and parent/child linkage (C4).
///
/// Tokens are exclusively owned by their instance. A consumed token keeps
/// its subject triples (minus liveness) so audit entries referencing it stay
/// resolvable.
pub struct TokenService {
    store: Arc<dyn GraphStore>,
    vocab: Arc<Vocab>,
    bus: Arc<EventBus>,
    /// Orders message-wait registrations so delivery picks the oldest.
    wait_seq: AtomicU64,
}

impl TokenService {
    pub fn new(store: Arc<dyn GraphStore>, vocab: Arc<Vocab>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            vocab,
            bus,
            wait_seq: AtomicU64::new(1),
        }
    }

    pub fn create_token(
        &self,
        instance: &NamedNode,
        node: &NamedNode,
        parent: Option<&NamedNode>,
        loop_index: Option<u32>,
    ) -> Result<NamedNode, EngineError> {
        let token = self.vocab.mint("token");
        let v = &self.vocab;
        self.store.add(
            &token,
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(v.class(class::TOKEN)),
        )?;
        self.store.add(
            &token,
            &v.prop(pred::INSTANCE),
            &Term::NamedNode(instance.clone()),
        )?;
        self.store
            .add(&token, &v.prop(pred::AT_NODE), &Term::NamedNode(node.clone()))?;
        self.store.add(
            &token,
            &v.prop(pred::STATE),
            &Term::Literal(Literal::new_simple_literal(TokenState::Live.as_str())),
        )?;
        if let Some(parent) = parent {
            self.store.add(
                &token,
                &v.prop(pred::PARENT_TOKEN),
                &Term::NamedNode(parent.clone()),
            )?;
        }
        if let Some(index) = loop_index {
            self.store.add(
                &token,
                &v.prop(pred::LOOP_INDEX),
                &Term::Literal(Literal::new_typed_literal(index.to_string(), xsd::INTEGER)),
            )?;
        }
        debug!(token = token.as_str(), node = node.as_str(), "token created");
        self.bus.publish(&ExecutionEvent::TokenCreated {
            token: token.clone(),
            instance: instance.clone(),
            node: node.clone(),
            parent: parent.cloned(),
            loop_index,
        })?;
        Ok(token)
    }

    /// Move a token to a target node, recording the flow it arrived through
    /// (used for join accounting). A waiting token becomes live again.
    pub fn move_token(
        &self,
        token: &NamedNode,
        target: &NamedNode,
        via_flow: Option<&NamedNode>,
    ) -> Result<(), EngineError> {
        let v = &self.vocab;
        let instance = self.instance_of(token)?;
        self.store
            .set(token, &v.prop(pred::AT_NODE), &Term::NamedNode(target.clone()))?;
        match via_flow {
            Some(flow) => self.store.set(
                token,
                &v.prop(pred::ARRIVED_VIA),
                &Term::NamedNode(flow.clone()),
            )?,
            None => {
                self.store.remove(token, &v.prop(pred::ARRIVED_VIA), None)?;
            }
        }
        self.clear_wait(token)?;
        self.set_token_state(token, TokenState::Live)?;
        debug!(token = token.as_str(), target = target.as_str(), "token moved");
        self.bus.publish(&ExecutionEvent::TokenMoved {
            token: token.clone(),
            targets: vec![target.clone()],
            instance,
            consume_original: false,
        })
    }

    pub fn consume_token(&self, token: &NamedNode) -> Result<(), EngineError> {
        let instance = self.instance_of(token)?;
        self.clear_wait(token)?;
        self.set_token_state(token, TokenState::Consumed)?;
        debug!(token = token.as_str(), "token consumed");
        self.bus.publish(&ExecutionEvent::TokenConsumed {
            token: token.clone(),
            instance,
        })
    }

    fn set_token_state(&self, token: &NamedNode, state: TokenState) -> Result<(), EngineError> {
        self.store.set(
            token,
            &self.vocab.prop(pred::STATE),
            &Term::Literal(Literal::new_simple_literal(state.as_str())),
        )
    }

    pub fn state_of(&self, token: &NamedNode) -> Result<TokenState, EngineError> {
        let raw = self
            .store
            .value_str(token, &self.vocab.prop(pred::STATE))?
            .ok_or_else(|| EngineError::UnknownToken(token.as_str().to_string()))?;
        TokenState::from_str(&raw)
    }

    pub fn node_of(&self, token: &NamedNode) -> Result<NamedNode, EngineError> {
        self.store
            .value_node(token, &self.vocab.prop(pred::AT_NODE))?
            .ok_or_else(|| EngineError::UnknownToken(token.as_str().to_string()))
    }

    pub fn instance_of(&self, token: &NamedNode) -> Result<NamedNode, EngineError> {
        self.store
            .value_node(token, &self.vocab.prop(pred::INSTANCE))?
            .ok_or_else(|| EngineError::UnknownToken(token.as_str().to_string()))
    }

    pub fn parent_of(&self, token: &NamedNode) -> Result<Option<NamedNode>, EngineError> {
        self.store
            .value_node(token, &self.vocab.prop(pred::PARENT_TOKEN))
    }

    pub fn loop_index_of(&self, token: &NamedNode) -> Result<Option<u32>, EngineError> {
        Ok(self
            .store
            .value_str(token, &self.vocab.prop(pred::LOOP_INDEX))?
            .and_then(|s| s.parse().ok()))
    }

    pub fn arrived_via(&self, token: &NamedNode) -> Result<Option<NamedNode>, EngineError> {
        self.store
            .value_node(token, &self.vocab.prop(pred::ARRIVED_VIA))
    }

    pub fn set_arrived_via(&self, token: &NamedNode, flow: &NamedNode) -> Result<(), EngineError> {
        self.store.set(
            token,
            &self.vocab.prop(pred::ARRIVED_VIA),
            &Term::NamedNode(flow.clone()),
        )
    }

    /// Direct child tokens (any state).
    pub fn children_of(&self, parent: &NamedNode) -> Result<Vec<NamedNode>, EngineError> {
        let mut children = self.store.subjects_with(
            &self.vocab.prop(pred::PARENT_TOKEN),
            &Term::NamedNode(parent.clone()),
        )?;
        children.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(children)
    }

    // ── Waits ──

    pub fn mark_waiting(&self, token: &NamedNode, kind: WaitKind) -> Result<(), EngineError> {
        self.set_token_state(token, TokenState::Waiting)?;
        self.store.set(
            token,
            &self.vocab.prop(pred::WAIT_KIND),
            &Term::Literal(Literal::new_simple_literal(kind.as_str())),
        )
    }

    pub fn wait_kind_of(&self, token: &NamedNode) -> Result<Option<WaitKind>, EngineError> {
        match self
            .store
            .value_str(token, &self.vocab.prop(pred::WAIT_KIND))?
        {
            Some(raw) => Ok(Some(WaitKind::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Register a message wait with an optional correlation value and a
    /// monotonic registration sequence.
    pub fn register_message_wait(
        &self,
        token: &NamedNode,
        message_name: &str,
        correlation: Option<&VariableValue>,
    ) -> Result<(), EngineError> {
        let v = &self.vocab;
        self.mark_waiting(token, WaitKind::Message)?;
        self.store.set(
            token,
            &v.prop(pred::WAIT_MESSAGE),
            &Term::Literal(Literal::new_simple_literal(message_name)),
        )?;
        if let Some(correlation) = correlation {
            self.store
                .set(token, &v.prop(pred::CORRELATION_VALUE), &correlation.to_term())?;
        }
        let seq = self.wait_seq.fetch_add(1, Ordering::Relaxed);
        self.store.set(
            token,
            &v.prop(pred::WAIT_SEQ),
            &Term::Literal(Literal::new_typed_literal(seq.to_string(), xsd::INTEGER)),
        )
    }

    /// Waiting tokens registered for a message name, oldest first, with
    /// their correlation values.
    pub fn message_waits(
        &self,
        message_name: &str,
    ) -> Result<Vec<(NamedNode, Option<VariableValue>)>, EngineError> {
        let v = &self.vocab;
        let mut waits = Vec::new();
        for token in self.store.subjects_with(
            &v.prop(pred::WAIT_MESSAGE),
            &Term::Literal(Literal::new_simple_literal(message_name)),
        )? {
            if self.state_of(&token)? != TokenState::Waiting {
                continue;
            }
            let correlation = match self
                .store
                .value_literal(&token, &v.prop(pred::CORRELATION_VALUE))?
            {
                Some(lit) => Some(VariableValue::from_literal(&lit)?),
                None => None,
            };
            let seq = self
                .store
                .value_str(&token, &v.prop(pred::WAIT_SEQ))?
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(u64::MAX);
            waits.push((seq, token, correlation));
        }
        waits.sort_by_key(|(seq, _, _)| *seq);
        Ok(waits.into_iter().map(|(_, t, c)| (t, c)).collect())
    }

    fn clear_wait(&self, token: &NamedNode) -> Result<(), EngineError> {
        let v = &self.vocab;
        for local in [
            pred::WAIT_KIND,
            pred::WAIT_MESSAGE,
            pred::CORRELATION_VALUE,
            pred::WAIT_SEQ,
        ] {
            self.store.remove(token, &v.prop(local), None)?;
        }
        Ok(())
    }

    // ── Race groups (event-based gateways) ──

    pub fn set_race_group(&self, token: &NamedNode, group: &NamedNode) -> Result<(), EngineError> {
        self.store.set(
            token,
            &self.vocab.prop(pred::RACE_GROUP),
            &Term::NamedNode(group.clone()),
        )
    }

    pub fn race_group_of(&self, token: &NamedNode) -> Result<Option<NamedNode>, EngineError> {
        self.store
            .value_node(token, &self.vocab.prop(pred::RACE_GROUP))
    }

    pub fn race_members(&self, group: &NamedNode) -> Result<Vec<NamedNode>, EngineError> {
        self.store.subjects_with(
            &self.vocab.prop(pred::RACE_GROUP),
            &Term::NamedNode(group.clone()),
        )
    }

    // ── Boundary arming and subprocess linkage ──

    pub fn arm_boundary(&self, token: &NamedNode, boundary: &NamedNode) -> Result<(), EngineError> {
        self.store.add(
            token,
            &self.vocab.prop(pred::ARMED_BOUNDARY),
            &Term::NamedNode(boundary.clone()),
        )
    }

    pub fn armed_boundaries(&self, token: &NamedNode) -> Result<Vec<NamedNode>, EngineError> {
        Ok(self
            .store
            .objects(token, &self.vocab.prop(pred::ARMED_BOUNDARY))?
            .into_iter()
            .filter_map(|t| match t {
                Term::NamedNode(n) => Some(n),
                _ => None,
            })
            .collect())
    }

    pub fn disarm_boundaries(&self, token: &NamedNode) -> Result<(), EngineError> {
        self.store
            .remove(token, &self.vocab.prop(pred::ARMED_BOUNDARY), None)?;
        Ok(())
    }

    /// Detach a single boundary listener from its host.
    pub fn remove_armed_boundary(
        &self,
        host: &NamedNode,
        listener: &NamedNode,
    ) -> Result<(), EngineError> {
        self.store.remove(
            host,
            &self.vocab.prop(pred::ARMED_BOUNDARY),
            Some(&Term::NamedNode(listener.clone())),
        )?;
        Ok(())
    }

    pub fn link_child_instance(
        &self,
        token: &NamedNode,
        child: &NamedNode,
    ) -> Result<(), EngineError> {
        self.store.set(
            token,
            &self.vocab.prop(pred::CHILD_INSTANCE),
            &Term::NamedNode(child.clone()),
        )
    }

    pub fn child_instance_of(&self, token: &NamedNode) -> Result<Option<NamedNode>, EngineError> {
        self.store
            .value_node(token, &self.vocab.prop(pred::CHILD_INSTANCE))
    }

    // ── Inclusive fork accounting ──

    pub fn set_fork_origin(&self, token: &NamedNode, split: &NamedNode) -> Result<(), EngineError> {
        self.store.set(
            token,
            &self.vocab.prop(pred::FORK_ORIGIN),
            &Term::NamedNode(split.clone()),
        )
    }

    pub fn fork_origin_of(&self, token: &NamedNode) -> Result<Option<NamedNode>, EngineError> {
        self.store
            .value_node(token, &self.vocab.prop(pred::FORK_ORIGIN))
    }

    pub fn set_fork_expected(&self, token: &NamedNode, expected: u32) -> Result<(), EngineError> {
        self.store.set(
            token,
            &self.vocab.prop(pred::FORK_EXPECTED),
            &Term::Literal(Literal::new_typed_literal(expected.to_string(), xsd::INTEGER)),
        )
    }

    pub fn fork_expected_of(&self, token: &NamedNode) -> Result<Option<u32>, EngineError> {
        Ok(self
            .store
            .value_str(token, &self.vocab.prop(pred::FORK_EXPECTED))?
            .and_then(|s| s.parse().ok()))
    }

    // ── Queries ──

    fn all_tokens_of(&self, instance: &NamedNode) -> Result<Vec<NamedNode>, EngineError> {
        let v = &self.vocab;
        let mut out = Vec::new();
        for token in self
            .store
            .subjects_with(&v.prop(pred::INSTANCE), &Term::NamedNode(instance.clone()))?
        {
            let is_token = self
                .store
                .value_node(&token, &rdf::TYPE.into_owned())?
                .is_some_and(|t| t == v.class(class::TOKEN));
            if is_token {
                out.push(token);
            }
        }
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(out)
    }

    /// Non-consumed tokens positioned at a node.
    pub fn tokens_at(
        &self,
        instance: &NamedNode,
        node: &NamedNode,
    ) -> Result<Vec<NamedNode>, EngineError> {
        let mut out = Vec::new();
        for token in self.all_tokens_of(instance)? {
            if self.state_of(&token)? != TokenState::Consumed && &self.node_of(&token)? == node {
                out.push(token);
            }
        }
        Ok(out)
    }

    /// Every non-consumed token of the instance (live and waiting).
    pub fn live_tokens(&self, instance: &NamedNode) -> Result<Vec<NamedNode>, EngineError> {
        let mut out = Vec::new();
        for token in self.all_tokens_of(instance)? {
            if self.state_of(&token)? != TokenState::Consumed {
                out.push(token);
            }
        }
        Ok(out)
    }

    /// Tokens ready to be stepped (state live, not waiting).
    pub fn runnable_tokens(&self, instance: &NamedNode) -> Result<Vec<NamedNode>, EngineError> {
        let mut out = Vec::new();
        for token in self.all_tokens_of(instance)? {
            if self.state_of(&token)? == TokenState::Live {
                out.push(token);
            }
        }
        Ok(out)
    }
}
