use crate::error::EngineError;
use crate::store::GraphStore;
use crate::types::{
    CmpOp, Condition, ListenerSpec, ListenerType, MultiInstanceSpec, NodeDescriptor, NodeType,
    TimerDefinition, VariableValue,
};
use crate::vocab::{pred, Vocab};
use oxigraph::model::vocab::rdf;
use oxigraph::model::{NamedNode, Subject, Term};
use std::collections::HashMap;
use std::str::FromStr;

/// One sequence flow with its resolved condition.
#[derive(Clone, Debug)]
pub struct FlowInfo {
    pub uri: NamedNode,
    pub source: NamedNode,
    pub target: NamedNode,
    pub order: i64,
    pub condition: Option<Condition>,
}

/// A structural problem found while building the index.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
    pub node: Option<String>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "[{}] {}", node, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Read-only lookup over one process definition subgraph (C2).
///
/// Built once per loaded process and treated as immutable during execution.
/// It resolves every node into a tagged `NodeDescriptor` so the step loop
/// dispatches on the tag rather than matching IRIs.
pub struct DefinitionIndex {
    process: NamedNode,
    descriptors: HashMap<NamedNode, NodeDescriptor>,
    outgoing: HashMap<NamedNode, Vec<FlowInfo>>,
    incoming: HashMap<NamedNode, Vec<FlowInfo>>,
    default_flows: HashMap<NamedNode, NamedNode>,
    flows: HashMap<NamedNode, FlowInfo>,
    boundary_events: HashMap<NamedNode, Vec<NamedNode>>,
    containers: HashMap<NamedNode, NamedNode>,
    start_events: HashMap<NamedNode, NamedNode>,
}

impl DefinitionIndex {
    /// Build the index for a process. Fails on malformed condition or timer
    /// specifications; structural invariants are reported by `validate`.
    pub fn build(
        store: &dyn GraphStore,
        vocab: &Vocab,
        process: &NamedNode,
    ) -> Result<DefinitionIndex, EngineError> {
        let rdf_type = rdf::TYPE.into_owned();

        // Collect every node whose container chain reaches this process.
        let mut containers: HashMap<NamedNode, NamedNode> = HashMap::new();
        for triple in store.triples(None, Some(&vocab.prop(pred::PART_OF)), None)? {
            if let (Subject::NamedNode(node), Term::NamedNode(container)) =
                (triple.subject, triple.object)
            {
                containers.insert(node, container);
            }
        }
        let belongs = |node: &NamedNode| -> bool {
            let mut cur = node.clone();
            loop {
                match containers.get(&cur) {
                    Some(c) if c == process => return true,
                    Some(c) => cur = c.clone(),
                    None => return false,
                }
            }
        };

        let mut descriptors = HashMap::new();
        for node_type in NodeType::ALL {
            let class_term = Term::NamedNode(vocab.class(node_type.as_local()));
            for node in store.subjects_with(&rdf_type, &class_term)? {
                if !belongs(&node) {
                    continue;
                }
                let descriptor = read_descriptor(store, vocab, &node, node_type)?;
                descriptors.insert(node, descriptor);
            }
        }

        // Flows between nodes of this process.
        let mut flows = HashMap::new();
        let mut outgoing: HashMap<NamedNode, Vec<FlowInfo>> = HashMap::new();
        let mut incoming: HashMap<NamedNode, Vec<FlowInfo>> = HashMap::new();
        for triple in store.triples(None, Some(&vocab.prop(pred::SOURCE)), None)? {
            let flow = match triple.subject {
                Subject::NamedNode(n) => n,
                _ => continue,
            };
            let source = match triple.object {
                Term::NamedNode(n) => n,
                _ => continue,
            };
            if !descriptors.contains_key(&source) {
                continue;
            }
            let target = store
                .value_node(&flow, &vocab.prop(pred::TARGET))?
                .ok_or_else(|| {
                    EngineError::Definition(format!("flow {flow} has no target"))
                })?;
            let order = store
                .value_str(&flow, &vocab.prop(pred::FLOW_ORDER))?
                .and_then(|s| s.parse().ok())
                .unwrap_or(i64::MAX);
            let condition = read_condition(store, vocab, &flow)?;
            let info = FlowInfo {
                uri: flow.clone(),
                source: source.clone(),
                target: target.clone(),
                order,
                condition,
            };
            outgoing.entry(source).or_default().push(info.clone());
            incoming.entry(target).or_default().push(info.clone());
            flows.insert(flow, info);
        }
        for list in outgoing.values_mut().chain(incoming.values_mut()) {
            list.sort_by(|a, b| a.order.cmp(&b.order).then(a.uri.as_str().cmp(b.uri.as_str())));
        }

        let mut default_flows = HashMap::new();
        for triple in store.triples(None, Some(&vocab.prop(pred::DEFAULT_FLOW)), None)? {
            if let (Subject::NamedNode(node), Term::NamedNode(flow)) =
                (triple.subject, triple.object)
            {
                if descriptors.contains_key(&node) {
                    default_flows.insert(node, flow);
                }
            }
        }

        // Boundary events indexed by host activity, definition order.
        let mut boundary_events: HashMap<NamedNode, Vec<NamedNode>> = HashMap::new();
        let mut boundary_list: Vec<&NodeDescriptor> = descriptors
            .values()
            .filter(|d| d.node_type == NodeType::BoundaryEvent)
            .collect();
        boundary_list.sort_by(|a, b| a.uri.as_str().cmp(b.uri.as_str()));
        for descriptor in boundary_list {
            if let Some(host) = &descriptor.attached_to {
                boundary_events
                    .entry(host.clone())
                    .or_default()
                    .push(descriptor.uri.clone());
            }
        }

        // Start events per container (the process itself and each subprocess).
        let mut start_events = HashMap::new();
        for descriptor in descriptors.values() {
            if descriptor.node_type == NodeType::StartEvent {
                if let Some(container) = containers.get(&descriptor.uri) {
                    start_events.insert(container.clone(), descriptor.uri.clone());
                }
            }
        }

        Ok(DefinitionIndex {
            process: process.clone(),
            descriptors,
            outgoing,
            incoming,
            default_flows,
            flows,
            boundary_events,
            containers,
            start_events,
        })
    }

    pub fn process(&self) -> &NamedNode {
        &self.process
    }

    pub fn node(&self, uri: &NamedNode) -> Result<&NodeDescriptor, EngineError> {
        self.descriptors.get(uri).ok_or_else(|| {
            EngineError::Definition(format!("node {uri} not in process {}", self.process))
        })
    }

    pub fn node_type(&self, uri: &NamedNode) -> Result<NodeType, EngineError> {
        Ok(self.node(uri)?.node_type)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.descriptors.values()
    }

    /// Outgoing flows in definition order.
    pub fn outgoing_flows(&self, node: &NamedNode) -> &[FlowInfo] {
        self.outgoing.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn incoming_flows(&self, node: &NamedNode) -> &[FlowInfo] {
        self.incoming.get(node).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn default_flow(&self, node: &NamedNode) -> Option<&FlowInfo> {
        self.default_flows
            .get(node)
            .and_then(|flow| self.flows.get(flow))
    }

    pub fn flow(&self, uri: &NamedNode) -> Option<&FlowInfo> {
        self.flows.get(uri)
    }

    /// The flow's condition; `None` means unconditionally true.
    pub fn condition_of(&self, flow: &NamedNode) -> Option<&Condition> {
        self.flows.get(flow).and_then(|f| f.condition.as_ref())
    }

    pub fn boundary_events_of(&self, activity: &NamedNode) -> Vec<&NodeDescriptor> {
        self.boundary_events
            .get(activity)
            .map(|list| {
                list.iter()
                    .filter_map(|uri| self.descriptors.get(uri))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn start_event_of(&self, container: &NamedNode) -> Option<&NamedNode> {
        self.start_events.get(container)
    }

    pub fn container_of(&self, node: &NamedNode) -> Option<&NamedNode> {
        self.containers.get(node)
    }

    /// Number of subprocess containers enclosing the node.
    pub fn scope_depth(&self, node: &NamedNode) -> usize {
        let mut depth = 0;
        let mut cur = node.clone();
        while let Some(container) = self.containers.get(&cur) {
            if container == &self.process {
                break;
            }
            depth += 1;
            cur = container.clone();
        }
        depth
    }

    /// The nearest error boundary event matching the code, walking up the
    /// subprocess enclosure chain from the failing activity. A boundary
    /// event without a code is a catch-all; an exact code match on the same
    /// activity wins over it.
    pub fn error_handler_for(
        &self,
        activity: &NamedNode,
        code: &str,
    ) -> Option<&NodeDescriptor> {
        let mut cur = Some(activity.clone());
        while let Some(node) = cur {
            let boundaries = self.boundary_events_of(&node);
            if let Some(exact) = boundaries
                .iter()
                .find(|b| b.error_code.as_deref() == Some(code))
            {
                return Some(*exact);
            }
            if let Some(catch_all) = boundaries.iter().find(|b| {
                b.error_code.is_none()
                    && b.timer.is_none()
                    && b.message_name.is_none()
                    && !b.cancel_end
            }) {
                return Some(*catch_all);
            }
            cur = self.containers.get(&node).and_then(|container| {
                if container == &self.process {
                    None
                } else {
                    Some(container.clone())
                }
            });
        }
        None
    }

    /// Structural invariants of the definition. An empty list means valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.start_event_of(&self.process).is_none() {
            errors.push(ValidationError {
                message: "process has no start event".to_string(),
                node: None,
            });
        }

        // Compensation handlers sit outside the normal flow.
        let handler_nodes: Vec<&NamedNode> = self
            .descriptors
            .values()
            .filter_map(|d| d.compensation_handler.as_ref())
            .collect();

        for descriptor in self.descriptors.values() {
            let uri = &descriptor.uri;
            if handler_nodes.contains(&uri) {
                continue;
            }
            let out = self.outgoing_flows(uri).len();
            let inc = self.incoming_flows(uri).len();

            match descriptor.node_type {
                NodeType::StartEvent | NodeType::BoundaryEvent => {}
                _ => {
                    if inc == 0 {
                        errors.push(ValidationError {
                            message: "node has no incoming flow".to_string(),
                            node: Some(uri.as_str().to_string()),
                        });
                    }
                }
            }
            match descriptor.node_type {
                NodeType::EndEvent => {}
                _ => {
                    if out == 0 {
                        errors.push(ValidationError {
                            message: "node has no outgoing flow".to_string(),
                            node: Some(uri.as_str().to_string()),
                        });
                    }
                }
            }
            if descriptor.node_type.is_gateway() && out == 1 && inc < 2 {
                errors.push(ValidationError {
                    message: "gateway is neither a split (≥2 outgoing) nor a join (≥2 incoming)"
                        .to_string(),
                    node: Some(uri.as_str().to_string()),
                });
            }
            if descriptor.node_type == NodeType::BoundaryEvent {
                match &descriptor.attached_to {
                    None => errors.push(ValidationError {
                        message: "boundary event has no host activity".to_string(),
                        node: Some(uri.as_str().to_string()),
                    }),
                    Some(host) if !self.descriptors.contains_key(host) => {
                        errors.push(ValidationError {
                            message: format!("boundary event host {host} does not exist"),
                            node: Some(uri.as_str().to_string()),
                        })
                    }
                    _ => {}
                }
            }
        }
        errors
    }
}

fn read_condition(
    store: &dyn GraphStore,
    vocab: &Vocab,
    flow: &NamedNode,
) -> Result<Option<Condition>, EngineError> {
    // An ASK query takes precedence when both forms are present.
    if let Some(query) = store.value_str(flow, &vocab.prop(pred::CONDITION_QUERY))? {
        return Ok(Some(Condition::Ask(query)));
    }
    let Some(cond_node) = store.value_node(flow, &vocab.prop(pred::CONDITION))? else {
        return Ok(None);
    };
    let variable = store
        .value_str(&cond_node, &vocab.prop(pred::VARIABLE))?
        .ok_or_else(|| EngineError::Definition(format!("condition on {flow} has no variable")))?;
    let op_raw = store
        .value_str(&cond_node, &vocab.prop(pred::OPERATOR))?
        .ok_or_else(|| EngineError::Definition(format!("condition on {flow} has no operator")))?;
    let value = store
        .value_literal(&cond_node, &vocab.prop(pred::VALUE))?
        .ok_or_else(|| EngineError::Definition(format!("condition on {flow} has no value")))?;
    Ok(Some(Condition::Structured {
        variable,
        op: CmpOp::from_str(&op_raw)?,
        value: VariableValue::from_literal(&value)?,
    }))
}

fn read_descriptor(
    store: &dyn GraphStore,
    vocab: &Vocab,
    node: &NamedNode,
    node_type: NodeType,
) -> Result<NodeDescriptor, EngineError> {
    let read_str = |local: &str| store.value_str(node, &vocab.prop(local));
    let read_node = |local: &str| store.value_node(node, &vocab.prop(local));
    let read_bool = |local: &str| -> Result<Option<bool>, EngineError> {
        Ok(store
            .value_str(node, &vocab.prop(local))?
            .and_then(|s| s.parse().ok()))
    };

    let timer = match read_str(pred::TIMER_SPEC)? {
        Some(raw) => Some(TimerDefinition::parse(&raw)?),
        None => None,
    };

    let multi_instance = {
        let sequential = read_bool(pred::MI_SEQUENTIAL)?;
        let cardinality = read_str(pred::MI_CARDINALITY)?.and_then(|s| s.parse().ok());
        let collection = read_str(pred::MI_COLLECTION)?;
        if sequential.is_some() || cardinality.is_some() || collection.is_some() {
            Some(MultiInstanceSpec {
                sequential: sequential.unwrap_or(false),
                cardinality,
                collection,
                element_variable: read_str(pred::MI_ELEMENT_VARIABLE)?,
            })
        } else {
            None
        }
    };

    let mut listeners = Vec::new();
    let mut listener_nodes: Vec<NamedNode> = store
        .objects(node, &vocab.prop(pred::LISTENER))?
        .into_iter()
        .filter_map(|t| match t {
            Term::NamedNode(n) => Some(n),
            _ => None,
        })
        .collect();
    listener_nodes.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    for listener in listener_nodes {
        let kind = store
            .value_str(&listener, &vocab.prop(pred::LISTENER_TYPE))?
            .ok_or_else(|| {
                EngineError::Definition(format!("listener {listener} has no type"))
            })?;
        listeners.push(ListenerSpec {
            listener_type: ListenerType::from_str(&kind)?,
            expression: store
                .value_str(&listener, &vocab.prop(pred::LISTENER_EXPRESSION))?
                .unwrap_or_default(),
        });
    }

    let string_list = |local: &str| -> Result<Vec<String>, EngineError> {
        let mut items: Vec<String> = store
            .objects(node, &vocab.prop(local))?
            .into_iter()
            .filter_map(|t| match t {
                Term::Literal(l) => Some(l.value().to_string()),
                _ => None,
            })
            .collect();
        items.sort();
        Ok(items)
    };

    Ok(NodeDescriptor {
        uri: node.clone(),
        node_type,
        name: read_str(pred::NAME)?,
        topic: read_str(pred::TOPIC)?,
        message_name: read_str(pred::MESSAGE_NAME)?,
        correlation_variable: read_str(pred::CORRELATION_VARIABLE)?,
        timer,
        error_code: read_str(pred::ERROR_CODE)?,
        attached_to: read_node(pred::ATTACHED_TO)?,
        interrupting: read_bool(pred::INTERRUPTING)?.unwrap_or(true),
        terminate_end: read_bool(pred::TERMINATE_END)?.unwrap_or(false),
        cancel_end: read_bool(pred::CANCEL_END)?.unwrap_or(false),
        is_transaction: read_bool(pred::TRANSACTION)?.unwrap_or(false),
        called_process: read_node(pred::CALLED_PROCESS)?,
        compensate_activity: read_node(pred::COMPENSATE_ACTIVITY)?,
        compensation_handler: read_node(pred::COMPENSATION_HANDLER)?,
        compensation_throw: read_bool(pred::COMPENSATION_THROW)?.unwrap_or(false),
        script: read_str(pred::SCRIPT)?,
        multi_instance,
        listeners,
        assignee: read_str(pred::ASSIGNEE)?,
        candidate_users: string_list(pred::CANDIDATE_USER)?,
        candidate_groups: string_list(pred::CANDIDATE_GROUP)?,
        due_date: read_str(pred::DUE_DATE)?,
        priority: read_str(pred::PRIORITY)?.and_then(|s| s.parse().ok()),
    })
}
