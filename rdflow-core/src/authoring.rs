use crate::error::EngineError;
use crate::store::GraphStore;
use crate::types::{CmpOp, ListenerType, MultiInstanceSpec, NodeType, VariableValue};
use crate::vocab::{class, pred, Vocab};
use oxigraph::model::vocab::{rdf, xsd};
use oxigraph::model::{Literal, NamedNode, Term};
use std::collections::HashMap;

/// Programmatic authoring of process definitions.
///
/// Definitions are normally loaded into the graph by an external tool; this
/// builder writes the same triples and is what the test suites and demos use
/// to stand up processes without a parser.
pub struct ProcessBuilder {
    vocab: Vocab,
    process: NamedNode,
    process_id: String,
    triples: Vec<(NamedNode, NamedNode, Term)>,
    containers: HashMap<NamedNode, NamedNode>,
    node_order: Vec<NamedNode>,
    flow_count: usize,
    listener_count: usize,
}

impl ProcessBuilder {
    pub fn new(vocab: &Vocab, process_id: &str) -> Self {
        let process = vocab.resource("process", process_id);
        Self {
            vocab: vocab.clone(),
            process,
            process_id: process_id.to_string(),
            triples: Vec::new(),
            containers: HashMap::new(),
            node_order: Vec::new(),
            flow_count: 0,
            listener_count: 0,
        }
    }

    pub fn process_uri(&self) -> &NamedNode {
        &self.process
    }

    fn lit(s: &str) -> Term {
        Term::Literal(Literal::new_simple_literal(s))
    }

    fn bool_lit(b: bool) -> Term {
        Term::Literal(Literal::new_typed_literal(b.to_string(), xsd::BOOLEAN))
    }

    fn int_lit(n: i64) -> Term {
        Term::Literal(Literal::new_typed_literal(n.to_string(), xsd::INTEGER))
    }

    fn attr(&mut self, node: &NamedNode, local: &str, value: Term) {
        self.triples.push((node.clone(), self.vocab.prop(local), value));
    }

    fn node(&mut self, id: &str, node_type: NodeType) -> NamedNode {
        let uri = self
            .vocab
            .resource("node", &format!("{}/{}", self.process_id, id));
        self.triples.push((
            uri.clone(),
            rdf::TYPE.into_owned(),
            Term::NamedNode(self.vocab.class(node_type.as_local())),
        ));
        self.node_order.push(uri.clone());
        uri
    }

    // ── Events ──

    pub fn start_event(&mut self, id: &str) -> NamedNode {
        self.node(id, NodeType::StartEvent)
    }

    pub fn end_event(&mut self, id: &str) -> NamedNode {
        self.node(id, NodeType::EndEvent)
    }

    pub fn terminate_end(&mut self, id: &str) -> NamedNode {
        let uri = self.node(id, NodeType::EndEvent);
        self.attr(&uri, pred::TERMINATE_END, Self::bool_lit(true));
        uri
    }

    pub fn cancel_end(&mut self, id: &str) -> NamedNode {
        let uri = self.node(id, NodeType::EndEvent);
        self.attr(&uri, pred::CANCEL_END, Self::bool_lit(true));
        uri
    }

    pub fn error_end(&mut self, id: &str, code: &str) -> NamedNode {
        let uri = self.node(id, NodeType::EndEvent);
        self.attr(&uri, pred::ERROR_CODE, Self::lit(code));
        uri
    }

    pub fn catch_message(&mut self, id: &str, message: &str) -> NamedNode {
        let uri = self.node(id, NodeType::IntermediateCatchEvent);
        self.attr(&uri, pred::MESSAGE_NAME, Self::lit(message));
        uri
    }

    pub fn catch_timer(&mut self, id: &str, spec: &str) -> NamedNode {
        let uri = self.node(id, NodeType::IntermediateCatchEvent);
        self.attr(&uri, pred::TIMER_SPEC, Self::lit(spec));
        uri
    }

    pub fn throw_message(&mut self, id: &str, message: &str) -> NamedNode {
        let uri = self.node(id, NodeType::IntermediateThrowEvent);
        self.attr(&uri, pred::MESSAGE_NAME, Self::lit(message));
        uri
    }

    /// Compensation throw; compensates one activity or, with `None`, every
    /// compensable in scope.
    pub fn throw_compensation(&mut self, id: &str, activity: Option<&NamedNode>) -> NamedNode {
        let uri = self.node(id, NodeType::IntermediateThrowEvent);
        self.attr(&uri, pred::COMPENSATION_THROW, Self::bool_lit(true));
        if let Some(activity) = activity {
            self.attr(
                &uri,
                pred::COMPENSATE_ACTIVITY,
                Term::NamedNode(activity.clone()),
            );
        }
        uri
    }

    // ── Activities ──

    pub fn service_task(&mut self, id: &str, topic: &str) -> NamedNode {
        let uri = self.node(id, NodeType::ServiceTask);
        self.attr(&uri, pred::TOPIC, Self::lit(topic));
        uri
    }

    pub fn script_task(&mut self, id: &str, script: &str) -> NamedNode {
        let uri = self.node(id, NodeType::ScriptTask);
        self.attr(&uri, pred::SCRIPT, Self::lit(script));
        uri
    }

    pub fn user_task(&mut self, id: &str, name: &str) -> NamedNode {
        let uri = self.node(id, NodeType::UserTask);
        self.attr(&uri, pred::NAME, Self::lit(name));
        uri
    }

    pub fn receive_task(&mut self, id: &str, message: &str) -> NamedNode {
        let uri = self.node(id, NodeType::ReceiveTask);
        self.attr(&uri, pred::MESSAGE_NAME, Self::lit(message));
        uri
    }

    pub fn subprocess(&mut self, id: &str) -> NamedNode {
        self.node(id, NodeType::Subprocess)
    }

    pub fn transaction(&mut self, id: &str) -> NamedNode {
        let uri = self.node(id, NodeType::Subprocess);
        self.attr(&uri, pred::TRANSACTION, Self::bool_lit(true));
        uri
    }

    pub fn call_activity(&mut self, id: &str, process: &NamedNode) -> NamedNode {
        let uri = self.node(id, NodeType::CallActivity);
        self.attr(&uri, pred::CALLED_PROCESS, Term::NamedNode(process.clone()));
        uri
    }

    // ── Gateways ──

    pub fn exclusive_gateway(&mut self, id: &str) -> NamedNode {
        self.node(id, NodeType::ExclusiveGateway)
    }

    pub fn parallel_gateway(&mut self, id: &str) -> NamedNode {
        self.node(id, NodeType::ParallelGateway)
    }

    pub fn inclusive_gateway(&mut self, id: &str) -> NamedNode {
        self.node(id, NodeType::InclusiveGateway)
    }

    pub fn event_gateway(&mut self, id: &str) -> NamedNode {
        self.node(id, NodeType::EventBasedGateway)
    }

    // ── Boundary events ──

    fn boundary(&mut self, id: &str, host: &NamedNode, interrupting: bool) -> NamedNode {
        let uri = self.node(id, NodeType::BoundaryEvent);
        self.attr(&uri, pred::ATTACHED_TO, Term::NamedNode(host.clone()));
        self.attr(&uri, pred::INTERRUPTING, Self::bool_lit(interrupting));
        uri
    }

    pub fn boundary_error(&mut self, id: &str, host: &NamedNode, code: Option<&str>) -> NamedNode {
        let uri = self.boundary(id, host, true);
        if let Some(code) = code {
            self.attr(&uri, pred::ERROR_CODE, Self::lit(code));
        }
        uri
    }

    pub fn boundary_timer(
        &mut self,
        id: &str,
        host: &NamedNode,
        spec: &str,
        interrupting: bool,
    ) -> NamedNode {
        let uri = self.boundary(id, host, interrupting);
        self.attr(&uri, pred::TIMER_SPEC, Self::lit(spec));
        uri
    }

    pub fn boundary_message(
        &mut self,
        id: &str,
        host: &NamedNode,
        message: &str,
        interrupting: bool,
    ) -> NamedNode {
        let uri = self.boundary(id, host, interrupting);
        self.attr(&uri, pred::MESSAGE_NAME, Self::lit(message));
        uri
    }

    pub fn boundary_cancel(&mut self, id: &str, host: &NamedNode) -> NamedNode {
        let uri = self.boundary(id, host, true);
        self.attr(&uri, pred::CANCEL_END, Self::bool_lit(true));
        uri
    }

    // ── Node attributes ──

    /// Re-parent nodes into a subprocess container.
    pub fn contain(&mut self, container: &NamedNode, nodes: &[&NamedNode]) {
        for node in nodes {
            self.containers.insert((*node).clone(), container.clone());
        }
    }

    pub fn compensation_handler(&mut self, activity: &NamedNode, handler: &NamedNode) {
        self.attr(
            activity,
            pred::COMPENSATION_HANDLER,
            Term::NamedNode(handler.clone()),
        );
    }

    pub fn multi_instance(&mut self, activity: &NamedNode, spec: &MultiInstanceSpec) {
        self.attr(activity, pred::MI_SEQUENTIAL, Self::bool_lit(spec.sequential));
        if let Some(cardinality) = spec.cardinality {
            self.attr(
                activity,
                pred::MI_CARDINALITY,
                Self::int_lit(cardinality as i64),
            );
        }
        if let Some(collection) = &spec.collection {
            self.attr(activity, pred::MI_COLLECTION, Self::lit(collection));
        }
        if let Some(element) = &spec.element_variable {
            self.attr(activity, pred::MI_ELEMENT_VARIABLE, Self::lit(element));
        }
    }

    pub fn listener(&mut self, node: &NamedNode, listener_type: ListenerType, expression: &str) {
        self.listener_count += 1;
        let listener = self.vocab.resource(
            "listener",
            &format!("{}/{}", self.process_id, self.listener_count),
        );
        self.attr(node, pred::LISTENER, Term::NamedNode(listener.clone()));
        self.attr(&listener, pred::LISTENER_TYPE, Self::lit(listener_type.as_str()));
        self.attr(&listener, pred::LISTENER_EXPRESSION, Self::lit(expression));
    }

    pub fn assign(&mut self, task: &NamedNode, assignee: &str) {
        self.attr(task, pred::ASSIGNEE, Self::lit(assignee));
    }

    pub fn candidates(&mut self, task: &NamedNode, users: &[&str], groups: &[&str]) {
        for user in users {
            self.attr(task, pred::CANDIDATE_USER, Self::lit(user));
        }
        for group in groups {
            self.attr(task, pred::CANDIDATE_GROUP, Self::lit(group));
        }
    }

    pub fn priority(&mut self, task: &NamedNode, priority: i64) {
        self.attr(task, pred::PRIORITY, Self::int_lit(priority));
    }

    pub fn due_date(&mut self, task: &NamedNode, due: &str) {
        self.attr(task, pred::DUE_DATE, Self::lit(due));
    }

    pub fn correlate(&mut self, node: &NamedNode, variable: &str) {
        self.attr(node, pred::CORRELATION_VARIABLE, Self::lit(variable));
    }

    // ── Flows ──

    fn new_flow(&mut self, from: &NamedNode, to: &NamedNode) -> NamedNode {
        self.flow_count += 1;
        let flow = self.vocab.resource(
            "flow",
            &format!("{}/f{}", self.process_id, self.flow_count),
        );
        self.triples.push((
            flow.clone(),
            rdf::TYPE.into_owned(),
            Term::NamedNode(self.vocab.class(class::SEQUENCE_FLOW)),
        ));
        self.attr(&flow, pred::SOURCE, Term::NamedNode(from.clone()));
        self.attr(&flow, pred::TARGET, Term::NamedNode(to.clone()));
        self.attr(&flow, pred::FLOW_ORDER, Self::int_lit(self.flow_count as i64));
        flow
    }

    pub fn flow(&mut self, from: &NamedNode, to: &NamedNode) -> NamedNode {
        self.new_flow(from, to)
    }

    pub fn conditional_flow(
        &mut self,
        from: &NamedNode,
        to: &NamedNode,
        variable: &str,
        op: CmpOp,
        value: VariableValue,
    ) -> NamedNode {
        let flow = self.new_flow(from, to);
        let condition = self.vocab.resource(
            "condition",
            &format!("{}/c{}", self.process_id, self.flow_count),
        );
        self.attr(&flow, pred::CONDITION, Term::NamedNode(condition.clone()));
        self.attr(&condition, pred::VARIABLE, Self::lit(variable));
        self.attr(&condition, pred::OPERATOR, Self::lit(op.as_str()));
        self.attr(&condition, pred::VALUE, value.to_term());
        flow
    }

    pub fn ask_flow(&mut self, from: &NamedNode, to: &NamedNode, ask: &str) -> NamedNode {
        let flow = self.new_flow(from, to);
        self.attr(&flow, pred::CONDITION_QUERY, Self::lit(ask));
        flow
    }

    /// Attach an ASK condition to an existing flow.
    pub fn flow_ask(&mut self, flow: &NamedNode, ask: &str) {
        self.attr(flow, pred::CONDITION_QUERY, Self::lit(ask));
    }

    pub fn default_flow(&mut self, from: &NamedNode, to: &NamedNode) -> NamedNode {
        let flow = self.new_flow(from, to);
        self.attr(from, pred::DEFAULT_FLOW, Term::NamedNode(flow.clone()));
        flow
    }

    // ── Build ──

    /// Write the definition into the store and return the process URI.
    pub fn build(&self, store: &dyn GraphStore) -> Result<NamedNode, EngineError> {
        store.add(
            &self.process,
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(self.vocab.class(class::PROCESS)),
        )?;
        for node in &self.node_order {
            let container = self.containers.get(node).unwrap_or(&self.process);
            store.add(
                node,
                &self.vocab.prop(pred::PART_OF),
                &Term::NamedNode(container.clone()),
            )?;
        }
        for (s, p, o) in &self.triples {
            store.add(s, p, o)?;
        }
        Ok(self.process.clone())
    }
}
