use crate::definition::{DefinitionIndex, FlowInfo};
use crate::error::{codes, EngineError};
use crate::store::GraphStore;
use crate::token::TokenService;
use crate::types::{Condition, NodeDescriptor, NodeType, TokenState, VariableValue};
use crate::variables::InstanceService;
use oxigraph::model::{NamedNode, Term};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Routing decision for an activated gateway.
#[derive(Debug)]
pub enum GatewayDecision {
    /// Emit tokens on these flows (one flow = plain move, several = fork).
    Advance(Vec<FlowInfo>),
    /// Park the arriving token; the join is not complete yet.
    Join,
    /// Event-based gateway: arm a race across these flows' catch events.
    EventRace(Vec<FlowInfo>),
}

/// Evaluation result: a decision or a BPMN-level failure to be routed as an
/// `ErrorThrown` event.
#[derive(Debug)]
pub enum GatewayOutcome {
    Decision(GatewayDecision),
    Failure { code: &'static str, message: String },
}

/// A released join: the arrived tokens to consume and the flow to continue on.
#[derive(Debug)]
pub struct JoinRelease {
    pub arrived: Vec<NamedNode>,
    pub flow: FlowInfo,
}

struct ConditionError(String);

/// Exclusive/inclusive/parallel/event-based routing decisions (C7).
pub struct GatewayEvaluator {
    store: Arc<dyn GraphStore>,
    variables: Arc<InstanceService>,
    tokens: Arc<TokenService>,
}

impl GatewayEvaluator {
    pub fn new(
        store: Arc<dyn GraphStore>,
        variables: Arc<InstanceService>,
        tokens: Arc<TokenService>,
    ) -> Self {
        Self {
            store,
            variables,
            tokens,
        }
    }

    /// A flow with no condition is unconditionally true.
    fn eval_condition(
        &self,
        condition: Option<&Condition>,
        instance: &NamedNode,
        scope: Option<&NamedNode>,
    ) -> Result<Result<bool, ConditionError>, EngineError> {
        let Some(condition) = condition else {
            return Ok(Ok(true));
        };
        match condition {
            Condition::Structured {
                variable,
                op,
                value,
            } => {
                let actual = self.variables.get_variable(instance, variable, scope)?;
                let Some(actual) = actual else {
                    return Ok(Err(ConditionError(format!(
                        "variable '{variable}' is not set"
                    ))));
                };
                match actual.compare(value) {
                    Some(ord) => Ok(Ok(op.holds(ord))),
                    None => Ok(Err(ConditionError(format!(
                        "cannot compare {actual} with {value}"
                    )))),
                }
            }
            Condition::Ask(query) => {
                match self
                    .store
                    .ask(query, &[("instance", Term::NamedNode(instance.clone()))])
                {
                    Ok(answer) => Ok(Ok(answer)),
                    Err(e) => Ok(Err(ConditionError(format!("ASK failed: {e}")))),
                }
            }
        }
    }

    /// Route a token arriving at a gateway. Joins return
    /// `GatewayDecision::Join`; the engine parks the token and then calls
    /// `try_release_join`.
    pub fn route(
        &self,
        index: &DefinitionIndex,
        gateway: &NodeDescriptor,
        instance: &NamedNode,
        token: &NamedNode,
    ) -> Result<GatewayOutcome, EngineError> {
        let outgoing = index.outgoing_flows(&gateway.uri);
        let is_join = outgoing.len() == 1 && index.incoming_flows(&gateway.uri).len() > 1;

        match gateway.node_type {
            NodeType::ExclusiveGateway => self.route_exclusive(index, gateway, instance, token),
            NodeType::InclusiveGateway => {
                if is_join {
                    Ok(GatewayOutcome::Decision(GatewayDecision::Join))
                } else {
                    self.route_inclusive(index, gateway, instance, token)
                }
            }
            NodeType::ParallelGateway => {
                if is_join {
                    Ok(GatewayOutcome::Decision(GatewayDecision::Join))
                } else {
                    Ok(GatewayOutcome::Decision(GatewayDecision::Advance(
                        outgoing.to_vec(),
                    )))
                }
            }
            NodeType::EventBasedGateway => Ok(GatewayOutcome::Decision(
                GatewayDecision::EventRace(outgoing.to_vec()),
            )),
            other => Err(EngineError::Definition(format!(
                "{} is not a gateway (got {:?})",
                gateway.uri, other
            ))),
        }
    }

    /// Exclusive: first condition (in definition order) that holds wins; the
    /// default flow catches the rest. A condition error fails the gateway
    /// unless a default flow exists.
    fn route_exclusive(
        &self,
        index: &DefinitionIndex,
        gateway: &NodeDescriptor,
        instance: &NamedNode,
        token: &NamedNode,
    ) -> Result<GatewayOutcome, EngineError> {
        let default = index.default_flow(&gateway.uri);
        for flow in index.outgoing_flows(&gateway.uri) {
            if default.map(|d| &d.uri) == Some(&flow.uri) {
                continue;
            }
            match self.eval_condition(flow.condition.as_ref(), instance, Some(token))? {
                Ok(true) => {
                    return Ok(GatewayOutcome::Decision(GatewayDecision::Advance(vec![
                        flow.clone(),
                    ])))
                }
                Ok(false) => {}
                Err(ConditionError(message)) => {
                    debug!(gateway = gateway.uri.as_str(), %message, "condition evaluation failed");
                    return Ok(match default {
                        Some(default) => GatewayOutcome::Decision(GatewayDecision::Advance(
                            vec![default.clone()],
                        )),
                        None => GatewayOutcome::Failure {
                            code: codes::CONDITION_EVALUATION_FAILED,
                            message,
                        },
                    });
                }
            }
        }
        Ok(match default {
            Some(default) => {
                GatewayOutcome::Decision(GatewayDecision::Advance(vec![default.clone()]))
            }
            None => GatewayOutcome::Failure {
                code: codes::NO_VALID_PATH,
                message: format!("no outgoing condition of {} holds", gateway.uri),
            },
        })
    }

    /// Inclusive split: every flow whose condition holds; condition errors
    /// count as false. Falls back to the default flow, then fails.
    fn route_inclusive(
        &self,
        index: &DefinitionIndex,
        gateway: &NodeDescriptor,
        instance: &NamedNode,
        token: &NamedNode,
    ) -> Result<GatewayOutcome, EngineError> {
        let default = index.default_flow(&gateway.uri);
        let mut selected = Vec::new();
        for flow in index.outgoing_flows(&gateway.uri) {
            if default.map(|d| &d.uri) == Some(&flow.uri) {
                continue;
            }
            if matches!(
                self.eval_condition(flow.condition.as_ref(), instance, Some(token))?,
                Ok(true)
            ) {
                selected.push(flow.clone());
            }
        }
        if selected.is_empty() {
            return Ok(match default {
                Some(default) => {
                    GatewayOutcome::Decision(GatewayDecision::Advance(vec![default.clone()]))
                }
                None => GatewayOutcome::Failure {
                    code: codes::NO_VALID_PATH,
                    message: format!("no outgoing condition of {} holds", gateway.uri),
                },
            });
        }
        Ok(GatewayOutcome::Decision(GatewayDecision::Advance(selected)))
    }

    /// Check whether a join gateway can release, given the tokens currently
    /// parked at it. For a parallel join, tokens from all distinct incoming
    /// flows must have arrived. For an inclusive join, the activation count
    /// recorded at the matching split is the target (1 for tokens that never
    /// went through a split).
    pub fn try_release_join(
        &self,
        index: &DefinitionIndex,
        gateway: &NodeDescriptor,
        instance: &NamedNode,
    ) -> Result<Option<JoinRelease>, EngineError> {
        let outgoing = index.outgoing_flows(&gateway.uri);
        let Some(flow) = outgoing.first() else {
            return Err(EngineError::Definition(format!(
                "join {} has no outgoing flow",
                gateway.uri
            )));
        };

        let mut arrived = Vec::new();
        for token in self.tokens.tokens_at(instance, &gateway.uri)? {
            if self.tokens.state_of(&token)? == TokenState::Waiting {
                arrived.push(token);
            }
        }
        if arrived.is_empty() {
            return Ok(None);
        }

        let ready = match gateway.node_type {
            NodeType::ParallelGateway => {
                let mut distinct = HashSet::new();
                for token in &arrived {
                    if let Some(via) = self.tokens.arrived_via(token)? {
                        distinct.insert(via.as_str().to_string());
                    }
                }
                distinct.len() >= index.incoming_flows(&gateway.uri).len()
            }
            NodeType::InclusiveGateway => {
                let mut expected = 1u32;
                for token in &arrived {
                    if let Some(n) = self.tokens.fork_expected_of(token)? {
                        expected = expected.max(n);
                    }
                }
                arrived.len() as u32 >= expected
            }
            other => {
                return Err(EngineError::Definition(format!(
                    "{:?} gateway {} cannot join",
                    other, gateway.uri
                )))
            }
        };

        if ready {
            debug!(gateway = gateway.uri.as_str(), arrived = arrived.len(), "join released");
            Ok(Some(JoinRelease {
                arrived,
                flow: flow.clone(),
            }))
        } else {
            Ok(None)
        }
    }

    /// Evaluate a single flow's condition for callers outside gateway
    /// routing (used by tests and diagnostic tooling).
    pub fn flow_condition_holds(
        &self,
        flow: &FlowInfo,
        instance: &NamedNode,
        scope: Option<&NamedNode>,
    ) -> Result<bool, EngineError> {
        match self.eval_condition(flow.condition.as_ref(), instance, scope)? {
            Ok(answer) => Ok(answer),
            Err(ConditionError(message)) => Err(EngineError::Value(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authoring::ProcessBuilder;
    use crate::bus::EventBus;
    use crate::scheduler::SystemClock;
    use crate::store::OxiGraphStore;
    use crate::types::CmpOp;
    use crate::vocab::Vocab;
    use std::collections::BTreeMap;

    struct Fixture {
        store: Arc<OxiGraphStore>,
        vocab: Arc<Vocab>,
        variables: Arc<InstanceService>,
        tokens: Arc<TokenService>,
        evaluator: GatewayEvaluator,
    }

    fn fixture() -> Fixture {
        let store: Arc<OxiGraphStore> = Arc::new(OxiGraphStore::new().unwrap());
        let vocab = Arc::new(Vocab::default());
        let bus = Arc::new(EventBus::new());
        let variables = Arc::new(InstanceService::new(
            store.clone(),
            vocab.clone(),
            bus.clone(),
            Arc::new(SystemClock),
        ));
        let tokens = Arc::new(TokenService::new(store.clone(), vocab.clone(), bus));
        let evaluator = GatewayEvaluator::new(store.clone(), variables.clone(), tokens.clone());
        Fixture {
            store,
            vocab,
            variables,
            tokens,
            evaluator,
        }
    }

    fn exclusive_process(f: &Fixture) -> (DefinitionIndex, NamedNode, NamedNode, NamedNode) {
        let mut b = ProcessBuilder::new(&f.vocab, "route");
        let start = b.start_event("start");
        let gw = b.exclusive_gateway("decide");
        let a = b.end_event("a");
        let bb = b.end_event("b");
        b.flow(&start, &gw);
        let high = b.conditional_flow(&gw, &a, "amount", CmpOp::Gt, VariableValue::Integer(1000));
        b.default_flow(&gw, &bb);
        let process = b.build(f.store.as_ref()).unwrap();
        let index = DefinitionIndex::build(f.store.as_ref(), &f.vocab, &process).unwrap();
        (index, gw, high, process)
    }

    fn advance_targets(outcome: GatewayOutcome) -> Vec<NamedNode> {
        match outcome {
            GatewayOutcome::Decision(GatewayDecision::Advance(flows)) => {
                flows.into_iter().map(|f| f.target).collect()
            }
            other => panic!("expected Advance, got {other:?}"),
        }
    }

    #[test]
    fn test_exclusive_picks_matching_flow_or_default() {
        let f = fixture();
        let (index, gw, high, process) = exclusive_process(&f);
        let gateway = index.node(&gw).unwrap().clone();

        let instance = f
            .variables
            .create_instance(&process, &BTreeMap::new(), None)
            .unwrap();
        let token = f.tokens.create_token(&instance, &gw, None, None).unwrap();

        f.variables
            .set_variable(&instance, "amount", VariableValue::Integer(1500), None)
            .unwrap();
        let outcome = f.evaluator.route(&index, &gateway, &instance, &token).unwrap();
        let high_target = index.flow(&high).unwrap().target.clone();
        assert_eq!(advance_targets(outcome), vec![high_target]);

        f.variables
            .set_variable(&instance, "amount", VariableValue::Integer(500), None)
            .unwrap();
        let outcome = f.evaluator.route(&index, &gateway, &instance, &token).unwrap();
        let default_target = index.default_flow(&gw).unwrap().target.clone();
        assert_eq!(advance_targets(outcome), vec![default_target]);
    }

    #[test]
    fn test_exclusive_condition_error_takes_default_or_fails() {
        let f = fixture();
        let (index, gw, _, process) = exclusive_process(&f);
        let gateway = index.node(&gw).unwrap().clone();
        let instance = f
            .variables
            .create_instance(&process, &BTreeMap::new(), None)
            .unwrap();
        let token = f.tokens.create_token(&instance, &gw, None, None).unwrap();

        // "amount" not set: evaluation error, but a default exists
        let outcome = f.evaluator.route(&index, &gateway, &instance, &token).unwrap();
        let default_target = index.default_flow(&gw).unwrap().target.clone();
        assert_eq!(advance_targets(outcome), vec![default_target]);

        // same shape without a default: ConditionEvaluationFailed
        let mut b = ProcessBuilder::new(&f.vocab, "route2");
        let start = b.start_event("start");
        let gw2 = b.exclusive_gateway("decide");
        let a = b.end_event("a");
        b.flow(&start, &gw2);
        b.conditional_flow(&gw2, &a, "amount", CmpOp::Gt, VariableValue::Integer(1000));
        let process2 = b.build(f.store.as_ref()).unwrap();
        let index2 = DefinitionIndex::build(f.store.as_ref(), &f.vocab, &process2).unwrap();
        let gateway2 = index2.node(&gw2).unwrap().clone();
        let instance2 = f
            .variables
            .create_instance(&process2, &BTreeMap::new(), None)
            .unwrap();
        let token2 = f.tokens.create_token(&instance2, &gw2, None, None).unwrap();

        match f
            .evaluator
            .route(&index2, &gateway2, &instance2, &token2)
            .unwrap()
        {
            GatewayOutcome::Failure { code, .. } => {
                assert_eq!(code, codes::CONDITION_EVALUATION_FAILED)
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_exclusive_no_valid_path() {
        let f = fixture();
        let mut b = ProcessBuilder::new(&f.vocab, "deadend");
        let start = b.start_event("start");
        let gw = b.exclusive_gateway("decide");
        let a = b.end_event("a");
        b.flow(&start, &gw);
        b.conditional_flow(&gw, &a, "amount", CmpOp::Gt, VariableValue::Integer(1000));
        let process = b.build(f.store.as_ref()).unwrap();
        let index = DefinitionIndex::build(f.store.as_ref(), &f.vocab, &process).unwrap();
        let gateway = index.node(&gw).unwrap().clone();

        let instance = f
            .variables
            .create_instance(&process, &BTreeMap::new(), None)
            .unwrap();
        f.variables
            .set_variable(&instance, "amount", VariableValue::Integer(10), None)
            .unwrap();
        let token = f.tokens.create_token(&instance, &gw, None, None).unwrap();

        match f.evaluator.route(&index, &gateway, &instance, &token).unwrap() {
            GatewayOutcome::Failure { code, .. } => assert_eq!(code, codes::NO_VALID_PATH),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_inclusive_selects_every_holding_flow() {
        let f = fixture();
        let mut b = ProcessBuilder::new(&f.vocab, "or");
        let start = b.start_event("start");
        let gw = b.inclusive_gateway("split");
        let a = b.end_event("a");
        let c = b.end_event("b");
        let d = b.end_event("c");
        b.flow(&start, &gw);
        b.conditional_flow(&gw, &a, "x", CmpOp::Ge, VariableValue::Integer(1));
        b.conditional_flow(&gw, &c, "x", CmpOp::Ge, VariableValue::Integer(10));
        b.default_flow(&gw, &d);
        let process = b.build(f.store.as_ref()).unwrap();
        let index = DefinitionIndex::build(f.store.as_ref(), &f.vocab, &process).unwrap();
        let gateway = index.node(&gw).unwrap().clone();

        let instance = f
            .variables
            .create_instance(&process, &BTreeMap::new(), None)
            .unwrap();
        let token = f.tokens.create_token(&instance, &gw, None, None).unwrap();

        f.variables
            .set_variable(&instance, "x", VariableValue::Integer(5), None)
            .unwrap();
        assert_eq!(
            advance_targets(f.evaluator.route(&index, &gateway, &instance, &token).unwrap()),
            vec![a.clone()]
        );

        f.variables
            .set_variable(&instance, "x", VariableValue::Integer(50), None)
            .unwrap();
        assert_eq!(
            advance_targets(f.evaluator.route(&index, &gateway, &instance, &token).unwrap())
                .len(),
            2
        );

        // nothing holds: default
        f.variables
            .set_variable(&instance, "x", VariableValue::Integer(0), None)
            .unwrap();
        assert_eq!(
            advance_targets(f.evaluator.route(&index, &gateway, &instance, &token).unwrap()),
            vec![d]
        );
    }

    #[test]
    fn test_parallel_join_waits_for_all_incoming_flows() {
        let f = fixture();
        let mut b = ProcessBuilder::new(&f.vocab, "and");
        let start = b.start_event("start");
        let split = b.parallel_gateway("split");
        let t1 = b.script_task("t1", "a = 1");
        let t2 = b.script_task("t2", "b = 1");
        let join = b.parallel_gateway("join");
        let end = b.end_event("end");
        b.flow(&start, &split);
        b.flow(&split, &t1);
        b.flow(&split, &t2);
        let f1 = b.flow(&t1, &join);
        let f2 = b.flow(&t2, &join);
        b.flow(&join, &end);
        let process = b.build(f.store.as_ref()).unwrap();
        let index = DefinitionIndex::build(f.store.as_ref(), &f.vocab, &process).unwrap();
        let join_desc = index.node(&join).unwrap().clone();

        let instance = f
            .variables
            .create_instance(&process, &BTreeMap::new(), None)
            .unwrap();

        // first branch arrives
        let tok1 = f.tokens.create_token(&instance, &t1, None, None).unwrap();
        f.tokens.move_token(&tok1, &join, Some(&f1)).unwrap();
        f.tokens
            .mark_waiting(&tok1, crate::types::WaitKind::Join)
            .unwrap();
        assert!(f
            .evaluator
            .try_release_join(&index, &join_desc, &instance)
            .unwrap()
            .is_none());

        // second branch arrives on the other flow
        let tok2 = f.tokens.create_token(&instance, &t2, None, None).unwrap();
        f.tokens.move_token(&tok2, &join, Some(&f2)).unwrap();
        f.tokens
            .mark_waiting(&tok2, crate::types::WaitKind::Join)
            .unwrap();
        let release = f
            .evaluator
            .try_release_join(&index, &join_desc, &instance)
            .unwrap()
            .unwrap();
        assert_eq!(release.arrived.len(), 2);
        assert_eq!(release.flow.target, end);
    }

    #[test]
    fn test_ask_condition_routes_on_graph_state() {
        let f = fixture();
        let mut b = ProcessBuilder::new(&f.vocab, "ask");
        let start = b.start_event("start");
        let gw = b.exclusive_gateway("decide");
        let yes = b.end_event("yes");
        let no = b.end_event("no");
        b.flow(&start, &gw);
        let vocab_base = f.vocab.base().to_string();
        b.ask_flow(
            &gw,
            &yes,
            &format!("ASK {{ ?instance <{vocab_base}vocab#varName> ?v }}"),
        );
        b.default_flow(&gw, &no);
        let process = b.build(f.store.as_ref()).unwrap();
        let index = DefinitionIndex::build(f.store.as_ref(), &f.vocab, &process).unwrap();
        let gateway = index.node(&gw).unwrap().clone();

        let instance = f
            .variables
            .create_instance(&process, &BTreeMap::new(), None)
            .unwrap();
        let token = f.tokens.create_token(&instance, &gw, None, None).unwrap();

        // instance has no varName triple on itself: ASK false, default taken
        assert_eq!(
            advance_targets(f.evaluator.route(&index, &gateway, &instance, &token).unwrap()),
            vec![no]
        );

        // add a matching triple and the ASK answers true
        f.store
            .add(
                &instance,
                &f.vocab.prop(crate::vocab::pred::VAR_NAME),
                &Term::Literal(oxigraph::model::Literal::new_simple_literal("marker")),
            )
            .unwrap();
        assert_eq!(
            advance_targets(f.evaluator.route(&index, &gateway, &instance, &token).unwrap()),
            vec![yes]
        );
    }
}
