use crate::audit::AuditService;
use crate::bus::EventBus;
use crate::definition::{DefinitionIndex, FlowInfo};
use crate::error::{codes, EngineError};
use crate::events::ExecutionEvent;
use crate::gateway::{GatewayDecision, GatewayEvaluator, GatewayOutcome};
use crate::registry::{HandlerError, ServiceContext, TopicRegistry};
use crate::scheduler::{Clock, TimerService};
use crate::store::GraphStore;
use crate::tasks::TaskService;
use crate::token::TokenService;
use crate::types::{
    InstanceState, ListenerType, NodeDescriptor, NodeType, TimerDefinition, TimerRegistration,
    TokenState, VariableValue, WaitKind,
};
use crate::variables::InstanceService;
use crate::vocab::{class, pred, Vocab};
use chrono::{DateTime, Utc};
use oxigraph::model::vocab::{rdf, xsd};
use oxigraph::model::{Literal, NamedNode, Term};
use serde_json::json;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Engine construction knobs.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Base IRI under which all resources and the vocabulary live.
    pub base_iri: String,
    /// Cadence applied to instances with `nextRunAt` but no explicit cadence.
    pub default_cadence_seconds: u64,
    /// Upper bound on node executions per resume; exceeding it fails the
    /// instance instead of spinning.
    pub max_steps_per_resume: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_iri: crate::vocab::DEFAULT_BASE.to_string(),
            default_cadence_seconds: 60,
            max_steps_per_resume: 10_000,
        }
    }
}

thread_local! {
    /// Instance lanes held by the current thread, so nested engine calls
    /// (subprocess completion, in-process message sends) re-enter their lane
    /// instead of deadlocking.
    static LANE_STACK: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// A recorded compensable: a completed activity whose compensation handler
/// may still be invoked.
struct Compensable {
    record: NamedNode,
    activity: NamedNode,
    handler: NamedNode,
    scope_depth: u64,
    completion_seq: u64,
}

/// The execution core (C8): drives tokens through nodes, dispatches on node
/// kind, and owns the per-instance execution lanes.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn GraphStore>,
    vocab: Arc<Vocab>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    instances: Arc<InstanceService>,
    tokens: Arc<TokenService>,
    tasks: Arc<TaskService>,
    timers: Arc<TimerService>,
    registry: Arc<TopicRegistry>,
    gateways: GatewayEvaluator,
    audit: Arc<AuditService>,
    indexes: RwLock<HashMap<String, Arc<DefinitionIndex>>>,
    lanes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    compensation_seq: AtomicU64,
}

impl Engine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        registry: Arc<TopicRegistry>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Arc<Engine> {
        let vocab = Arc::new(Vocab::new(&config.base_iri));
        let bus = Arc::new(EventBus::new());
        let instances = Arc::new(InstanceService::new(
            store.clone(),
            vocab.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let tokens = Arc::new(TokenService::new(store.clone(), vocab.clone(), bus.clone()));
        let tasks = Arc::new(TaskService::new(
            store.clone(),
            vocab.clone(),
            bus.clone(),
            clock.clone(),
        ));
        let timers = Arc::new(TimerService::new(store.clone(), vocab.clone()));
        let gateways = GatewayEvaluator::new(store.clone(), instances.clone(), tokens.clone());
        let audit = Arc::new(AuditService::new(store.clone(), vocab.clone(), clock.clone()));
        audit.attach(&bus);

        Arc::new(Engine {
            config,
            store,
            vocab,
            bus,
            clock,
            instances,
            tokens,
            tasks,
            timers,
            registry,
            gateways,
            audit,
            indexes: RwLock::new(HashMap::new()),
            lanes: Mutex::new(HashMap::new()),
            compensation_seq: AtomicU64::new(1),
        })
    }

    // ── Accessors ──

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    pub fn vocab(&self) -> &Arc<Vocab> {
        &self.vocab
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn instances(&self) -> &Arc<InstanceService> {
        &self.instances
    }

    pub fn tokens(&self) -> &Arc<TokenService> {
        &self.tokens
    }

    pub fn tasks(&self) -> &Arc<TaskService> {
        &self.tasks
    }

    pub fn timers(&self) -> &Arc<TimerService> {
        &self.timers
    }

    pub fn audit(&self) -> &Arc<AuditService> {
        &self.audit
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    // ── Definition indexes ──

    fn root_process_of(&self, container: &NamedNode) -> Result<NamedNode, EngineError> {
        let mut cur = container.clone();
        while let Some(parent) = self
            .store
            .value_node(&cur, &self.vocab.prop(pred::PART_OF))?
        {
            cur = parent;
        }
        Ok(cur)
    }

    /// The (cached) index covering a process or any container within it.
    pub fn index_for(&self, container: &NamedNode) -> Result<Arc<DefinitionIndex>, EngineError> {
        let root = self.root_process_of(container)?;
        if let Some(index) = self
            .indexes
            .read()
            .expect("index lock poisoned")
            .get(root.as_str())
        {
            return Ok(index.clone());
        }
        let index = Arc::new(DefinitionIndex::build(
            self.store.as_ref(),
            &self.vocab,
            &root,
        )?);
        self.indexes
            .write()
            .expect("index lock poisoned")
            .insert(root.as_str().to_string(), index.clone());
        Ok(index)
    }

    /// Drop a cached index after the definition subgraph was mutated.
    pub fn invalidate_index(&self, process: &NamedNode) {
        self.indexes
            .write()
            .expect("index lock poisoned")
            .remove(process.as_str());
    }

    fn index_for_instance(&self, instance: &NamedNode) -> Result<Arc<DefinitionIndex>, EngineError> {
        let process = self.instances.process_of(instance)?;
        self.index_for(&process)
    }

    // ── Lanes ──

    fn root_instance_of(&self, instance: &NamedNode) -> Result<NamedNode, EngineError> {
        let mut cur = instance.clone();
        loop {
            match self.instances.parent_token_of(&cur)? {
                Some(parent_token) => cur = self.tokens.instance_of(&parent_token)?,
                None => return Ok(cur),
            }
        }
    }

    /// Run `f` while holding the instance tree's execution lane. Re-entrant
    /// per thread: nested calls on the same lane run directly.
    fn with_lane<R>(
        &self,
        instance: &NamedNode,
        f: impl FnOnce() -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let root = self.root_instance_of(instance)?.as_str().to_string();
        let already_held = LANE_STACK.with(|stack| stack.borrow().contains(&root));
        if already_held {
            return f();
        }
        let lane = {
            let mut lanes = self.lanes.lock().expect("lane lock poisoned");
            lanes
                .entry(root.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lane.lock().expect("lane poisoned");
        LANE_STACK.with(|stack| stack.borrow_mut().push(root.clone()));
        let result = f();
        LANE_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
        result
    }

    // ── Entry points ──

    /// Start a new instance of a process definition. Definition errors at
    /// this point (invalid structure, missing start event) propagate to the
    /// caller; nothing is created.
    pub fn start_instance(
        &self,
        process: &NamedNode,
        initial_variables: BTreeMap<String, VariableValue>,
        start_event: Option<&NamedNode>,
    ) -> Result<NamedNode, EngineError> {
        let index = self.index_for(process)?;
        let errors = index.validate();
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(ToString::to_string).collect();
            return Err(EngineError::Definition(messages.join("; ")));
        }
        let start = match start_event {
            Some(start) => {
                if index.node_type(start)? != NodeType::StartEvent {
                    return Err(EngineError::Definition(format!(
                        "{start} is not a start event"
                    )));
                }
                start.clone()
            }
            None => index
                .start_event_of(process)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Definition(format!(
                        "{}: process {process} has no start event",
                        codes::MISSING_START_EVENT
                    ))
                })?,
        };

        let instance = self
            .instances
            .create_instance(process, &initial_variables, None)?;
        info!(instance = instance.as_str(), process = process.as_str(), "instance started");
        self.with_lane(&instance, || {
            self.tokens.create_token(&instance, &start, None, None)?;
            self.run_to_quiescence(&instance)
        })?;
        Ok(instance)
    }

    /// Complete an open user task, applying its completion variables and
    /// resuming the owning token.
    pub fn complete_task(
        &self,
        task: &NamedNode,
        completed_by: &str,
        variables: BTreeMap<String, VariableValue>,
    ) -> Result<(), EngineError> {
        let instance = self.tasks.record(task)?.instance;
        self.with_lane(&instance, || {
            let state = self.instances.state(&instance)?;
            if state != InstanceState::Active {
                return Err(EngineError::InstanceNotActive {
                    instance: instance.as_str().to_string(),
                    state: state.as_str().to_string(),
                });
            }
            for (name, value) in &variables {
                self.instances
                    .set_variable(&instance, name, value.clone(), None)?;
            }
            let record = self.tasks.mark_completed(task, completed_by, &variables)?;
            let index = self.index_for_instance(&instance)?;
            let descriptor = index.node(&record.node)?.clone();
            self.fire_listeners(&instance, &descriptor, ListenerType::Complete, Some(&record.token))?;
            self.finish_activity(&instance, &index, &descriptor, &record.token)?;
            self.run_to_quiescence(&instance)
        })
    }

    /// Claim a task for a user (publishes the assignment listener hook).
    pub fn claim_task(&self, task: &NamedNode, user: &str) -> Result<(), EngineError> {
        let record = self.tasks.record(task)?;
        self.with_lane(&record.instance, || {
            self.tasks.claim(task, user)?;
            let index = self.index_for_instance(&record.instance)?;
            let descriptor = index.node(&record.node)?.clone();
            self.fire_listeners(
                &record.instance,
                &descriptor,
                ListenerType::Assignment,
                Some(&record.token),
            )
        })
    }

    /// Deliver an external message. Returns true if a waiting token matched;
    /// an unmatched message is dropped (no buffering).
    pub fn deliver_message(
        &self,
        name: &str,
        correlation_key: Option<&VariableValue>,
        payload: &BTreeMap<String, VariableValue>,
    ) -> Result<bool, EngineError> {
        self.bus.publish(&ExecutionEvent::MessageSent {
            name: name.to_string(),
            correlation_key: correlation_key.cloned(),
            payload: payload.clone(),
            source_instance: None,
            source_node: None,
        })?;
        self.route_message(name, correlation_key, payload)
    }

    fn route_message(
        &self,
        name: &str,
        correlation_key: Option<&VariableValue>,
        payload: &BTreeMap<String, VariableValue>,
    ) -> Result<bool, EngineError> {
        for (token, wait_correlation) in self.tokens.message_waits(name)? {
            let matches = match (correlation_key, &wait_correlation) {
                (Some(key), Some(wait_key)) => key == wait_key,
                (Some(_), None) => false,
                // a message without a key matches any wait on the name
                (None, _) => true,
            };
            if !matches {
                continue;
            }
            let instance = self.tokens.instance_of(&token)?;
            let delivered = self.with_lane(&instance, || {
                if self.instances.state(&instance)? != InstanceState::Active {
                    return Ok(false);
                }
                if self.tokens.state_of(&token)? != TokenState::Waiting {
                    return Ok(false);
                }
                for (key, value) in payload {
                    self.instances
                        .set_variable(&instance, key, value.clone(), None)?;
                }
                self.bus.publish(&ExecutionEvent::MessageReceived {
                    instance: instance.clone(),
                    node: self.tokens.node_of(&token)?,
                    token: token.clone(),
                    name: name.to_string(),
                    payload: payload.clone(),
                })?;
                self.resume_waiting_token(&instance, &token)?;
                self.run_to_quiescence(&instance)?;
                Ok(true)
            })?;
            if delivered {
                return Ok(true);
            }
        }
        debug!(message = name, "no waiting receiver for message");
        Ok(false)
    }

    /// Fire the timer a token is waiting on, regardless of its deadline.
    pub fn signal_timer(&self, token: &NamedNode) -> Result<(), EngineError> {
        let Some(registration) = self.timers.registration_for_token(token)? else {
            return Err(EngineError::UnknownToken(format!(
                "{token} has no timer registration"
            )));
        };
        self.fire_timer(registration)
    }

    /// Pause an active instance. External inputs are rejected (tasks) or
    /// skipped (messages, timers) until it is resumed.
    pub fn suspend_instance(&self, instance: &NamedNode) -> Result<(), EngineError> {
        self.with_lane(instance, || {
            let state = self.instances.state(instance)?;
            if state != InstanceState::Active {
                return Err(EngineError::InstanceNotActive {
                    instance: instance.as_str().to_string(),
                    state: state.as_str().to_string(),
                });
            }
            self.instances
                .set_state(instance, InstanceState::Suspended, None)
        })
    }

    /// Re-enter the step loop for an instance, waking it from suspension if
    /// needed (also used by the scheduler).
    pub fn resume_instance(&self, instance: &NamedNode) -> Result<(), EngineError> {
        self.with_lane(instance, || {
            let state = self.instances.state(instance)?;
            if state.is_terminal() {
                return Ok(());
            }
            if state == InstanceState::Suspended {
                self.instances
                    .set_state(instance, InstanceState::Active, None)?;
            }
            self.run_to_quiescence(instance)
        })
    }

    // ── Scheduler hooks ──

    /// Fire every due timer registration. Failures are isolated per timer.
    pub fn fire_due_timers(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        for registration in self.timers.due(now)? {
            let uri = registration.uri.clone();
            if let Err(e) = self.fire_timer(registration) {
                warn!(timer = uri.as_str(), error = %e, "timer fire failed");
            }
        }
        Ok(())
    }

    /// Resume instances whose `nextRunAt` is due and re-arm their cadence.
    pub fn resume_due_instances(&self, now: DateTime<Utc>) -> Result<(), EngineError> {
        for instance in self.instances.due_instances(now)? {
            let result = (|| -> Result<(), EngineError> {
                let cadence = self
                    .instances
                    .cadence_seconds(&instance)?
                    .unwrap_or(self.config.default_cadence_seconds);
                self.instances
                    .mark_ran(&instance, now + chrono::Duration::seconds(cadence as i64))?;
                if !self.instances.state(&instance)?.is_terminal() {
                    self.resume_instance(&instance)?;
                }
                Ok(())
            })();
            if let Err(e) = result {
                warn!(instance = instance.as_str(), error = %e, "cadence resume failed");
            }
        }
        Ok(())
    }

    // ── Step loop ──

    fn run_to_quiescence(&self, instance: &NamedNode) -> Result<(), EngineError> {
        let mut steps = 0usize;
        loop {
            if self.instances.state(instance)?.is_terminal() {
                return Ok(());
            }
            let runnable = self.tokens.runnable_tokens(instance)?;
            if runnable.is_empty() {
                return self.check_completion(instance);
            }
            for token in runnable {
                if self.instances.state(instance)?.is_terminal() {
                    return Ok(());
                }
                if self.tokens.state_of(&token)? != TokenState::Live {
                    continue;
                }
                steps += 1;
                if steps > self.config.max_steps_per_resume {
                    warn!(instance = instance.as_str(), "step limit exceeded");
                    return self.instances.set_state(
                        instance,
                        InstanceState::Failed,
                        Some("step limit exceeded"),
                    );
                }
                self.step_token(instance, &token)?;
            }
        }
    }

    fn step_token(&self, instance: &NamedNode, token: &NamedNode) -> Result<(), EngineError> {
        let index = self.index_for_instance(instance)?;
        let node = self.tokens.node_of(token)?;
        let descriptor = index.node(&node)?.clone();
        debug!(
            instance = instance.as_str(),
            token = token.as_str(),
            node = node.as_str(),
            kind = descriptor.node_type.as_local(),
            "step"
        );

        self.bus.publish(&ExecutionEvent::AuditLog {
            instance: instance.clone(),
            event_type: "nodeEntered".to_string(),
            node: Some(node.clone()),
            details: json!({
                "token": token.as_str(),
                "nodeType": descriptor.node_type.as_local(),
            }),
            user: None,
        })?;
        self.fire_listeners(instance, &descriptor, ListenerType::Start, Some(token))?;

        // Multi-instance wrapper: the first arrival spawns the per-iteration
        // tokens; tokens carrying a loopIndex run the activity itself.
        if descriptor.multi_instance.is_some()
            && descriptor.node_type.is_activity()
            && self.tokens.loop_index_of(token)?.is_none()
        {
            return self.start_multi_instance(instance, &index, &descriptor, token);
        }

        match descriptor.node_type {
            NodeType::StartEvent | NodeType::BoundaryEvent => {
                let flows = index.outgoing_flows(&node).to_vec();
                self.take_flows(instance, &index, token, &flows, None)?;
                Ok(())
            }
            NodeType::EndEvent => self.run_end_event(instance, &index, &descriptor, token),
            NodeType::ServiceTask => self.run_service_task(instance, &index, &descriptor, token),
            NodeType::ScriptTask => self.run_script_task(instance, &index, &descriptor, token),
            NodeType::UserTask => self.run_user_task(instance, &index, &descriptor, token),
            NodeType::ReceiveTask => self.run_message_catch(instance, &index, &descriptor, token),
            NodeType::IntermediateCatchEvent => {
                if descriptor.message_name.is_some() {
                    self.run_message_catch(instance, &index, &descriptor, token)
                } else if descriptor.timer.is_some() {
                    self.run_timer_catch(instance, &index, &descriptor, token)
                } else {
                    Err(EngineError::Definition(format!(
                        "catch event {node} has neither message nor timer"
                    )))
                }
            }
            NodeType::IntermediateThrowEvent => {
                self.run_throw_event(instance, &index, &descriptor, token)
            }
            NodeType::ExclusiveGateway
            | NodeType::ParallelGateway
            | NodeType::InclusiveGateway
            | NodeType::EventBasedGateway => {
                self.run_gateway(instance, &index, &descriptor, token)
            }
            NodeType::Subprocess | NodeType::CallActivity => {
                self.start_subprocess(instance, &index, &descriptor, token)
            }
        }
    }

    // ── Node handlers ──

    fn run_end_event(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        self.tokens.consume_token(token)?;
        self.fire_listeners(instance, descriptor, ListenerType::End, Some(token))?;

        if descriptor.terminate_end {
            self.bus.publish(&ExecutionEvent::TerminateTriggered {
                instance: instance.clone(),
                source_node: Some(descriptor.uri.clone()),
            })?;
            return self.terminate_instance(instance);
        }
        if descriptor.cancel_end {
            return self.cancel_scope(instance, descriptor);
        }
        if let Some(code) = &descriptor.error_code {
            self.bus.publish(&ExecutionEvent::ErrorThrown {
                instance: instance.clone(),
                source_node: descriptor.uri.clone(),
                code: code.clone(),
                message: format!("error end event {}", descriptor.uri),
                token: Some(token.clone()),
            })?;
            return self.route_error(
                instance,
                index,
                &descriptor.uri,
                code,
                &format!("error end event {}", descriptor.uri),
            );
        }
        self.check_completion(instance)
    }

    fn run_service_task(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        let topic = descriptor.topic.clone().unwrap_or_default();
        let input = self.instances.visible_variables(instance, Some(token))?;
        self.bus.publish(&ExecutionEvent::ServiceTaskExecute {
            instance: instance.clone(),
            node: descriptor.uri.clone(),
            token: token.clone(),
            topic: topic.clone(),
            input_variables: input,
        })?;

        let Some(handler) = self.registry.resolve(&topic) else {
            return self.throw_error(
                instance,
                index,
                descriptor,
                token,
                codes::TOPIC_MISSING,
                &format!("no handler registered for topic '{topic}'"),
            );
        };

        let mut ctx = ServiceContext::new(instance, &descriptor.uri, token, &self.instances);
        match handler(&mut ctx) {
            Ok(()) => {
                let outputs = ctx.written().clone();
                self.bus.publish(&ExecutionEvent::ServiceTaskCompleted {
                    instance: instance.clone(),
                    node: descriptor.uri.clone(),
                    token: token.clone(),
                    output_variables: outputs,
                })?;
                self.finish_activity(instance, index, descriptor, token)
            }
            Err(HandlerError::Fail(failure)) => self.throw_error(
                instance,
                index,
                descriptor,
                token,
                &failure.code,
                &failure.message,
            ),
            Err(HandlerError::Engine(e)) => Err(e),
        }
    }

    fn run_script_task(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        if let Some(script) = &descriptor.script {
            for statement in script.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                let Some((name, value)) = statement.split_once('=') else {
                    return Err(EngineError::Definition(format!(
                        "script statement '{statement}' in {} is not an assignment",
                        descriptor.uri
                    )));
                };
                self.instances.set_variable(
                    instance,
                    name.trim(),
                    VariableValue::parse_lexical(value),
                    None,
                )?;
            }
        }
        self.finish_activity(instance, index, descriptor, token)
    }

    fn run_user_task(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        self.tasks.create_task(instance, descriptor, token)?;
        self.fire_listeners(instance, descriptor, ListenerType::Create, Some(token))?;
        if descriptor.assignee.is_some() {
            self.fire_listeners(instance, descriptor, ListenerType::Assignment, Some(token))?;
        }
        self.tokens.mark_waiting(token, WaitKind::Task)?;
        self.arm_boundaries(instance, index, descriptor, token)
    }

    fn run_message_catch(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        let Some(name) = &descriptor.message_name else {
            return Err(EngineError::Definition(format!(
                "{} has no message name",
                descriptor.uri
            )));
        };
        let correlation = self.resolve_correlation(instance, descriptor, token)?;
        self.tokens
            .register_message_wait(token, name, correlation.as_ref())?;
        if descriptor.node_type.is_activity() {
            self.arm_boundaries(instance, index, descriptor, token)?;
        }
        Ok(())
    }

    fn run_timer_catch(
        &self,
        instance: &NamedNode,
        _index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        let Some(timer) = &descriptor.timer else {
            return Err(EngineError::Definition(format!(
                "{} has no timer specification",
                descriptor.uri
            )));
        };
        self.tokens.mark_waiting(token, WaitKind::Timer)?;
        self.timers.register(
            instance,
            &descriptor.uri,
            token,
            timer.fire_at(self.clock.now()),
            None,
        )?;
        Ok(())
    }

    fn run_throw_event(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        if let Some(name) = &descriptor.message_name {
            let payload = self.instances.visible_variables(instance, Some(token))?;
            let correlation = self.resolve_correlation(instance, descriptor, token)?;
            self.bus.publish(&ExecutionEvent::MessageSent {
                name: name.clone(),
                correlation_key: correlation.clone(),
                payload: payload.clone(),
                source_instance: Some(instance.clone()),
                source_node: Some(descriptor.uri.clone()),
            })?;
            self.route_message(name, correlation.as_ref(), &payload)?;
        } else if descriptor.compensation_throw {
            self.bus.publish(&ExecutionEvent::CompensationTriggered {
                instance: instance.clone(),
                activity: descriptor.compensate_activity.clone(),
                source_node: Some(descriptor.uri.clone()),
            })?;
            self.run_compensation(instance, descriptor.compensate_activity.as_ref())?;
        }
        let flows = index.outgoing_flows(&descriptor.uri).to_vec();
        self.take_flows(instance, index, token, &flows, None)?;
        Ok(())
    }

    fn run_gateway(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        match self.gateways.route(index, descriptor, instance, token)? {
            GatewayOutcome::Failure { code, message } => {
                self.throw_error(instance, index, descriptor, token, code, &message)
            }
            GatewayOutcome::Decision(GatewayDecision::Advance(flows)) => {
                self.bus.publish(&ExecutionEvent::GatewayEvaluated {
                    instance: instance.clone(),
                    gateway: descriptor.uri.clone(),
                    token: token.clone(),
                    selected_flows: flows.iter().map(|f| f.uri.clone()).collect(),
                    gateway_type: descriptor.node_type,
                })?;
                let fork_meta = (descriptor.node_type == NodeType::InclusiveGateway
                    && flows.len() > 1)
                    .then(|| flows.len() as u32);
                self.take_flows(instance, index, token, &flows, fork_meta)?;
                Ok(())
            }
            GatewayOutcome::Decision(GatewayDecision::Join) => {
                self.tokens.mark_waiting(token, WaitKind::Join)?;
                if let Some(release) = self.gateways.try_release_join(index, descriptor, instance)? {
                    self.bus.publish(&ExecutionEvent::GatewayEvaluated {
                        instance: instance.clone(),
                        gateway: descriptor.uri.clone(),
                        token: token.clone(),
                        selected_flows: vec![release.flow.uri.clone()],
                        gateway_type: descriptor.node_type,
                    })?;
                    let parent = self.tokens.parent_of(&release.arrived[0])?;
                    for arrived in &release.arrived {
                        self.tokens.consume_token(arrived)?;
                    }
                    let merged = self.tokens.create_token(
                        instance,
                        &descriptor.uri,
                        parent.as_ref(),
                        None,
                    )?;
                    self.tokens
                        .move_token(&merged, &release.flow.target, Some(&release.flow.uri))?;
                    self.fire_listeners(instance, descriptor, ListenerType::Take, Some(&merged))?;
                }
                Ok(())
            }
            GatewayOutcome::Decision(GatewayDecision::EventRace(flows)) => {
                self.bus.publish(&ExecutionEvent::GatewayEvaluated {
                    instance: instance.clone(),
                    gateway: descriptor.uri.clone(),
                    token: token.clone(),
                    selected_flows: flows.iter().map(|f| f.uri.clone()).collect(),
                    gateway_type: descriptor.node_type,
                })?;
                self.tokens.mark_waiting(token, WaitKind::Race)?;
                for flow in &flows {
                    let target = index.node(&flow.target)?.clone();
                    let arm = self
                        .tokens
                        .create_token(instance, &flow.target, Some(token), None)?;
                    self.tokens.set_race_group(&arm, token)?;
                    if let Some(name) = &target.message_name {
                        let correlation = self.resolve_correlation(instance, &target, &arm)?;
                        self.tokens
                            .register_message_wait(&arm, name, correlation.as_ref())?;
                    } else if let Some(timer) = &target.timer {
                        self.tokens.mark_waiting(&arm, WaitKind::Timer)?;
                        self.timers.register(
                            instance,
                            &flow.target,
                            &arm,
                            timer.fire_at(self.clock.now()),
                            None,
                        )?;
                    } else {
                        return Err(EngineError::Definition(format!(
                            "event gateway {} target {} is not a message or timer catch",
                            descriptor.uri, flow.target
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    fn start_subprocess(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        let (child_process, child_start) = match descriptor.node_type {
            NodeType::Subprocess => {
                let start = index
                    .start_event_of(&descriptor.uri)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Definition(format!(
                            "subprocess {} has no start event",
                            descriptor.uri
                        ))
                    })?;
                (descriptor.uri.clone(), start)
            }
            NodeType::CallActivity => {
                let called = descriptor.called_process.clone().ok_or_else(|| {
                    EngineError::Definition(format!(
                        "call activity {} names no process",
                        descriptor.uri
                    ))
                })?;
                let called_index = self.index_for(&called)?;
                let start = called_index
                    .start_event_of(&called)
                    .cloned()
                    .ok_or_else(|| {
                        EngineError::Definition(format!(
                            "{}: called process {called} has no start event",
                            codes::MISSING_START_EVENT
                        ))
                    })?;
                (called, start)
            }
            other => {
                return Err(EngineError::Definition(format!(
                    "{} is not a subprocess (got {other:?})",
                    descriptor.uri
                )))
            }
        };

        self.tokens.mark_waiting(token, WaitKind::Subprocess)?;
        self.arm_boundaries(instance, index, descriptor, token)?;

        let initial = self.instances.visible_variables(instance, Some(token))?;
        let child = self
            .instances
            .create_instance(&child_process, &initial, Some(token))?;
        self.tokens.link_child_instance(token, &child)?;
        self.bus.publish(&ExecutionEvent::SubprocessStarted {
            instance: instance.clone(),
            subprocess: descriptor.uri.clone(),
            parent_token: token.clone(),
            child_instance: child.clone(),
            loop_index: self.tokens.loop_index_of(token)?,
        })?;
        self.tokens.create_token(&child, &child_start, None, None)?;
        self.run_to_quiescence(&child)
    }

    // ── Multi-instance ──

    fn mi_items(
        &self,
        instance: &NamedNode,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<Vec<Option<VariableValue>>, EngineError> {
        let spec = descriptor.multi_instance.as_ref().ok_or_else(|| {
            EngineError::Definition(format!("{} has no loop characteristics", descriptor.uri))
        })?;
        if let Some(collection) = &spec.collection {
            let raw = self
                .instances
                .get_variable(instance, collection, Some(token))?
                .ok_or_else(|| {
                    EngineError::Definition(format!(
                        "collection variable '{collection}' for {} is not set",
                        descriptor.uri
                    ))
                })?;
            let json: serde_json::Value =
                serde_json::from_str(&raw.lexical()).map_err(|e| {
                    EngineError::Definition(format!(
                        "collection variable '{collection}' is not a JSON array: {e}"
                    ))
                })?;
            let items = json.as_array().ok_or_else(|| {
                EngineError::Definition(format!(
                    "collection variable '{collection}' is not a JSON array"
                ))
            })?;
            return Ok(items
                .iter()
                .map(|item| {
                    Some(match item {
                        serde_json::Value::Bool(b) => VariableValue::Boolean(*b),
                        serde_json::Value::Number(n) if n.is_i64() => {
                            VariableValue::Integer(n.as_i64().unwrap_or_default())
                        }
                        serde_json::Value::Number(n) => {
                            VariableValue::Double(n.as_f64().unwrap_or_default())
                        }
                        serde_json::Value::String(s) => VariableValue::String(s.clone()),
                        other => VariableValue::String(other.to_string()),
                    })
                })
                .collect());
        }
        let cardinality = spec.cardinality.ok_or_else(|| {
            EngineError::Definition(format!(
                "{} has neither collection nor cardinality",
                descriptor.uri
            ))
        })?;
        Ok((0..cardinality).map(|_| None).collect())
    }

    fn spawn_mi_child(
        &self,
        instance: &NamedNode,
        descriptor: &NodeDescriptor,
        parent: &NamedNode,
        loop_index: u32,
        item: Option<VariableValue>,
    ) -> Result<NamedNode, EngineError> {
        let child =
            self.tokens
                .create_token(instance, &descriptor.uri, Some(parent), Some(loop_index))?;
        self.instances.set_variable(
            instance,
            "loopIndex",
            VariableValue::Integer(loop_index as i64),
            Some(&child),
        )?;
        if let (Some(spec), Some(item)) = (&descriptor.multi_instance, item) {
            if let Some(element) = &spec.element_variable {
                self.instances
                    .set_variable(instance, element, item, Some(&child))?;
            }
        }
        Ok(child)
    }

    fn start_multi_instance(
        &self,
        instance: &NamedNode,
        _index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        let items = self.mi_items(instance, descriptor, token)?;
        let total = items.len() as u32;
        let sequential = descriptor
            .multi_instance
            .as_ref()
            .is_some_and(|s| s.sequential);
        debug!(
            node = descriptor.uri.as_str(),
            total, sequential, "multi-instance activated"
        );

        self.tokens.mark_waiting(token, WaitKind::Join)?;
        self.tokens.set_fork_expected(token, total)?;
        if total == 0 {
            // nothing to iterate: the wrapper completes immediately
            return self.finish_activity(instance, &self.index_for_instance(instance)?, descriptor, token);
        }
        if sequential {
            self.spawn_mi_child(instance, descriptor, token, 0, items[0].clone())?;
        } else {
            for (i, item) in items.into_iter().enumerate() {
                self.spawn_mi_child(instance, descriptor, token, i as u32, item)?;
            }
        }
        Ok(())
    }

    fn mi_child_done(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        child: &NamedNode,
    ) -> Result<(), EngineError> {
        self.tokens.consume_token(child)?;
        let parent = self.tokens.parent_of(child)?.ok_or_else(|| {
            EngineError::UnknownToken(format!("loop token {child} has no parent"))
        })?;
        let total = self.tokens.fork_expected_of(&parent)?.unwrap_or(1);
        let children = self.tokens.children_of(&parent)?;
        let completed = {
            let mut count = 0u32;
            for token in &children {
                if self.tokens.state_of(token)? == TokenState::Consumed {
                    count += 1;
                }
            }
            count
        };
        let sequential = descriptor
            .multi_instance
            .as_ref()
            .is_some_and(|s| s.sequential);

        if completed < total {
            if sequential {
                let items = self.mi_items(instance, descriptor, &parent)?;
                self.spawn_mi_child(
                    instance,
                    descriptor,
                    &parent,
                    completed,
                    items.get(completed as usize).cloned().flatten(),
                )?;
            }
            return Ok(());
        }
        debug!(node = descriptor.uri.as_str(), total, "multi-instance complete");
        self.finish_activity(instance, index, descriptor, &parent)
    }

    // ── Flow mechanics ──

    /// Advance a completed activity: record its compensable, disarm its
    /// boundary listeners, and move along the outgoing flows. Multi-instance
    /// iteration tokens are folded into their wrapper instead.
    fn finish_activity(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        if descriptor.multi_instance.is_some() && self.tokens.loop_index_of(token)?.is_some() {
            return self.mi_child_done(instance, index, descriptor, token);
        }
        if let Some(handler) = &descriptor.compensation_handler {
            self.record_compensable(instance, index, &descriptor.uri, handler)?;
        }
        self.disarm_boundaries(token)?;
        self.fire_listeners(instance, descriptor, ListenerType::End, Some(token))?;
        let flows = index.outgoing_flows(&descriptor.uri).to_vec();
        if flows.is_empty() {
            return Err(EngineError::Definition(format!(
                "{} has no outgoing flow",
                descriptor.uri
            )));
        }
        self.take_flows(instance, index, token, &flows, None)?;
        Ok(())
    }

    /// Move the token along one flow, or fork it across several (one child
    /// per flow, parent linkage preserved, original consumed).
    fn take_flows(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        token: &NamedNode,
        flows: &[FlowInfo],
        inclusive_expected: Option<u32>,
    ) -> Result<Vec<NamedNode>, EngineError> {
        match flows {
            [] => Ok(Vec::new()),
            [flow] => {
                let source = index.node(&flow.source)?.clone();
                self.fire_listeners(instance, &source, ListenerType::Take, Some(token))?;
                self.tokens.move_token(token, &flow.target, Some(&flow.uri))?;
                Ok(vec![token.clone()])
            }
            many => {
                self.bus.publish(&ExecutionEvent::TokenMoved {
                    token: token.clone(),
                    targets: many.iter().map(|f| f.target.clone()).collect(),
                    instance: instance.clone(),
                    consume_original: true,
                })?;
                let mut children = Vec::new();
                for flow in many {
                    let child =
                        self.tokens
                            .create_token(instance, &flow.target, Some(token), None)?;
                    self.tokens.set_arrived_via(&child, &flow.uri)?;
                    if let Some(expected) = inclusive_expected {
                        self.tokens.set_fork_origin(&child, &flow.source)?;
                        self.tokens.set_fork_expected(&child, expected)?;
                    }
                    children.push(child);
                }
                self.tokens.consume_token(token)?;
                Ok(children)
            }
        }
    }

    // ── Boundary events ──

    fn resolve_correlation(
        &self,
        instance: &NamedNode,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<Option<VariableValue>, EngineError> {
        match &descriptor.correlation_variable {
            Some(variable) => self.instances.get_variable(instance, variable, Some(token)),
            None => Ok(None),
        }
    }

    /// Register listener tokens for the timer and message boundary events of
    /// an activity. Error and cancel boundaries are passive; they are looked
    /// up when their trigger occurs.
    fn arm_boundaries(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        host_token: &NamedNode,
    ) -> Result<(), EngineError> {
        for boundary in index.boundary_events_of(&descriptor.uri) {
            if let Some(timer) = &boundary.timer {
                let listener =
                    self.tokens
                        .create_token(instance, &boundary.uri, Some(host_token), None)?;
                self.tokens.mark_waiting(&listener, WaitKind::Timer)?;
                let repeats = match timer {
                    TimerDefinition::Cycle { max_fires, .. } if *max_fires > 0 => Some(*max_fires),
                    _ => None,
                };
                self.timers.register(
                    instance,
                    &boundary.uri,
                    &listener,
                    timer.fire_at(self.clock.now()),
                    repeats,
                )?;
                self.tokens.arm_boundary(host_token, &listener)?;
            } else if let Some(name) = &boundary.message_name {
                let listener =
                    self.tokens
                        .create_token(instance, &boundary.uri, Some(host_token), None)?;
                let correlation = self.resolve_correlation(instance, boundary, host_token)?;
                self.tokens
                    .register_message_wait(&listener, name, correlation.as_ref())?;
                self.tokens.arm_boundary(host_token, &listener)?;
            }
        }
        Ok(())
    }

    /// Consume the boundary listener tokens of a host and cancel their
    /// timer/message waits.
    fn disarm_boundaries(&self, host_token: &NamedNode) -> Result<(), EngineError> {
        for listener in self.tokens.armed_boundaries(host_token)? {
            self.timers.cancel_for_token(&listener)?;
            if self.tokens.state_of(&listener)? != TokenState::Consumed {
                self.tokens.consume_token(&listener)?;
            }
        }
        self.tokens.disarm_boundaries(host_token)
    }

    /// Cancel a suspended activity: its open task, timers, boundary
    /// listeners and child instance, then the host token itself.
    fn cancel_activity(
        &self,
        _instance: &NamedNode,
        host_token: &NamedNode,
        reason: &str,
    ) -> Result<(), EngineError> {
        if let Some(task) = self.tasks.open_task_for_token(host_token)? {
            self.tasks.cancel(&task)?;
        }
        self.timers.cancel_for_token(host_token)?;
        self.disarm_boundaries(host_token)?;
        if let Some(child) = self.tokens.child_instance_of(host_token)? {
            if !self.instances.state(&child)?.is_terminal() {
                self.interrupt_instance(&child, reason)?;
            }
        }
        if self.tokens.state_of(host_token)? != TokenState::Consumed {
            self.tokens.consume_token(host_token)?;
        }
        Ok(())
    }

    /// Abort a (child) instance that was interrupted from outside: consume
    /// its tokens, cancel its waits, mark it failed with the reason.
    fn interrupt_instance(&self, instance: &NamedNode, reason: &str) -> Result<(), EngineError> {
        for token in self.tokens.live_tokens(instance)? {
            self.cancel_activity(instance, &token, reason)?;
        }
        self.instances
            .set_state(instance, InstanceState::Failed, Some(reason))
    }

    /// Fire a boundary listener token: interrupt its host when the boundary
    /// is interrupting, then continue on the boundary's outgoing flow.
    fn fire_boundary_listener(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        listener: &NamedNode,
    ) -> Result<(), EngineError> {
        let host_token = self.tokens.parent_of(listener)?.ok_or_else(|| {
            EngineError::UnknownToken(format!("boundary listener {listener} has no host"))
        })?;
        let attached_to = descriptor
            .attached_to
            .clone()
            .unwrap_or_else(|| descriptor.uri.clone());
        self.bus.publish(&ExecutionEvent::BoundaryEventTriggered {
            instance: instance.clone(),
            boundary_event: descriptor.uri.clone(),
            attached_to,
            interrupting: descriptor.interrupting,
        })?;

        if descriptor.interrupting {
            // detach this listener first so cancelling the host does not
            // consume the very token that is about to advance
            self.tokens.remove_armed_boundary(&host_token, listener)?;
            self.cancel_activity(
                instance,
                &host_token,
                &format!("interrupted by boundary event {}", descriptor.uri),
            )?;
        }

        let flows = index.outgoing_flows(&descriptor.uri).to_vec();
        self.take_flows(instance, index, listener, &flows, None)?;
        Ok(())
    }

    // ── Waits resuming ──

    /// If the token is part of an event-based gateway race, resolve the
    /// race: consume the anchor and the sibling arms, cancelling their waits.
    fn resolve_race(&self, _instance: &NamedNode, winner: &NamedNode) -> Result<(), EngineError> {
        let Some(anchor) = self.tokens.race_group_of(winner)? else {
            return Ok(());
        };
        for member in self.tokens.race_members(&anchor)? {
            if &member == winner {
                continue;
            }
            self.timers.cancel_for_token(&member)?;
            if self.tokens.state_of(&member)? != TokenState::Consumed {
                self.tokens.consume_token(&member)?;
            }
        }
        if self.tokens.state_of(&anchor)? != TokenState::Consumed {
            self.tokens.consume_token(&anchor)?;
        }
        Ok(())
    }

    /// Resume a token whose wait was satisfied (message arrived or timer
    /// fired). Boundary listeners divert their host; catch events and
    /// receive tasks simply continue.
    fn resume_waiting_token(
        &self,
        instance: &NamedNode,
        token: &NamedNode,
    ) -> Result<(), EngineError> {
        let index = self.index_for_instance(instance)?;
        let node = self.tokens.node_of(token)?;
        let descriptor = index.node(&node)?.clone();

        self.resolve_race(instance, token)?;

        if descriptor.node_type == NodeType::BoundaryEvent {
            return self.fire_boundary_listener(instance, &index, &descriptor, token);
        }
        self.finish_activity(instance, &index, &descriptor, token)
    }

    fn fire_timer(&self, registration: TimerRegistration) -> Result<(), EngineError> {
        let TimerRegistration {
            uri,
            instance,
            node,
            token,
            fire_at,
        } = registration;
        let repeats_left = self.timers.repeats_left(&uri)?;
        self.timers.remove(&uri)?;

        self.with_lane(&instance, || {
            match self.instances.state(&instance)? {
                InstanceState::Active => {}
                // keep the registration alive for a suspended instance
                InstanceState::Suspended => {
                    self.timers
                        .register(&instance, &node, &token, fire_at, repeats_left)?;
                    return Ok(());
                }
                _ => return Ok(()),
            }
            if self.tokens.state_of(&token)? != TokenState::Waiting {
                return Ok(());
            }
            let index = self.index_for_instance(&instance)?;
            let descriptor = index.node(&node)?.clone();

            // Non-interrupting cycle timers re-arm a fresh listener before
            // this one moves on.
            if descriptor.node_type == NodeType::BoundaryEvent && !descriptor.interrupting {
                if let Some(TimerDefinition::Cycle { interval_ms, .. }) = descriptor.timer {
                    let remaining = repeats_left.map(|n| n.saturating_sub(1));
                    if remaining.is_none_or(|n| n > 0) {
                        if let Some(host) = self.tokens.parent_of(&token)? {
                            if self.tokens.state_of(&host)? == TokenState::Waiting {
                                let listener = self.tokens.create_token(
                                    &instance,
                                    &descriptor.uri,
                                    Some(&host),
                                    None,
                                )?;
                                self.tokens.mark_waiting(&listener, WaitKind::Timer)?;
                                self.timers.register(
                                    &instance,
                                    &descriptor.uri,
                                    &listener,
                                    fire_at
                                        + chrono::Duration::milliseconds(interval_ms as i64),
                                    remaining,
                                )?;
                                self.tokens.arm_boundary(&host, &listener)?;
                            }
                        }
                    }
                }
            }

            self.resume_waiting_token(&instance, &token)?;
            self.run_to_quiescence(&instance)
        })
    }

    // ── Errors ──

    fn throw_error(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
        code: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        self.bus.publish(&ExecutionEvent::ErrorThrown {
            instance: instance.clone(),
            source_node: descriptor.uri.clone(),
            code: code.to_string(),
            message: message.to_string(),
            token: Some(token.clone()),
        })?;
        self.route_error(instance, index, &descriptor.uri, code, message)
    }

    /// Route a thrown error to the nearest matching error boundary event,
    /// walking the subprocess enclosure chain and then the parent-instance
    /// chain (call activities). Without a handler the instance fails, and
    /// the error escalates to its parent.
    fn route_error(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        source: &NamedNode,
        code: &str,
        message: &str,
    ) -> Result<(), EngineError> {
        if let Some(handler) = index.error_handler_for(source, code).cloned() {
            let host = handler.attached_to.clone().ok_or_else(|| {
                EngineError::Definition(format!("boundary {} has no host", handler.uri))
            })?;
            // Find the instance holding a token at the host activity,
            // climbing from the failing instance; child instances crossed on
            // the way are interrupted.
            let mut cur = instance.clone();
            loop {
                let at_host = self.tokens.tokens_at(&cur, &host)?;
                if let Some(host_token) = at_host.first() {
                    self.cancel_activity(&cur, host_token, &format!("error {code}"))?;
                    // failing tokens at the source inside this instance
                    for stray in self.tokens.tokens_at(&cur, source)? {
                        self.tokens.consume_token(&stray)?;
                    }
                    self.tokens.create_token(&cur, &handler.uri, None, None)?;
                    self.bus.publish(&ExecutionEvent::BoundaryEventTriggered {
                        instance: cur.clone(),
                        boundary_event: handler.uri.clone(),
                        attached_to: host.clone(),
                        interrupting: true,
                    })?;
                    if cur != *instance {
                        self.run_to_quiescence(&cur)?;
                    }
                    return Ok(());
                }
                // the host is not in this instance: interrupt it and climb
                let Some(parent_token) = self.instances.parent_token_of(&cur)? else {
                    break;
                };
                self.interrupt_instance(&cur, &format!("error {code} escalated"))?;
                cur = self.tokens.instance_of(&parent_token)?;
            }
            // handler found but no live host token: fall through to failure
        }

        warn!(instance = instance.as_str(), code, "unhandled error, failing instance");
        // the failing token(s) at the source are consumed with the instance
        for token in self.tokens.live_tokens(instance)? {
            self.cancel_activity(instance, &token, &format!("error {code}"))?;
        }
        self.instances.set_state(
            instance,
            InstanceState::Failed,
            Some(&format!("{code}: {message}")),
        )?;

        // escalate across a call-activity boundary
        if let Some(parent_token) = self.instances.parent_token_of(instance)? {
            let parent_instance = self.tokens.instance_of(&parent_token)?;
            let subprocess_node = self.tokens.node_of(&parent_token)?;
            if self.tokens.state_of(&parent_token)? == TokenState::Waiting {
                let parent_index = self.index_for_instance(&parent_instance)?;
                self.bus.publish(&ExecutionEvent::ErrorThrown {
                    instance: parent_instance.clone(),
                    source_node: subprocess_node.clone(),
                    code: code.to_string(),
                    message: message.to_string(),
                    token: Some(parent_token.clone()),
                })?;
                self.route_error(&parent_instance, &parent_index, &subprocess_node, code, message)?;
                if self.instances.state(&parent_instance)? == InstanceState::Active {
                    self.run_to_quiescence(&parent_instance)?;
                }
            }
        }
        Ok(())
    }

    // ── Compensation ──

    fn record_compensable(
        &self,
        instance: &NamedNode,
        index: &Arc<DefinitionIndex>,
        activity: &NamedNode,
        handler: &NamedNode,
    ) -> Result<(), EngineError> {
        let record = self.vocab.mint("compensation");
        let v = &self.vocab;
        let seq = self.compensation_seq.fetch_add(1, Ordering::Relaxed);
        self.store.add(
            &record,
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(v.class(class::COMPENSABLE)),
        )?;
        self.store
            .add(&record, &v.prop(pred::INSTANCE), &Term::NamedNode(instance.clone()))?;
        self.store
            .add(&record, &v.prop(pred::ACTIVITY), &Term::NamedNode(activity.clone()))?;
        self.store
            .add(&record, &v.prop(pred::HANDLER), &Term::NamedNode(handler.clone()))?;
        self.store.add(
            &record,
            &v.prop(pred::SCOPE_DEPTH),
            &Term::Literal(Literal::new_typed_literal(
                index.scope_depth(activity).to_string(),
                xsd::INTEGER,
            )),
        )?;
        self.store.add(
            &record,
            &v.prop(pred::COMPLETION_SEQ),
            &Term::Literal(Literal::new_typed_literal(seq.to_string(), xsd::INTEGER)),
        )?;
        Ok(())
    }

    fn compensables(&self, instance: &NamedNode) -> Result<Vec<Compensable>, EngineError> {
        let v = &self.vocab;
        let mut records = Vec::new();
        for record in self
            .store
            .subjects_with(&v.prop(pred::INSTANCE), &Term::NamedNode(instance.clone()))?
        {
            let is_compensable = self
                .store
                .value_node(&record, &rdf::TYPE.into_owned())?
                .is_some_and(|t| t == v.class(class::COMPENSABLE));
            if !is_compensable {
                continue;
            }
            let (Some(activity), Some(handler)) = (
                self.store.value_node(&record, &v.prop(pred::ACTIVITY))?,
                self.store.value_node(&record, &v.prop(pred::HANDLER))?,
            ) else {
                continue;
            };
            records.push(Compensable {
                record: record.clone(),
                activity,
                handler,
                scope_depth: self
                    .store
                    .value_str(&record, &v.prop(pred::SCOPE_DEPTH))?
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                completion_seq: self
                    .store
                    .value_str(&record, &v.prop(pred::COMPLETION_SEQ))?
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
            });
        }
        Ok(records)
    }

    /// Promote a completed child's compensables into the parent scope so a
    /// later compensation can still undo them.
    fn promote_compensables(
        &self,
        child: &NamedNode,
        parent: &NamedNode,
    ) -> Result<(), EngineError> {
        for compensable in self.compensables(child)? {
            self.store.set(
                &compensable.record,
                &self.vocab.prop(pred::INSTANCE),
                &Term::NamedNode(parent.clone()),
            )?;
        }
        Ok(())
    }

    /// Run compensation handlers: one activity's, or every compensable in
    /// the instance scope: innermost scope first, reverse completion order
    /// within a scope. Each handler runs once and its record is removed.
    fn run_compensation(
        &self,
        instance: &NamedNode,
        activity: Option<&NamedNode>,
    ) -> Result<(), EngineError> {
        let mut selected: Vec<Compensable> = self
            .compensables(instance)?
            .into_iter()
            .filter(|c| activity.is_none() || Some(&c.activity) == activity)
            .collect();
        selected.sort_by(|a, b| {
            b.scope_depth
                .cmp(&a.scope_depth)
                .then(b.completion_seq.cmp(&a.completion_seq))
        });

        let index = self.index_for_instance(instance)?;
        for compensable in selected {
            debug!(
                activity = compensable.activity.as_str(),
                handler = compensable.handler.as_str(),
                "compensating"
            );
            let descriptor = index.node(&compensable.handler)?.clone();
            let token =
                self.tokens
                    .create_token(instance, &compensable.handler, None, None)?;
            // Compensation handlers sit outside the normal flow: run the
            // service logic in place, never advance.
            let topic = descriptor.topic.clone().unwrap_or_default();
            let input = self.instances.visible_variables(instance, Some(&token))?;
            self.bus.publish(&ExecutionEvent::ServiceTaskExecute {
                instance: instance.clone(),
                node: descriptor.uri.clone(),
                token: token.clone(),
                topic: topic.clone(),
                input_variables: input,
            })?;
            match self.registry.resolve(&topic) {
                Some(handler) => {
                    let mut ctx =
                        ServiceContext::new(instance, &descriptor.uri, &token, &self.instances);
                    match handler(&mut ctx) {
                        Ok(()) => {
                            self.bus.publish(&ExecutionEvent::ServiceTaskCompleted {
                                instance: instance.clone(),
                                node: descriptor.uri.clone(),
                                token: token.clone(),
                                output_variables: ctx.written().clone(),
                            })?;
                        }
                        Err(HandlerError::Fail(failure)) => {
                            self.bus.publish(&ExecutionEvent::ErrorThrown {
                                instance: instance.clone(),
                                source_node: descriptor.uri.clone(),
                                code: failure.code.clone(),
                                message: failure.message.clone(),
                                token: Some(token.clone()),
                            })?;
                            warn!(
                                handler = descriptor.uri.as_str(),
                                code = failure.code.as_str(),
                                "compensation handler failed"
                            );
                        }
                        Err(HandlerError::Engine(e)) => return Err(e),
                    }
                }
                None => {
                    self.bus.publish(&ExecutionEvent::ErrorThrown {
                        instance: instance.clone(),
                        source_node: descriptor.uri.clone(),
                        code: codes::TOPIC_MISSING.to_string(),
                        message: format!("no handler registered for topic '{topic}'"),
                        token: Some(token.clone()),
                    })?;
                }
            }
            self.tokens.consume_token(&token)?;
            self.store.remove_subject(&compensable.record)?;
        }
        Ok(())
    }

    // ── Cancel / terminate / completion ──

    /// A cancel end event: cancel the enclosing scope. Inside a transaction
    /// subprocess this compensates the child and diverts the parent to the
    /// cancel boundary event; at the root it cancels the instance.
    fn cancel_scope(
        &self,
        instance: &NamedNode,
        descriptor: &NodeDescriptor,
    ) -> Result<(), EngineError> {
        let parent_token = self.instances.parent_token_of(instance)?;
        let transaction = match &parent_token {
            Some(parent) => self.tokens.node_of(parent)?,
            None => self.instances.process_of(instance)?,
        };
        self.bus.publish(&ExecutionEvent::CancelTriggered {
            instance: instance.clone(),
            transaction: transaction.clone(),
            source_node: Some(descriptor.uri.clone()),
        })?;

        for token in self.tokens.live_tokens(instance)? {
            self.cancel_activity(instance, &token, "transaction cancelled")?;
        }
        self.run_compensation(instance, None)?;
        self.instances
            .set_state(instance, InstanceState::Cancelled, Some("cancel end event"))?;

        if let Some(parent_token) = parent_token {
            let parent_instance = self.tokens.instance_of(&parent_token)?;
            let parent_index = self.index_for_instance(&parent_instance)?;
            self.disarm_boundaries(&parent_token)?;
            let cancel_boundary = parent_index
                .boundary_events_of(&transaction)
                .into_iter()
                .find(|b| b.cancel_end)
                .cloned();
            match cancel_boundary {
                Some(boundary) => {
                    self.tokens.consume_token(&parent_token)?;
                    self.bus.publish(&ExecutionEvent::BoundaryEventTriggered {
                        instance: parent_instance.clone(),
                        boundary_event: boundary.uri.clone(),
                        attached_to: transaction.clone(),
                        interrupting: true,
                    })?;
                    self.tokens
                        .create_token(&parent_instance, &boundary.uri, None, None)?;
                }
                None => {
                    // no cancel boundary: the parent continues normally
                    let descriptor = parent_index.node(&transaction)?.clone();
                    self.finish_activity(&parent_instance, &parent_index, &descriptor, &parent_token)?;
                }
            }
            self.run_to_quiescence(&parent_instance)?;
        }
        Ok(())
    }

    /// Consume every live token and transition the instance (and its active
    /// children) to `terminated`.
    pub fn terminate_instance(&self, instance: &NamedNode) -> Result<(), EngineError> {
        self.with_lane(instance, || {
            for token in self.tokens.live_tokens(instance)? {
                if let Some(task) = self.tasks.open_task_for_token(&token)? {
                    self.tasks.cancel(&task)?;
                }
                self.timers.cancel_for_token(&token)?;
                if let Some(child) = self.tokens.child_instance_of(&token)? {
                    if !self.instances.state(&child)?.is_terminal() {
                        self.terminate_instance(&child)?;
                    }
                }
                if self.tokens.state_of(&token)? != TokenState::Consumed {
                    self.tokens.consume_token(&token)?;
                }
            }
            self.instances
                .set_state(instance, InstanceState::Terminated, None)?;

            // a terminated subprocess ends its wrapper activity; the parent
            // continues on the normal flow
            if let Some(parent_token) = self.instances.parent_token_of(instance)? {
                if self.tokens.state_of(&parent_token)? == TokenState::Waiting {
                    let parent_instance = self.tokens.instance_of(&parent_token)?;
                    let parent_index = self.index_for_instance(&parent_instance)?;
                    let node = self.tokens.node_of(&parent_token)?;
                    let descriptor = parent_index.node(&node)?.clone();
                    self.finish_activity(&parent_instance, &parent_index, &descriptor, &parent_token)?;
                    self.run_to_quiescence(&parent_instance)?;
                }
            }
            Ok(())
        })
    }

    /// An instance with no remaining tokens is complete. Subprocess children
    /// hand control back to their parent token.
    fn check_completion(&self, instance: &NamedNode) -> Result<(), EngineError> {
        if !self.tokens.live_tokens(instance)?.is_empty() {
            return Ok(());
        }
        if self.instances.state(instance)?.is_terminal() {
            return Ok(());
        }
        match self.instances.parent_token_of(instance)? {
            Some(parent_token) => self.complete_subprocess(instance, &parent_token),
            None => {
                info!(instance = instance.as_str(), "instance completed");
                self.instances
                    .set_state(instance, InstanceState::Completed, None)
            }
        }
    }

    fn complete_subprocess(
        &self,
        child: &NamedNode,
        parent_token: &NamedNode,
    ) -> Result<(), EngineError> {
        self.instances
            .set_state(child, InstanceState::Completed, None)?;
        let parent_instance = self.tokens.instance_of(parent_token)?;
        let subprocess_node = self.tokens.node_of(parent_token)?;
        let outputs = self.instances.snapshot_variables(child)?;
        let loop_index = self.tokens.loop_index_of(parent_token)?;

        // outputs surface in the parent; iteration outputs stay scoped to
        // the iteration token
        let scope = if loop_index.is_some() {
            Some(parent_token)
        } else {
            None
        };
        for (name, value) in &outputs {
            self.instances
                .set_variable(&parent_instance, name, value.clone(), scope)?;
        }
        self.promote_compensables(child, &parent_instance)?;

        self.bus.publish(&ExecutionEvent::SubprocessCompleted {
            instance: parent_instance.clone(),
            subprocess: subprocess_node.clone(),
            parent_token: parent_token.clone(),
            child_instance: child.clone(),
            output_variables: outputs,
            loop_index,
        })?;

        let parent_index = self.index_for_instance(&parent_instance)?;
        let descriptor = parent_index.node(&subprocess_node)?.clone();
        self.finish_activity(&parent_instance, &parent_index, &descriptor, parent_token)?;
        self.run_to_quiescence(&parent_instance)
    }

    // ── Listeners ──

    fn fire_listeners(
        &self,
        instance: &NamedNode,
        descriptor: &NodeDescriptor,
        listener_type: ListenerType,
        token: Option<&NamedNode>,
    ) -> Result<(), EngineError> {
        for listener in &descriptor.listeners {
            if listener.listener_type != listener_type {
                continue;
            }
            let variables = self.instances.visible_variables(instance, token)?;
            self.bus.publish(&ExecutionEvent::ListenerExecute {
                instance: instance.clone(),
                node: descriptor.uri.clone(),
                listener_type,
                expression: listener.expression.clone(),
                variables,
            })?;
        }
        Ok(())
    }
}
