use crate::types::{InstanceState, ListenerType, NodeType, VariableValue};
use oxigraph::model::NamedNode;
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Discriminants for subscription. One per `ExecutionEvent` variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    TokenMoved,
    TokenCreated,
    TokenConsumed,
    TaskCreated,
    TaskCompleted,
    VariableSet,
    MessageSent,
    MessageReceived,
    InstanceStateChanged,
    ServiceTaskExecute,
    ServiceTaskCompleted,
    SubprocessStarted,
    SubprocessCompleted,
    GatewayEvaluated,
    ErrorThrown,
    CompensationTriggered,
    CancelTriggered,
    TerminateTriggered,
    BoundaryEventTriggered,
    ListenerExecute,
    AuditLog,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TokenMoved => "TokenMoved",
            EventKind::TokenCreated => "TokenCreated",
            EventKind::TokenConsumed => "TokenConsumed",
            EventKind::TaskCreated => "TaskCreated",
            EventKind::TaskCompleted => "TaskCompleted",
            EventKind::VariableSet => "VariableSet",
            EventKind::MessageSent => "MessageSent",
            EventKind::MessageReceived => "MessageReceived",
            EventKind::InstanceStateChanged => "InstanceStateChanged",
            EventKind::ServiceTaskExecute => "ServiceTaskExecute",
            EventKind::ServiceTaskCompleted => "ServiceTaskCompleted",
            EventKind::SubprocessStarted => "SubprocessStarted",
            EventKind::SubprocessCompleted => "SubprocessCompleted",
            EventKind::GatewayEvaluated => "GatewayEvaluated",
            EventKind::ErrorThrown => "ErrorThrown",
            EventKind::CompensationTriggered => "CompensationTriggered",
            EventKind::CancelTriggered => "CancelTriggered",
            EventKind::TerminateTriggered => "TerminateTriggered",
            EventKind::BoundaryEventTriggered => "BoundaryEventTriggered",
            EventKind::ListenerExecute => "ListenerExecute",
            EventKind::AuditLog => "AuditLog",
        }
    }
}

/// The closed set of execution events carried by the bus (C5).
///
/// Node handlers and services publish these; the audit log subscribes to all
/// of them. Every record schema is explicit; there is no property enumeration.
#[derive(Clone, Debug)]
pub enum ExecutionEvent {
    TokenMoved {
        token: NamedNode,
        targets: Vec<NamedNode>,
        instance: NamedNode,
        consume_original: bool,
    },
    TokenCreated {
        token: NamedNode,
        instance: NamedNode,
        node: NamedNode,
        parent: Option<NamedNode>,
        loop_index: Option<u32>,
    },
    TokenConsumed {
        token: NamedNode,
        instance: NamedNode,
    },
    TaskCreated {
        task: NamedNode,
        instance: NamedNode,
        node: NamedNode,
        token: NamedNode,
        name: Option<String>,
        assignee: Option<String>,
        candidate_users: Vec<String>,
        candidate_groups: Vec<String>,
        form_data: Value,
        due_date: Option<String>,
        priority: Option<i64>,
    },
    TaskCompleted {
        task: NamedNode,
        instance: NamedNode,
        node: NamedNode,
        token: NamedNode,
        completed_by: String,
        variables: BTreeMap<String, VariableValue>,
    },
    VariableSet {
        instance: NamedNode,
        name: String,
        value: VariableValue,
        scope_token: Option<NamedNode>,
        loop_index: Option<u32>,
    },
    MessageSent {
        name: String,
        correlation_key: Option<VariableValue>,
        payload: BTreeMap<String, VariableValue>,
        source_instance: Option<NamedNode>,
        source_node: Option<NamedNode>,
    },
    MessageReceived {
        instance: NamedNode,
        node: NamedNode,
        token: NamedNode,
        name: String,
        payload: BTreeMap<String, VariableValue>,
    },
    InstanceStateChanged {
        instance: NamedNode,
        old_state: Option<InstanceState>,
        new_state: InstanceState,
        reason: Option<String>,
    },
    ServiceTaskExecute {
        instance: NamedNode,
        node: NamedNode,
        token: NamedNode,
        topic: String,
        input_variables: BTreeMap<String, VariableValue>,
    },
    ServiceTaskCompleted {
        instance: NamedNode,
        node: NamedNode,
        token: NamedNode,
        output_variables: BTreeMap<String, VariableValue>,
    },
    SubprocessStarted {
        instance: NamedNode,
        subprocess: NamedNode,
        parent_token: NamedNode,
        child_instance: NamedNode,
        loop_index: Option<u32>,
    },
    SubprocessCompleted {
        instance: NamedNode,
        subprocess: NamedNode,
        parent_token: NamedNode,
        child_instance: NamedNode,
        output_variables: BTreeMap<String, VariableValue>,
        loop_index: Option<u32>,
    },
    GatewayEvaluated {
        instance: NamedNode,
        gateway: NamedNode,
        token: NamedNode,
        selected_flows: Vec<NamedNode>,
        gateway_type: NodeType,
    },
    ErrorThrown {
        instance: NamedNode,
        source_node: NamedNode,
        code: String,
        message: String,
        token: Option<NamedNode>,
    },
    CompensationTriggered {
        instance: NamedNode,
        activity: Option<NamedNode>,
        source_node: Option<NamedNode>,
    },
    CancelTriggered {
        instance: NamedNode,
        transaction: NamedNode,
        source_node: Option<NamedNode>,
    },
    TerminateTriggered {
        instance: NamedNode,
        source_node: Option<NamedNode>,
    },
    BoundaryEventTriggered {
        instance: NamedNode,
        boundary_event: NamedNode,
        attached_to: NamedNode,
        interrupting: bool,
    },
    ListenerExecute {
        instance: NamedNode,
        node: NamedNode,
        listener_type: ListenerType,
        expression: String,
        variables: BTreeMap<String, VariableValue>,
    },
    AuditLog {
        instance: NamedNode,
        event_type: String,
        node: Option<NamedNode>,
        details: Value,
        user: Option<String>,
    },
}

fn uris(nodes: &[NamedNode]) -> Value {
    Value::Array(nodes.iter().map(|n| json!(n.as_str())).collect())
}

fn opt_uri(node: &Option<NamedNode>) -> Value {
    node.as_ref()
        .map(|n| json!(n.as_str()))
        .unwrap_or(Value::Null)
}

fn vars(map: &BTreeMap<String, VariableValue>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), json!(v.lexical())))
            .collect(),
    )
}

impl ExecutionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ExecutionEvent::TokenMoved { .. } => EventKind::TokenMoved,
            ExecutionEvent::TokenCreated { .. } => EventKind::TokenCreated,
            ExecutionEvent::TokenConsumed { .. } => EventKind::TokenConsumed,
            ExecutionEvent::TaskCreated { .. } => EventKind::TaskCreated,
            ExecutionEvent::TaskCompleted { .. } => EventKind::TaskCompleted,
            ExecutionEvent::VariableSet { .. } => EventKind::VariableSet,
            ExecutionEvent::MessageSent { .. } => EventKind::MessageSent,
            ExecutionEvent::MessageReceived { .. } => EventKind::MessageReceived,
            ExecutionEvent::InstanceStateChanged { .. } => EventKind::InstanceStateChanged,
            ExecutionEvent::ServiceTaskExecute { .. } => EventKind::ServiceTaskExecute,
            ExecutionEvent::ServiceTaskCompleted { .. } => EventKind::ServiceTaskCompleted,
            ExecutionEvent::SubprocessStarted { .. } => EventKind::SubprocessStarted,
            ExecutionEvent::SubprocessCompleted { .. } => EventKind::SubprocessCompleted,
            ExecutionEvent::GatewayEvaluated { .. } => EventKind::GatewayEvaluated,
            ExecutionEvent::ErrorThrown { .. } => EventKind::ErrorThrown,
            ExecutionEvent::CompensationTriggered { .. } => EventKind::CompensationTriggered,
            ExecutionEvent::CancelTriggered { .. } => EventKind::CancelTriggered,
            ExecutionEvent::TerminateTriggered { .. } => EventKind::TerminateTriggered,
            ExecutionEvent::BoundaryEventTriggered { .. } => EventKind::BoundaryEventTriggered,
            ExecutionEvent::ListenerExecute { .. } => EventKind::ListenerExecute,
            ExecutionEvent::AuditLog { .. } => EventKind::AuditLog,
        }
    }

    /// The instance this event belongs to, when it has one. `MessageSent`
    /// may originate outside any instance.
    pub fn instance(&self) -> Option<&NamedNode> {
        match self {
            ExecutionEvent::TokenMoved { instance, .. }
            | ExecutionEvent::TokenCreated { instance, .. }
            | ExecutionEvent::TokenConsumed { instance, .. }
            | ExecutionEvent::TaskCreated { instance, .. }
            | ExecutionEvent::TaskCompleted { instance, .. }
            | ExecutionEvent::VariableSet { instance, .. }
            | ExecutionEvent::MessageReceived { instance, .. }
            | ExecutionEvent::InstanceStateChanged { instance, .. }
            | ExecutionEvent::ServiceTaskExecute { instance, .. }
            | ExecutionEvent::ServiceTaskCompleted { instance, .. }
            | ExecutionEvent::SubprocessStarted { instance, .. }
            | ExecutionEvent::SubprocessCompleted { instance, .. }
            | ExecutionEvent::GatewayEvaluated { instance, .. }
            | ExecutionEvent::ErrorThrown { instance, .. }
            | ExecutionEvent::CompensationTriggered { instance, .. }
            | ExecutionEvent::CancelTriggered { instance, .. }
            | ExecutionEvent::TerminateTriggered { instance, .. }
            | ExecutionEvent::BoundaryEventTriggered { instance, .. }
            | ExecutionEvent::ListenerExecute { instance, .. }
            | ExecutionEvent::AuditLog { instance, .. } => Some(instance),
            ExecutionEvent::MessageSent {
                source_instance, ..
            } => source_instance.as_ref(),
        }
    }

    /// The node most relevant to this event, when there is one.
    pub fn node(&self) -> Option<&NamedNode> {
        match self {
            ExecutionEvent::TokenCreated { node, .. }
            | ExecutionEvent::TaskCreated { node, .. }
            | ExecutionEvent::TaskCompleted { node, .. }
            | ExecutionEvent::MessageReceived { node, .. }
            | ExecutionEvent::ServiceTaskExecute { node, .. }
            | ExecutionEvent::ServiceTaskCompleted { node, .. }
            | ExecutionEvent::ListenerExecute { node, .. } => Some(node),
            ExecutionEvent::GatewayEvaluated { gateway, .. } => Some(gateway),
            ExecutionEvent::SubprocessStarted { subprocess, .. }
            | ExecutionEvent::SubprocessCompleted { subprocess, .. } => Some(subprocess),
            ExecutionEvent::ErrorThrown { source_node, .. } => Some(source_node),
            ExecutionEvent::BoundaryEventTriggered { boundary_event, .. } => Some(boundary_event),
            ExecutionEvent::CompensationTriggered { source_node, .. }
            | ExecutionEvent::CancelTriggered { source_node, .. }
            | ExecutionEvent::TerminateTriggered { source_node, .. } => source_node.as_ref(),
            ExecutionEvent::AuditLog { node, .. } => node.as_ref(),
            _ => None,
        }
    }

    /// Serialized detail map, recorded verbatim by the audit log.
    pub fn details(&self) -> Value {
        match self {
            ExecutionEvent::TokenMoved {
                token,
                targets,
                consume_original,
                ..
            } => json!({
                "token": token.as_str(),
                "targets": uris(targets),
                "consumeOriginal": consume_original,
            }),
            ExecutionEvent::TokenCreated {
                token,
                parent,
                loop_index,
                ..
            } => json!({
                "token": token.as_str(),
                "parent": opt_uri(parent),
                "loopIndex": loop_index,
            }),
            ExecutionEvent::TokenConsumed { token, .. } => json!({ "token": token.as_str() }),
            ExecutionEvent::TaskCreated {
                task,
                token,
                name,
                assignee,
                candidate_users,
                candidate_groups,
                due_date,
                priority,
                ..
            } => json!({
                "task": task.as_str(),
                "token": token.as_str(),
                "name": name,
                "assignee": assignee,
                "candidateUsers": candidate_users,
                "candidateGroups": candidate_groups,
                "dueDate": due_date,
                "priority": priority,
            }),
            ExecutionEvent::TaskCompleted {
                task,
                token,
                completed_by,
                variables,
                ..
            } => json!({
                "task": task.as_str(),
                "token": token.as_str(),
                "completedBy": completed_by,
                "variables": vars(variables),
            }),
            ExecutionEvent::VariableSet {
                name,
                value,
                scope_token,
                loop_index,
                ..
            } => json!({
                "name": name,
                "value": value.lexical(),
                "datatype": value.datatype().as_str(),
                "scopeToken": opt_uri(scope_token),
                "loopIndex": loop_index,
            }),
            ExecutionEvent::MessageSent {
                name,
                correlation_key,
                payload,
                ..
            } => json!({
                "name": name,
                "correlationKey": correlation_key.as_ref().map(|v| v.lexical()),
                "payload": vars(payload),
            }),
            ExecutionEvent::MessageReceived {
                token,
                name,
                payload,
                ..
            } => json!({
                "token": token.as_str(),
                "name": name,
                "payload": vars(payload),
            }),
            ExecutionEvent::InstanceStateChanged {
                old_state,
                new_state,
                reason,
                ..
            } => json!({
                "oldState": old_state.map(|s| s.as_str()),
                "newState": new_state.as_str(),
                "reason": reason,
            }),
            ExecutionEvent::ServiceTaskExecute {
                token,
                topic,
                input_variables,
                ..
            } => json!({
                "token": token.as_str(),
                "topic": topic,
                "inputVariables": vars(input_variables),
            }),
            ExecutionEvent::ServiceTaskCompleted {
                token,
                output_variables,
                ..
            } => json!({
                "token": token.as_str(),
                "outputVariables": vars(output_variables),
            }),
            ExecutionEvent::SubprocessStarted {
                parent_token,
                child_instance,
                loop_index,
                ..
            } => json!({
                "parentToken": parent_token.as_str(),
                "childInstance": child_instance.as_str(),
                "loopIndex": loop_index,
            }),
            ExecutionEvent::SubprocessCompleted {
                parent_token,
                child_instance,
                output_variables,
                loop_index,
                ..
            } => json!({
                "parentToken": parent_token.as_str(),
                "childInstance": child_instance.as_str(),
                "outputVariables": vars(output_variables),
                "loopIndex": loop_index,
            }),
            ExecutionEvent::GatewayEvaluated {
                token,
                selected_flows,
                gateway_type,
                ..
            } => json!({
                "token": token.as_str(),
                "selectedFlows": uris(selected_flows),
                "gatewayType": gateway_type.as_local(),
            }),
            ExecutionEvent::ErrorThrown {
                code,
                message,
                token,
                ..
            } => json!({
                "code": code,
                "message": message,
                "token": opt_uri(token),
            }),
            ExecutionEvent::CompensationTriggered { activity, .. } => json!({
                "activity": opt_uri(activity),
            }),
            ExecutionEvent::CancelTriggered { transaction, .. } => json!({
                "transaction": transaction.as_str(),
            }),
            ExecutionEvent::TerminateTriggered { .. } => json!({}),
            ExecutionEvent::BoundaryEventTriggered {
                attached_to,
                interrupting,
                ..
            } => json!({
                "attachedTo": attached_to.as_str(),
                "interrupting": interrupting,
            }),
            ExecutionEvent::ListenerExecute {
                listener_type,
                expression,
                variables,
                ..
            } => json!({
                "listenerType": listener_type.as_str(),
                "expression": expression,
                "variables": vars(variables),
            }),
            ExecutionEvent::AuditLog {
                event_type,
                details,
                user,
                ..
            } => json!({
                "eventType": event_type,
                "details": details,
                "user": user,
            }),
        }
    }
}
