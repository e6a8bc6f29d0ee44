use crate::error::EngineError;
use chrono::{DateTime, Utc};
use oxigraph::model::vocab::xsd;
use oxigraph::model::{Literal, NamedNode, Term};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

// ─── Node kinds ───────────────────────────────────────────────

/// The closed set of node kinds a definition may contain. The definition
/// index tags every node with one of these; the step loop dispatches on the
/// tag and never matches on raw IRIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    StartEvent,
    EndEvent,
    ServiceTask,
    UserTask,
    ScriptTask,
    ReceiveTask,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway,
    EventBasedGateway,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    Subprocess,
    CallActivity,
    BoundaryEvent,
}

impl NodeType {
    pub const ALL: [NodeType; 15] = [
        NodeType::StartEvent,
        NodeType::EndEvent,
        NodeType::ServiceTask,
        NodeType::UserTask,
        NodeType::ScriptTask,
        NodeType::ReceiveTask,
        NodeType::ExclusiveGateway,
        NodeType::ParallelGateway,
        NodeType::InclusiveGateway,
        NodeType::EventBasedGateway,
        NodeType::IntermediateCatchEvent,
        NodeType::IntermediateThrowEvent,
        NodeType::Subprocess,
        NodeType::CallActivity,
        NodeType::BoundaryEvent,
    ];

    pub fn as_local(&self) -> &'static str {
        match self {
            NodeType::StartEvent => "StartEvent",
            NodeType::EndEvent => "EndEvent",
            NodeType::ServiceTask => "ServiceTask",
            NodeType::UserTask => "UserTask",
            NodeType::ScriptTask => "ScriptTask",
            NodeType::ReceiveTask => "ReceiveTask",
            NodeType::ExclusiveGateway => "ExclusiveGateway",
            NodeType::ParallelGateway => "ParallelGateway",
            NodeType::InclusiveGateway => "InclusiveGateway",
            NodeType::EventBasedGateway => "EventBasedGateway",
            NodeType::IntermediateCatchEvent => "IntermediateCatchEvent",
            NodeType::IntermediateThrowEvent => "IntermediateThrowEvent",
            NodeType::Subprocess => "Subprocess",
            NodeType::CallActivity => "CallActivity",
            NodeType::BoundaryEvent => "BoundaryEvent",
        }
    }

    pub fn from_local(local: &str) -> Option<NodeType> {
        NodeType::ALL.iter().copied().find(|t| t.as_local() == local)
    }

    /// Activities can host boundary events and declare loop characteristics.
    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            NodeType::ServiceTask
                | NodeType::UserTask
                | NodeType::ScriptTask
                | NodeType::ReceiveTask
                | NodeType::Subprocess
                | NodeType::CallActivity
        )
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            NodeType::ExclusiveGateway
                | NodeType::ParallelGateway
                | NodeType::InclusiveGateway
                | NodeType::EventBasedGateway
        )
    }
}

// ─── Lifecycle states ─────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Active,
    Suspended,
    Completed,
    Cancelled,
    Failed,
    Terminated,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Active => "active",
            InstanceState::Suspended => "suspended",
            InstanceState::Completed => "completed",
            InstanceState::Cancelled => "cancelled",
            InstanceState::Failed => "failed",
            InstanceState::Terminated => "terminated",
        }
    }

    /// Terminal states admit no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::Completed
                | InstanceState::Cancelled
                | InstanceState::Failed
                | InstanceState::Terminated
        )
    }
}

impl FromStr for InstanceState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(InstanceState::Active),
            "suspended" => Ok(InstanceState::Suspended),
            "completed" => Ok(InstanceState::Completed),
            "cancelled" => Ok(InstanceState::Cancelled),
            "failed" => Ok(InstanceState::Failed),
            "terminated" => Ok(InstanceState::Terminated),
            other => Err(EngineError::Value(format!("instance state: {other}"))),
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    Live,
    Waiting,
    Consumed,
}

impl TokenState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenState::Live => "live",
            TokenState::Waiting => "waiting",
            TokenState::Consumed => "consumed",
        }
    }
}

impl FromStr for TokenState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(TokenState::Live),
            "waiting" => Ok(TokenState::Waiting),
            "consumed" => Ok(TokenState::Consumed),
            other => Err(EngineError::Value(format!("token state: {other}"))),
        }
    }
}

/// What a waiting token is blocked on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WaitKind {
    Task,
    Message,
    Timer,
    Subprocess,
    Join,
    Race,
}

impl WaitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitKind::Task => "task",
            WaitKind::Message => "message",
            WaitKind::Timer => "timer",
            WaitKind::Subprocess => "subprocess",
            WaitKind::Join => "join",
            WaitKind::Race => "race",
        }
    }
}

impl FromStr for WaitKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(WaitKind::Task),
            "message" => Ok(WaitKind::Message),
            "timer" => Ok(WaitKind::Timer),
            "subprocess" => Ok(WaitKind::Subprocess),
            "join" => Ok(WaitKind::Join),
            "race" => Ok(WaitKind::Race),
            other => Err(EngineError::Value(format!("wait kind: {other}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Claimed,
    Completed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Claimed => "claimed",
            TaskState::Completed => "completed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, TaskState::Created | TaskState::Claimed)
    }
}

impl FromStr for TaskState {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(TaskState::Created),
            "claimed" => Ok(TaskState::Claimed),
            "completed" => Ok(TaskState::Completed),
            "cancelled" => Ok(TaskState::Cancelled),
            other => Err(EngineError::Value(format!("task state: {other}"))),
        }
    }
}

// ─── Variable values ──────────────────────────────────────────

/// A typed variable value. Covers the XSD primitives the engine coerces;
/// anything else round-trips as a string.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    Boolean(bool),
    Integer(i64),
    Decimal(Decimal),
    Double(f64),
    String(String),
    DateTime(DateTime<Utc>),
}

impl VariableValue {
    pub fn datatype(&self) -> NamedNode {
        match self {
            VariableValue::Boolean(_) => xsd::BOOLEAN.into_owned(),
            VariableValue::Integer(_) => xsd::INTEGER.into_owned(),
            VariableValue::Decimal(_) => xsd::DECIMAL.into_owned(),
            VariableValue::Double(_) => xsd::DOUBLE.into_owned(),
            VariableValue::String(_) => xsd::STRING.into_owned(),
            VariableValue::DateTime(_) => xsd::DATE_TIME.into_owned(),
        }
    }

    pub fn lexical(&self) -> String {
        match self {
            VariableValue::Boolean(b) => b.to_string(),
            VariableValue::Integer(n) => n.to_string(),
            VariableValue::Decimal(d) => d.to_string(),
            VariableValue::Double(d) => d.to_string(),
            VariableValue::String(s) => s.clone(),
            VariableValue::DateTime(t) => t.to_rfc3339(),
        }
    }

    pub fn to_literal(&self) -> Literal {
        match self {
            VariableValue::String(s) => Literal::new_simple_literal(s.clone()),
            other => Literal::new_typed_literal(other.lexical(), other.datatype()),
        }
    }

    pub fn to_term(&self) -> Term {
        Term::Literal(self.to_literal())
    }

    /// Coerce a literal by its datatype. Unknown datatypes are kept as
    /// strings; malformed lexical forms for a known datatype are an error.
    pub fn from_literal(lit: &Literal) -> Result<VariableValue, EngineError> {
        let dt = lit.datatype();
        let lex = lit.value();
        if dt == xsd::BOOLEAN {
            lex.parse::<bool>()
                .map(VariableValue::Boolean)
                .map_err(|_| EngineError::Value(format!("not a boolean: {lex}")))
        } else if dt == xsd::INTEGER || dt == xsd::INT || dt == xsd::LONG {
            lex.parse::<i64>()
                .map(VariableValue::Integer)
                .map_err(|_| EngineError::Value(format!("not an integer: {lex}")))
        } else if dt == xsd::DECIMAL {
            Decimal::from_str(lex)
                .map(VariableValue::Decimal)
                .map_err(|_| EngineError::Value(format!("not a decimal: {lex}")))
        } else if dt == xsd::DOUBLE || dt == xsd::FLOAT {
            lex.parse::<f64>()
                .map(VariableValue::Double)
                .map_err(|_| EngineError::Value(format!("not a double: {lex}")))
        } else if dt == xsd::DATE_TIME {
            DateTime::parse_from_rfc3339(lex)
                .map(|t| VariableValue::DateTime(t.with_timezone(&Utc)))
                .map_err(|_| EngineError::Value(format!("not a dateTime: {lex}")))
        } else {
            Ok(VariableValue::String(lex.to_string()))
        }
    }

    /// Coerce any term. IRIs become their string form.
    pub fn from_term(term: &Term) -> Result<VariableValue, EngineError> {
        match term {
            Term::Literal(lit) => VariableValue::from_literal(lit),
            Term::NamedNode(n) => Ok(VariableValue::String(n.as_str().to_string())),
            other => Err(EngineError::Value(format!("not a value term: {other}"))),
        }
    }

    /// Parse a lexical form with XSD literal syntax: `"..."` for strings,
    /// `true`/`false`, integers, decimals with a trailing `d` for double,
    /// otherwise decimal, otherwise string. Used by scripts and authoring.
    pub fn parse_lexical(s: &str) -> VariableValue {
        let s = s.trim();
        if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
            return VariableValue::String(s[1..s.len() - 1].to_string());
        }
        if let Ok(b) = s.parse::<bool>() {
            return VariableValue::Boolean(b);
        }
        if let Ok(n) = s.parse::<i64>() {
            return VariableValue::Integer(n);
        }
        if let Some(stripped) = s.strip_suffix('d') {
            if let Ok(d) = stripped.parse::<f64>() {
                return VariableValue::Double(d);
            }
        }
        if let Ok(d) = Decimal::from_str(s) {
            return VariableValue::Decimal(d);
        }
        VariableValue::String(s.to_string())
    }

    /// Ordering across the numeric tower (integer/decimal/double promote to
    /// the widest involved type), strings lexically, booleans and dateTimes
    /// by their natural order. Mixed non-comparable kinds yield `None`.
    pub fn compare(&self, other: &VariableValue) -> Option<Ordering> {
        use VariableValue::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            (String(a), String(b)) => Some(a.cmp(b)),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (a, b) if a.is_numeric() && b.is_numeric() => {
                if matches!(a, Double(_)) || matches!(b, Double(_)) {
                    a.as_f64().partial_cmp(&b.as_f64())
                } else {
                    a.as_decimal().partial_cmp(&b.as_decimal())
                }
            }
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            VariableValue::Integer(_) | VariableValue::Decimal(_) | VariableValue::Double(_)
        )
    }

    fn as_f64(&self) -> f64 {
        match self {
            VariableValue::Integer(n) => *n as f64,
            VariableValue::Decimal(d) => d.to_string().parse().unwrap_or(f64::NAN),
            VariableValue::Double(d) => *d,
            _ => f64::NAN,
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            VariableValue::Integer(n) => Some(Decimal::from(*n)),
            VariableValue::Decimal(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            VariableValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lexical())
    }
}

// ─── Conditions ───────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Ge,
    Gt,
}

impl CmpOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Ge => ">=",
            CmpOp::Gt => ">",
        }
    }

    pub fn holds(&self, ord: Ordering) -> bool {
        match self {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Ge => ord != Ordering::Less,
            CmpOp::Gt => ord == Ordering::Greater,
        }
    }
}

impl FromStr for CmpOp {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(CmpOp::Lt),
            "<=" | "≤" => Ok(CmpOp::Le),
            "=" | "==" => Ok(CmpOp::Eq),
            "!=" | "≠" => Ok(CmpOp::Ne),
            ">=" | "≥" => Ok(CmpOp::Ge),
            ">" => Ok(CmpOp::Gt),
            other => Err(EngineError::Value(format!("operator: {other}"))),
        }
    }
}

/// A sequence-flow condition. A flow carrying neither form is
/// unconditionally true (default flows rely on this).
#[derive(Clone, Debug, PartialEq)]
pub enum Condition {
    /// `variable op value`, resolved against instance variables.
    Structured {
        variable: String,
        op: CmpOp,
        value: VariableValue,
    },
    /// A SPARQL ASK with `?instance` bound to the instance IRI.
    Ask(String),
}

// ─── Timers ───────────────────────────────────────────────────

/// A parsed timer specification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TimerDefinition {
    /// ISO 8601 duration relative to arming time, e.g. `PT1S`, `P1DT2H`.
    Duration { ms: u64 },
    /// Absolute RFC 3339 date.
    Date(DateTime<Utc>),
    /// Repeating cycle `R<n>/PT<duration>` (n = 0 means unbounded).
    Cycle { interval_ms: u64, max_fires: u32 },
}

impl TimerDefinition {
    pub fn parse(s: &str) -> Result<TimerDefinition, EngineError> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('R') {
            let (count, duration) = rest
                .split_once('/')
                .ok_or_else(|| EngineError::Timer(format!("cycle missing '/': {s}")))?;
            let max_fires = if count.is_empty() {
                0
            } else {
                count
                    .parse::<u32>()
                    .map_err(|_| EngineError::Timer(format!("cycle count: {s}")))?
            };
            return Ok(TimerDefinition::Cycle {
                interval_ms: parse_iso_duration(duration)?,
                max_fires,
            });
        }
        if s.starts_with('P') {
            return Ok(TimerDefinition::Duration {
                ms: parse_iso_duration(s)?,
            });
        }
        DateTime::parse_from_rfc3339(s)
            .map(|t| TimerDefinition::Date(t.with_timezone(&Utc)))
            .map_err(|_| EngineError::Timer(format!("not a duration, cycle or date: {s}")))
    }

    /// The first (or only) firing time when armed at `now`.
    pub fn fire_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            TimerDefinition::Duration { ms } => now + chrono::Duration::milliseconds(*ms as i64),
            TimerDefinition::Date(t) => *t,
            TimerDefinition::Cycle { interval_ms, .. } => {
                now + chrono::Duration::milliseconds(*interval_ms as i64)
            }
        }
    }
}

/// Parse a simple ISO 8601 duration to milliseconds.
/// Supports `P{n}D`, `PT{n}H`, `PT{n}M`, `PT{n}S` and combinations.
fn parse_iso_duration(s: &str) -> Result<u64, EngineError> {
    let body = s
        .strip_prefix('P')
        .ok_or_else(|| EngineError::Timer(format!("duration must start with P: {s}")))?;
    let mut total_ms: u64 = 0;
    let mut in_time = false;
    let mut digits = String::new();
    for ch in body.chars() {
        match ch {
            'T' => in_time = true,
            '0'..='9' | '.' => digits.push(ch),
            unit => {
                let n: f64 = digits
                    .parse()
                    .map_err(|_| EngineError::Timer(format!("bad number in duration: {s}")))?;
                digits.clear();
                let ms = match (unit, in_time) {
                    ('D', false) => n * 86_400_000.0,
                    ('H', true) => n * 3_600_000.0,
                    ('M', true) => n * 60_000.0,
                    ('S', true) => n * 1_000.0,
                    _ => return Err(EngineError::Timer(format!("unit '{unit}' in {s}"))),
                };
                total_ms += ms as u64;
            }
        }
    }
    if !digits.is_empty() {
        return Err(EngineError::Timer(format!("trailing number in {s}")));
    }
    Ok(total_ms)
}

// ─── Multi-instance ───────────────────────────────────────────

/// Loop characteristics on an activity. Either a fixed cardinality or a
/// collection variable (a JSON array) drives the iteration count.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiInstanceSpec {
    pub sequential: bool,
    pub cardinality: Option<u32>,
    pub collection: Option<String>,
    pub element_variable: Option<String>,
}

// ─── Listeners ────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListenerType {
    Start,
    End,
    Take,
    Create,
    Assignment,
    Complete,
}

impl ListenerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerType::Start => "start",
            ListenerType::End => "end",
            ListenerType::Take => "take",
            ListenerType::Create => "create",
            ListenerType::Assignment => "assignment",
            ListenerType::Complete => "complete",
        }
    }
}

impl FromStr for ListenerType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ListenerType::Start),
            "end" => Ok(ListenerType::End),
            "take" => Ok(ListenerType::Take),
            "create" => Ok(ListenerType::Create),
            "assignment" => Ok(ListenerType::Assignment),
            "complete" => Ok(ListenerType::Complete),
            other => Err(EngineError::Value(format!("listener type: {other}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ListenerSpec {
    pub listener_type: ListenerType,
    pub expression: String,
}

// ─── Node descriptor ──────────────────────────────────────────

/// Everything the step loop needs to know about one node, resolved once by
/// the definition index. Optional fields are populated per node kind.
#[derive(Clone, Debug)]
pub struct NodeDescriptor {
    pub uri: NamedNode,
    pub node_type: NodeType,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub message_name: Option<String>,
    pub correlation_variable: Option<String>,
    pub timer: Option<TimerDefinition>,
    pub error_code: Option<String>,
    pub attached_to: Option<NamedNode>,
    /// Boundary events only; defaults to true.
    pub interrupting: bool,
    pub terminate_end: bool,
    pub cancel_end: bool,
    pub is_transaction: bool,
    pub called_process: Option<NamedNode>,
    pub compensate_activity: Option<NamedNode>,
    pub compensation_handler: Option<NamedNode>,
    /// Intermediate throw event that triggers compensation.
    pub compensation_throw: bool,
    pub script: Option<String>,
    pub multi_instance: Option<MultiInstanceSpec>,
    pub listeners: Vec<ListenerSpec>,
    pub assignee: Option<String>,
    pub candidate_users: Vec<String>,
    pub candidate_groups: Vec<String>,
    pub due_date: Option<String>,
    pub priority: Option<i64>,
}

// ─── Runtime records (read-back views) ────────────────────────

#[derive(Clone, Debug)]
pub struct TaskRecord {
    pub uri: NamedNode,
    pub instance: NamedNode,
    pub node: NamedNode,
    pub token: NamedNode,
    pub state: TaskState,
    pub name: Option<String>,
    pub assignee: Option<String>,
    pub candidate_users: Vec<String>,
    pub candidate_groups: Vec<String>,
    pub form_data: serde_json::Value,
    pub due_date: Option<String>,
    pub priority: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_by: Option<String>,
}

#[derive(Clone, Debug)]
pub struct TimerRegistration {
    pub uri: NamedNode,
    pub instance: NamedNode,
    pub node: NamedNode,
    pub token: NamedNode,
    pub fire_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub uri: NamedNode,
    pub instance: NamedNode,
    pub seq: u64,
    pub event_type: String,
    pub node: Option<NamedNode>,
    pub at: DateTime<Utc>,
    pub details: serde_json::Value,
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_type_local_round_trip() {
        for t in NodeType::ALL {
            assert_eq!(NodeType::from_local(t.as_local()), Some(t));
        }
        assert_eq!(NodeType::from_local("Nope"), None);
    }

    #[test]
    fn test_instance_state_terminal() {
        assert!(!InstanceState::Active.is_terminal());
        assert!(!InstanceState::Suspended.is_terminal());
        assert!(InstanceState::Completed.is_terminal());
        assert!(InstanceState::Failed.is_terminal());
        assert!(InstanceState::Terminated.is_terminal());
        assert!(InstanceState::Cancelled.is_terminal());
    }

    #[test]
    fn test_variable_value_literal_round_trip() {
        let values = vec![
            VariableValue::Boolean(true),
            VariableValue::Integer(-42),
            VariableValue::Decimal(Decimal::from_str("10.25").unwrap()),
            VariableValue::Double(2.5),
            VariableValue::String("hello".to_string()),
        ];
        for v in values {
            let lit = v.to_literal();
            assert_eq!(VariableValue::from_literal(&lit).unwrap(), v);
        }
    }

    #[test]
    fn test_unknown_datatype_coerces_to_string() {
        let lit = Literal::new_typed_literal(
            "whatever",
            NamedNode::new_unchecked("http://example.org/custom#blob"),
        );
        assert_eq!(
            VariableValue::from_literal(&lit).unwrap(),
            VariableValue::String("whatever".to_string())
        );
    }

    #[test]
    fn test_numeric_comparison_promotes() {
        let i = VariableValue::Integer(2);
        let d = VariableValue::Decimal(Decimal::from_str("2.0").unwrap());
        let f = VariableValue::Double(2.5);
        assert_eq!(i.compare(&d), Some(Ordering::Equal));
        assert_eq!(i.compare(&f), Some(Ordering::Less));
        assert_eq!(f.compare(&i), Some(Ordering::Greater));
    }

    #[test]
    fn test_mixed_kind_comparison_is_none() {
        let s = VariableValue::String("2".to_string());
        let i = VariableValue::Integer(2);
        assert_eq!(s.compare(&i), None);
    }

    #[test]
    fn test_cmp_op_holds() {
        assert!(CmpOp::Gt.holds(Ordering::Greater));
        assert!(!CmpOp::Gt.holds(Ordering::Equal));
        assert!(CmpOp::Le.holds(Ordering::Equal));
        assert!(CmpOp::Ne.holds(Ordering::Less));
    }

    #[test]
    fn test_parse_iso_duration() {
        assert_eq!(parse_iso_duration("PT5S").unwrap(), 5_000);
        assert_eq!(parse_iso_duration("PT30M").unwrap(), 1_800_000);
        assert_eq!(parse_iso_duration("PT1H").unwrap(), 3_600_000);
        assert_eq!(parse_iso_duration("P1D").unwrap(), 86_400_000);
        assert_eq!(parse_iso_duration("PT1H30M").unwrap(), 5_400_000);
        assert_eq!(parse_iso_duration("P1DT1S").unwrap(), 86_401_000);
        assert!(parse_iso_duration("1H").is_err());
        assert!(parse_iso_duration("P1X").is_err());
    }

    #[test]
    fn test_timer_definition_parse() {
        assert_eq!(
            TimerDefinition::parse("PT2S").unwrap(),
            TimerDefinition::Duration { ms: 2_000 }
        );
        assert_eq!(
            TimerDefinition::parse("R3/PT1H").unwrap(),
            TimerDefinition::Cycle {
                interval_ms: 3_600_000,
                max_fires: 3
            }
        );
        let date = TimerDefinition::parse("2030-01-02T03:04:05Z").unwrap();
        assert!(matches!(date, TimerDefinition::Date(_)));
        assert!(TimerDefinition::parse("soon").is_err());
    }

    #[test]
    fn test_parse_lexical_forms() {
        assert_eq!(
            VariableValue::parse_lexical("\"x\""),
            VariableValue::String("x".to_string())
        );
        assert_eq!(
            VariableValue::parse_lexical("true"),
            VariableValue::Boolean(true)
        );
        assert_eq!(
            VariableValue::parse_lexical("7"),
            VariableValue::Integer(7)
        );
        assert_eq!(
            VariableValue::parse_lexical("2.5d"),
            VariableValue::Double(2.5)
        );
        assert_eq!(
            VariableValue::parse_lexical("10.25"),
            VariableValue::Decimal(Decimal::from_str("10.25").unwrap())
        );
    }
}
