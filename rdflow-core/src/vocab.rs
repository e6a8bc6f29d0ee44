use oxigraph::model::NamedNode;
use uuid::Uuid;

/// Predicate local names, resolved against the vocabulary namespace.
///
/// Definition predicates describe the immutable process graph; runtime
/// predicates are written by the engine as instances execute.
pub mod pred {
    // ── Definition ──
    pub const NAME: &str = "name";
    pub const SOURCE: &str = "source";
    pub const TARGET: &str = "target";
    pub const FLOW_ORDER: &str = "flowOrder";
    pub const DEFAULT_FLOW: &str = "defaultFlow";
    pub const CONDITION: &str = "condition";
    pub const CONDITION_QUERY: &str = "conditionQuery";
    pub const VARIABLE: &str = "variable";
    pub const OPERATOR: &str = "operator";
    pub const VALUE: &str = "value";
    pub const TOPIC: &str = "topic";
    pub const MESSAGE_NAME: &str = "messageName";
    pub const CORRELATION_VARIABLE: &str = "correlationVariable";
    pub const TIMER_SPEC: &str = "timerSpec";
    pub const ERROR_CODE: &str = "errorCode";
    pub const ATTACHED_TO: &str = "attachedTo";
    pub const INTERRUPTING: &str = "isInterrupting";
    pub const TERMINATE_END: &str = "isTerminateEnd";
    pub const CANCEL_END: &str = "isCancelEnd";
    pub const TRANSACTION: &str = "isTransaction";
    pub const START_EVENT: &str = "startEvent";
    pub const PART_OF: &str = "partOf";
    pub const CALLED_PROCESS: &str = "calledProcess";
    pub const COMPENSATION_HANDLER: &str = "compensationHandler";
    pub const COMPENSATE_ACTIVITY: &str = "compensateActivity";
    pub const COMPENSATION_THROW: &str = "isCompensationThrow";
    pub const SCRIPT: &str = "script";
    pub const MI_SEQUENTIAL: &str = "miSequential";
    pub const MI_CARDINALITY: &str = "miCardinality";
    pub const MI_COLLECTION: &str = "miCollection";
    pub const MI_ELEMENT_VARIABLE: &str = "miElementVariable";
    pub const LISTENER: &str = "listener";
    pub const LISTENER_TYPE: &str = "listenerType";
    pub const LISTENER_EXPRESSION: &str = "listenerExpression";
    pub const ASSIGNEE: &str = "assignee";
    pub const CANDIDATE_USER: &str = "candidateUser";
    pub const CANDIDATE_GROUP: &str = "candidateGroup";
    pub const DUE_DATE: &str = "dueDate";
    pub const PRIORITY: &str = "priority";

    // ── Runtime: instance ──
    pub const PROCESS: &str = "process";
    pub const STATE: &str = "state";
    pub const STATE_REASON: &str = "stateReason";
    pub const STARTED_AT: &str = "startedAt";
    pub const COMPLETED_AT: &str = "completedAt";
    pub const PARENT_TOKEN: &str = "parentToken";
    pub const NEXT_RUN_AT: &str = "nextRunAt";
    pub const LAST_RUN_AT: &str = "lastRunAt";
    pub const CADENCE_SECONDS: &str = "cadenceSeconds";

    // ── Runtime: token ──
    pub const INSTANCE: &str = "instance";
    pub const AT_NODE: &str = "atNode";
    pub const LOOP_INDEX: &str = "loopIndex";
    pub const ARRIVED_VIA: &str = "arrivedVia";
    pub const WAIT_KIND: &str = "waitKind";
    pub const WAIT_MESSAGE: &str = "waitMessage";
    pub const CORRELATION_VALUE: &str = "correlationValue";
    pub const WAIT_SEQ: &str = "waitSeq";
    pub const RACE_GROUP: &str = "raceGroup";
    pub const ARMED_BOUNDARY: &str = "armedBoundary";
    pub const FORK_ORIGIN: &str = "forkOrigin";
    pub const FORK_EXPECTED: &str = "forkExpected";
    pub const CHILD_INSTANCE: &str = "childInstance";

    // ── Runtime: variable bindings ──
    pub const VAR_NAME: &str = "varName";
    pub const VAR_VALUE: &str = "varValue";
    pub const SCOPE_TOKEN: &str = "scopeToken";

    // ── Runtime: tasks ──
    pub const NODE: &str = "node";
    pub const TOKEN: &str = "token";
    pub const FORM_DATA: &str = "formData";
    pub const CREATED_AT: &str = "createdAt";
    pub const COMPLETED_BY: &str = "completedBy";

    // ── Runtime: timers ──
    pub const FIRE_AT: &str = "fireAt";
    pub const REPEATS_LEFT: &str = "repeatsLeft";

    // ── Runtime: compensation ──
    pub const ACTIVITY: &str = "activity";
    pub const HANDLER: &str = "handler";
    pub const SCOPE_DEPTH: &str = "scopeDepth";
    pub const COMPLETION_SEQ: &str = "completionSeq";

    // ── Runtime: audit ──
    pub const SEQ: &str = "seq";
    pub const EVENT_TYPE: &str = "eventType";
    pub const AT_TIME: &str = "atTime";
    pub const DETAILS: &str = "details";
    pub const USER: &str = "user";
}

/// Class local names (objects of `rdf:type`).
pub mod class {
    pub const PROCESS: &str = "Process";
    pub const SEQUENCE_FLOW: &str = "SequenceFlow";
    pub const INSTANCE: &str = "Instance";
    pub const TOKEN: &str = "Token";
    pub const VARIABLE_BINDING: &str = "VariableBinding";
    pub const TASK: &str = "Task";
    pub const TIMER_REGISTRATION: &str = "TimerRegistration";
    pub const AUDIT_ENTRY: &str = "AuditEntry";
    pub const COMPENSABLE: &str = "Compensable";
}

/// URI vocabulary for one engine deployment.
///
/// All resources live under a single configurable base IRI, partitioned by
/// conventional prefixes (`process/`, `instance/`, `token/`, ...). The
/// vocabulary namespace (`vocab#`) carries classes and predicates.
#[derive(Debug, Clone)]
pub struct Vocab {
    base: String,
}

pub const DEFAULT_BASE: &str = "http://rdflow.dev/";

impl Default for Vocab {
    fn default() -> Self {
        Self::new(DEFAULT_BASE)
    }
}

impl Vocab {
    pub fn new(base: impl Into<String>) -> Self {
        let mut base = base.into();
        if !base.ends_with('/') {
            base.push('/');
        }
        Self { base }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// A vocabulary predicate, e.g. `prop(pred::STATE)`.
    pub fn prop(&self, local: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("{}vocab#{}", self.base, local))
    }

    /// A vocabulary class, e.g. `class("ServiceTask")`.
    pub fn class(&self, local: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("{}vocab#{}", self.base, local))
    }

    /// Mint a fresh resource under the given prefix: `{base}{kind}/{uuid}`.
    pub fn mint(&self, kind: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("{}{}/{}", self.base, kind, Uuid::now_v7()))
    }

    /// A named resource under the given prefix (used by authoring, where
    /// callers pick stable ids).
    pub fn resource(&self, kind: &str, id: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("{}{}/{}", self.base, kind, id))
    }

    /// True if the IRI belongs to this vocabulary's class/predicate space.
    pub fn owns(&self, iri: &str) -> bool {
        iri.starts_with(self.base.as_str())
    }

    /// Strip the vocabulary namespace from a class IRI, if it is ours.
    pub fn local_class<'a>(&self, iri: &'a str) -> Option<&'a str> {
        iri.strip_prefix(&format!("{}vocab#", self.base))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prop_and_class_iris() {
        let v = Vocab::default();
        assert_eq!(
            v.prop(pred::STATE).as_str(),
            "http://rdflow.dev/vocab#state"
        );
        assert_eq!(
            v.class(class::TOKEN).as_str(),
            "http://rdflow.dev/vocab#Token"
        );
    }

    #[test]
    fn test_mint_is_unique_and_prefixed() {
        let v = Vocab::default();
        let a = v.mint("token");
        let b = v.mint("token");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("http://rdflow.dev/token/"));
    }

    #[test]
    fn test_base_normalization() {
        let v = Vocab::new("http://example.org/engine");
        assert_eq!(v.base(), "http://example.org/engine/");
    }

    #[test]
    fn test_local_class_round_trip() {
        let v = Vocab::default();
        let c = v.class("ServiceTask");
        assert_eq!(v.local_class(c.as_str()), Some("ServiceTask"));
        assert_eq!(v.local_class("http://other.org/vocab#ServiceTask"), None);
    }
}
