use thiserror::Error;

/// Reserved engine error codes. Definition-level failures surface as
/// `ErrorThrown` events carrying one of these codes; they route through
/// error boundary events like any business error.
pub mod codes {
    /// Exclusive gateway with no matching condition and no default flow.
    pub const NO_VALID_PATH: &str = "NoValidPath";
    /// Condition raised while evaluating an exclusive gateway flow.
    pub const CONDITION_EVALUATION_FAILED: &str = "ConditionEvaluationFailed";
    /// Service task references a topic with no registered handler.
    pub const TOPIC_MISSING: &str = "EngineTopicMissing";
    /// Process definition has no usable start event.
    pub const MISSING_START_EVENT: &str = "EngineMissingStartEvent";
}

/// Library-level failures. BPMN-level errors (handler `fail`, no valid
/// path) do NOT use this type; they travel as `ErrorThrown` events and are
/// resolved by boundary events or by failing the instance.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(String),

    #[error("sparql error: {0}")]
    Sparql(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid iri: {0}")]
    Iri(String),

    #[error("invalid definition: {0}")]
    Definition(String),

    #[error("unknown process: {0}")]
    UnknownProcess(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    #[error("unknown token: {0}")]
    UnknownToken(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error("task {task} is {state}, cannot complete")]
    TaskNotOpen { task: String, state: String },

    #[error("instance {instance} is {state}, cannot accept input")]
    InstanceNotActive { instance: String, state: String },

    #[error("subscriber '{name}' failed: {source}")]
    Subscriber {
        name: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("invalid value: {0}")]
    Value(String),

    #[error("invalid timer specification: {0}")]
    Timer(String),
}

impl EngineError {
    pub fn store(e: impl std::fmt::Display) -> Self {
        EngineError::Store(e.to_string())
    }

    pub fn sparql(e: impl std::fmt::Display) -> Self {
        EngineError::Sparql(e.to_string())
    }
}
