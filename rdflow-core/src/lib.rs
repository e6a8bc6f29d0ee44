//! rdflow-core: a definition-agnostic process execution engine whose process
//! definitions and runtime state (instances, tokens, variables, tasks, audit
//! trail, timers) all live in one RDF graph.
//!
//! The engine advances process instances by moving tokens across nodes; node
//! handlers publish typed events on a synchronous bus, service-task logic is
//! invoked through a topic registry, and a scheduler drives timers and
//! per-instance cadence out-of-band.

pub mod audit;
pub mod authoring;
pub mod bus;
pub mod definition;
pub mod engine;
pub mod error;
pub mod events;
pub mod gateway;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod token;
pub mod types;
pub mod variables;
pub mod vocab;

pub use bus::EventBus;
pub use engine::{Engine, EngineConfig};
pub use error::EngineError;
pub use events::{EventKind, ExecutionEvent};
pub use registry::{HandlerFailure, ServiceContext, TopicRegistry};
pub use store::{GraphStore, OxiGraphStore};
pub use types::VariableValue;
pub use vocab::Vocab;
