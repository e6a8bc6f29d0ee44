use crate::error::EngineError;
use crate::types::VariableValue;
use crate::variables::InstanceService;
use oxigraph::model::NamedNode;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// A business error raised by a service-task handler via `ctx.fail`. It is
/// translated to an `ErrorThrown` event and routed to error boundaries.
#[derive(Clone, Debug)]
pub struct HandlerFailure {
    pub code: String,
    pub message: String,
}

impl HandlerFailure {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Everything that can come out of a handler.
#[derive(Debug)]
pub enum HandlerError {
    /// Business failure; becomes an `ErrorThrown` event.
    Fail(HandlerFailure),
    /// Infrastructure failure; propagates as a library error.
    Engine(EngineError),
}

impl From<HandlerFailure> for HandlerError {
    fn from(f: HandlerFailure) -> Self {
        HandlerError::Fail(f)
    }
}

impl From<EngineError> for HandlerError {
    fn from(e: EngineError) -> Self {
        HandlerError::Engine(e)
    }
}

pub type TopicHandler =
    Arc<dyn Fn(&mut ServiceContext<'_>) -> Result<(), HandlerError> + Send + Sync>;

/// The bounded view a service-task handler gets of the engine (C6).
///
/// Reads resolve through the current token's scope chain; writes default to
/// the instance level. Handlers interact with the engine only through this
/// context.
pub struct ServiceContext<'a> {
    instance: &'a NamedNode,
    node: &'a NamedNode,
    token: &'a NamedNode,
    variables: &'a InstanceService,
    written: BTreeMap<String, VariableValue>,
}

impl<'a> ServiceContext<'a> {
    pub fn new(
        instance: &'a NamedNode,
        node: &'a NamedNode,
        token: &'a NamedNode,
        variables: &'a InstanceService,
    ) -> Self {
        Self {
            instance,
            node,
            token,
            variables,
            written: BTreeMap::new(),
        }
    }

    pub fn instance(&self) -> &NamedNode {
        self.instance
    }

    pub fn node(&self) -> &NamedNode {
        self.node
    }

    pub fn token(&self) -> &NamedNode {
        self.token
    }

    /// Read a variable through the token's scope chain.
    pub fn get_variable(&self, name: &str) -> Result<Option<VariableValue>, EngineError> {
        self.variables
            .get_variable(self.instance, name, Some(self.token))
    }

    /// Write an instance-level variable.
    pub fn set_variable(&mut self, name: &str, value: VariableValue) -> Result<(), EngineError> {
        self.variables
            .set_variable(self.instance, name, value.clone(), None)?;
        self.written.insert(name.to_string(), value);
        Ok(())
    }

    /// Write a variable bound to the current token's scope (shadowing the
    /// instance level for this token and its children).
    pub fn set_local(&mut self, name: &str, value: VariableValue) -> Result<(), EngineError> {
        self.variables
            .set_variable(self.instance, name, value.clone(), Some(self.token))?;
        self.written.insert(name.to_string(), value);
        Ok(())
    }

    /// Raise a business error, e.g. `return Err(ctx.fail("E_STOCK", "out of stock"))`.
    pub fn fail(&self, code: impl Into<String>, message: impl Into<String>) -> HandlerError {
        HandlerError::Fail(HandlerFailure::new(code, message))
    }

    /// The variables this handler wrote, in write order by name. Reported in
    /// `ServiceTaskCompleted`.
    pub fn written(&self) -> &BTreeMap<String, VariableValue> {
        &self.written
    }
}

/// Maps service-task topics to handlers (C6). Registering a topic again
/// replaces the previous handler.
#[derive(Default)]
pub struct TopicRegistry {
    handlers: RwLock<HashMap<String, TopicHandler>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        topic: impl Into<String>,
        handler: impl Fn(&mut ServiceContext<'_>) -> Result<(), HandlerError> + Send + Sync + 'static,
    ) {
        self.handlers
            .write()
            .expect("registry lock poisoned")
            .insert(topic.into(), Arc::new(handler));
    }

    pub fn resolve(&self, topic: &str) -> Option<TopicHandler> {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .get(topic)
            .cloned()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.handlers
            .read()
            .expect("registry lock poisoned")
            .contains_key(topic)
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .handlers
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::scheduler::SystemClock;
    use crate::store::OxiGraphStore;
    use crate::vocab::Vocab;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn context_parts() -> (InstanceService, NamedNode, NamedNode, NamedNode) {
        let variables = InstanceService::new(
            Arc::new(OxiGraphStore::new().unwrap()),
            Arc::new(Vocab::default()),
            Arc::new(EventBus::new()),
            Arc::new(SystemClock),
        );
        let process = NamedNode::new_unchecked("http://rdflow.dev/process/p");
        let instance = variables
            .create_instance(&process, &BTreeMap::new(), None)
            .unwrap();
        let node = NamedNode::new_unchecked("http://rdflow.dev/node/p/tax");
        let token = NamedNode::new_unchecked("http://rdflow.dev/token/t1");
        (variables, instance, node, token)
    }

    #[test]
    fn test_handler_reads_and_writes_through_context() {
        let registry = TopicRegistry::new();
        registry.register("tax", |ctx: &mut ServiceContext<'_>| {
            let total = ctx
                .get_variable("orderTotal")?
                .ok_or_else(|| ctx.fail("E_NO_TOTAL", "orderTotal missing"))?;
            let total = match total {
                VariableValue::Decimal(d) => d,
                VariableValue::Integer(n) => Decimal::from(n),
                other => return Err(ctx.fail("E_TYPE", format!("bad orderTotal: {other}"))),
            };
            let tax = total * Decimal::from_str("0.10").unwrap();
            ctx.set_variable("taxAmount", VariableValue::Decimal(tax))?;
            Ok(())
        });

        let (variables, instance, node, token) = context_parts();
        variables
            .set_variable(&instance, "orderTotal", VariableValue::Integer(1000), None)
            .unwrap();

        let handler = registry.resolve("tax").unwrap();
        let mut ctx = ServiceContext::new(&instance, &node, &token, &variables);
        handler(&mut ctx).unwrap();

        assert_eq!(
            ctx.written().get("taxAmount"),
            Some(&VariableValue::Decimal(Decimal::from_str("100.00").unwrap()))
        );
        assert_eq!(
            variables.get_variable(&instance, "taxAmount", None).unwrap(),
            Some(VariableValue::Decimal(Decimal::from_str("100.00").unwrap()))
        );
    }

    #[test]
    fn test_fail_escape() {
        let registry = TopicRegistry::new();
        registry.register("stock", |ctx: &mut ServiceContext<'_>| {
            Err(ctx.fail("E_STOCK", "no stock left"))
        });

        let (variables, instance, node, token) = context_parts();
        let handler = registry.resolve("stock").unwrap();
        let mut ctx = ServiceContext::new(&instance, &node, &token, &variables);
        match handler(&mut ctx) {
            Err(HandlerError::Fail(failure)) => {
                assert_eq!(failure.code, "E_STOCK");
                assert_eq!(failure.message, "no stock left");
            }
            other => panic!("expected business failure, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_topic_and_replacement() {
        let registry = TopicRegistry::new();
        assert!(registry.resolve("nope").is_none());
        assert!(!registry.contains("nope"));

        registry.register("t", |_ctx: &mut ServiceContext<'_>| Ok(()));
        registry.register("t", |ctx: &mut ServiceContext<'_>| {
            Err(ctx.fail("E", "replaced"))
        });
        assert_eq!(registry.topics(), vec!["t".to_string()]);

        let (variables, instance, node, token) = context_parts();
        let mut ctx = ServiceContext::new(&instance, &node, &token, &variables);
        assert!(matches!(
            registry.resolve("t").unwrap()(&mut ctx),
            Err(HandlerError::Fail(_))
        ));
    }

    #[test]
    fn test_set_local_shadows_instance_level() {
        let (variables, instance, node, token) = context_parts();
        variables
            .set_variable(&instance, "x", VariableValue::Integer(1), None)
            .unwrap();
        let mut ctx = ServiceContext::new(&instance, &node, &token, &variables);
        ctx.set_local("x", VariableValue::Integer(99)).unwrap();

        assert_eq!(
            ctx.get_variable("x").unwrap(),
            Some(VariableValue::Integer(99))
        );
        assert_eq!(
            variables.get_variable(&instance, "x", None).unwrap(),
            Some(VariableValue::Integer(1))
        );
    }
}
