//! End-to-end scenarios: exercise the full engine through its public entry
//! points (start, complete-task, deliver-message, timer fires) and assert
//! on instance state, variables and the audit trail.

use chrono::{TimeZone, Utc};
use oxigraph::io::RdfFormat;
use rdflow_core::authoring::ProcessBuilder;
use rdflow_core::engine::{Engine, EngineConfig};
use rdflow_core::registry::{ServiceContext, TopicRegistry};
use rdflow_core::scheduler::{Clock, ManualClock, Scheduler};
use rdflow_core::store::{GraphStore, OxiGraphStore};
use rdflow_core::types::{CmpOp, InstanceState, MultiInstanceSpec, TaskState, VariableValue};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

fn engine_with(registry: Arc<TopicRegistry>) -> (Arc<Engine>, Arc<ManualClock>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let store: Arc<dyn GraphStore> = Arc::new(OxiGraphStore::new().unwrap());
    let clock = Arc::new(ManualClock::at(
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    ));
    let engine = Engine::new(store, registry, clock.clone(), EngineConfig::default());
    (engine, clock)
}

fn vars(pairs: &[(&str, VariableValue)]) -> BTreeMap<String, VariableValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Position of the first `name` entry at or after `from`.
fn pos(types: &[String], name: &str, from: usize) -> usize {
    types
        .iter()
        .skip(from)
        .position(|t| t == name)
        .map(|p| p + from)
        .unwrap_or_else(|| panic!("{name} not found after index {from} in {types:?}"))
}

/// Scenario 1: Start → ServiceTask(tax) → End with a 10% tax handler.
#[test]
fn linear_service_task_flow() {
    let registry = Arc::new(TopicRegistry::new());
    registry.register("tax", |ctx: &mut ServiceContext<'_>| {
        let total = match ctx.get_variable("orderTotal")? {
            Some(VariableValue::Integer(n)) => Decimal::from(n),
            Some(VariableValue::Decimal(d)) => d,
            other => return Err(ctx.fail("E_INPUT", format!("bad orderTotal: {other:?}"))),
        };
        let tax = total * Decimal::from_str("0.10").unwrap();
        ctx.set_variable("taxAmount", VariableValue::Decimal(tax))?;
        Ok(())
    });
    let (engine, _clock) = engine_with(registry);

    let mut b = ProcessBuilder::new(engine.vocab(), "order");
    let start = b.start_event("start");
    let tax = b.service_task("tax", "tax");
    let end = b.end_event("end");
    b.flow(&start, &tax);
    b.flow(&tax, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(
            &process,
            vars(&[("orderTotal", VariableValue::Integer(1000))]),
            None,
        )
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "taxAmount", None)
            .unwrap(),
        Some(VariableValue::Decimal(Decimal::from(100)))
    );
    // no tokens survive completion
    assert!(engine.tokens().live_tokens(&instance).unwrap().is_empty());

    // audit trail order
    let entries = engine.audit().entries_for(&instance).unwrap();
    let types: Vec<String> = entries.iter().map(|e| e.event_type.clone()).collect();
    let started = pos(&types, "InstanceStateChanged", 0);
    let executed = pos(&types, "ServiceTaskExecute", started);
    let tax_set = entries
        .iter()
        .position(|e| e.event_type == "VariableSet" && e.details["name"] == "taxAmount")
        .expect("taxAmount VariableSet recorded");
    let completed_task = pos(&types, "ServiceTaskCompleted", executed);
    assert!(executed < tax_set && tax_set < completed_task);
    let moved_to_end = entries
        .iter()
        .position(|e| {
            e.event_type == "TokenMoved"
                && e.details["targets"]
                    .as_array()
                    .is_some_and(|t| t.iter().any(|u| u == end.as_str()))
        })
        .expect("TokenMoved to end recorded");
    assert!(completed_task < moved_to_end);
    let finished = entries
        .iter()
        .rposition(|e| e.event_type == "InstanceStateChanged" && e.details["newState"] == "completed")
        .expect("completion recorded");
    assert!(moved_to_end < finished);
    // audit timestamps are monotone within the lane
    for pair in entries.windows(2) {
        assert!(pair[0].at <= pair[1].at);
        assert!(pair[0].seq < pair[1].seq);
    }
}

/// Scenario 2: exclusive gateway routes on `amount`, default flow otherwise.
#[test]
fn exclusive_gateway_routing() {
    let build = |engine: &Arc<Engine>| {
        let mut b = ProcessBuilder::new(engine.vocab(), "routing");
        let start = b.start_event("start");
        let gw = b.exclusive_gateway("decide");
        let a = b.script_task("mark-a", "path = \"A\"");
        let bb = b.script_task("mark-b", "path = \"B\"");
        let end_a = b.end_event("end-a");
        let end_b = b.end_event("end-b");
        b.flow(&start, &gw);
        b.conditional_flow(&gw, &a, "amount", CmpOp::Gt, VariableValue::Integer(1000));
        b.default_flow(&gw, &bb);
        b.flow(&a, &end_a);
        b.flow(&bb, &end_b);
        b.build(engine.store().as_ref()).unwrap()
    };

    for (amount, expected) in [(500, "B"), (1500, "A")] {
        let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));
        let process = build(&engine);
        let instance = engine
            .start_instance(
                &process,
                vars(&[("amount", VariableValue::Integer(amount))]),
                None,
            )
            .unwrap();
        assert_eq!(
            engine.instances().state(&instance).unwrap(),
            InstanceState::Completed
        );
        assert_eq!(
            engine
                .instances()
                .get_variable(&instance, "path", None)
                .unwrap(),
            Some(VariableValue::String(expected.to_string())),
            "amount {amount} must route through {expected}"
        );
    }
}

/// Scenario 3: parallel split and join; each branch increments a counter,
/// exactly one token emerges downstream.
#[test]
fn parallel_split_and_join() {
    let registry = Arc::new(TopicRegistry::new());
    registry.register("inc", |ctx: &mut ServiceContext<'_>| {
        let n = match ctx.get_variable("counter")? {
            Some(VariableValue::Integer(n)) => n,
            _ => 0,
        };
        ctx.set_variable("counter", VariableValue::Integer(n + 1))?;
        Ok(())
    });
    let (engine, _clock) = engine_with(registry);

    let mut b = ProcessBuilder::new(engine.vocab(), "fanout");
    let start = b.start_event("start");
    let split = b.parallel_gateway("split");
    let inc1 = b.service_task("inc-1", "inc");
    let inc2 = b.service_task("inc-2", "inc");
    let join = b.parallel_gateway("join");
    let after = b.script_task("after", "joined = true");
    let end = b.end_event("end");
    b.flow(&start, &split);
    b.flow(&split, &inc1);
    b.flow(&split, &inc2);
    b.flow(&inc1, &join);
    b.flow(&inc2, &join);
    b.flow(&join, &after);
    b.flow(&after, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "counter", None)
            .unwrap(),
        Some(VariableValue::Integer(2))
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "joined", None)
            .unwrap(),
        Some(VariableValue::Boolean(true))
    );

    // exactly one token crossed the join into the downstream task
    let entries = engine.audit().entries_for(&instance).unwrap();
    let into_after = entries
        .iter()
        .filter(|e| {
            e.event_type == "TokenMoved"
                && e.details["targets"]
                    .as_array()
                    .is_some_and(|t| t.iter().any(|u| u == after.as_str()))
        })
        .count();
    assert_eq!(into_after, 1);
}

/// Scenario 4: a user task suspends the instance; completing it resumes.
#[test]
fn user_task_suspend_and_resume() {
    let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "approval");
    let start = b.start_event("start");
    let approve = b.user_task("approve", "Approve order");
    b.assign(&approve, "alice");
    let end = b.end_event("end");
    b.flow(&start, &approve);
    b.flow(&approve, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Active
    );

    let open = engine.tasks().open_tasks(&instance).unwrap();
    assert_eq!(open.len(), 1);
    let record = engine.tasks().record(&open[0]).unwrap();
    assert_eq!(record.state, TaskState::Created);
    assert_eq!(record.assignee.as_deref(), Some("alice"));

    engine
        .complete_task(
            &open[0],
            "alice",
            vars(&[("approved", VariableValue::Boolean(true))]),
        )
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "approved", None)
            .unwrap(),
        Some(VariableValue::Boolean(true))
    );
    assert!(engine.tasks().open_tasks(&instance).unwrap().is_empty());
}

/// Scenario 5: an interrupting PT1S timer boundary cancels the user task and
/// diverts execution to the escalation path.
#[test]
fn timer_boundary_interrupts_user_task() {
    let (engine, clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "escalation");
    let start = b.start_event("start");
    let approve = b.user_task("approve", "Approve order");
    let timeout = b.boundary_timer("timeout", &approve, "PT1S", true);
    let escalate = b.script_task("escalate", "escalated = true");
    let end_ok = b.end_event("end-ok");
    let end_late = b.end_event("end-late");
    b.flow(&start, &approve);
    b.flow(&approve, &end_ok);
    b.flow(&timeout, &escalate);
    b.flow(&escalate, &end_late);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();
    let open = engine.tasks().open_tasks(&instance).unwrap();
    assert_eq!(open.len(), 1);

    // nothing happens before the deadline
    engine.fire_due_timers(clock.now()).unwrap();
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Active
    );

    clock.advance(chrono::Duration::seconds(2));
    engine.fire_due_timers(clock.now()).unwrap();

    assert_eq!(
        engine.tasks().record(&open[0]).unwrap().state,
        TaskState::Cancelled
    );
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "escalated", None)
            .unwrap(),
        Some(VariableValue::Boolean(true))
    );
    let types = engine.audit().event_types_for(&instance).unwrap();
    assert!(types.iter().any(|t| t == "BoundaryEventTriggered"));
}

/// Scenario 6: a handler failure routes to the matching error boundary and
/// the instance completes instead of failing.
#[test]
fn error_boundary_catches_handler_failure() {
    let registry = Arc::new(TopicRegistry::new());
    registry.register("reserve", |ctx: &mut ServiceContext<'_>| {
        Err(ctx.fail("E_STOCK", "out of stock"))
    });
    let (engine, _clock) = engine_with(registry);

    let mut b = ProcessBuilder::new(engine.vocab(), "reservation");
    let start = b.start_event("start");
    let reserve = b.service_task("reserve", "reserve");
    let on_stock = b.boundary_error("on-stock", &reserve, Some("E_STOCK"));
    let fallback = b.script_task("fallback", "fallback = true");
    let end_ok = b.end_event("end-ok");
    let end_fallback = b.end_event("end-fallback");
    b.flow(&start, &reserve);
    b.flow(&reserve, &end_ok);
    b.flow(&on_stock, &fallback);
    b.flow(&fallback, &end_fallback);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "fallback", None)
            .unwrap(),
        Some(VariableValue::Boolean(true))
    );
    let types = engine.audit().event_types_for(&instance).unwrap();
    let thrown = pos(&types, "ErrorThrown", 0);
    let boundary = pos(&types, "BoundaryEventTriggered", thrown);
    assert!(thrown < boundary);
}

/// A handler failure with no matching boundary fails the instance.
#[test]
fn unhandled_error_fails_instance() {
    let registry = Arc::new(TopicRegistry::new());
    registry.register("boom", |ctx: &mut ServiceContext<'_>| {
        Err(ctx.fail("E_BOOM", "no survivors"))
    });
    let (engine, _clock) = engine_with(registry);

    let mut b = ProcessBuilder::new(engine.vocab(), "fragile");
    let start = b.start_event("start");
    let task = b.service_task("boom", "boom");
    let end = b.end_event("end");
    b.flow(&start, &task);
    b.flow(&task, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Failed
    );
}

/// Subprocess: variables flow in, the child runs to completion, outputs
/// surface in the parent.
#[test]
fn subprocess_runs_and_returns_outputs() {
    let registry = Arc::new(TopicRegistry::new());
    registry.register("work", |ctx: &mut ServiceContext<'_>| {
        let seed = match ctx.get_variable("seed")? {
            Some(VariableValue::Integer(n)) => n,
            _ => 0,
        };
        ctx.set_variable("result", VariableValue::Integer(seed * 2))?;
        Ok(())
    });
    let (engine, _clock) = engine_with(registry);

    let mut b = ProcessBuilder::new(engine.vocab(), "outer");
    let start = b.start_event("start");
    let sub = b.subprocess("sub");
    let inner_start = b.start_event("inner-start");
    let work = b.service_task("work", "work");
    let inner_end = b.end_event("inner-end");
    b.contain(&sub, &[&inner_start, &work, &inner_end]);
    let end = b.end_event("end");
    b.flow(&start, &sub);
    b.flow(&sub, &end);
    b.flow(&inner_start, &work);
    b.flow(&work, &inner_end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, vars(&[("seed", VariableValue::Integer(21))]), None)
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "result", None)
            .unwrap(),
        Some(VariableValue::Integer(42))
    );
    let types = engine.audit().event_types_for(&instance).unwrap();
    let started = pos(&types, "SubprocessStarted", 0);
    let completed = pos(&types, "SubprocessCompleted", started);
    assert!(started < completed);
}

/// An error inside a subprocess escalates to the boundary event on the
/// subprocess node in the parent.
#[test]
fn subprocess_error_escalates_to_parent_boundary() {
    let registry = Arc::new(TopicRegistry::new());
    registry.register("risky", |ctx: &mut ServiceContext<'_>| {
        Err(ctx.fail("E_INNER", "inner failure"))
    });
    let (engine, _clock) = engine_with(registry);

    let mut b = ProcessBuilder::new(engine.vocab(), "guarded");
    let start = b.start_event("start");
    let sub = b.subprocess("sub");
    let inner_start = b.start_event("inner-start");
    let risky = b.service_task("risky", "risky");
    let inner_end = b.end_event("inner-end");
    b.contain(&sub, &[&inner_start, &risky, &inner_end]);
    let on_error = b.boundary_error("on-error", &sub, Some("E_INNER"));
    let recover = b.script_task("recover", "recovered = true");
    let end = b.end_event("end");
    let end_recover = b.end_event("end-recover");
    b.flow(&start, &sub);
    b.flow(&sub, &end);
    b.flow(&inner_start, &risky);
    b.flow(&risky, &inner_end);
    b.flow(&on_error, &recover);
    b.flow(&recover, &end_recover);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "recovered", None)
            .unwrap(),
        Some(VariableValue::Boolean(true))
    );
}

/// Message correlation: the payload lands on the instance whose correlation
/// value matches, not the first waiter.
#[test]
fn message_delivery_correlates() {
    let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "payment");
    let start = b.start_event("start");
    let wait = b.receive_task("wait-payment", "payment");
    b.correlate(&wait, "orderId");
    let done = b.script_task("done", "paid = true");
    let end = b.end_event("end");
    b.flow(&start, &wait);
    b.flow(&wait, &done);
    b.flow(&done, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let first = engine
        .start_instance(&process, vars(&[("orderId", VariableValue::Integer(1))]), None)
        .unwrap();
    let second = engine
        .start_instance(&process, vars(&[("orderId", VariableValue::Integer(2))]), None)
        .unwrap();

    let delivered = engine
        .deliver_message(
            "payment",
            Some(&VariableValue::Integer(2)),
            &vars(&[("amount", VariableValue::Integer(99))]),
        )
        .unwrap();
    assert!(delivered);

    assert_eq!(
        engine.instances().state(&first).unwrap(),
        InstanceState::Active
    );
    assert_eq!(
        engine.instances().state(&second).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&second, "amount", None)
            .unwrap(),
        Some(VariableValue::Integer(99))
    );

    // no more waiters for that key
    assert!(!engine
        .deliver_message("payment", Some(&VariableValue::Integer(2)), &BTreeMap::new())
        .unwrap());
}

/// Event-based gateway: the first event to fire wins and the losing arm's
/// timer wait is cancelled.
#[test]
fn event_gateway_message_beats_timer() {
    let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "race");
    let start = b.start_event("start");
    let gw = b.event_gateway("choose");
    let on_msg = b.catch_message("on-msg", "go");
    let on_timer = b.catch_timer("on-timer", "PT1H");
    let fast = b.script_task("fast", "outcome = \"message\"");
    let slow = b.script_task("slow", "outcome = \"timeout\"");
    let end_fast = b.end_event("end-fast");
    let end_slow = b.end_event("end-slow");
    b.flow(&start, &gw);
    b.flow(&gw, &on_msg);
    b.flow(&gw, &on_timer);
    b.flow(&on_msg, &fast);
    b.flow(&on_timer, &slow);
    b.flow(&fast, &end_fast);
    b.flow(&slow, &end_slow);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Active
    );
    assert_eq!(engine.timers().pending_for_instance(&instance).unwrap(), 1);

    assert!(engine.deliver_message("go", None, &BTreeMap::new()).unwrap());

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "outcome", None)
            .unwrap(),
        Some(VariableValue::String("message".to_string()))
    );
    assert_eq!(engine.timers().pending_for_instance(&instance).unwrap(), 0);
}

/// Parallel multi-instance service task with a fixed cardinality.
#[test]
fn multi_instance_service_task() {
    let registry = Arc::new(TopicRegistry::new());
    registry.register("inc", |ctx: &mut ServiceContext<'_>| {
        let n = match ctx.get_variable("counter")? {
            Some(VariableValue::Integer(n)) => n,
            _ => 0,
        };
        ctx.set_variable("counter", VariableValue::Integer(n + 1))?;
        Ok(())
    });
    let (engine, _clock) = engine_with(registry);

    let mut b = ProcessBuilder::new(engine.vocab(), "batch");
    let start = b.start_event("start");
    let work = b.service_task("work", "inc");
    b.multi_instance(
        &work,
        &MultiInstanceSpec {
            sequential: false,
            cardinality: Some(3),
            collection: None,
            element_variable: None,
        },
    );
    let end = b.end_event("end");
    b.flow(&start, &work);
    b.flow(&work, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "counter", None)
            .unwrap(),
        Some(VariableValue::Integer(3))
    );
}

/// A terminate end event kills the whole instance, cancelling open tasks.
#[test]
fn terminate_end_consumes_everything() {
    let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "abort");
    let start = b.start_event("start");
    let split = b.parallel_gateway("split");
    let approve = b.user_task("approve", "Approve");
    let kill = b.terminate_end("kill");
    let end = b.end_event("end");
    b.flow(&start, &split);
    b.flow(&split, &approve);
    b.flow(&split, &kill);
    b.flow(&approve, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Terminated
    );
    assert!(engine.tokens().live_tokens(&instance).unwrap().is_empty());
    assert!(engine.tasks().open_tasks(&instance).unwrap().is_empty());
    let types = engine.audit().event_types_for(&instance).unwrap();
    assert!(types.iter().any(|t| t == "TerminateTriggered"));
}

/// Round-trip: serializing the graph mid-flight and reloading it into a
/// fresh engine reproduces the same active state, which then completes
/// normally.
#[test]
fn serialized_state_round_trips() {
    let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "approval");
    let start = b.start_event("start");
    let approve = b.user_task("approve", "Approve order");
    let end = b.end_event("end");
    b.flow(&start, &approve);
    b.flow(&approve, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(
            &process,
            vars(&[("amount", VariableValue::Integer(7))]),
            None,
        )
        .unwrap();
    let task = engine.tasks().open_tasks(&instance).unwrap()[0].clone();
    let bytes = engine.store().serialize(RdfFormat::NQuads).unwrap();

    // fresh engine over the reloaded graph
    let store: Arc<dyn GraphStore> = Arc::new(OxiGraphStore::new().unwrap());
    store.parse(&bytes, RdfFormat::NQuads).unwrap();
    let clock = Arc::new(ManualClock::at(
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
    ));
    let engine2 = Engine::new(
        store,
        Arc::new(TopicRegistry::new()),
        clock,
        EngineConfig::default(),
    );
    engine2.timers().rebuild().unwrap();

    assert_eq!(
        engine2.instances().state(&instance).unwrap(),
        InstanceState::Active
    );
    assert_eq!(
        engine2
            .instances()
            .get_variable(&instance, "amount", None)
            .unwrap(),
        Some(VariableValue::Integer(7))
    );
    assert_eq!(engine2.tasks().open_tasks(&instance).unwrap(), vec![task.clone()]);

    engine2.complete_task(&task, "alice", BTreeMap::new()).unwrap();
    assert_eq!(
        engine2.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
}

/// The scheduler loop drives an overdue boundary timer through the engine.
#[tokio::test(start_paused = true)]
async fn scheduler_loop_fires_overdue_timer() {
    let (engine, clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "deadline");
    let start = b.start_event("start");
    let approve = b.user_task("approve", "Approve");
    let timeout = b.boundary_timer("timeout", &approve, "PT1S", true);
    let escalate = b.script_task("escalate", "escalated = true");
    let end_ok = b.end_event("end-ok");
    let end_late = b.end_event("end-late");
    b.flow(&start, &approve);
    b.flow(&approve, &end_ok);
    b.flow(&timeout, &escalate);
    b.flow(&escalate, &end_late);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();
    clock.advance(chrono::Duration::seconds(5));

    let handle = Scheduler::new(engine.clone(), std::time::Duration::from_millis(50)).spawn();
    for _ in 0..10 {
        tokio::time::advance(std::time::Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        if engine.instances().state(&instance).unwrap().is_terminal() {
            break;
        }
    }
    handle.abort();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "escalated", None)
            .unwrap(),
        Some(VariableValue::Boolean(true))
    );
}

/// A suspended instance rejects task completion until resumed.
#[test]
fn suspended_instance_rejects_input() {
    let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "pausable");
    let start = b.start_event("start");
    let approve = b.user_task("approve", "Approve");
    let end = b.end_event("end");
    b.flow(&start, &approve);
    b.flow(&approve, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();
    let task = engine.tasks().open_tasks(&instance).unwrap()[0].clone();

    engine.suspend_instance(&instance).unwrap();
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Suspended
    );
    assert!(engine
        .complete_task(&task, "alice", BTreeMap::new())
        .is_err());

    engine.resume_instance(&instance).unwrap();
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Active
    );
    engine.complete_task(&task, "alice", BTreeMap::new()).unwrap();
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
}

/// `signal_timer` fires a pending timer wait without consulting the clock.
#[test]
fn signal_timer_fires_catch_event_early() {
    let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "delay");
    let start = b.start_event("start");
    let wait = b.catch_timer("wait", "PT1H");
    let done = b.script_task("done", "woke = true");
    let end = b.end_event("end");
    b.flow(&start, &wait);
    b.flow(&wait, &done);
    b.flow(&done, &end);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();
    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Active
    );

    let waiting = engine.tokens().live_tokens(&instance).unwrap();
    assert_eq!(waiting.len(), 1);
    engine.signal_timer(&waiting[0]).unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "woke", None)
            .unwrap(),
        Some(VariableValue::Boolean(true))
    );
    assert_eq!(engine.timers().pending_for_instance(&instance).unwrap(), 0);
}

/// A message throw event in one instance resumes a receive task in another.
#[test]
fn throw_event_delivers_message_across_instances() {
    let (engine, _clock) = engine_with(Arc::new(TopicRegistry::new()));

    let mut b = ProcessBuilder::new(engine.vocab(), "listener");
    let start = b.start_event("start");
    let wait = b.receive_task("wait", "ping");
    let end = b.end_event("end");
    b.flow(&start, &wait);
    b.flow(&wait, &end);
    let listener_process = b.build(engine.store().as_ref()).unwrap();

    let mut b = ProcessBuilder::new(engine.vocab(), "sender");
    let start = b.start_event("start");
    let throw = b.throw_message("notify", "ping");
    let end = b.end_event("end");
    b.flow(&start, &throw);
    b.flow(&throw, &end);
    let sender_process = b.build(engine.store().as_ref()).unwrap();

    let listener = engine
        .start_instance(&listener_process, BTreeMap::new(), None)
        .unwrap();
    assert_eq!(
        engine.instances().state(&listener).unwrap(),
        InstanceState::Active
    );

    let sender = engine
        .start_instance(&sender_process, BTreeMap::new(), None)
        .unwrap();

    assert_eq!(
        engine.instances().state(&sender).unwrap(),
        InstanceState::Completed
    );
    assert_eq!(
        engine.instances().state(&listener).unwrap(),
        InstanceState::Completed
    );
    let types = engine.audit().event_types_for(&listener).unwrap();
    assert!(types.iter().any(|t| t == "MessageReceived"));
}

/// Compensation: a cancel end event in a transaction compensates completed
/// activities in reverse order and takes the cancel boundary path.
#[test]
fn transaction_cancel_triggers_compensation() {
    let registry = Arc::new(TopicRegistry::new());
    registry.register("book", |ctx: &mut ServiceContext<'_>| {
        ctx.set_variable("booked", VariableValue::Boolean(true))?;
        Ok(())
    });
    registry.register("unbook", |ctx: &mut ServiceContext<'_>| {
        ctx.set_variable("booked", VariableValue::Boolean(false))?;
        Ok(())
    });
    let (engine, _clock) = engine_with(registry);

    let mut b = ProcessBuilder::new(engine.vocab(), "booking");
    let start = b.start_event("start");
    let tx = b.transaction("tx");
    let inner_start = b.start_event("inner-start");
    let book = b.service_task("book", "book");
    let undo = b.service_task("undo-book", "unbook");
    b.compensation_handler(&book, &undo);
    let cancel = b.cancel_end("cancel");
    b.contain(&tx, &[&inner_start, &book, &undo, &cancel]);
    let on_cancel = b.boundary_cancel("on-cancel", &tx);
    let apologise = b.script_task("apologise", "apologised = true");
    let end = b.end_event("end");
    let end_cancelled = b.end_event("end-cancelled");
    b.flow(&start, &tx);
    b.flow(&tx, &end);
    b.flow(&inner_start, &book);
    b.flow(&book, &cancel);
    b.flow(&on_cancel, &apologise);
    b.flow(&apologise, &end_cancelled);
    let process = b.build(engine.store().as_ref()).unwrap();

    let instance = engine
        .start_instance(&process, BTreeMap::new(), None)
        .unwrap();

    assert_eq!(
        engine.instances().state(&instance).unwrap(),
        InstanceState::Completed
    );
    // the transaction child was cancelled, and its compensation handler
    // undid the booking in the child's own namespace
    let cancelled = engine
        .instances()
        .instances_in_state(InstanceState::Cancelled)
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(
        engine
            .instances()
            .get_variable(&cancelled[0], "booked", None)
            .unwrap(),
        Some(VariableValue::Boolean(false))
    );
    assert_eq!(
        engine
            .instances()
            .get_variable(&instance, "apologised", None)
            .unwrap(),
        Some(VariableValue::Boolean(true))
    );
    // the cancel itself and the compensation run are on the child's trail
    let child_types = engine.audit().event_types_for(&cancelled[0]).unwrap();
    assert!(child_types.iter().any(|t| t == "CancelTriggered"));
    let parent_types = engine.audit().event_types_for(&instance).unwrap();
    assert!(parent_types.iter().any(|t| t == "BoundaryEventTriggered"));
}
