use crate::engine::Engine;
use crate::error::EngineError;
use crate::store::GraphStore;
use crate::types::TimerRegistration;
use crate::vocab::{class, pred, Vocab};
use chrono::{DateTime, Utc};
use oxigraph::model::vocab::{rdf, xsd};
use oxigraph::model::{Literal, NamedNode, Term};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

// ─── Clock ────────────────────────────────────────────────────

/// Single logical clock source for the engine. Swappable so timer behavior
/// is testable without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Test clock advanced by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        *self.now.lock().expect("clock lock poisoned") = t;
    }

    pub fn advance(&self, d: chrono::Duration) {
        let mut now = self.now.lock().expect("clock lock poisoned");
        *now += d;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock lock poisoned")
    }
}

// ─── Timer service ────────────────────────────────────────────

/// Timer registrations: a priority queue by `fireAt`, mirrored in timer
/// triples so a serialized graph reproduces the pending timers on reload.
pub struct TimerService {
    store: Arc<dyn GraphStore>,
    vocab: Arc<Vocab>,
    queue: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, String)>>>,
}

impl TimerService {
    pub fn new(store: Arc<dyn GraphStore>, vocab: Arc<Vocab>) -> Self {
        Self {
            store,
            vocab,
            queue: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn register(
        &self,
        instance: &NamedNode,
        node: &NamedNode,
        token: &NamedNode,
        fire_at: DateTime<Utc>,
        repeats_left: Option<u32>,
    ) -> Result<NamedNode, EngineError> {
        let timer = self.vocab.mint("timer");
        let v = &self.vocab;
        self.store.add(
            &timer,
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(v.class(class::TIMER_REGISTRATION)),
        )?;
        self.store
            .add(&timer, &v.prop(pred::INSTANCE), &Term::NamedNode(instance.clone()))?;
        self.store
            .add(&timer, &v.prop(pred::NODE), &Term::NamedNode(node.clone()))?;
        self.store
            .add(&timer, &v.prop(pred::TOKEN), &Term::NamedNode(token.clone()))?;
        self.store.add(
            &timer,
            &v.prop(pred::FIRE_AT),
            &Term::Literal(Literal::new_typed_literal(
                fire_at.to_rfc3339(),
                xsd::DATE_TIME,
            )),
        )?;
        if let Some(repeats) = repeats_left {
            self.store.add(
                &timer,
                &v.prop(pred::REPEATS_LEFT),
                &Term::Literal(Literal::new_typed_literal(repeats.to_string(), xsd::INTEGER)),
            )?;
        }
        self.queue
            .lock()
            .expect("timer lock poisoned")
            .push(Reverse((fire_at, timer.as_str().to_string())));
        debug!(timer = timer.as_str(), %fire_at, "timer registered");
        Ok(timer)
    }

    fn read(&self, timer: &NamedNode) -> Result<Option<TimerRegistration>, EngineError> {
        let v = &self.vocab;
        let Some(fire_at) = self
            .store
            .value_str(timer, &v.prop(pred::FIRE_AT))?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
        else {
            return Ok(None);
        };
        let (Some(instance), Some(node), Some(token)) = (
            self.store.value_node(timer, &v.prop(pred::INSTANCE))?,
            self.store.value_node(timer, &v.prop(pred::NODE))?,
            self.store.value_node(timer, &v.prop(pred::TOKEN))?,
        ) else {
            return Ok(None);
        };
        Ok(Some(TimerRegistration {
            uri: timer.clone(),
            instance,
            node,
            token,
            fire_at,
        }))
    }

    pub fn repeats_left(&self, timer: &NamedNode) -> Result<Option<u32>, EngineError> {
        Ok(self
            .store
            .value_str(timer, &self.vocab.prop(pred::REPEATS_LEFT))?
            .and_then(|s| s.parse().ok()))
    }

    /// Remove a registration (fired or cancelled).
    pub fn remove(&self, timer: &NamedNode) -> Result<(), EngineError> {
        self.store.remove_subject(timer)?;
        Ok(())
    }

    /// Cancel every registration owned by a token. Returns how many were
    /// cancelled. The in-memory queue is cleaned lazily on `due`.
    pub fn cancel_for_token(&self, token: &NamedNode) -> Result<usize, EngineError> {
        let timers = self.registrations_matching(pred::TOKEN, token)?;
        let count = timers.len();
        for timer in timers {
            self.remove(&timer)?;
        }
        Ok(count)
    }

    fn registrations_matching(
        &self,
        local: &str,
        target: &NamedNode,
    ) -> Result<Vec<NamedNode>, EngineError> {
        let v = &self.vocab;
        let mut out = Vec::new();
        for timer in self
            .store
            .subjects_with(&v.prop(local), &Term::NamedNode(target.clone()))?
        {
            let is_timer = self
                .store
                .value_node(&timer, &rdf::TYPE.into_owned())?
                .is_some_and(|t| t == v.class(class::TIMER_REGISTRATION));
            if is_timer {
                out.push(timer);
            }
        }
        Ok(out)
    }

    pub fn registration_for_token(
        &self,
        token: &NamedNode,
    ) -> Result<Option<TimerRegistration>, EngineError> {
        for timer in self.registrations_matching(pred::TOKEN, token)? {
            if let Some(registration) = self.read(&timer)? {
                return Ok(Some(registration));
            }
        }
        Ok(None)
    }

    pub fn pending_for_instance(&self, instance: &NamedNode) -> Result<usize, EngineError> {
        Ok(self.registrations_matching(pred::INSTANCE, instance)?.len())
    }

    /// Pop every registration due at `now`. Cancelled timers (triples gone)
    /// are skipped.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<TimerRegistration>, EngineError> {
        let mut due = Vec::new();
        let mut queue = self.queue.lock().expect("timer lock poisoned");
        while let Some(Reverse((fire_at, _))) = queue.peek() {
            if *fire_at > now {
                break;
            }
            let Some(Reverse((_, uri))) = queue.pop() else {
                break;
            };
            let timer = NamedNode::new_unchecked(uri);
            if let Some(registration) = self.read(&timer)? {
                due.push(registration);
            }
        }
        Ok(due)
    }

    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.queue
            .lock()
            .expect("timer lock poisoned")
            .peek()
            .map(|Reverse((at, _))| *at)
    }

    /// Rebuild the in-memory queue from timer triples (after `parse`).
    pub fn rebuild(&self) -> Result<usize, EngineError> {
        let v = &self.vocab;
        let mut queue = self.queue.lock().expect("timer lock poisoned");
        queue.clear();
        let mut count = 0;
        for timer in self.store.subjects_with(
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(v.class(class::TIMER_REGISTRATION)),
        )? {
            if let Some(registration) = self.read(&timer)? {
                queue.push(Reverse((
                    registration.fire_at,
                    registration.uri.as_str().to_string(),
                )));
                count += 1;
            }
        }
        Ok(count)
    }
}

// ─── Scheduler ────────────────────────────────────────────────

/// Time-based dispatch (C9): fires due timer registrations and resumes
/// instances whose `nextRunAt` is due. Failures in one item are logged and
/// do not halt the tick; failures in one tick do not halt later ticks.
pub struct Scheduler {
    engine: Arc<Engine>,
    tick_interval: std::time::Duration,
}

impl Scheduler {
    pub fn new(engine: Arc<Engine>, tick_interval: std::time::Duration) -> Self {
        Self {
            engine,
            tick_interval,
        }
    }

    /// One scheduler pass at the engine clock's current time.
    pub fn tick(&self) {
        let now = self.engine.clock().now();
        if let Err(e) = self.engine.fire_due_timers(now) {
            warn!(error = %e, "timer pass failed");
        }
        if let Err(e) = self.engine.resume_due_instances(now) {
            warn!(error = %e, "cadence pass failed");
        }
    }

    /// Run the scheduler loop on the tokio runtime until aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                self.tick();
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OxiGraphStore;
    use oxigraph::io::RdfFormat;

    fn setup() -> (Arc<OxiGraphStore>, Arc<Vocab>, TimerService) {
        let store: Arc<OxiGraphStore> = Arc::new(OxiGraphStore::new().unwrap());
        let vocab = Arc::new(Vocab::default());
        let timers = TimerService::new(store.clone(), vocab.clone());
        (store, vocab, timers)
    }

    fn node(iri: &str) -> NamedNode {
        NamedNode::new_unchecked(iri)
    }

    #[test]
    fn test_due_pops_in_fire_order() {
        let (_, _, timers) = setup();
        let instance = node("http://rdflow.dev/instance/1");
        let n = node("http://rdflow.dev/node/p/timer");
        let t0 = Utc::now();

        let late = timers
            .register(
                &instance,
                &n,
                &node("http://rdflow.dev/token/late"),
                t0 + chrono::Duration::seconds(10),
                None,
            )
            .unwrap();
        let early = timers
            .register(
                &instance,
                &n,
                &node("http://rdflow.dev/token/early"),
                t0 + chrono::Duration::seconds(1),
                None,
            )
            .unwrap();

        assert!(timers.due(t0).unwrap().is_empty());
        let due = timers.due(t0 + chrono::Duration::seconds(5)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uri, early);
        let due = timers.due(t0 + chrono::Duration::seconds(20)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uri, late);
    }

    #[test]
    fn test_cancelled_timers_are_skipped() {
        let (_, _, timers) = setup();
        let instance = node("http://rdflow.dev/instance/1");
        let n = node("http://rdflow.dev/node/p/timer");
        let token = node("http://rdflow.dev/token/1");
        let t0 = Utc::now();

        timers
            .register(&instance, &n, &token, t0 + chrono::Duration::seconds(1), None)
            .unwrap();
        assert_eq!(timers.pending_for_instance(&instance).unwrap(), 1);
        assert_eq!(timers.cancel_for_token(&token).unwrap(), 1);
        assert_eq!(timers.pending_for_instance(&instance).unwrap(), 0);
        assert!(timers
            .due(t0 + chrono::Duration::seconds(5))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_rebuild_from_serialized_graph() {
        let (store, vocab, timers) = setup();
        let instance = node("http://rdflow.dev/instance/1");
        let n = node("http://rdflow.dev/node/p/timer");
        let token = node("http://rdflow.dev/token/1");
        let fire_at = Utc::now() + chrono::Duration::seconds(30);
        timers
            .register(&instance, &n, &token, fire_at, None)
            .unwrap();

        let bytes = store.serialize(RdfFormat::NTriples).unwrap();
        let store2: Arc<OxiGraphStore> = Arc::new(OxiGraphStore::new().unwrap());
        store2.parse(&bytes, RdfFormat::NTriples).unwrap();

        let timers2 = TimerService::new(store2, vocab);
        assert_eq!(timers2.rebuild().unwrap(), 1);
        let due = timers2.due(fire_at + chrono::Duration::seconds(1)).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].token, token);
    }

    #[test]
    fn test_next_fire_at() {
        let (_, _, timers) = setup();
        assert!(timers.next_fire_at().is_none());
        let t0 = Utc::now();
        timers
            .register(
                &node("http://rdflow.dev/instance/1"),
                &node("http://rdflow.dev/node/p/t"),
                &node("http://rdflow.dev/token/1"),
                t0 + chrono::Duration::seconds(7),
                None,
            )
            .unwrap();
        assert_eq!(
            timers.next_fire_at(),
            Some(t0 + chrono::Duration::seconds(7))
        );
    }
}
