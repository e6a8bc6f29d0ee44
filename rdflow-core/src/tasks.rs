use crate::bus::EventBus;
use crate::error::EngineError;
use crate::events::ExecutionEvent;
use crate::scheduler::Clock;
use crate::store::GraphStore;
use crate::types::{NodeDescriptor, TaskRecord, TaskState, VariableValue};
use crate::vocab::{class, pred, Vocab};
use chrono::{DateTime, Utc};
use oxigraph::model::vocab::{rdf, xsd};
use oxigraph::model::{Literal, NamedNode, Term};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// User-task records: created when a UserTask node is entered, completed
/// externally through the engine, which then resumes the owning token.
pub struct TaskService {
    store: Arc<dyn GraphStore>,
    vocab: Arc<Vocab>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
}

impl TaskService {
    pub fn new(
        store: Arc<dyn GraphStore>,
        vocab: Arc<Vocab>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            vocab,
            bus,
            clock,
        }
    }

    pub fn create_task(
        &self,
        instance: &NamedNode,
        descriptor: &NodeDescriptor,
        token: &NamedNode,
    ) -> Result<NamedNode, EngineError> {
        let task = self.vocab.mint("task");
        let v = &self.vocab;
        let lit = |s: &str| Term::Literal(Literal::new_simple_literal(s));

        self.store.add(
            &task,
            &rdf::TYPE.into_owned(),
            &Term::NamedNode(v.class(class::TASK)),
        )?;
        self.store
            .add(&task, &v.prop(pred::INSTANCE), &Term::NamedNode(instance.clone()))?;
        self.store.add(
            &task,
            &v.prop(pred::NODE),
            &Term::NamedNode(descriptor.uri.clone()),
        )?;
        self.store
            .add(&task, &v.prop(pred::TOKEN), &Term::NamedNode(token.clone()))?;
        self.store
            .add(&task, &v.prop(pred::STATE), &lit(TaskState::Created.as_str()))?;
        self.store.add(
            &task,
            &v.prop(pred::CREATED_AT),
            &Term::Literal(Literal::new_typed_literal(
                self.clock.now().to_rfc3339(),
                xsd::DATE_TIME,
            )),
        )?;
        if let Some(name) = &descriptor.name {
            self.store.add(&task, &v.prop(pred::NAME), &lit(name))?;
        }
        if let Some(assignee) = &descriptor.assignee {
            self.store.add(&task, &v.prop(pred::ASSIGNEE), &lit(assignee))?;
        }
        for user in &descriptor.candidate_users {
            self.store.add(&task, &v.prop(pred::CANDIDATE_USER), &lit(user))?;
        }
        for group in &descriptor.candidate_groups {
            self.store.add(&task, &v.prop(pred::CANDIDATE_GROUP), &lit(group))?;
        }
        if let Some(due) = &descriptor.due_date {
            self.store.add(&task, &v.prop(pred::DUE_DATE), &lit(due))?;
        }
        if let Some(priority) = descriptor.priority {
            self.store.add(
                &task,
                &v.prop(pred::PRIORITY),
                &Term::Literal(Literal::new_typed_literal(priority.to_string(), xsd::INTEGER)),
            )?;
        }
        self.store
            .add(&task, &v.prop(pred::FORM_DATA), &lit("{}"))?;

        debug!(task = task.as_str(), node = descriptor.uri.as_str(), "task created");
        self.bus.publish(&ExecutionEvent::TaskCreated {
            task: task.clone(),
            instance: instance.clone(),
            node: descriptor.uri.clone(),
            token: token.clone(),
            name: descriptor.name.clone(),
            assignee: descriptor.assignee.clone(),
            candidate_users: descriptor.candidate_users.clone(),
            candidate_groups: descriptor.candidate_groups.clone(),
            form_data: serde_json::json!({}),
            due_date: descriptor.due_date.clone(),
            priority: descriptor.priority,
        })?;
        Ok(task)
    }

    pub fn record(&self, task: &NamedNode) -> Result<TaskRecord, EngineError> {
        let v = &self.vocab;
        let missing = || EngineError::UnknownTask(task.as_str().to_string());

        let state = self
            .store
            .value_str(task, &v.prop(pred::STATE))?
            .ok_or_else(missing)?;
        let created_at = self
            .store
            .value_str(task, &v.prop(pred::CREATED_AT))?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc))
            .ok_or_else(missing)?;
        let strings = |local: &str| -> Result<Vec<String>, EngineError> {
            let mut items: Vec<String> = self
                .store
                .objects(task, &v.prop(local))?
                .into_iter()
                .filter_map(|t| match t {
                    Term::Literal(l) => Some(l.value().to_string()),
                    _ => None,
                })
                .collect();
            items.sort();
            Ok(items)
        };

        Ok(TaskRecord {
            uri: task.clone(),
            instance: self
                .store
                .value_node(task, &v.prop(pred::INSTANCE))?
                .ok_or_else(missing)?,
            node: self
                .store
                .value_node(task, &v.prop(pred::NODE))?
                .ok_or_else(missing)?,
            token: self
                .store
                .value_node(task, &v.prop(pred::TOKEN))?
                .ok_or_else(missing)?,
            state: TaskState::from_str(&state)?,
            name: self.store.value_str(task, &v.prop(pred::NAME))?,
            assignee: self.store.value_str(task, &v.prop(pred::ASSIGNEE))?,
            candidate_users: strings(pred::CANDIDATE_USER)?,
            candidate_groups: strings(pred::CANDIDATE_GROUP)?,
            form_data: self
                .store
                .value_str(task, &v.prop(pred::FORM_DATA))?
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::json!({})),
            due_date: self.store.value_str(task, &v.prop(pred::DUE_DATE))?,
            priority: self
                .store
                .value_str(task, &v.prop(pred::PRIORITY))?
                .and_then(|s| s.parse().ok()),
            created_at,
            completed_by: self.store.value_str(task, &v.prop(pred::COMPLETED_BY))?,
        })
    }

    pub fn claim(&self, task: &NamedNode, user: &str) -> Result<(), EngineError> {
        let record = self.record(task)?;
        if record.state != TaskState::Created {
            return Err(EngineError::TaskNotOpen {
                task: task.as_str().to_string(),
                state: record.state.as_str().to_string(),
            });
        }
        let v = &self.vocab;
        self.store.set(
            task,
            &v.prop(pred::STATE),
            &Term::Literal(Literal::new_simple_literal(TaskState::Claimed.as_str())),
        )?;
        self.store.set(
            task,
            &v.prop(pred::ASSIGNEE),
            &Term::Literal(Literal::new_simple_literal(user)),
        )
    }

    /// Flip the task to completed and publish `TaskCompleted`. The engine is
    /// responsible for applying completion variables and resuming the token.
    pub fn mark_completed(
        &self,
        task: &NamedNode,
        completed_by: &str,
        variables: &BTreeMap<String, VariableValue>,
    ) -> Result<TaskRecord, EngineError> {
        let record = self.record(task)?;
        if !record.state.is_open() {
            return Err(EngineError::TaskNotOpen {
                task: task.as_str().to_string(),
                state: record.state.as_str().to_string(),
            });
        }
        let v = &self.vocab;
        self.store.set(
            task,
            &v.prop(pred::STATE),
            &Term::Literal(Literal::new_simple_literal(TaskState::Completed.as_str())),
        )?;
        self.store.set(
            task,
            &v.prop(pred::COMPLETED_BY),
            &Term::Literal(Literal::new_simple_literal(completed_by)),
        )?;
        self.bus.publish(&ExecutionEvent::TaskCompleted {
            task: task.clone(),
            instance: record.instance.clone(),
            node: record.node.clone(),
            token: record.token.clone(),
            completed_by: completed_by.to_string(),
            variables: variables.clone(),
        })?;
        Ok(record)
    }

    /// Cancel an open task (interrupting boundary event, terminate).
    /// Cancelling an already-closed task is a no-op.
    pub fn cancel(&self, task: &NamedNode) -> Result<(), EngineError> {
        let record = self.record(task)?;
        if !record.state.is_open() {
            return Ok(());
        }
        debug!(task = task.as_str(), "task cancelled");
        self.store.set(
            task,
            &self.vocab.prop(pred::STATE),
            &Term::Literal(Literal::new_simple_literal(TaskState::Cancelled.as_str())),
        )
    }

    fn tasks_matching(
        &self,
        p: &NamedNode,
        o: &Term,
    ) -> Result<Vec<NamedNode>, EngineError> {
        let v = &self.vocab;
        let mut out = Vec::new();
        for task in self.store.subjects_with(p, o)? {
            let is_task = self
                .store
                .value_node(&task, &rdf::TYPE.into_owned())?
                .is_some_and(|t| t == v.class(class::TASK));
            if is_task {
                out.push(task);
            }
        }
        out.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(out)
    }

    pub fn open_task_for_token(
        &self,
        token: &NamedNode,
    ) -> Result<Option<NamedNode>, EngineError> {
        for task in self.tasks_matching(
            &self.vocab.prop(pred::TOKEN),
            &Term::NamedNode(token.clone()),
        )? {
            if self.record(&task)?.state.is_open() {
                return Ok(Some(task));
            }
        }
        Ok(None)
    }

    pub fn open_tasks(&self, instance: &NamedNode) -> Result<Vec<NamedNode>, EngineError> {
        let mut out = Vec::new();
        for task in self.tasks_matching(
            &self.vocab.prop(pred::INSTANCE),
            &Term::NamedNode(instance.clone()),
        )? {
            if self.record(&task)?.state.is_open() {
                out.push(task);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SystemClock;
    use crate::store::OxiGraphStore;
    use crate::types::NodeType;

    fn service() -> TaskService {
        TaskService::new(
            Arc::new(OxiGraphStore::new().unwrap()),
            Arc::new(Vocab::default()),
            Arc::new(EventBus::new()),
            Arc::new(SystemClock),
        )
    }

    fn descriptor() -> NodeDescriptor {
        NodeDescriptor {
            uri: NamedNode::new_unchecked("http://rdflow.dev/node/p/approve"),
            node_type: NodeType::UserTask,
            name: Some("Approve order".to_string()),
            topic: None,
            message_name: None,
            correlation_variable: None,
            timer: None,
            error_code: None,
            attached_to: None,
            interrupting: true,
            terminate_end: false,
            cancel_end: false,
            is_transaction: false,
            called_process: None,
            compensate_activity: None,
            compensation_handler: None,
            compensation_throw: false,
            script: None,
            multi_instance: None,
            listeners: Vec::new(),
            assignee: Some("alice".to_string()),
            candidate_users: vec!["bob".to_string()],
            candidate_groups: vec!["approvers".to_string()],
            due_date: None,
            priority: Some(10),
        }
    }

    #[test]
    fn test_create_and_read_back() {
        let svc = service();
        let instance = NamedNode::new_unchecked("http://rdflow.dev/instance/1");
        let token = NamedNode::new_unchecked("http://rdflow.dev/token/1");

        let task = svc.create_task(&instance, &descriptor(), &token).unwrap();
        let record = svc.record(&task).unwrap();
        assert_eq!(record.state, TaskState::Created);
        assert_eq!(record.name.as_deref(), Some("Approve order"));
        assert_eq!(record.assignee.as_deref(), Some("alice"));
        assert_eq!(record.candidate_users, vec!["bob".to_string()]);
        assert_eq!(record.priority, Some(10));
        assert_eq!(svc.open_task_for_token(&token).unwrap(), Some(task.clone()));
        assert_eq!(svc.open_tasks(&instance).unwrap(), vec![task]);
    }

    #[test]
    fn test_claim_then_complete() {
        let svc = service();
        let instance = NamedNode::new_unchecked("http://rdflow.dev/instance/1");
        let token = NamedNode::new_unchecked("http://rdflow.dev/token/1");
        let task = svc.create_task(&instance, &descriptor(), &token).unwrap();

        svc.claim(&task, "carol").unwrap();
        let record = svc.record(&task).unwrap();
        assert_eq!(record.state, TaskState::Claimed);
        assert_eq!(record.assignee.as_deref(), Some("carol"));

        // claiming twice is rejected
        assert!(matches!(
            svc.claim(&task, "dave"),
            Err(EngineError::TaskNotOpen { .. })
        ));

        svc.mark_completed(&task, "carol", &BTreeMap::new()).unwrap();
        assert_eq!(svc.record(&task).unwrap().state, TaskState::Completed);
        assert!(svc.open_tasks(&instance).unwrap().is_empty());

        // completing a completed task is rejected
        assert!(matches!(
            svc.mark_completed(&task, "carol", &BTreeMap::new()),
            Err(EngineError::TaskNotOpen { .. })
        ));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let svc = service();
        let instance = NamedNode::new_unchecked("http://rdflow.dev/instance/1");
        let token = NamedNode::new_unchecked("http://rdflow.dev/token/1");
        let task = svc.create_task(&instance, &descriptor(), &token).unwrap();

        svc.cancel(&task).unwrap();
        assert_eq!(svc.record(&task).unwrap().state, TaskState::Cancelled);
        svc.cancel(&task).unwrap();
        assert_eq!(svc.record(&task).unwrap().state, TaskState::Cancelled);
    }
}
