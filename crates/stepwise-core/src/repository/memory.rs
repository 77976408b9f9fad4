//! In-memory `ExecutionRepository` backed by `DashMap`.
//!
//! Clones share the same underlying maps, so a test can keep a handle to the
//! repository it hands to the engine.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use stepwise_types::definition::WorkflowDefinition;
use stepwise_types::error::RepositoryError;
use stepwise_types::execution::{ExecutionStatus, ScheduledWake, WorkflowExecution};
use uuid::Uuid;

use super::execution::ExecutionRepository;

#[derive(Clone, Default)]
pub struct InMemoryRepository {
    definitions: Arc<DashMap<Uuid, BTreeMap<u32, WorkflowDefinition>>>,
    executions: Arc<DashMap<Uuid, WorkflowExecution>>,
    wakes: Arc<DashMap<Uuid, ScheduledWake>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pending wakes (test helper).
    pub fn wake_count(&self) -> usize {
        self.wakes.len()
    }
}

impl ExecutionRepository for InMemoryRepository {
    async fn save_definition(&self, def: &WorkflowDefinition) -> Result<(), RepositoryError> {
        self.definitions
            .entry(def.id)
            .or_default()
            .insert(def.version, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .get(id)
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    async fn get_definition_version(
        &self,
        id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .get(id)
            .and_then(|versions| versions.get(&version).cloned()))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut defs: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .filter_map(|entry| entry.value().values().next_back().cloned())
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(defs)
    }

    async fn save_execution(&self, execution: &WorkflowExecution) -> Result<(), RepositoryError> {
        self.executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn load_execution(&self, id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn list_executions(
        &self,
        status: Option<ExecutionStatus>,
    ) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let mut execs: Vec<WorkflowExecution> = self
            .executions
            .iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .map(|e| e.value().clone())
            .collect();
        execs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(execs)
    }

    async fn schedule_wake(&self, wake: &ScheduledWake) -> Result<(), RepositoryError> {
        self.wakes.insert(wake.id, wake.clone());
        Ok(())
    }

    async fn due_wakes(&self, now: DateTime<Utc>) -> Result<Vec<ScheduledWake>, RepositoryError> {
        let mut due: Vec<ScheduledWake> = self
            .wakes
            .iter()
            .filter(|w| w.due_at <= now)
            .map(|w| w.value().clone())
            .collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.id.cmp(&b.id)));
        Ok(due)
    }

    async fn delete_wake(&self, id: &Uuid) -> Result<(), RepositoryError> {
        self.wakes.remove(id);
        Ok(())
    }

    async fn delete_wakes_for_step(
        &self,
        execution_id: &Uuid,
        step_id: &str,
    ) -> Result<(), RepositoryError> {
        self.wakes
            .retain(|_, w| !(w.execution_id == *execution_id && w.step_id == step_id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use stepwise_types::context::ExecutionContext;
    use stepwise_types::definition::{StepType, WorkflowStep};
    use stepwise_types::execution::WakeKind;

    fn definition(version: u32) -> WorkflowDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "01938e90-0000-7000-8000-0000000000aa",
            "name": "wf",
            "version": version,
            "steps": [serde_json::to_value(WorkflowStep::new("s", StepType::Start)).unwrap()]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn definitions_are_versioned() {
        let repo = InMemoryRepository::new();
        repo.save_definition(&definition(1)).await.unwrap();
        repo.save_definition(&definition(2)).await.unwrap();

        let id = definition(1).id;
        assert_eq!(repo.get_definition(&id).await.unwrap().unwrap().version, 2);
        assert_eq!(
            repo.get_definition_version(&id, 1).await.unwrap().unwrap().version,
            1
        );
        assert!(repo.get_definition_version(&id, 3).await.unwrap().is_none());
        assert_eq!(repo.list_definitions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn executions_filter_by_status() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let mut a = WorkflowExecution::new(Uuid::now_v7(), "wf", 1, ExecutionContext::new(), now);
        a.status = ExecutionStatus::Running;
        let b = WorkflowExecution::new(Uuid::now_v7(), "wf", 1, ExecutionContext::new(), now);
        repo.save_execution(&a).await.unwrap();
        repo.save_execution(&b).await.unwrap();

        assert_eq!(repo.list_executions(None).await.unwrap().len(), 2);
        let running = repo
            .list_executions(Some(ExecutionStatus::Running))
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, a.id);
    }

    #[tokio::test]
    async fn due_wakes_ordered_and_deletable() {
        let repo = InMemoryRepository::new();
        let now = Utc::now();
        let exec_id = Uuid::now_v7();
        let late = ScheduledWake::new(exec_id, "a", WakeKind::Timeout, now - Duration::seconds(1));
        let early = ScheduledWake::new(exec_id, "b", WakeKind::Timer, now - Duration::seconds(10));
        let future = ScheduledWake::new(exec_id, "a", WakeKind::Escalation, now + Duration::hours(1));
        for w in [&late, &early, &future] {
            repo.schedule_wake(w).await.unwrap();
        }

        let due = repo.due_wakes(now).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].step_id, "b");

        repo.delete_wakes_for_step(&exec_id, "a").await.unwrap();
        assert_eq!(repo.wake_count(), 1);
        repo.delete_wake(&early.id).await.unwrap();
        assert_eq!(repo.wake_count(), 0);
    }
}
