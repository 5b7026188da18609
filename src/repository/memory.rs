use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{ContainerRepository, RepositoryError, TaskRepository};
use crate::container::{Container, ContainerId, ContainerStatus, ContainerTask, TaskStatus};

/// Keeps container rows in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryContainerRepository {
    containers: RwLock<HashMap<ContainerId, Container>>,
}

impl MemoryContainerRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContainerRepository for MemoryContainerRepository {
    async fn create(&self, container: &Container) -> Result<(), RepositoryError> {
        let mut containers = self.containers.write().await;

        if containers.contains_key(&container.id) {
            return Err(RepositoryError::InvalidData(format!(
                "container {} already exists",
                container.id
            )));
        }

        containers.insert(container.id.clone(), container.clone());

        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: ContainerStatus,
    ) -> Result<(), RepositoryError> {
        match self.containers.write().await.get_mut(id) {
            None => Err(RepositoryError::NotFound(id.to_owned())),
            Some(container) => {
                container.status = status;
                Ok(())
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<Container>, RepositoryError> {
        Ok(self.containers.read().await.get(id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryTaskRepository {
    tasks: RwLock<HashMap<String, ContainerTask>>,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn insert(&self, task: &ContainerTask) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;

        if tasks.contains_key(&task.id) {
            return Err(RepositoryError::InvalidData(format!(
                "task {} already exists",
                task.id
            )));
        }

        tasks.insert(task.id.clone(), task.clone());

        Ok(())
    }

    async fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        exit_code: i64,
        logs: &str,
    ) -> Result<(), RepositoryError> {
        let mut tasks = self.tasks.write().await;

        let task = tasks
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_owned()))?;

        if task.status != TaskStatus::Pending {
            return Err(RepositoryError::InvalidData(format!(
                "task {id} already finished as {}",
                task.status
            )));
        }

        task.status = status;
        task.exit_code = Some(exit_code);
        task.logs = Some(logs.to_owned());
        task.finished_at = Some(Utc::now());

        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<ContainerTask>, RepositoryError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn list_for_container(
        &self,
        container_id: &str,
    ) -> Result<Vec<ContainerTask>, RepositoryError> {
        let mut tasks: Vec<ContainerTask> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|task| task.container_id == container_id)
            .cloned()
            .collect();

        // v7 ids are time ordered.
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        Ok(tasks)
    }
}
