use async_trait::async_trait;

use crate::container::{Container, ContainerStatus, ContainerTask, TaskStatus};

pub mod memory;
pub mod postgres;

pub use memory::{MemoryContainerRepository, MemoryTaskRepository};
pub use postgres::{PostgresContainerRepository, PostgresTaskRepository};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("unable to acquire connection: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
    #[error("record {0} not found")]
    NotFound(String),
}

/// Persistent record of containers created through the service.
#[async_trait]
pub trait ContainerRepository: Send + Sync {
    async fn create(&self, container: &Container) -> Result<(), RepositoryError>;

    async fn update_status(&self, id: &str, status: ContainerStatus)
        -> Result<(), RepositoryError>;

    async fn get(&self, id: &str) -> Result<Option<Container>, RepositoryError>;
}

/// History of exec invocations.
///
/// A task is written twice: once as pending and once when it reaches a terminal status.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn insert(&self, task: &ContainerTask) -> Result<(), RepositoryError>;

    async fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        exit_code: i64,
        logs: &str,
    ) -> Result<(), RepositoryError>;

    async fn get(&self, id: &str) -> Result<Option<ContainerTask>, RepositoryError>;

    /// Oldest first.
    async fn list_for_container(
        &self,
        container_id: &str,
    ) -> Result<Vec<ContainerTask>, RepositoryError>;
}
