use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use super::{Provider, ProviderError};
use crate::container::{Container, ContainerId, ContainerStatus, CreateOptions, ExecOutput};

/// Simulates container lifecycle in memory, for tests and hosts without a runtime.
///
/// Does not implement `run_job`.
#[derive(Debug, Default)]
pub struct MockProvider {
    containers: RwLock<HashMap<ContainerId, Container>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<Container> {
        self.containers.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.containers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.containers.read().await.is_empty()
    }

    async fn set_status(&self, id: &str, status: ContainerStatus) -> Result<(), ProviderError> {
        let mut containers = self.containers.write().await;

        let container = containers
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(id.to_owned()))?;

        container.status = status;

        Ok(())
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    #[tracing::instrument(name = "MockProvider::create", skip_all, fields(
        image = %opts.image
    ))]
    async fn create(&self, opts: &CreateOptions) -> Result<Container, ProviderError> {
        let container = Container {
            id: Uuid::new_v4().to_string(),
            name: opts.name.clone(),
            image: opts.image.clone(),
            status: ContainerStatus::Created,
            created_at: Utc::now(),
        };

        self.containers
            .write()
            .await
            .insert(container.id.clone(), container.clone());

        info!(id = %container.id, "container created");

        Ok(container)
    }

    #[tracing::instrument(name = "MockProvider::start", skip_all, fields(id = %id))]
    async fn start(&self, id: &str) -> Result<(), ProviderError> {
        self.set_status(id, ContainerStatus::Running).await
    }

    #[tracing::instrument(name = "MockProvider::stop", skip_all, fields(id = %id))]
    async fn stop(&self, id: &str) -> Result<(), ProviderError> {
        self.set_status(id, ContainerStatus::Stopped).await
    }

    #[tracing::instrument(name = "MockProvider::delete", skip_all, fields(id = %id))]
    async fn delete(&self, id: &str) -> Result<(), ProviderError> {
        match self.containers.write().await.remove(id) {
            None => Err(ProviderError::NotFound(id.to_owned())),
            Some(_) => Ok(()),
        }
    }

    #[tracing::instrument(name = "MockProvider::exec", skip_all, fields(id = %id, cmd = ?cmd))]
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ProviderError> {
        if !self.containers.read().await.contains_key(id) {
            return Err(ProviderError::NotFound(id.to_owned()));
        }

        let program = cmd.first().map(String::as_str).unwrap_or_default();

        Ok(ExecOutput {
            exit_code: 0,
            logs: format!("mock exec: {program}\n"),
        })
    }
}
