use std::{
    collections::{btree_map::Entry, BTreeMap},
    path::PathBuf,
    sync::Arc,
};

use serde::Serialize;
use tracing::{error, info};

use crate::container::{
    Container, ContainerStatus, ContainerTask, CreateOptions, JobOptions, JobOutput, JobRequest,
    TaskStatus,
};
use crate::detect::detect_program;
use crate::path_translator::{PathTranslator, TranslateError};
use crate::provider::{Provider, ProviderError};
use crate::repository::{ContainerRepository, TaskRepository};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Configuration(String),
    #[error("{0} is not supported by the configured provider")]
    NotSupported(&'static str),
    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for ServiceError {
    fn from(error: ProviderError) -> Self {
        match error {
            ProviderError::NotFound(id) => Self::NotFound(id),
            ProviderError::NotSupported(capability) => Self::NotSupported(capability),
            other => Self::Provider(other),
        }
    }
}

impl From<TranslateError> for ServiceError {
    fn from(error: TranslateError) -> Self {
        match error {
            TranslateError::HostRootNotConfigured => Self::Configuration(error.to_string()),
            TranslateError::Unresolvable { .. } => Self::Validation(error.to_string()),
        }
    }
}

/// Result of an exec that reached the provider and came back.
/// A nonzero `exit_code` is still a report, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecReport {
    pub exit_code: i64,
    pub logs: String,
    pub task_id: Option<String>,
}

/// An exec that failed. Carries whatever output and task id exist so callers can
/// still inspect them.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ExecFailure {
    pub task_id: Option<String>,
    pub exit_code: i64,
    pub logs: String,
    #[source]
    pub error: ServiceError,
}

impl ExecFailure {
    pub(crate) fn rejected(error: ServiceError) -> Self {
        Self {
            task_id: None,
            exit_code: -1,
            logs: String::new(),
            error,
        }
    }
}

/// Composes a provider with the repositories.
///
/// Mutations call the provider first and only write the repository after the
/// provider succeeded. Repository failures at that point are logged with
/// `reconciliation_needed` and do not fail the call: the runtime is the source of truth.
///
/// Calls against the same id are not serialized, so a concurrent start and stop
/// may persist a status that differs from the runtime's final state.
pub struct Service {
    provider: Arc<dyn Provider>,
    containers: Arc<dyn ContainerRepository>,
    tasks: Arc<dyn TaskRepository>,
    paths: PathTranslator,
}

impl Service {
    pub fn new(
        provider: Arc<dyn Provider>,
        containers: Arc<dyn ContainerRepository>,
        tasks: Arc<dyn TaskRepository>,
        paths: PathTranslator,
    ) -> Self {
        Self {
            provider,
            containers,
            tasks,
            paths,
        }
    }

    pub fn paths(&self) -> &PathTranslator {
        &self.paths
    }

    #[tracing::instrument(name = "Service::create", skip_all, fields(
        provider = self.provider.name(),
        image = %opts.image,
        name = ?opts.name
    ))]
    pub async fn create(&self, opts: CreateOptions) -> Result<Container, ServiceError> {
        let image = opts.image.trim();
        if image.is_empty() {
            return Err(ServiceError::Validation("image is required".to_owned()));
        }

        let opts = CreateOptions {
            name: opts.name.filter(|name| !name.trim().is_empty()),
            image: image.to_owned(),
            mounts: self.translate_mounts(opts.mounts).await?,
        };

        let container = self.provider.create(&opts).await?;

        if let Err(error) = self.containers.create(&container).await {
            error!(
                ?error,
                id = %container.id,
                reconciliation_needed = true,
                "container created but not persisted"
            );
        }

        info!(id = %container.id, "container created");

        Ok(container)
    }

    #[tracing::instrument(name = "Service::start", skip_all, fields(id = %id))]
    pub async fn start(&self, id: &str) -> Result<(), ServiceError> {
        self.provider.start(id).await?;

        self.persist_status(id, ContainerStatus::Running).await;

        Ok(())
    }

    #[tracing::instrument(name = "Service::stop", skip_all, fields(id = %id))]
    pub async fn stop(&self, id: &str) -> Result<(), ServiceError> {
        self.provider.stop(id).await?;

        self.persist_status(id, ContainerStatus::Stopped).await;

        Ok(())
    }

    /// Removes the container from the runtime. The row is kept and marked deleted.
    #[tracing::instrument(name = "Service::delete", skip_all, fields(id = %id))]
    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        self.provider.delete(id).await?;

        self.persist_status(id, ContainerStatus::Deleted).await;

        Ok(())
    }

    #[tracing::instrument(name = "Service::run_job", skip_all, fields(
        host_dir = %request.host_dir,
        container_dir = %request.container_dir
    ))]
    pub async fn run_job(&self, request: JobRequest) -> Result<JobOutput, ServiceError> {
        let host_dir = request.host_dir.trim();
        if host_dir.is_empty() {
            return Err(ServiceError::Validation("hostDir is required".to_owned()));
        }

        let container_dir = request.container_dir.trim();
        if container_dir.is_empty() {
            return Err(ServiceError::Validation("containerDir is required".to_owned()));
        }
        if !container_dir.starts_with('/') {
            return Err(ServiceError::Validation(format!(
                "containerDir must be an absolute path: {container_dir}"
            )));
        }

        let service_dir = self.paths.resolve(host_dir)?;
        let translated_dir = self.paths.translate_required(&service_dir)?;

        let image = request
            .image
            .map(|image| image.trim().to_owned())
            .filter(|image| !image.is_empty());
        let cmd = request.cmd.filter(|cmd| !cmd.is_empty());

        let (image, cmd) = match (image, cmd) {
            (Some(image), Some(cmd)) => (image, cmd),
            (image, cmd) => {
                // The service can only read its own view of the directory.
                let detected = detect_program(&service_dir, container_dir).await;
                (
                    image.unwrap_or(detected.image),
                    cmd.unwrap_or(detected.cmd),
                )
            }
        };

        let opts = JobOptions {
            image,
            host_dir: translated_dir,
            container_dir: container_dir.to_owned(),
            cmd,
        };

        let output = self.provider.run_job(&opts).await?;

        info!(exit_code = output.exit_code, "job finished");

        Ok(output)
    }

    /// Runs `cmd` in a running container and records it as a task.
    ///
    /// The task is inserted as pending before the provider is called and written
    /// once more with its terminal status.
    #[tracing::instrument(name = "Service::exec", skip_all, fields(id = %id, cmd = ?cmd))]
    pub async fn exec(&self, id: &str, cmd: Vec<String>) -> Result<ExecReport, ExecFailure> {
        if cmd.first().map_or(true, |program| program.trim().is_empty()) {
            return Err(ExecFailure::rejected(ServiceError::Validation(
                "cmd must contain at least one non-empty argument".to_owned(),
            )));
        }

        let task = ContainerTask::pending(id, &cmd);
        let task_id = match self.tasks.insert(&task).await {
            Ok(()) => Some(task.id.clone()),
            Err(error) => {
                error!(
                    ?error,
                    task_id = %task.id,
                    reconciliation_needed = true,
                    "unable to record pending task"
                );
                None
            }
        };

        let result = self.provider.exec(id, &cmd).await;

        let (status, exit_code, logs) = match &result {
            Ok(output) if output.exit_code == 0 => (TaskStatus::Succeeded, 0, output.logs.as_str()),
            Ok(output) => (TaskStatus::Failed, output.exit_code, output.logs.as_str()),
            Err(_) => (TaskStatus::Failed, -1, ""),
        };

        if task_id.is_some() {
            if let Err(error) = self.tasks.finish(&task.id, status, exit_code, logs).await {
                error!(
                    ?error,
                    task_id = %task.id,
                    %status,
                    reconciliation_needed = true,
                    "unable to record task result"
                );
            }
        }

        match result {
            Ok(output) => {
                info!(exit_code = output.exit_code, %status, "exec finished");

                Ok(ExecReport {
                    exit_code: output.exit_code,
                    logs: output.logs,
                    task_id,
                })
            }
            Err(error) => Err(ExecFailure {
                task_id,
                exit_code: -1,
                logs: String::new(),
                error: error.into(),
            }),
        }
    }

    pub async fn container(&self, id: &str) -> Option<Container> {
        match self.containers.get(id).await {
            Ok(container) => container,
            Err(error) => {
                error!(?error, %id, "unable to read container");
                None
            }
        }
    }

    pub async fn tasks(&self, container_id: &str) -> Vec<ContainerTask> {
        match self.tasks.list_for_container(container_id).await {
            Ok(tasks) => tasks,
            Err(error) => {
                error!(?error, %container_id, "unable to read tasks");
                Vec::new()
            }
        }
    }

    async fn persist_status(&self, id: &str, status: ContainerStatus) {
        if let Err(error) = self.containers.update_status(id, status).await {
            error!(
                ?error,
                %id,
                %status,
                reconciliation_needed = true,
                "runtime updated but status not persisted"
            );
        }
    }

    /// Resolves every mount source, checks that it exists and rebases it onto the
    /// runtime's view.
    async fn translate_mounts(
        &self,
        mounts: BTreeMap<PathBuf, String>,
    ) -> Result<BTreeMap<PathBuf, String>, ServiceError> {
        let mut translated = BTreeMap::new();

        for (source, target) in mounts {
            if !target.starts_with('/') {
                return Err(ServiceError::Validation(format!(
                    "mount target must be an absolute path: {target}"
                )));
            }

            let resolved = self.paths.resolve(&source)?;
            if tokio::fs::metadata(&resolved).await.is_err() {
                return Err(ServiceError::Validation(format!(
                    "mount source does not exist: {}",
                    resolved.display()
                )));
            }

            match translated.entry(self.paths.translate(&resolved)?) {
                Entry::Occupied(entry) => {
                    return Err(ServiceError::Validation(format!(
                        "mount source listed twice: {}",
                        entry.key().display()
                    )))
                }
                Entry::Vacant(entry) => {
                    entry.insert(target);
                }
            }
        }

        Ok(translated)
    }
}
