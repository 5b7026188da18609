//! One-shot jobs: create a throwaway container, run it to completion or until
//! the time budget runs out, collect its output and always remove it.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{info, warn};

use super::ProviderError;
use crate::container::{JobOptions, JobOutput};

/// The container operations a job needs from a runtime.
#[async_trait]
pub trait JobRuntime: Send + Sync {
    /// Creates the job container and returns its id. Does not start it.
    async fn create_job(&self, opts: &JobOptions) -> Result<String, ProviderError>;

    async fn start_job(&self, id: &str) -> Result<(), ProviderError>;

    /// Resolves with the exit code once the container is no longer running.
    async fn wait_job(&self, id: &str) -> Result<i64, ProviderError>;

    /// Combined stdout and stderr.
    async fn job_logs(&self, id: &str) -> Result<String, ProviderError>;

    async fn stop_job(&self, id: &str) -> Result<(), ProviderError>;

    /// Forced removal, whatever state the container is in.
    async fn remove_job(&self, id: &str) -> Result<(), ProviderError>;
}

/// Runs a job on `runtime`. Once the container exists it is removed on every
/// path, including when the returned future is dropped midway.
#[tracing::instrument(name = "job::run", skip_all, fields(
    image = %opts.image,
    timeout = ?timeout
))]
pub async fn run(
    runtime: Arc<dyn JobRuntime>,
    opts: &JobOptions,
    timeout: Duration,
) -> Result<JobOutput, ProviderError> {
    let id = runtime.create_job(opts).await?;

    let container = JobContainer::new(runtime.clone(), id);

    let result = drive(runtime.as_ref(), container.id(), timeout).await;

    container.release().await;

    result
}

#[tracing::instrument(name = "job::drive", skip_all, fields(container_id = %id))]
async fn drive(
    runtime: &dyn JobRuntime,
    id: &str,
    timeout: Duration,
) -> Result<JobOutput, ProviderError> {
    runtime.start_job(id).await?;

    let exit_code = tokio::select! {
        exit_code = runtime.wait_job(id) => exit_code?,
        _ = tokio::time::sleep(timeout) => {
            warn!(?timeout, "job timed out, stopping container");

            if let Err(error) = runtime.stop_job(id).await {
                warn!(?error, "unable to stop timed out job container");
            }

            return Ok(JobOutput::timed_out());
        }
    };

    let logs = match runtime.job_logs(id).await {
        Ok(logs) => logs,
        Err(error) => {
            warn!(?error, "unable to read job logs");
            String::new()
        }
    };

    info!(exit_code, "job finished");

    Ok(JobOutput { exit_code, logs })
}

/// Owns a throwaway job container. The container is force-removed either by
/// `release` or, if the owning future is dropped first, by a task spawned from `Drop`.
struct JobContainer {
    runtime: Arc<dyn JobRuntime>,
    id: String,
    released: bool,
}

impl JobContainer {
    fn new(runtime: Arc<dyn JobRuntime>, id: String) -> Self {
        Self {
            runtime,
            id,
            released: false,
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    async fn release(mut self) {
        self.released = true;
        remove(self.runtime.as_ref(), &self.id).await;
    }
}

impl Drop for JobContainer {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let runtime = self.runtime.clone();
        let id = std::mem::take(&mut self.id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { remove(runtime.as_ref(), &id).await });
            }
            Err(_) => warn!(container_id = %id, "no runtime available to remove job container"),
        }
    }
}

async fn remove(runtime: &dyn JobRuntime, container_id: &str) {
    if let Err(error) = runtime.remove_job(container_id).await {
        warn!(?error, %container_id, "unable to remove job container");
    }
}
