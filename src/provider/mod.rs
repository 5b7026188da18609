use async_trait::async_trait;

use crate::container::{Container, CreateOptions, ExecOutput, JobOptions, JobOutput};

pub mod docker;
pub mod job;
pub mod mock;

pub use docker::DockerProvider;
pub use job::JobRuntime;
pub use mock::MockProvider;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("container {0} not found")]
    NotFound(String),
    #[error("{0} is not supported by this provider")]
    NotSupported(&'static str),
    #[error("runtime error: {0}")]
    Runtime(#[source] BoxError),
}

impl ProviderError {
    pub fn runtime(error: impl Into<BoxError>) -> Self {
        Self::Runtime(error.into())
    }
}

/// Container lifecycle and execution over a concrete runtime.
///
/// `exec` and `run_job` are optional capabilities. Implementations that lack
/// them keep the default bodies, which fail with [`ProviderError::NotSupported`].
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    async fn create(&self, opts: &CreateOptions) -> Result<Container, ProviderError>;

    async fn start(&self, id: &str) -> Result<(), ProviderError>;

    async fn stop(&self, id: &str) -> Result<(), ProviderError>;

    async fn delete(&self, id: &str) -> Result<(), ProviderError>;

    /// Runs `cmd` inside an already running container.
    async fn exec(&self, _id: &str, _cmd: &[String]) -> Result<ExecOutput, ProviderError> {
        Err(ProviderError::NotSupported("exec"))
    }

    /// Runs a one-shot job in a throwaway container.
    async fn run_job(&self, _opts: &JobOptions) -> Result<JobOutput, ProviderError> {
        Err(ProviderError::NotSupported("run_job"))
    }
}
