use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    exec::{CreateExecOptions, StartExecResults},
    image::CreateImageOptions,
    models::{HostConfig, Mount, MountTypeEnum},
    Docker,
};
use chrono::Utc;
use futures_util::stream::StreamExt;
use tracing::{info, warn};

use super::job::{self, JobRuntime};
use super::{Provider, ProviderError};
use crate::container::{
    Container, ContainerStatus, CreateOptions, ExecOutput, JobOptions, JobOutput,
};

/// Seconds the runtime waits for a graceful stop before killing the container.
pub const STOP_GRACE_PERIOD_SECS: i64 = 10;

/// Drives a Docker Engine daemon.
pub struct DockerProvider {
    docker: Docker,
    job_timeout: Duration,
}

impl DockerProvider {
    /// Connects using `DOCKER_HOST` or the platform's default socket.
    #[tracing::instrument(name = "DockerProvider::connect", skip_all, fields(
        job_timeout = ?job_timeout
    ))]
    pub fn connect(job_timeout: Duration) -> Result<Self, ProviderError> {
        let docker = Docker::connect_with_local_defaults().map_err(ProviderError::runtime)?;

        info!("connected to docker");

        Ok(Self::new(docker, job_timeout))
    }

    pub fn new(docker: Docker, job_timeout: Duration) -> Self {
        Self {
            docker,
            job_timeout,
        }
    }

    /// Best effort: a failed pull is logged and the following create reports
    /// the real problem if the image is unavailable.
    #[tracing::instrument(name = "DockerProvider::pull_image", skip_all, fields(
        image = %image
    ))]
    async fn pull_image(&self, image: &str) {
        info!("pulling image");

        let mut stream = Box::pin(self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        ));

        while let Some(result) = stream.next().await {
            if let Err(error) = result {
                warn!(?error, "unable to pull image, continuing with local copy");
                return;
            }
        }
    }
}

#[async_trait]
impl Provider for DockerProvider {
    fn name(&self) -> &'static str {
        "docker"
    }

    #[tracing::instrument(name = "DockerProvider::create", skip_all, fields(
        image = %opts.image,
        name = ?opts.name
    ))]
    async fn create(&self, opts: &CreateOptions) -> Result<Container, ProviderError> {
        self.pull_image(&opts.image).await;

        let create_opts = opts
            .name
            .as_ref()
            .filter(|name| !name.is_empty())
            .map(|name| CreateContainerOptions {
                name: name.clone(),
                platform: None,
            });

        let response = self
            .docker
            .create_container(create_opts, container_config(opts))
            .await
            .map_err(ProviderError::runtime)?;

        info!(id = %response.id, "container created");

        Ok(Container {
            id: response.id,
            name: opts.name.clone(),
            image: opts.image.clone(),
            status: ContainerStatus::Created,
            created_at: Utc::now(),
        })
    }

    #[tracing::instrument(name = "DockerProvider::start", skip_all, fields(id = %id))]
    async fn start(&self, id: &str) -> Result<(), ProviderError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|err| lookup_error(id, err))
    }

    #[tracing::instrument(name = "DockerProvider::stop", skip_all, fields(id = %id))]
    async fn stop(&self, id: &str) -> Result<(), ProviderError> {
        self.docker
            .stop_container(
                id,
                Some(StopContainerOptions {
                    t: STOP_GRACE_PERIOD_SECS,
                }),
            )
            .await
            .map_err(|err| lookup_error(id, err))
    }

    #[tracing::instrument(name = "DockerProvider::delete", skip_all, fields(id = %id))]
    async fn delete(&self, id: &str) -> Result<(), ProviderError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| lookup_error(id, err))
    }

    #[tracing::instrument(name = "DockerProvider::exec", skip_all, fields(id = %id, cmd = ?cmd))]
    async fn exec(&self, id: &str, cmd: &[String]) -> Result<ExecOutput, ProviderError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(cmd.to_vec()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|err| lookup_error(id, err))?;

        let mut logs = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(ProviderError::runtime)?
        {
            while let Some(chunk) = output.next().await {
                logs.push_str(&chunk.map_err(ProviderError::runtime)?.to_string());
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(ProviderError::runtime)?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            logs,
        })
    }

    #[tracing::instrument(name = "DockerProvider::run_job", skip_all, fields(
        image = %opts.image,
        host_dir = ?opts.host_dir,
        container_dir = %opts.container_dir
    ))]
    async fn run_job(&self, opts: &JobOptions) -> Result<JobOutput, ProviderError> {
        self.pull_image(&opts.image).await;

        job::run(Arc::new(self.docker.clone()), opts, self.job_timeout).await
    }
}

#[async_trait]
impl JobRuntime for Docker {
    async fn create_job(&self, opts: &JobOptions) -> Result<String, ProviderError> {
        let response = self
            .create_container(None::<CreateContainerOptions<String>>, job_config(opts))
            .await
            .map_err(ProviderError::runtime)?;

        Ok(response.id)
    }

    async fn start_job(&self, id: &str) -> Result<(), ProviderError> {
        self.start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(ProviderError::runtime)
    }

    async fn wait_job(&self, id: &str) -> Result<i64, ProviderError> {
        let mut wait = Box::pin(self.wait_container(
            id,
            Some(WaitContainerOptions {
                condition: "not-running",
            }),
        ));

        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // Non-zero exit codes come back as errors from the wait endpoint.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(error)) => Err(ProviderError::runtime(error)),
            None => Err(ProviderError::runtime(
                "wait stream ended before the container exited",
            )),
        }
    }

    async fn job_logs(&self, id: &str) -> Result<String, ProviderError> {
        let mut stream = Box::pin(self.logs(
            id,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        ));

        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            logs.push_str(&chunk.map_err(ProviderError::runtime)?.to_string());
        }

        Ok(logs)
    }

    async fn stop_job(&self, id: &str) -> Result<(), ProviderError> {
        self.stop_container(id, None)
            .await
            .map_err(ProviderError::runtime)
    }

    async fn remove_job(&self, id: &str) -> Result<(), ProviderError> {
        self.remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
        .map_err(ProviderError::runtime)
    }
}

/// 404 from the daemon means the container does not exist.
fn lookup_error(id: &str, error: DockerError) -> ProviderError {
    match error {
        DockerError::DockerResponseServerError {
            status_code: 404, ..
        } => ProviderError::NotFound(id.to_owned()),
        other => ProviderError::runtime(other),
    }
}

pub(crate) fn bind_mount(source: &Path, target: &str) -> Mount {
    Mount {
        typ: Some(MountTypeEnum::BIND),
        source: Some(source.to_string_lossy().into_owned()),
        target: Some(target.to_owned()),
        read_only: Some(false),
        ..Default::default()
    }
}

pub(crate) fn container_config(opts: &CreateOptions) -> Config<String> {
    let mounts: Vec<Mount> = opts
        .mounts
        .iter()
        .map(|(source, target)| bind_mount(source, target))
        .collect();

    Config {
        image: Some(opts.image.clone()),
        host_config: Some(HostConfig {
            mounts: if mounts.is_empty() { None } else { Some(mounts) },
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub(crate) fn job_config(opts: &JobOptions) -> Config<String> {
    Config {
        image: Some(opts.image.clone()),
        cmd: Some(opts.cmd.clone()),
        working_dir: Some(opts.container_dir.clone()),
        tty: Some(false),
        host_config: Some(HostConfig {
            mounts: Some(vec![bind_mount(&opts.host_dir, &opts.container_dir)]),
            ..Default::default()
        }),
        ..Default::default()
    }
}
