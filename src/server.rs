use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tracing::info;

use crate::api::{self, AppState};
use crate::auth::Authenticator;
use crate::config::{Config, ProviderKind, StorageKind};
use crate::path_translator::PathTranslator;
use crate::provider::{DockerProvider, MockProvider, Provider};
use crate::repository::{
    postgres, ContainerRepository, MemoryContainerRepository, MemoryTaskRepository,
    PostgresContainerRepository, PostgresTaskRepository, TaskRepository,
};
use crate::service::Service;

/// Wires the provider, repositories and service selected by `config`.
#[tracing::instrument(name = "server::build_state", skip_all, fields(
    provider = ?config.provider,
    storage = ?config.storage
))]
pub async fn build_state(config: &Config) -> Result<AppState> {
    tokio::fs::create_dir_all(&config.data_dir)
        .await
        .with_context(|| format!("unable to create {}", config.data_dir.display()))?;

    let provider: Arc<dyn Provider> = match config.provider {
        ProviderKind::Docker => Arc::new(DockerProvider::connect(config.job_timeout())?),
        ProviderKind::Mock => Arc::new(MockProvider::new()),
    };

    let (containers, tasks): (Arc<dyn ContainerRepository>, Arc<dyn TaskRepository>) =
        match config.storage {
            StorageKind::Postgres => {
                let pool = postgres::connect(&config.database)?;
                postgres::migrate(&pool).await?;

                info!("connected to postgres");

                (
                    Arc::new(PostgresContainerRepository::new(pool.clone())),
                    Arc::new(PostgresTaskRepository::new(pool)),
                )
            }
            StorageKind::Memory => (
                Arc::new(MemoryContainerRepository::new()),
                Arc::new(MemoryTaskRepository::new()),
            ),
        };

    let paths = PathTranslator::new(&config.data_dir, config.host_data_dir.clone())?;

    Ok(AppState {
        service: Arc::new(Service::new(provider, containers, tasks, paths)),
        auth: Arc::new(Authenticator::new(&config.auth)),
        data_dir: config.data_dir.clone(),
    })
}

pub async fn serve(config: Config) -> Result<()> {
    let state = build_state(&config).await?;

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(addr = ?addr, "listening");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(?error, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
