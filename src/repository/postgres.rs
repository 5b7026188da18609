use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Runtime};
use tokio_postgres::{NoTls, Row};
use tracing::info;

use super::{ContainerRepository, RepositoryError, TaskRepository};
use crate::config::DatabaseConfig;
use crate::container::{Container, ContainerStatus, ContainerTask, TaskStatus};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS containers (
    id          TEXT PRIMARY KEY,
    name        TEXT,
    image       TEXT NOT NULL,
    status      TEXT NOT NULL,
    created_at  BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS container_tasks (
    id           TEXT PRIMARY KEY,
    container_id TEXT NOT NULL,
    cmd_json     TEXT NOT NULL,
    status       TEXT NOT NULL,
    exit_code    INTEGER,
    logs         TEXT,
    created_at   BIGINT NOT NULL,
    finished_at  BIGINT
);

CREATE INDEX IF NOT EXISTS container_tasks_container_id_idx
    ON container_tasks (container_id, created_at);
"#;

#[tracing::instrument(name = "postgres::connect", skip_all, fields(
    host = %config.host,
    dbname = %config.name
))]
pub fn connect(config: &DatabaseConfig) -> anyhow::Result<Pool> {
    let pool_config = deadpool_postgres::Config {
        url: Some(config.connection_url()),
        ..Default::default()
    };

    let pool = pool_config.create_pool(Some(Runtime::Tokio1), NoTls)?;

    Ok(pool)
}

/// Creates the tables if they do not exist yet.
#[tracing::instrument(name = "postgres::migrate", skip_all)]
pub async fn migrate(pool: &Pool) -> Result<(), RepositoryError> {
    let client = pool.get().await?;

    client.batch_execute(SCHEMA).await?;

    info!("schema is up to date");

    Ok(())
}

pub struct PostgresContainerRepository {
    pool: Pool,
}

impl PostgresContainerRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContainerRepository for PostgresContainerRepository {
    #[tracing::instrument(name = "PostgresContainerRepository::create", skip_all, fields(
        id = %container.id
    ))]
    async fn create(&self, container: &Container) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;

        client
            .execute(
                r#"
                INSERT INTO containers (id, name, image, status, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
                &[
                    &container.id,
                    &container.name,
                    &container.image,
                    &container.status.as_str(),
                    &container.created_at.timestamp(),
                ],
            )
            .await?;

        Ok(())
    }

    #[tracing::instrument(name = "PostgresContainerRepository::update_status", skip_all, fields(
        id = %id,
        status = %status
    ))]
    async fn update_status(
        &self,
        id: &str,
        status: ContainerStatus,
    ) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;

        let updated = client
            .execute(
                "UPDATE containers SET status = $1 WHERE id = $2",
                &[&status.as_str(), &id],
            )
            .await?;

        if updated == 0 {
            return Err(RepositoryError::NotFound(id.to_owned()));
        }

        Ok(())
    }

    #[tracing::instrument(name = "PostgresContainerRepository::get", skip_all, fields(id = %id))]
    async fn get(&self, id: &str) -> Result<Option<Container>, RepositoryError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                "SELECT id, name, image, status, created_at FROM containers WHERE id = $1",
                &[&id],
            )
            .await?;

        row.as_ref().map(row_to_container).transpose()
    }
}

pub struct PostgresTaskRepository {
    pool: Pool,
}

impl PostgresTaskRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    #[tracing::instrument(name = "PostgresTaskRepository::insert", skip_all, fields(
        id = %task.id,
        container_id = %task.container_id
    ))]
    async fn insert(&self, task: &ContainerTask) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;

        let cmd_json = serde_json::to_string(&task.cmd)?;
        let exit_code = task.exit_code.map(exit_code_column).transpose()?;
        let finished_at = task.finished_at.map(|at| at.timestamp());

        client
            .execute(
                r#"
                INSERT INTO container_tasks
                    (id, container_id, cmd_json, status, exit_code, logs, created_at, finished_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
                &[
                    &task.id,
                    &task.container_id,
                    &cmd_json,
                    &task.status.as_str(),
                    &exit_code,
                    &task.logs,
                    &task.created_at.timestamp(),
                    &finished_at,
                ],
            )
            .await?;

        Ok(())
    }

    #[tracing::instrument(name = "PostgresTaskRepository::finish", skip_all, fields(
        id = %id,
        status = %status,
        exit_code
    ))]
    async fn finish(
        &self,
        id: &str,
        status: TaskStatus,
        exit_code: i64,
        logs: &str,
    ) -> Result<(), RepositoryError> {
        let client = self.pool.get().await?;

        let updated = client
            .execute(
                r#"
                UPDATE container_tasks
                SET status = $1, exit_code = $2, logs = $3, finished_at = $4
                WHERE id = $5 AND status = $6
                "#,
                &[
                    &status.as_str(),
                    &exit_code_column(exit_code)?,
                    &logs,
                    &Utc::now().timestamp(),
                    &id,
                    &TaskStatus::Pending.as_str(),
                ],
            )
            .await?;

        if updated == 0 {
            let existing = client
                .query_opt("SELECT status FROM container_tasks WHERE id = $1", &[&id])
                .await?;

            return Err(match existing {
                None => RepositoryError::NotFound(id.to_owned()),
                Some(row) => RepositoryError::InvalidData(format!(
                    "task {id} already finished as {}",
                    row.try_get::<_, String>("status")?
                )),
            });
        }

        Ok(())
    }

    #[tracing::instrument(name = "PostgresTaskRepository::get", skip_all, fields(id = %id))]
    async fn get(&self, id: &str) -> Result<Option<ContainerTask>, RepositoryError> {
        let client = self.pool.get().await?;

        let row = client
            .query_opt(
                r#"
                SELECT id, container_id, cmd_json, status, exit_code, logs, created_at, finished_at
                FROM container_tasks
                WHERE id = $1
                "#,
                &[&id],
            )
            .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    #[tracing::instrument(name = "PostgresTaskRepository::list_for_container", skip_all, fields(
        container_id = %container_id
    ))]
    async fn list_for_container(
        &self,
        container_id: &str,
    ) -> Result<Vec<ContainerTask>, RepositoryError> {
        let client = self.pool.get().await?;

        let rows = client
            .query(
                r#"
                SELECT id, container_id, cmd_json, status, exit_code, logs, created_at, finished_at
                FROM container_tasks
                WHERE container_id = $1
                ORDER BY created_at, id
                "#,
                &[&container_id],
            )
            .await?;

        rows.iter().map(row_to_task).collect()
    }
}

fn exit_code_column(exit_code: i64) -> Result<i32, RepositoryError> {
    i32::try_from(exit_code)
        .map_err(|_| RepositoryError::InvalidData(format!("exit code {exit_code} out of range")))
}

fn timestamp(seconds: i64) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| RepositoryError::InvalidData(format!("bad timestamp {seconds}")))
}

fn row_to_container(row: &Row) -> Result<Container, RepositoryError> {
    let status: String = row.try_get("status")?;

    Ok(Container {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        status: status.parse().map_err(RepositoryError::InvalidData)?,
        created_at: timestamp(row.try_get("created_at")?)?,
    })
}

fn row_to_task(row: &Row) -> Result<ContainerTask, RepositoryError> {
    let cmd_json: String = row.try_get("cmd_json")?;
    let status: String = row.try_get("status")?;
    let exit_code: Option<i32> = row.try_get("exit_code")?;
    let finished_at: Option<i64> = row.try_get("finished_at")?;

    Ok(ContainerTask {
        id: row.try_get("id")?,
        container_id: row.try_get("container_id")?,
        cmd: serde_json::from_str(&cmd_json)?,
        status: status.parse().map_err(RepositoryError::InvalidData)?,
        exit_code: exit_code.map(i64::from),
        logs: row.try_get("logs")?,
        created_at: timestamp(row.try_get("created_at")?)?,
        finished_at: finished_at.map(timestamp).transpose()?,
    })
}
