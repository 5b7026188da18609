use std::{collections::BTreeMap, path::PathBuf};

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinError;

use super::{ApiError, AppState};
use crate::auth::AuthError;
use crate::container::{Container, CreateOptions, JobOutput, JobRequest};
use crate::provider::ProviderError;
use crate::service::{ExecFailure, ExecReport, ServiceError};

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(request) = body.map_err(bad_body)?;

    match state.auth.login(&request.username, &request.password) {
        Ok(token) => Ok(Json(json!({ "token": token }))),
        Err(AuthError::InvalidCredentials) => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid credentials",
        )),
        Err(error) => Err(ApiError::internal(error.to_string())),
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image: String,
    /// Host path -> container path.
    #[serde(default)]
    pub mounts: BTreeMap<String, String>,
}

pub async fn create_container(
    State(state): State<AppState>,
    body: Result<Json<CreateContainerRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Container>), ApiError> {
    let Json(request) = body.map_err(bad_body)?;

    let opts = CreateOptions {
        name: request.name,
        image: request.image,
        mounts: request
            .mounts
            .into_iter()
            .map(|(source, target)| (PathBuf::from(source), target))
            .collect(),
    };

    let container = state.service.create(opts).await?;

    Ok((StatusCode::CREATED, Json(container)))
}

pub async fn start_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.start(&id).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn stop_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.stop(&id).await?;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete(&id).await?;

    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    #[serde(default)]
    pub cmd: Vec<String>,
}

pub async fn exec_in_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ExecRequest>, JsonRejection>,
) -> Result<Json<ExecReport>, ExecFailure> {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return Err(ExecFailure {
                task_id: None,
                exit_code: -1,
                logs: String::new(),
                error: ServiceError::Validation(rejection.body_text()),
            })
        }
    };

    let service = state.service;
    let report = tokio::spawn(async move { service.exec(&id, request.cmd).await })
        .await
        .map_err(|err| ExecFailure::rejected(detached_failure(err)))??;

    Ok(Json(report))
}

pub async fn run_job(
    State(state): State<AppState>,
    body: Result<Json<JobRequest>, JsonRejection>,
) -> Result<Json<JobOutput>, ApiError> {
    let Json(request) = body.map_err(bad_body)?;

    let service = state.service;
    let output = tokio::spawn(async move { service.run_job(request).await })
        .await
        .map_err(detached_failure)??;

    Ok(Json(output))
}

/// Exec and job work runs on its own task, so a client hanging up does not
/// cancel it halfway. This only fires if that task panicked.
fn detached_failure(error: JoinError) -> ServiceError {
    ServiceError::Provider(ProviderError::runtime(error))
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request(rejection.body_text())
}
