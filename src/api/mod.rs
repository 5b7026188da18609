//! REST surface.
//!
//! `/healthz` and `/login` are public. Everything under `/v1` requires a bearer
//! token issued by `/login`.

use std::{path::PathBuf, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{error, warn};

use crate::auth::Authenticator;
use crate::service::{ExecFailure, ServiceError};

mod handlers;
mod uploads;

pub use uploads::STAGING_DIR;

/// Upper bound for a whole upload request.
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<crate::service::Service>,
    pub auth: Arc<Authenticator>,
    /// Root under which uploads are stored, in the service's own view.
    pub data_dir: PathBuf,
}

pub fn router(state: AppState) -> Router {
    let v1 = Router::new()
        .route(
            "/uploads",
            post(uploads::upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/containers", post(handlers::create_container))
        .route("/containers/{id}", delete(handlers::delete_container))
        .route("/containers/{id}/start", post(handlers::start_container))
        .route("/containers/{id}/stop", post(handlers::stop_container))
        .route("/containers/{id}/exec", post(handlers::exec_in_container))
        .route("/jobs", post(handlers::run_job))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/healthz", get(handlers::health))
        .route("/login", post(handlers::login))
        .nest("/v1", v1)
        .with_state(state)
}

async fn require_bearer(
    State(auth): State<Arc<Authenticator>>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    let Some(token) = token else {
        return ApiError::new(StatusCode::UNAUTHORIZED, "missing bearer token").into_response();
    };

    if let Err(error) = auth.verify(token) {
        warn!(?error, "rejected bearer token");
        return ApiError::new(StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }

    next.run(request).await
}

/// Error response with a `{"error": ...}` body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub(crate) fn status_of(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
        ServiceError::Configuration(_) | ServiceError::Provider(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        let status = status_of(&error);

        if status.is_server_error() {
            error!(?error, "request failed");
        }

        Self::new(status, error.to_string())
    }
}

/// Exec failures keep the output fields next to the error.
impl IntoResponse for ExecFailure {
    fn into_response(self) -> Response {
        let status = status_of(&self.error);

        if status.is_server_error() {
            error!(error = ?self.error, "exec failed");
        }

        (
            status,
            Json(json!({
                "error": self.error.to_string(),
                "exitCode": self.exit_code,
                "logs": self.logs,
                "taskId": self.task_id,
            })),
        )
            .into_response()
    }
}
