use std::path::{Component, Path, PathBuf};

use axum::{
    extract::{
        multipart::{Multipart, MultipartRejection},
        State,
    },
    Json,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

use super::{ApiError, AppState};

/// Multipart field carrying the uploaded files.
pub const FILES_FIELD: &str = "files";
pub const USER_ID_FIELD: &str = "userId";
/// Hidden directory under the data root where parts land while a request is read.
pub const STAGING_DIR: &str = ".incoming";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub user_id: String,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
}

/// Stores every `files` part under `<data_dir>/<userId>/<UTC batch stamp>/`.
///
/// Parts are streamed into a private staging directory as they arrive, since
/// the user id may come after the files, and moved into place at the end.
#[tracing::instrument(name = "api::upload", skip_all)]
pub async fn upload(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let multipart = multipart.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;

    let staging = state
        .data_dir
        .join(STAGING_DIR)
        .join(Uuid::new_v4().to_string());

    tokio::fs::create_dir_all(&staging).await.map_err(|err| {
        ApiError::internal(format!("unable to create {}: {err}", staging.display()))
    })?;

    let result = store(&state.data_dir, &staging, multipart).await;

    if let Err(error) = tokio::fs::remove_dir_all(&staging).await {
        warn!(?error, staging = ?staging, "unable to remove upload staging dir");
    }

    result.map(Json)
}

async fn store(
    data_dir: &Path,
    staging: &Path,
    mut multipart: Multipart,
) -> Result<UploadResponse, ApiError> {
    let mut user_id = None;
    let mut files: Vec<String> = Vec::new();

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(err.body_text()))?
    {
        let name = field.name().map(str::to_owned);

        match name.as_deref() {
            Some(USER_ID_FIELD) => {
                let text = field
                    .text()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?;
                user_id = Some(text.trim().to_owned()).filter(|id| !id.is_empty());
            }
            Some(FILES_FIELD) => {
                let file_name = field.file_name().and_then(base_name).ok_or_else(|| {
                    ApiError::bad_request("every uploaded file needs a file name")
                })?;

                let mut file = File::create(staging.join(&file_name))
                    .await
                    .map_err(|err| save_failed(&file_name, err))?;

                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|err| ApiError::bad_request(err.body_text()))?
                {
                    file.write_all(&chunk)
                        .await
                        .map_err(|err| save_failed(&file_name, err))?;
                }

                file.flush()
                    .await
                    .map_err(|err| save_failed(&file_name, err))?;

                // A repeated name replaces the earlier part.
                if !files.contains(&file_name) {
                    files.push(file_name);
                }
            }
            _ => {}
        }
    }

    if files.is_empty() {
        return Err(ApiError::bad_request(format!(
            "no files uploaded (field: {FILES_FIELD})"
        )));
    }

    let user_id = match user_id {
        Some(id) if is_valid_user_id(&id) => id,
        Some(id) => return Err(ApiError::bad_request(format!("invalid userId: {id}"))),
        None => Uuid::new_v4().to_string(),
    };

    let batch = Utc::now().format("%Y%m%dT%H%M%SZ").to_string();
    let dir = data_dir.join(&user_id).join(batch);

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| ApiError::internal(format!("unable to create {}: {err}", dir.display())))?;

    let mut stored = Vec::with_capacity(files.len());
    for file_name in files {
        let path = dir.join(&file_name);

        tokio::fs::rename(staging.join(&file_name), &path)
            .await
            .map_err(|err| save_failed(&file_name, err))?;

        stored.push(path);
    }

    info!(%user_id, dir = ?dir, files = stored.len(), "stored upload");

    Ok(UploadResponse {
        user_id,
        dir,
        files: stored,
    })
}

fn save_failed(file_name: &str, err: std::io::Error) -> ApiError {
    ApiError::internal(format!("save {file_name} failed: {err}"))
}

/// Final path component of a client supplied file name, whichever separator it used.
pub(crate) fn base_name(file_name: &str) -> Option<String> {
    let name = file_name.rsplit(['/', '\\']).next()?.trim();

    if name.is_empty() || name == "." || name == ".." {
        return None;
    }

    Some(name.to_owned())
}

/// A single plain path component that does not collide with the staging area.
fn is_valid_user_id(id: &str) -> bool {
    !id.starts_with('.') && is_single_component(id)
}

fn is_single_component(id: &str) -> bool {
    let mut components = Path::new(id).components();

    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !id.contains('\\')
}
