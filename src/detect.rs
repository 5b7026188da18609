use std::path::Path;

use tracing::info;

pub const SHELL_IMAGE: &str = "alpine:3.20";
pub const PYTHON_IMAGE: &str = "python:3.11-slim";
pub const GO_IMAGE: &str = "golang:1.21-alpine";

/// Image and command picked for a job directory that did not specify them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedProgram {
    pub image: String,
    pub cmd: Vec<String>,
}

impl DetectedProgram {
    fn new(image: &str, cmd: Vec<String>) -> Self {
        Self {
            image: image.to_owned(),
            cmd,
        }
    }
}

/// Inspects `dir` and decides how to run it once mounted at `container_dir`.
///
/// Checked in order: an executable `app`, `run.sh`, `app.py`, `app.go`. When
/// nothing matches the job lists the directory.
#[tracing::instrument(name = "detect::detect_program", skip_all, fields(
    dir = ?dir,
    container_dir = %container_dir
))]
pub async fn detect_program(dir: &Path, container_dir: &str) -> DetectedProgram {
    let detected = if is_executable_file(&dir.join("app")).await {
        run_in_shell(container_dir, "app")
    } else if is_file(&dir.join("run.sh")).await {
        run_in_shell(container_dir, "run.sh")
    } else if is_file(&dir.join("app.py")).await {
        DetectedProgram::new(
            PYTHON_IMAGE,
            vec!["python".to_owned(), container_path(container_dir, "app.py")],
        )
    } else if is_file(&dir.join("app.go")).await {
        DetectedProgram::new(
            GO_IMAGE,
            sh(format!("cd {container_dir} && go run app.go")),
        )
    } else {
        DetectedProgram::new(SHELL_IMAGE, sh(format!("ls -la {container_dir}")))
    };

    info!(image = %detected.image, cmd = ?detected.cmd, "detected program");

    detected
}

fn run_in_shell(container_dir: &str, file: &str) -> DetectedProgram {
    let path = container_path(container_dir, file);

    DetectedProgram::new(SHELL_IMAGE, sh(format!("chmod +x {path} && {path}")))
}

fn sh(script: String) -> Vec<String> {
    vec!["sh".to_owned(), "-c".to_owned(), script]
}

/// Joins with `/` regardless of the host platform since the path lives inside a Linux container.
pub(crate) fn container_path(container_dir: &str, file: &str) -> String {
    format!("{}/{file}", container_dir.trim_end_matches('/'))
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|metadata| metadata.is_file())
        .unwrap_or(false)
}

#[cfg(unix)]
async fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file() && metadata.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_executable_file(path: &Path) -> bool {
    is_file(path).await
}
