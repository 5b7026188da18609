use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("unable to resolve path {path}: {reason}")]
    Unresolvable { path: String, reason: String },
    #[error("HOST_DATA_DIR is not set")]
    HostRootNotConfigured,
}

/// Maps paths from the service's own filesystem view to the view of the
/// container runtime daemon.
///
/// When the service runs inside a container, `service_root` is where the shared
/// data directory is mounted for the service and `host_root` is the same
/// directory on the physical host. Bind mounts must use the host path because
/// the daemon, not the service, performs the bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathTranslator {
    service_root: PathBuf,
    host_root: Option<PathBuf>,
}

impl PathTranslator {
    #[tracing::instrument(name = "PathTranslator::new", skip_all, fields(
        service_root = ?service_root.as_ref(),
        host_root = ?host_root
    ))]
    pub fn new(
        service_root: impl AsRef<Path>,
        host_root: Option<PathBuf>,
    ) -> Result<Self, TranslateError> {
        let service_root = absolutize(service_root.as_ref())?;
        let host_root = match host_root {
            None => None,
            Some(root) => Some(absolutize(&root)?),
        };

        Ok(Self {
            service_root,
            host_root,
        })
    }

    pub fn service_root(&self) -> &Path {
        &self.service_root
    }

    pub fn host_root(&self) -> Option<&Path> {
        self.host_root.as_deref()
    }

    /// Resolves `path` against the working directory without translating it.
    pub fn resolve(&self, path: impl AsRef<Path>) -> Result<PathBuf, TranslateError> {
        absolutize(path.as_ref())
    }

    /// Translates `path` if a host root is configured, otherwise returns the
    /// resolved path unchanged.
    pub fn translate(&self, path: impl AsRef<Path>) -> Result<PathBuf, TranslateError> {
        let resolved = absolutize(path.as_ref())?;

        match &self.host_root {
            None => Ok(resolved),
            Some(host_root) => Ok(self.rebase(resolved, host_root)),
        }
    }

    /// Like [`PathTranslator::translate`] but refuses to guess when no host root
    /// is configured.
    pub fn translate_required(&self, path: impl AsRef<Path>) -> Result<PathBuf, TranslateError> {
        let host_root = self
            .host_root
            .as_ref()
            .ok_or(TranslateError::HostRootNotConfigured)?;

        let resolved = absolutize(path.as_ref())?;

        Ok(self.rebase(resolved, host_root))
    }

    fn rebase(&self, resolved: PathBuf, host_root: &Path) -> PathBuf {
        // Component-wise, so `/data2` is not inside `/data`.
        match resolved.strip_prefix(&self.service_root) {
            Ok(relative) if relative.as_os_str().is_empty() => host_root.to_path_buf(),
            Ok(relative) => host_root.join(relative),
            Err(_) => resolved,
        }
    }
}

fn absolutize(path: &Path) -> Result<PathBuf, TranslateError> {
    if path.as_os_str().is_empty() {
        return Err(TranslateError::Unresolvable {
            path: String::new(),
            reason: "path is empty".to_owned(),
        });
    }

    if path.is_absolute() {
        return Ok(normalize(path));
    }

    let cwd = std::env::current_dir().map_err(|err| TranslateError::Unresolvable {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;

    Ok(normalize(&cwd.join(path)))
}

/// Lexically removes `.` and `..` components.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();

    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }

    normalized
}
