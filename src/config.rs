use std::{fmt, path::Path, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[serde(alias = "runtime")]
    Docker,
    Mock,
}

impl FromStr for ProviderKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "docker" | "runtime" => Ok(Self::Docker),
            "mock" => Ok(Self::Mock),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Postgres,
    Memory,
}

impl FromStr for StorageKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" => Ok(Self::Postgres),
            "memory" => Ok(Self::Memory),
            _ => Err(()),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Wins over the discrete settings when present.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: "postgres".to_owned(),
            port: 5432,
            user: "postgres".to_owned(),
            password: "postgres".to_owned(),
            name: "containerdb".to_owned(),
        }
    }
}

impl DatabaseConfig {
    pub fn connection_url(&self) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "postgres://{}:{}@{}:{}/{}?sslmode=disable",
                self.user, self.password, self.host, self.port, self.name
            ),
        }
    }
}

// Keeps the password out of logs.
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("name", &self.name)
            .finish()
    }
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub user: String,
    pub password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "devsecret".to_owned(),
            user: "admin".to_owned(),
            password: "admin".to_owned(),
        }
    }
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    pub provider: ProviderKind,
    pub data_dir: PathBuf,
    pub host_data_dir: Option<PathBuf>,
    pub storage: StorageKind,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub job_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            provider: ProviderKind::Mock,
            data_dir: PathBuf::from("./data"),
            host_data_dir: None,
            storage: StorageKind::Postgres,
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            job_timeout_secs: 600,
        }
    }
}

impl Config {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    #[tracing::instrument(name = "Config::from_file", skip_all, fields(
        file_path = ?file_path.as_ref()
    ))]
    pub async fn from_file(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_contents = tokio::fs::read_to_string(file_path.as_ref()).await?;

        let config: Config = serde_yaml::from_str(&file_contents)?;

        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, which maps a variable name to its value.
    /// Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let defaults = Config::default();

        Ok(Self {
            port: parse(&get, "PORT")?.unwrap_or(defaults.port),
            provider: parse(&get, "PROVIDER")?.unwrap_or(defaults.provider),
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            host_data_dir: get("HOST_DATA_DIR").map(PathBuf::from),
            storage: parse(&get, "STORAGE")?.unwrap_or(defaults.storage),
            database: DatabaseConfig {
                url: get("DATABASE_URL"),
                host: get("DB_HOST").unwrap_or(defaults.database.host),
                port: parse(&get, "DB_PORT")?.unwrap_or(defaults.database.port),
                user: get("DB_USER").unwrap_or(defaults.database.user),
                password: get("DB_PASSWORD").unwrap_or(defaults.database.password),
                name: get("DB_NAME").unwrap_or(defaults.database.name),
            },
            auth: AuthConfig {
                jwt_secret: get("JWT_SECRET").unwrap_or(defaults.auth.jwt_secret),
                user: get("AUTH_USER").unwrap_or(defaults.auth.user),
                password: get("AUTH_PASS").unwrap_or(defaults.auth.password),
            },
            job_timeout_secs: parse(&get, "JOB_TIMEOUT_SECS")?.unwrap_or(defaults.job_timeout_secs),
        })
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(key)
        .map(|value| {
            value
                .parse()
                .map_err(|_| ConfigError::InvalidValue { key, value })
        })
        .transpose()
}
