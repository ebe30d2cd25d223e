use std::env;
use std::path::PathBuf;

use tend_core::config::normalize_base_url;

use crate::error::CliError;

pub const DB_PATH_VAR: &str = "TEND_DB_PATH";
pub const SERVER_URL_VAR: &str = "TEND_SERVER_URL";

/// Where the local replica lives and which server it replicates with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub db_path: PathBuf,
    pub server_url: Option<String>,
}

impl ClientConfig {
    /// Command-line flags win over the environment.
    pub fn resolve(
        cli_db_path: Option<PathBuf>,
        cli_server: Option<String>,
    ) -> Result<Self, CliError> {
        Self::from_lookup(cli_db_path, cli_server, |name| env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        cli_db_path: Option<PathBuf>,
        cli_server: Option<String>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, CliError> {
        let db_path = match cli_db_path.or_else(|| non_empty(&lookup, DB_PATH_VAR).map(PathBuf::from)) {
            Some(path) => path,
            None => default_db_path()?,
        };

        let server_url = cli_server
            .or_else(|| non_empty(&lookup, SERVER_URL_VAR))
            .map(|raw| normalize_base_url(&raw))
            .transpose()
            .map_err(|e| CliError::Config(e.to_string()))?;

        Ok(Self {
            db_path,
            server_url,
        })
    }

    pub fn require_server(&self) -> Result<&str, CliError> {
        self.server_url
            .as_deref()
            .ok_or(CliError::ServerNotConfigured)
    }
}

pub fn default_db_path() -> Result<PathBuf, CliError> {
    dirs::data_dir()
        .map(|dir| dir.join("tend").join("tend.db"))
        .ok_or_else(|| CliError::Config("Failed to resolve CLI data directory".to_string()))
}

fn non_empty(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
