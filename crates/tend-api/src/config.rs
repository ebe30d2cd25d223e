use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_BIND_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// `SQLite` file backing the master replica; in memory when unset
    pub db_path: Option<PathBuf>,
    /// Upper bound applied to the `batchSize` of pull requests
    pub max_batch_size: usize,
    /// Per-subscriber queue of the live stream
    pub stream_buffer: usize,
    pub sse_keep_alive: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let port = match optional_trimmed(&lookup, "PORT") {
            Some(port) => port.parse::<u16>().map_err(|_| {
                ConfigError::Invalid("PORT must be an integer in [0, 65535]".to_string())
            })?,
            None => DEFAULT_PORT,
        };
        let bind_addr = value_or_default(
            &lookup,
            "TEND_API_BIND_ADDR",
            &format!("{DEFAULT_BIND_HOST}:{port}"),
        );

        let db_path = optional_trimmed(&lookup, "TEND_API_DB_PATH").map(PathBuf::from);

        let max_batch_size =
            parse_in_range(&lookup, "TEND_API_MAX_BATCH_SIZE", 1_000, 1..=10_000)?;
        let stream_buffer = parse_in_range(&lookup, "TEND_API_STREAM_BUFFER", 256, 1..=65_536)?;

        let sse_keep_alive = match optional_trimmed(&lookup, "TEND_API_SSE_KEEPALIVE_SECS") {
            Some(raw) => {
                let secs = raw.parse::<u64>().map_err(|_| {
                    ConfigError::Invalid(
                        "TEND_API_SSE_KEEPALIVE_SECS must be an integer in [1, 3600]".to_string(),
                    )
                })?;
                if !(1..=3_600).contains(&secs) {
                    return Err(ConfigError::Invalid(
                        "TEND_API_SSE_KEEPALIVE_SECS must be in [1, 3600]".to_string(),
                    ));
                }
                Some(Duration::from_secs(secs))
            }
            None => None,
        };

        Ok(Self {
            bind_addr,
            db_path,
            max_batch_size,
            stream_buffer,
            sse_keep_alive,
        })
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: format!("{DEFAULT_BIND_HOST}:{DEFAULT_PORT}"),
            db_path: None,
            max_batch_size: 1_000,
            stream_buffer: 256,
            sse_keep_alive: None,
        }
    }
}

fn parse_in_range(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: usize,
    range: std::ops::RangeInclusive<usize>,
) -> Result<usize, ConfigError> {
    let Some(raw) = optional_trimmed(lookup, name) else {
        return Ok(default);
    };
    let value = raw.parse::<usize>().map_err(|_| {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    })?;
    if !range.contains(&value) {
        return Err(ConfigError::Invalid(format!(
            "{name} must be in [{}, {}]",
            range.start(),
            range.end()
        )));
    }
    Ok(value)
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
