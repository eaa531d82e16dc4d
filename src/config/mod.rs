//! Configuration module for the sync core.
//!
//! All configuration is loaded from environment variables with sensible defaults.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::SyncError;
use crate::models::EntityKind;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite file backing the local store
    pub db_path: PathBuf,
    /// Base URL of the remote API
    pub remote_url: String,
    /// Key sent with every remote request
    pub api_key: Option<String>,
    /// Owner scope for user-scoped entities
    pub user_id: Option<String>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    pub log_format: LogFormat,
    /// Freshness window for task lists
    pub task_cache_ttl: Duration,
    /// Freshness window for routines
    pub routine_cache_ttl: Duration,
    /// Freshness window for courses, teachers and materials
    pub static_cache_ttl: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Soft timeout for a single record replay
    pub record_timeout: Duration,
    /// Connectivity flapping window
    pub debounce: Duration,
    /// Interval between remote health probes
    pub probe_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/offline.sqlite"),
            remote_url: "http://127.0.0.1:8080".to_string(),
            api_key: None,
            user_id: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            task_cache_ttl: Duration::from_secs(120),
            routine_cache_ttl: Duration::from_secs(600),
            static_cache_ttl: Duration::from_secs(1800),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_millis(5000),
            record_timeout: Duration::from_secs(15),
            debounce: Duration::from_millis(750),
            probe_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, SyncError> {
        dotenvy::dotenv().ok();

        let db_path = env::var("NESTTASK_DB_PATH")
            .unwrap_or_else(|_| "./data/offline.sqlite".to_string())
            .into();

        let remote_url = env::var("NESTTASK_REMOTE_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string())
            .trim_end_matches('/')
            .to_string();

        let api_key = env::var("NESTTASK_API_KEY").ok().filter(|k| !k.is_empty());
        let user_id = env::var("NESTTASK_USER_ID").ok().filter(|u| !u.is_empty());

        let log_level = env::var("NESTTASK_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = match env::var("NESTTASK_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("text") | Err(_) => LogFormat::Text,
            Ok(other) => {
                return Err(SyncError::Config(format!(
                    "NESTTASK_LOG_FORMAT must be 'text' or 'json', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            db_path,
            remote_url,
            api_key,
            user_id,
            log_level,
            log_format,
            task_cache_ttl: Duration::from_secs(parse_var("NESTTASK_TASK_CACHE_SECS", 120)?),
            routine_cache_ttl: Duration::from_secs(parse_var("NESTTASK_ROUTINE_CACHE_SECS", 600)?),
            static_cache_ttl: Duration::from_secs(parse_var("NESTTASK_STATIC_CACHE_SECS", 1800)?),
            retry_max_attempts: parse_var("NESTTASK_RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay: Duration::from_millis(parse_var("NESTTASK_RETRY_BASE_MS", 250)?),
            retry_max_delay: Duration::from_millis(parse_var("NESTTASK_RETRY_MAX_MS", 5000)?),
            record_timeout: Duration::from_secs(parse_var("NESTTASK_RECORD_TIMEOUT_SECS", 15)?),
            debounce: Duration::from_millis(parse_var("NESTTASK_DEBOUNCE_MS", 750)?),
            probe_interval: Duration::from_secs(parse_var("NESTTASK_PROBE_INTERVAL_SECS", 10)?),
        })
    }

    /// Freshness window for an entity kind.
    pub fn cache_ttl(&self, kind: EntityKind) -> Duration {
        match kind {
            EntityKind::Task => self.task_cache_ttl,
            EntityKind::Routine => self.routine_cache_ttl,
            EntityKind::Course | EntityKind::Teacher | EntityKind::Material => {
                self.static_cache_ttl
            }
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, SyncError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| SyncError::Config(format!("Invalid {} value '{}'", name, raw))),
        Err(_) => Ok(default),
    }
}
