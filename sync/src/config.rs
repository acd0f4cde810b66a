//! Configuration management for the sync client.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Sync configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Local store file
    pub db_path: PathBuf,
    /// Remote directory used by the directory transport
    pub remote_dir: PathBuf,
    /// Sync-source identity the watermark is kept under
    pub source_id: String,
    /// Name of the remote snapshot entry
    pub snapshot_name: String,
    /// Name of the remote lock marker
    pub lock_name: String,
    /// Upper bound on each remote operation
    pub io_timeout: Duration,
    /// Identity written into the lock marker
    pub holder: String,
    /// Start with `force` set
    pub force: bool,
    /// Optional JSON record prototype; the tasks prototype otherwise
    pub schema_path: Option<PathBuf>,
}

impl SyncConfig {
    pub const DEFAULT_SOURCE_ID: &'static str = "remote";
    pub const DEFAULT_SNAPSHOT_NAME: &'static str = ".task_db.xml";
    pub const DEFAULT_LOCK_NAME: &'static str = ".task-lock";
    pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

    /// Defaults for everything but the two locations.
    pub fn new(db_path: impl Into<PathBuf>, remote_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            remote_dir: remote_dir.into(),
            source_id: Self::DEFAULT_SOURCE_ID.to_string(),
            snapshot_name: Self::DEFAULT_SNAPSHOT_NAME.to_string(),
            lock_name: Self::DEFAULT_LOCK_NAME.to_string(),
            io_timeout: Self::DEFAULT_IO_TIMEOUT,
            holder: uuid::Uuid::new_v4().to_string(),
            force: false,
            schema_path: None,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let db_path = lookup("STASH_DB_PATH").ok_or(ConfigError::Missing("STASH_DB_PATH"))?;
        let remote_dir =
            lookup("STASH_REMOTE_DIR").ok_or(ConfigError::Missing("STASH_REMOTE_DIR"))?;

        let mut config = Self::new(db_path, remote_dir);

        if let Some(source_id) = lookup("STASH_SOURCE_ID") {
            config.source_id = source_id;
        }
        if let Some(name) = lookup("STASH_SNAPSHOT_NAME") {
            config.snapshot_name = name;
        }
        if let Some(name) = lookup("STASH_LOCK_NAME") {
            config.lock_name = name;
        }
        if let Some(holder) = lookup("STASH_HOLDER") {
            config.holder = holder;
        }
        if let Some(secs) = lookup("STASH_IO_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidTimeout(secs.clone()))?;
            if secs == 0 {
                return Err(ConfigError::InvalidTimeout(secs.to_string()));
            }
            config.io_timeout = Duration::from_secs(secs);
        }
        if let Some(force) = lookup("STASH_FORCE") {
            config.force = parse_bool(&force).ok_or(ConfigError::InvalidBool {
                var: "STASH_FORCE",
                value: force.clone(),
            })?;
        }
        config.schema_path = lookup("STASH_SCHEMA_PATH").map(PathBuf::from);

        Ok(config)
    }

    /// The record prototype to open the local store with.
    pub fn load_schema(&self) -> Result<stash_engine::Schema, ConfigError> {
        match &self.schema_path {
            None => Ok(stash_engine::Schema::tasks()),
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| ConfigError::SchemaRead(format!("{}: {e}", path.display())))?;
                Ok(stash_engine::Schema::from_json(&text)?)
            }
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("Invalid STASH_IO_TIMEOUT_SECS value: {0:?}")]
    InvalidTimeout(String),

    #[error("Invalid {var} value: {value:?}")]
    InvalidBool { var: &'static str, value: String },

    #[error("Cannot read schema file {0}")]
    SchemaRead(String),

    #[error("Invalid schema: {0}")]
    Schema(#[from] stash_engine::Error),
}
