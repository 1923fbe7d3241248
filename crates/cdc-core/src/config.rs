//! Immutable configuration record (spec §6, §9 "Global config dataclasses").
//!
//! Loaded once at bootstrap from a TOML file and passed down by value —
//! the re-architected replacement for `original_source/Config.py` and
//! `Startup_Config.py`'s module-level dataclasses.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Postgres connection parameters for one endpoint (primary or sink).
///
/// Mirrors `original_source/Config.py`'s `Pg_Conn_Info` dataclass field
/// for field, generalized so the sink can point at a different database
/// than the primary being tailed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PgConnInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Never logged or serialized back out; populated from the
    /// configured environment variable at load time, not stored in the
    /// TOML file itself (spec §4.C: "password is passed via a dedicated
    /// environment variable, never on the command line").
    #[serde(skip_serializing)]
    pub password: String,
    pub dbname: String,
}

impl PgConnInfo {
    /// A `libpq`-style connection string, suitable for `tokio_postgres`.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={}",
            self.host, self.port, self.user, self.password, self.dbname
        )
    }
}

/// Which concrete `Sink` implementation to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Postgres,
    Stdout,
}

/// The full configuration surface from spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub primary: PgConnInfo,

    pub publication_name: String,
    pub slot_name: String,
    pub plugin: String,
    pub start_from_beginning: bool,

    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_seconds: f64,
    pub status_interval_seconds: f64,
    pub offsets_path: String,

    pub sink: SinkKind,
    /// Required when `sink = postgres`; connection string for the sink
    /// database, which may differ from `primary`.
    #[serde(default)]
    pub sink_dsn: Option<String>,

    /// Also provisions a demo `test_data` table on the primary (spec
    /// §10 / `original_source/Main.py`'s `Check_Test_Data_Table`). A
    /// demo convenience, not part of the core pipeline contract.
    #[serde(default)]
    pub demo_mode: bool,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Errors while loading an `AppConfig` from disk.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("sink is configured as postgres but sink_dsn is missing")]
    MissingSinkDsn,
}

impl AppConfig {
    /// Load configuration from a TOML file, with the primary's password
    /// overridden from the environment, per spec §4.C / §6
    /// (`PGPASSWORD`). The sink's credentials, when it's a Postgres
    /// sink, are carried directly in `sink_dsn` instead — a complete
    /// connection string the operator already controls — so there is no
    /// separate sink-password environment variable to apply here.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.display().to_string();

        let contents = std::fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_str.clone(),
            source,
        })?;

        let mut config: AppConfig =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path_str.clone(),
                source,
            })?;

        if let Ok(password) = std::env::var("PGPASSWORD") {
            config.primary.password = password;
        }

        if config.sink == SinkKind::Postgres && config.sink_dsn.is_none() {
            return Err(ConfigError::MissingSinkDsn);
        }

        Ok(config)
    }
}
