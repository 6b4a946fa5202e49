use std::collections::BTreeSet;
use std::time::Duration;
use clap::Parser;
use serde::Deserialize;
use crate::{Result, SqlSplitError};
use crate::session::SqliteOptions;

/// Query patterns that must always run on the primary: application-level
/// locks, advisory locks and row locks.
pub const DEFAULT_PRIMARY_PATTERNS: &[&str] = &[
    r"lock_db\b",
    r"(?i)\bget_lock\s*\(",
    r"(?i)\bpg_(?:try_)?advisory(?:_xact)?_lock",
    r"(?i)\bfor\s+(?:no\s+key\s+)?update\b",
    r"(?i)\bfor\s+(?:key\s+)?share\b",
];

/// Read replica settings for one session
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaConfig {
    /// Candidate replica addresses in configured order; empty disables the replica
    pub addresses: Vec<String>,
    /// Zero means a written table is never read from the replica again
    pub lag_tolerance: Duration,
    pub excluded_tables: BTreeSet<String>,
    pub table_prefix: String,
    pub primary_patterns: Vec<String>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            lag_tolerance: Duration::ZERO,
            excluded_tables: BTreeSet::new(),
            table_prefix: String::new(),
            primary_patterns: DEFAULT_PRIMARY_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

/// Options as the owning driver hands them over, before validation
#[derive(Deserialize, Default)]
#[serde(default)]
struct RawReplicaOptions {
    replica_addresses: Option<OneOrMany>,
    lag_tolerance_seconds: Option<f64>,
    excluded_tables: Option<serde_json::Value>,
    table_prefix: Option<String>,
    primary_patterns: Option<Vec<String>>,
}

impl ReplicaConfig {
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            ..Default::default()
        }
    }

    /// Build from a driver option map such as
    /// `{"replica_addresses": ["ro1", "ro2"], "lag_tolerance_seconds": 2, "excluded_tables": ["sessions"]}`.
    pub fn from_options(options: serde_json::Value) -> Result<Self> {
        if options.is_null() {
            return Ok(Self::default());
        }

        let raw: RawReplicaOptions = serde_json::from_value(options)
            .map_err(|e| SqlSplitError::Config(format!("invalid replica options: {e}")))?;

        let mut config = Self::default();

        config.addresses = match raw.replica_addresses {
            None => Vec::new(),
            Some(OneOrMany::One(address)) if address.trim().is_empty() => Vec::new(),
            Some(OneOrMany::One(address)) => vec![address],
            Some(OneOrMany::Many(addresses)) => addresses,
        };

        if let Some(seconds) = raw.lag_tolerance_seconds {
            config.lag_tolerance = lag_tolerance_from_secs(seconds)?;
        }

        match raw.excluded_tables {
            None | Some(serde_json::Value::Null) => {}
            Some(serde_json::Value::Array(tables)) => {
                for table in tables {
                    match table {
                        serde_json::Value::String(name) => {
                            config.excluded_tables.insert(name);
                        }
                        other => {
                            return Err(SqlSplitError::Config(format!(
                                "excluded_tables entries must be strings, got {other}"
                            )));
                        }
                    }
                }
            }
            Some(_) => {
                return Err(SqlSplitError::Config(
                    "excluded_tables must be a list of table names".to_string(),
                ));
            }
        }

        if let Some(prefix) = raw.table_prefix {
            config.table_prefix = prefix;
        }
        if let Some(patterns) = raw.primary_patterns {
            config.primary_patterns = patterns;
        }

        Ok(config)
    }

    pub fn with_lag_tolerance(mut self, lag_tolerance: Duration) -> Self {
        self.lag_tolerance = lag_tolerance;
        self
    }

    pub fn with_excluded_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_tables = tables.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }

    pub fn with_primary_patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_patterns = patterns.into_iter().map(Into::into).collect();
        self
    }
}

fn lag_tolerance_from_secs(seconds: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(seconds).map_err(|_| {
        SqlSplitError::Config(format!(
            "lag tolerance must be a non-negative number of seconds, got {seconds}"
        ))
    })
}

#[derive(Parser, Debug, Clone)]
#[command(name = "sqlsplit")]
#[command(about = "sqlsplit - read/write splitting SQLite shell\nRoutes reads to read-only replicas while keeping read-your-writes per session", long_about = None)]
pub struct Config {
    #[arg(short, long, default_value = "sqlite.db", env = "SQLSPLIT_PRIMARY", help = "Primary (read-write) database path")]
    pub primary: String,

    #[arg(short, long = "replica", env = "SQLSPLIT_REPLICAS", value_delimiter = ',', help = "Read-only replica database path; repeat for several candidates")]
    pub replicas: Vec<String>,

    #[arg(long, default_value = "0", env = "SQLSPLIT_LAG_TOLERANCE", help = "Seconds a written table stays on the primary (0 = for the whole session)")]
    pub lag_tolerance: f64,

    #[arg(long = "exclude-table", env = "SQLSPLIT_EXCLUDE_TABLES", value_delimiter = ',', help = "Table (without prefix) whose reads always go to the primary")]
    pub exclude_tables: Vec<String>,

    #[arg(long, default_value = "", env = "SQLSPLIT_TABLE_PREFIX", help = "Prefix shared by application table names; required with --replica")]
    pub table_prefix: String,

    #[arg(short, long, default_value = "sqlsplit", env = "SQLSPLIT_USER")]
    pub user: String,

    #[arg(long, default_value = "info", env = "SQLSPLIT_LOG_LEVEL")]
    pub log_level: String,

    // SQLite PRAGMA settings
    #[arg(long, default_value = "WAL", env = "SQLSPLIT_JOURNAL_MODE", help = "SQLite journal mode for the primary (WAL, DELETE, TRUNCATE, etc.)")]
    pub pragma_journal_mode: String,

    #[arg(long, default_value = "NORMAL", env = "SQLSPLIT_SYNCHRONOUS", help = "SQLite synchronous mode (NORMAL, FULL, OFF)")]
    pub pragma_synchronous: String,

    #[arg(long, default_value = "-64000", env = "SQLSPLIT_CACHE_SIZE", help = "SQLite page cache size in KB (negative for KB, positive for pages)")]
    pub pragma_cache_size: i32,

    #[arg(long, default_value = "5000", env = "SQLSPLIT_BUSY_TIMEOUT_MS", help = "SQLite busy timeout in milliseconds")]
    pub busy_timeout_ms: u64,
}

impl Config {
    /// Get a configuration instance with all values resolved from CLI args and environment variables
    pub fn load() -> Self {
        Config::parse()
    }

    /// Replica settings for the session. With replicas configured the table
    /// prefix must be set: an empty prefix turns every lowercase word of a
    /// statement into a table name, keywords included.
    pub fn replica_config(&self) -> Result<ReplicaConfig> {
        if !self.replicas.is_empty() && self.table_prefix.is_empty() {
            return Err(SqlSplitError::Config(
                "--table-prefix is required when replicas are configured".to_string(),
            ));
        }

        Ok(ReplicaConfig::new(self.replicas.clone())
            .with_lag_tolerance(lag_tolerance_from_secs(self.lag_tolerance)?)
            .with_excluded_tables(self.exclude_tables.iter().cloned())
            .with_table_prefix(self.table_prefix.clone()))
    }

    pub fn sqlite_options(&self) -> SqliteOptions {
        SqliteOptions {
            journal_mode: self.pragma_journal_mode.clone(),
            synchronous: self.pragma_synchronous.clone(),
            cache_size: self.pragma_cache_size,
            busy_timeout: Duration::from_millis(self.busy_timeout_ms),
        }
    }
}
