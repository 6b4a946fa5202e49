pub mod session;
pub mod query;
pub mod config;

use thiserror::Error;

pub use config::{Config, ReplicaConfig};
pub use query::QueryType;
pub use session::{Credentials, QueryRoute, ReadSplitter, SqliteDriver};

#[derive(Error, Debug)]
pub enum SqlSplitError {
    #[error("Connection to {address} failed: {source}")]
    Connection {
        address: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Session has been closed")]
    SessionClosed,

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Unknown cursor {0}")]
    UnknownCursor(u64),
}

pub type Result<T> = std::result::Result<T, SqlSplitError>;

impl SqlSplitError {
    pub fn connection(
        address: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        SqlSplitError::Connection {
            address: address.into(),
            source: source.into(),
        }
    }

    /// Errors that abort session construction
    pub fn is_fatal(&self) -> bool {
        matches!(self, SqlSplitError::Connection { .. } | SqlSplitError::Config(_))
    }
}
