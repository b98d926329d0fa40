//! Connection parameters shared by every backend.

use serde::{Deserialize, Serialize};

use crate::DbError;

/// Connection parameters for one logical database connection.
///
/// Owned exclusively by one worker instance and mutable only through
/// `DbWorker::init`. Deserializable so shard registries can be loaded from
/// JSON configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Backend selector used by shard registries ("mysql", "mssql", "postgresql").
    #[serde(default)]
    pub db_type: String,
    pub server: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub db_name: String,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub read_only: bool,
    /// Connect at shard registration instead of on first shard access.
    #[serde(default)]
    pub autoconnect: bool,
}

impl ConnectionParameters {
    /// Check the fields every backend requires before any I/O is attempted.
    pub fn validate(&self) -> Result<(), DbError> {
        if self.server.is_empty() {
            return Err(DbError::ConnectionDataIncomplete("server".into()));
        }
        if self.db_name.is_empty() {
            return Err(DbError::ConnectionDataIncomplete("db_name".into()));
        }
        if self.user.is_empty() {
            return Err(DbError::ConnectionDataIncomplete("user".into()));
        }
        Ok(())
    }
}
