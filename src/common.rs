//! Common helpers to be used by various bot modules.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use diesel::SqliteConnection;

use crate::config::Config;
use crate::db::StorageResult;

/// Wrapper around [`teloxide::dispatching::UpdateHandler`] to be used in this
/// crate.
pub type UpdateHandler = teloxide::dispatching::UpdateHandler<anyhow::Error>;

/// Bot environment: global state shared between all handlers and the
/// notification task.
pub struct BotEnv {
    pub conn: Mutex<SqliteConnection>,
    pub config: Arc<Config>,
}

impl BotEnv {
    pub fn new(config: Config) -> StorageResult<Self> {
        Ok(Self {
            conn: Mutex::new(crate::db::establish(&config.db)?),
            config: Arc::new(config),
        })
    }

    /// Lock the database connection. Never hold the guard across `.await`.
    pub fn conn(&self) -> MutexGuard<'_, SqliteConnection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
