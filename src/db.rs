use std::fmt;

use diesel::connection::SimpleConnection;
use diesel::{Connection, SqliteConnection};
use diesel_derive_newtype::DieselNewType;
use serde::{Deserialize, Serialize};
use teloxide::types::{ChatId, Recipient};

/// Schema applied on every startup. All statements are idempotent.
const SCHEMA: &str =
    include_str!("../migrations/2024-03-01-000000_init/up.sql");

/// Errors surfaced by the persistence layer.
///
/// A failed read must never be interpreted as "no rows": callers propagate it
/// and abort whatever decision depended on the data.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to open database {path:?}: {source}")]
    Connection {
        path: String,
        #[source]
        source: diesel::ConnectionError,
    },
    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Open the database at `path`, enable foreign keys and make sure all tables
/// exist.
pub fn establish(path: &str) -> StorageResult<SqliteConnection> {
    let mut conn = SqliteConnection::establish(path).map_err(|source| {
        StorageError::Connection { path: path.to_string(), source }
    })?;
    conn.batch_execute("PRAGMA foreign_keys = ON;")?;
    conn.batch_execute(SCHEMA)?;
    Ok(conn)
}

macro_rules! make_db_newtype {
    ($name:ident, $inner:ty, $doc:literal) => {
        #[derive(
            Copy,
            Clone,
            Debug,
            Eq,
            PartialEq,
            Ord,
            PartialOrd,
            Hash,
            Serialize,
            Deserialize,
            DieselNewType,
        )]
        #[doc = $doc]
        pub struct $name(pub(crate) $inner);
    };
}

make_db_newtype!(DbUserId, i32, "Internal user id, the `users` row id.");
make_db_newtype!(DbChatId, i64, "A Telegram chat id stored in the database.");
make_db_newtype!(DbTagId, i32, "A `tags` row id.");

impl fmt::Display for DbUserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user#{}", self.0)
    }
}

impl From<ChatId> for DbChatId {
    fn from(id: ChatId) -> Self {
        Self(id.0)
    }
}

impl From<DbChatId> for ChatId {
    fn from(id: DbChatId) -> Self {
        Self(id.0)
    }
}

impl From<DbChatId> for Recipient {
    fn from(id: DbChatId) -> Self {
        Self::Id(id.into())
    }
}

/// Key of an announcement source, e.g. `DISIM` or `ADSU`.
///
/// Websites are not stored on their own; the set of known websites comes from
/// the configured sources.
#[derive(
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    DieselNewType,
)]
#[serde(transparent)]
pub struct Website(String);

impl Website {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Website {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
pub fn test_connection() -> SqliteConnection {
    establish(":memory:").expect("in-memory database")
}
