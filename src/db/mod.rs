//! Database module for encrypted fact and episode persistence

pub mod cipher;
pub mod memory;
mod schema;

use std::path::Path;

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::{Error, Result};

pub use cipher::FactCipher;
pub use memory::{
    Episode, EpisodeOutcome, KeywordRecencyScorer, MemoryFact, MemoryStore, RelevanceScorer,
    normalize_key,
};
pub use schema::SCHEMA_VERSION;

/// Database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;

/// Pooled database connection
pub type DbConn = PooledConnection<SqliteConnectionManager>;

/// Initialize the database
///
/// # Errors
///
/// Returns error if database cannot be opened or initialized
pub fn init<P: AsRef<Path>>(path: P) -> Result<DbPool> {
    if let Some(parent) = path.as_ref().parent() {
        std::fs::create_dir_all(parent)?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
    });
    let pool = Pool::builder()
        .max_size(4)
        .build(manager)
        .map_err(|e| Error::MemoryStore(e.to_string()))?;

    // Run migrations on first connection
    let conn = pool.get().map_err(|e| Error::MemoryStore(e.to_string()))?;
    schema::init(&conn)?;

    tracing::info!(version = SCHEMA_VERSION, "database initialized");
    Ok(pool)
}

/// Initialize an in-memory database (for testing)
///
/// # Errors
///
/// Returns error if database cannot be initialized
pub fn init_memory() -> Result<DbPool> {
    let manager = SqliteConnectionManager::memory();
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .map_err(|e| Error::MemoryStore(e.to_string()))?;

    let conn = pool.get().map_err(|e| Error::MemoryStore(e.to_string()))?;
    schema::init(&conn)?;

    Ok(pool)
}
