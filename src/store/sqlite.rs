use std::time::Duration;

use r2d2_sqlite::SqliteConnectionManager;

use crate::{config::StoreConfig, constants, model};

pub type Pool = r2d2::Pool<SqliteConnectionManager>;
pub type PooledConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Builds the bounded connection pool. Connections are opened lazily, so an
/// unreachable database surfaces on first checkout rather than here.
pub fn init_pool(config: &StoreConfig) -> Pool {
    let manager = SqliteConnectionManager::file(&config.sqlite_file).with_init(|conn| {
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_row| Ok(()))?;
        conn.busy_timeout(Duration::from_millis(constants::SQLITE_BUSY_TIMEOUT_MS))
    });

    let pool = r2d2::Pool::builder()
        .max_size(config.pool_size)
        .min_idle(Some(0))
        .connection_timeout(config.pool_timeout)
        .build_unchecked(manager);
    log::info!(
        "SQLite pool for {} ready (max {} connections)",
        config.sqlite_file.display(),
        config.pool_size
    );
    pool
}

/// Checks out a connection. Times out with `ResourceExhausted` when the pool
/// stays empty for longer than its connection timeout, or `StoreUnavailable`
/// when the database file cannot be opened. The connection goes back to the
/// pool when dropped.
pub fn checkout(pool: &Pool) -> model::Result<PooledConnection> {
    Ok(pool.get()?)
}
