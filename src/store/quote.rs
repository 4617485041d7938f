use std::{collections::HashMap, str::FromStr};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter, types::Value};
use rust_decimal::Decimal;

use super::sqlite::{Pool, checkout};
use crate::model::{self, QuoteRecord, StoredQuote};

/// Rows written by one [`upsert_many`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCount {
    pub inserted: usize,
    pub updated: usize,
}

impl UpsertCount {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Per-symbol aggregate returned by [`query_stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolStats {
    pub count: u64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub avg_volume: Option<f64>,
    pub missing_close_count: u64,
}

/// Initializes the quote table and its indexes.
pub fn create_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS quote (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            symbol TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            open_price TEXT,
            high_price TEXT,
            low_price TEXT,
            close_price TEXT,
            volume INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE (symbol, timestamp)
        );
        CREATE INDEX IF NOT EXISTS idx_quote_symbol ON quote (symbol);
        CREATE INDEX IF NOT EXISTS idx_quote_timestamp ON quote (timestamp);
        CREATE INDEX IF NOT EXISTS idx_quote_created_at ON quote (created_at);",
    )
}

/// Checks out a connection and makes sure the schema exists.
pub fn ensure_schema(pool: &Pool) -> model::Result<()> {
    let conn = checkout(pool)?;
    create_table(&conn)?;
    Ok(())
}

/// Trivial round trip used by the connectivity check.
pub fn ping(pool: &Pool) -> model::Result<()> {
    let conn = checkout(pool)?;
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

/// Inserts or updates `records` keyed on (symbol, timestamp) in a single
/// transaction. Existing rows keep `created_at`; `updated_at` becomes `now`.
pub fn upsert_many(pool: &Pool, records: &[QuoteRecord], now: DateTime<Utc>) -> model::Result<UpsertCount> {
    let mut conn = checkout(pool)?;
    let transaction = conn.transaction()?;
    let mut count = UpsertCount::default();
    {
        let mut exists =
            transaction.prepare("SELECT EXISTS(SELECT 1 FROM quote WHERE symbol = ?1 AND timestamp = ?2)")?;
        let mut upsert = transaction.prepare(
            "INSERT INTO quote (symbol, timestamp, open_price, high_price, low_price, close_price, volume, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT (symbol, timestamp) DO UPDATE SET
                open_price = excluded.open_price,
                high_price = excluded.high_price,
                low_price = excluded.low_price,
                close_price = excluded.close_price,
                volume = excluded.volume,
                updated_at = excluded.updated_at",
        )?;
        for record in records {
            let ts = record.timestamp.timestamp();
            let existed: bool = exists.query_row(params![record.symbol, ts], |row| row.get(0))?;
            let volume = record
                .volume
                .map(i64::try_from)
                .transpose()
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            upsert.execute(params![
                record.symbol,
                ts,
                record.open_price.map(|p| p.to_string()),
                record.high_price.map(|p| p.to_string()),
                record.low_price.map(|p| p.to_string()),
                record.close_price.map(|p| p.to_string()),
                volume,
                now.timestamp(),
            ])?;
            if existed {
                count.updated += 1;
            } else {
                count.inserted += 1;
            }
        }
    }
    // an early return above drops the transaction, which rolls it back
    transaction.commit()?;
    Ok(count)
}

/// Aggregates per symbol, optionally restricted to `symbols` and to rows at or after `since`.
pub fn query_stats(
    pool: &Pool,
    symbols: Option<&[String]>,
    since: Option<DateTime<Utc>>,
) -> model::Result<HashMap<String, SymbolStats>> {
    let mut sql = String::from(
        "SELECT symbol, COUNT(*), MIN(timestamp), MAX(timestamp), AVG(volume),
                SUM(CASE WHEN close_price IS NULL THEN 1 ELSE 0 END)
         FROM quote WHERE 1 = 1",
    );
    let mut args: Vec<Value> = Vec::new();
    if let Some(symbols) = symbols {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; symbols.len()].join(", ");
        sql.push_str(&format!(" AND symbol IN ({placeholders})"));
        args.extend(symbols.iter().map(|s| Value::Text(s.clone())));
    }
    if let Some(since) = since {
        sql.push_str(" AND timestamp >= ?");
        args.push(Value::Integer(since.timestamp()));
    }
    sql.push_str(" GROUP BY symbol ORDER BY symbol");

    let conn = checkout(pool)?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(args), |row| {
        Ok((
            row.get::<_, String>(0)?,
            SymbolStats {
                count: row.get::<_, i64>(1)? as u64,
                earliest: row.get::<_, Option<i64>>(2)?.and_then(from_unix),
                latest: row.get::<_, Option<i64>>(3)?.and_then(from_unix),
                avg_volume: row.get(4)?,
                missing_close_count: row.get::<_, i64>(5)? as u64,
            },
        ))
    })?;

    let mut stats = HashMap::new();
    for row in rows {
        let (symbol, s) = row?;
        stats.insert(symbol, s);
    }
    Ok(stats)
}

/// Deletes rows whose timestamp is older than `now - horizon_days`.
pub fn delete_older_than(pool: &Pool, horizon_days: u32, now: DateTime<Utc>) -> model::Result<usize> {
    let cutoff = now - Duration::days(i64::from(horizon_days));
    let conn = checkout(pool)?;
    let deleted = conn.execute("DELETE FROM quote WHERE timestamp < ?1", params![cutoff.timestamp()])?;
    log::info!("Deleted {deleted} quotes older than {cutoff}");
    Ok(deleted)
}

pub fn total_count(pool: &Pool) -> model::Result<u64> {
    let conn = checkout(pool)?;
    let n: i64 = conn.query_row("SELECT COUNT(*) FROM quote", [], |row| row.get(0))?;
    Ok(n as u64)
}

const SELECT_QUOTE: &str = "SELECT id, symbol, timestamp, open_price, high_price, low_price, close_price, volume, created_at, updated_at FROM quote";

/// Most recent stored row for `symbol`.
pub fn latest_quote(pool: &Pool, symbol: &str) -> model::Result<Option<StoredQuote>> {
    let conn = checkout(pool)?;
    let quote = conn
        .query_row(
            &format!("{SELECT_QUOTE} WHERE symbol = ?1 ORDER BY timestamp DESC LIMIT 1"),
            params![symbol],
            stored_quote,
        )
        .optional()?;
    Ok(quote)
}

fn stored_quote(row: &Row<'_>) -> rusqlite::Result<StoredQuote> {
    let instant = |idx: usize| -> rusqlite::Result<DateTime<Utc>> {
        let secs: i64 = row.get(idx)?;
        from_unix(secs).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
    };
    Ok(StoredQuote {
        id: row.get(0)?,
        record: QuoteRecord {
            symbol: row.get(1)?,
            timestamp: instant(2)?,
            open_price: decimal(row, 3)?,
            high_price: decimal(row, 4)?,
            low_price: decimal(row, 5)?,
            close_price: decimal(row, 6)?,
            volume: row.get::<_, Option<i64>>(7)?.map(|v| v as u64),
        },
        created_at: instant(8)?,
        updated_at: instant(9)?,
    })
}

fn decimal(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| {
            Decimal::from_str(&s)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
        })
        .transpose()
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}
