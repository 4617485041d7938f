use std::{fmt::Display, io, str::FromStr};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{http::client::RequestError, validate::ValidationError};

/// One OHLCV observation for one symbol at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteRecord {
    pub symbol: String,             // Upper-case ticker.
    pub timestamp: DateTime<Utc>,   // Bar start (intraday) or date boundary (daily).
    pub open_price: Option<Decimal>,
    pub high_price: Option<Decimal>,
    pub low_price: Option<Decimal>,
    pub close_price: Option<Decimal>,
    pub volume: Option<u64>,
}

/// A persisted row, including the store-assigned bookkeeping columns.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredQuote {
    pub id: i64,
    pub record: QuoteRecord,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Bar width for intraday requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    OneMin,
    FiveMin,
    FifteenMin,
    ThirtyMin,
    SixtyMin,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMin => "1min",
            Interval::FiveMin => "5min",
            Interval::FifteenMin => "15min",
            Interval::ThirtyMin => "30min",
            Interval::SixtyMin => "60min",
        }
    }
}

impl Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "1min" => Ok(Interval::OneMin),
            "5min" => Ok(Interval::FiveMin),
            "15min" => Ok(Interval::FifteenMin),
            "30min" => Ok(Interval::ThirtyMin),
            "60min" => Ok(Interval::SixtyMin),
            other => Err(format!("unsupported interval {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchMode {
    Daily,
    Intraday(Interval),
}

impl Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchMode::Daily => f.write_str("daily"),
            FetchMode::Intraday(interval) => write!(f, "intraday/{interval}"),
        }
    }
}

/// Error classification shared by outcomes, step results and the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Transient,
    RateLimited,
    Parse,
    Unauthorized,
    Provider,
    Validation,
    ResourceExhausted,
    Persistence,
    Cancelled,
    Internal,
}

/// Result of fetching and validating one symbol.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success { records: Vec<QuoteRecord>, rejected: usize },
    Empty { reason: String },
    Failed { kind: ErrorKind, message: String },
    Cancelled,
}

impl FetchOutcome {
    pub fn count(&self) -> usize {
        match self {
            FetchOutcome::Success { records, .. } => records.len(),
            _ => 0,
        }
    }

    pub fn failed(err: &QuotesError) -> Self {
        FetchOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn tag(&self) -> OutcomeTag {
        match self {
            FetchOutcome::Success { records, rejected } => OutcomeTag::Success {
                count: records.len(),
                rejected: *rejected,
            },
            FetchOutcome::Empty { reason } => OutcomeTag::Empty { reason: reason.clone() },
            FetchOutcome::Failed { kind, .. } => OutcomeTag::Failed { kind: *kind },
            FetchOutcome::Cancelled => OutcomeTag::Cancelled,
        }
    }
}

/// Payload-free view of a [`FetchOutcome`], small enough to pass between steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeTag {
    Success { count: usize, rejected: usize },
    Empty { reason: String },
    Failed { kind: ErrorKind },
    Cancelled,
}

impl OutcomeTag {
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            OutcomeTag::Failed { kind } => Some(*kind),
            OutcomeTag::Cancelled => Some(ErrorKind::Cancelled),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, QuotesError>;

#[derive(Error, Debug)]
pub enum QuotesError {
    #[error("File not found: {0}")]
    FileNotFound(String),
    #[error("Could not read file: {0}")]
    CouldNotOpenFile(#[from] io::Error),
    #[error("Symbol file is empty: {0}")]
    EmptySymbolFile(String),
    #[error(transparent)]
    Http(#[from] RequestError),
    #[error("Invalid record: {0}")]
    Validation(#[from] ValidationError),
    #[error("Connection pool exhausted: {0}")]
    ResourceExhausted(String),
    #[error("Database unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),
}

impl QuotesError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuotesError::Http(e) => e.kind(),
            QuotesError::Validation(_) => ErrorKind::Validation,
            QuotesError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            QuotesError::DatabaseError(_) | QuotesError::StoreUnavailable(_) => ErrorKind::Persistence,
            _ => ErrorKind::Internal,
        }
    }
}

// r2d2 only exposes the last connection error as text
impl From<r2d2::Error> for QuotesError {
    fn from(value: r2d2::Error) -> Self {
        let message = value.to_string();
        if message.contains("unable to open") {
            Self::StoreUnavailable(message)
        } else {
            Self::ResourceExhausted(message)
        }
    }
}
