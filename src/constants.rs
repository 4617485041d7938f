// Defaults used when the matching environment variable is not set.

pub const DEFAULT_API_BASE_URL: &str = "https://www.alphavantage.co/query";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 5;
// free tier allows 5 calls per minute
pub const DEFAULT_CALL_INTERVAL_SECS: u64 = 12;
// rate-limit notices wait this many times longer than transient failures
pub const RATE_LIMIT_BACKOFF_FACTOR: u32 = 4;
// exponential backoff never waits longer than this many base delays
pub const MAX_BACKOFF_MULTIPLE: u32 = 8;

pub const DEFAULT_SQLITE_FILE: &str = "quotes.db";
pub const DEFAULT_POOL_SIZE: u32 = 10;
pub const DEFAULT_POOL_TIMEOUT_SECS: u64 = 30;
pub const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

pub const DEFAULT_SYMBOLS: &str = "AAPL,GOOGL,MSFT,TSLA,AMZN";
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_MAX_WORKERS: usize = 3;
pub const DEFAULT_BATCH_PAUSE_SECS: u64 = 2;
pub const DEFAULT_INTRADAY_SYMBOLS: usize = 3;
pub const DEFAULT_INTRADAY_INTERVAL: &str = "60min";
pub const DEFAULT_PROBE_SYMBOL: &str = "AAPL";

pub const DEFAULT_RETENTION_DAYS: u32 = 365;
pub const DEFAULT_MAX_STALENESS_DAYS: u32 = 5;
pub const QUALITY_WARN_SCORE: f64 = 80.0;

/// Max error strings carried in step metadata.
pub const MAX_REPORTED_ERRORS: usize = 10;

/// Time zone assumed for intraday timestamps when the payload omits one.
pub const DEFAULT_PROVIDER_TZ: &str = "US/Eastern";
pub const MAX_SYMBOL_LEN: usize = 10;
