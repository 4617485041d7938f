use std::{path::PathBuf, str::FromStr, time::Duration};

use thiserror::Error;

use crate::{constants, marketdata::retry::Backoff, model::Interval};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' not set")]
    Missing(&'static str),
    #[error("Invalid value for '{name}': {value}")]
    Invalid { name: &'static str, value: String },
}

/// Provider settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub backoff: Backoff,
    pub call_interval: Duration,
    pub probe_symbol: String,
}

/// SQLite file and pool settings.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_file: PathBuf,
    pub pool_size: u32,
    pub pool_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub symbols: Vec<String>,
    pub batch_size: usize,
    pub max_workers: usize,
    pub batch_pause: Duration,
    pub intraday_symbols: usize,
    pub intraday_interval: Interval,
    pub retention_days: u32,
    pub max_staleness_days: u32,
    pub run_deadline: Option<Duration>,
}

impl PipelineConfig {
    /// The leading subset of configured symbols that also gets intraday bars.
    pub fn priority_symbols(&self) -> &[String] {
        let n = self.intraday_symbols.min(self.symbols.len());
        &self.symbols[..n]
    }
}

/// Process-wide settings, built once at start-up and handed to each component.
#[derive(Debug, Clone)]
pub struct Config {
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub pipeline: PipelineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = get("ALPHA_VANTAGE_API_KEY").ok_or(ConfigError::Missing("ALPHA_VANTAGE_API_KEY"))?;

        let retry_delay = Duration::from_secs(parse_or(&get, "API_RETRY_DELAY", constants::DEFAULT_RETRY_DELAY_SECS)?);
        let backoff = match get("API_BACKOFF").as_deref().map(str::trim) {
            None | Some("linear") => Backoff::Linear { step: retry_delay },
            Some("fixed") => Backoff::Fixed { delay: retry_delay },
            Some("exponential") => Backoff::Exponential {
                base: retry_delay,
                factor: 2.0,
                max: retry_delay.saturating_mul(constants::MAX_BACKOFF_MULTIPLE),
                jitter: true,
            },
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "API_BACKOFF",
                    value: other.to_string(),
                });
            }
        };

        let api = ApiConfig {
            api_key,
            base_url: get("API_BASE_URL").unwrap_or_else(|| constants::DEFAULT_API_BASE_URL.into()),
            timeout: Duration::from_secs(parse_or(&get, "API_TIMEOUT", constants::DEFAULT_API_TIMEOUT_SECS)?),
            retry_attempts: parse_or(&get, "API_RETRY_ATTEMPTS", constants::DEFAULT_RETRY_ATTEMPTS)?.max(1),
            backoff,
            call_interval: Duration::from_secs(parse_or(
                &get,
                "API_CALL_INTERVAL",
                constants::DEFAULT_CALL_INTERVAL_SECS,
            )?),
            probe_symbol: get("PROBE_SYMBOL")
                .unwrap_or_else(|| constants::DEFAULT_PROBE_SYMBOL.into())
                .trim()
                .to_uppercase(),
        };

        let store = StoreConfig {
            sqlite_file: get("SQLITE_FILE")
                .unwrap_or_else(|| constants::DEFAULT_SQLITE_FILE.into())
                .into(),
            pool_size: parse_or(&get, "DB_POOL_SIZE", constants::DEFAULT_POOL_SIZE)?.max(1),
            pool_timeout: Duration::from_secs(parse_or(
                &get,
                "DB_POOL_TIMEOUT",
                constants::DEFAULT_POOL_TIMEOUT_SECS,
            )?),
        };

        let symbols = split_symbols(&get("STOCK_SYMBOLS").unwrap_or_else(|| constants::DEFAULT_SYMBOLS.into()));
        let pipeline = PipelineConfig {
            symbols,
            batch_size: parse_or(&get, "BATCH_SIZE", constants::DEFAULT_BATCH_SIZE)?.max(1),
            max_workers: parse_or(&get, "MAX_WORKERS", constants::DEFAULT_MAX_WORKERS)?.max(1),
            batch_pause: Duration::from_secs(parse_or(&get, "BATCH_PAUSE", constants::DEFAULT_BATCH_PAUSE_SECS)?),
            intraday_symbols: parse_or(&get, "INTRADAY_SYMBOLS", constants::DEFAULT_INTRADAY_SYMBOLS)?,
            intraday_interval: parse_or(
                &get,
                "INTRADAY_INTERVAL",
                Interval::from_str(constants::DEFAULT_INTRADAY_INTERVAL).unwrap_or(Interval::SixtyMin),
            )?,
            retention_days: parse_or(&get, "RETENTION_DAYS", constants::DEFAULT_RETENTION_DAYS)?,
            max_staleness_days: parse_or(
                &get,
                "QUALITY_MAX_STALENESS_DAYS",
                constants::DEFAULT_MAX_STALENESS_DAYS,
            )?,
            run_deadline: get("PIPELINE_DEADLINE_SECS")
                .map(|v| {
                    v.trim().parse::<u64>().map(Duration::from_secs).map_err(|_| ConfigError::Invalid {
                        name: "PIPELINE_DEADLINE_SECS",
                        value: v.clone(),
                    })
                })
                .transpose()?,
        };

        Ok(Config { api, store, pipeline })
    }
}

fn parse_or<T, G>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

/// Splits a comma separated list, upper-casing and dropping blanks.
pub fn split_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}
