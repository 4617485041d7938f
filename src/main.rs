// Quote ingestion: fetch, validate and upsert market quotes.
mod marketdata {
    // Alpha Vantage client behind the provider trait.
    pub mod api_caller;
    // Payload shapes for the time-series endpoints.
    pub mod response;
    pub mod retry;
}
// HTTP client module.
mod http {
    pub mod client;
}
mod config;
// module storing defaults
mod constants;
// Data models.
mod model;
mod pipeline;
// Concurrent fetch of many symbols.
mod quotes;
// Data storage module.
mod store {
    /// Quote table: upsert, stats and retention.
    pub mod quote;
    /// SQLite connection pool.
    pub mod sqlite;
}
mod symbols;
mod validate;

use std::{process::ExitCode, sync::Arc};

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use marketdata::api_caller::{AlphaVantageClient, QuoteProvider};
use model::{FetchMode, Interval};
use pipeline::{Pipeline, StepContext, StepMetadata};
use tokio::time::Instant;

// Command-line argument parser.
#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    Daily,
    Intraday,
}

// Subcommands for the application.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Check that the provider and the database are reachable.
    Test,
    /// Fetch and store quotes for the given or configured symbols.
    Run {
        #[arg(long, value_enum, default_value_t = Mode::Daily)]
        mode: Mode,
        /// Intraday bar width, e.g. 60min.
        #[arg(long, value_parser = parse_interval)]
        interval: Option<Interval>,
        #[arg(long, num_args = 1.., conflicts_with = "symbols_file")]
        symbols: Vec<String>,
        #[arg(long)]
        symbols_file: Option<String>,
    },
    /// Print per-symbol statistics for stored quotes.
    Stats {
        #[arg(long, num_args = 1..)]
        symbols: Vec<String>,
        #[arg(long)]
        since_days: Option<u32>,
    },
    /// Delete quotes older than the given number of days.
    Cleanup {
        #[arg(long)]
        days: u32,
    },
    /// Run every pipeline step and print the summary as JSON.
    Pipeline,
}

fn parse_interval(s: &str) -> Result<Interval, String> {
    s.parse()
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let config = match config::Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(err) => {
            log::error!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    let pool = store::sqlite::init_pool(&config.store);

    let provider: Arc<dyn QuoteProvider> = match AlphaVantageClient::new(&config.api) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            log::error!("Error building provider client: {err}");
            return ExitCode::FAILURE;
        }
    };

    let pipeline = Pipeline::new(config.clone(), provider, pool.clone());

    match args.command {
        Commands::Test => {
            let result = pipeline.check_connectivity(&StepContext::new(Utc::now())).await;
            match result.metadata {
                StepMetadata::Connectivity {
                    provider_ok: true,
                    store_ok: true,
                    ..
                } => {
                    log::info!("Provider and database are reachable");
                    ExitCode::SUCCESS
                }
                StepMetadata::Connectivity {
                    provider_ok, store_ok, ..
                } => {
                    log::error!("Connectivity check failed: provider ok={provider_ok}, database ok={store_ok}");
                    ExitCode::FAILURE
                }
                _ => ExitCode::FAILURE,
            }
        }

        Commands::Run {
            mode,
            interval,
            symbols,
            symbols_file,
        } => {
            let symbols = match symbols_file {
                Some(path) => match symbols::read_symbols_from_file(&path) {
                    Ok(symbols) => symbols,
                    Err(err) => {
                        log::error!("Error reading symbols: {err}");
                        return ExitCode::FAILURE;
                    }
                },
                None if !symbols.is_empty() => symbols,
                None => config.pipeline.symbols.clone(),
            };
            let mode = match mode {
                Mode::Daily => FetchMode::Daily,
                Mode::Intraday => FetchMode::Intraday(interval.unwrap_or(config.pipeline.intraday_interval)),
            };

            if let Err(err) = store::quote::ensure_schema(&pool) {
                log::error!("Error preparing database: {err}");
                return ExitCode::FAILURE;
            }
            let deadline = config.pipeline.run_deadline.map(|d| Instant::now() + d);
            let summary = pipeline.fetch_and_store(&symbols, mode, deadline).await;
            for err in &summary.errors {
                log::warn!("{err}");
            }
            if summary.persisted() > 0 {
                ExitCode::SUCCESS
            } else {
                log::error!("No symbols were successfully processed");
                ExitCode::FAILURE
            }
        }

        Commands::Stats { symbols, since_days } => {
            let symbols = config::split_symbols(&symbols.join(","));
            let filter = (!symbols.is_empty()).then_some(symbols.as_slice());
            let since = since_days.map(|days| Utc::now() - Duration::days(i64::from(days)));
            match store::quote::query_stats(&pool, filter, since) {
                Ok(stats) => {
                    let mut rows: Vec<_> = stats.into_iter().collect();
                    rows.sort_by(|a, b| a.0.cmp(&b.0));
                    for (symbol, s) in rows {
                        println!(
                            "{symbol}: {} records, {} .. {}, avg volume {}, {} missing closes",
                            s.count,
                            s.earliest.map(|t| t.to_rfc3339()).unwrap_or_default(),
                            s.latest.map(|t| t.to_rfc3339()).unwrap_or_default(),
                            s.avg_volume.map(|v| format!("{v:.0}")).unwrap_or_else(|| "-".into()),
                            s.missing_close_count
                        );
                        match store::quote::latest_quote(&pool, &symbol) {
                            Ok(Some(q)) => println!(
                                "  last #{}: close {}, stored {}, updated {}",
                                q.id,
                                q.record.close_price.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                                q.created_at.to_rfc3339(),
                                q.updated_at.to_rfc3339()
                            ),
                            Ok(None) => {}
                            Err(err) => log::warn!("Could not read latest {symbol} quote: {err}"),
                        }
                    }
                    ExitCode::SUCCESS
                }
                Err(err) => {
                    log::error!("Error reading statistics: {err}");
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Cleanup { days } => match store::quote::delete_older_than(&pool, days, Utc::now()) {
            Ok(deleted) => {
                log::info!("Successfully deleted {deleted} quotes");
                ExitCode::SUCCESS
            }
            Err(err) => {
                log::error!("Error cleaning up quotes: {err}");
                ExitCode::FAILURE
            }
        },

        Commands::Pipeline => {
            let summary = pipeline.run().await;
            match serde_json::to_string_pretty(&summary) {
                Ok(json) => println!("{json}"),
                Err(err) => log::error!("Error serializing summary: {err}"),
            }
            if summary.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
