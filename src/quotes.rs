use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::Utc;
use tokio::{sync::Semaphore, task::JoinSet, time::Instant};

use crate::{
    marketdata::api_caller::QuoteProvider,
    model::{ErrorKind, FetchMode, FetchOutcome, QuotesError},
    validate,
};

/// Pacing and concurrency limits for [`fetch_many`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_workers: usize,
    pub batch_size: usize,
    pub batch_pause: Duration, // Pause between batches.
}

/// Fetches and validates every symbol, one outcome per distinct symbol.
///
/// Symbols are processed in batches of `batch_size`; inside a batch at most
/// `max_workers` fetches run at once. A failure is recorded against its own
/// symbol only. Once `deadline` passes, unfinished and unstarted symbols are
/// reported as [`FetchOutcome::Cancelled`].
pub async fn fetch_many(
    provider: Arc<dyn QuoteProvider>,
    symbols: &[String],
    mode: FetchMode,
    options: &FetchOptions,
    deadline: Option<Instant>,
) -> HashMap<String, FetchOutcome> {
    let mut outcomes = HashMap::with_capacity(symbols.len());
    let mut seen = HashSet::new();
    let mut queue = Vec::with_capacity(symbols.len());
    for raw in symbols {
        match validate::normalize_symbol(raw) {
            Ok(symbol) if seen.insert(symbol.clone()) => queue.push(symbol),
            Ok(_) => log::warn!("duplicate symbol {raw} ignored"),
            Err(e) => {
                log::warn!("skipping {raw}: {e}");
                outcomes.insert(raw.clone(), FetchOutcome::failed(&QuotesError::Validation(e)));
            }
        }
    }

    let semaphore = Arc::new(Semaphore::new(options.max_workers.max(1)));
    let batches: Vec<&[String]> = queue.chunks(options.batch_size.max(1)).collect();
    let mut timed_out = false;

    for (i, batch) in batches.iter().enumerate() {
        if timed_out || deadline.is_some_and(|d| Instant::now() >= d) {
            timed_out = true;
            for symbol in batch.iter() {
                outcomes.insert(symbol.clone(), FetchOutcome::Cancelled);
            }
            continue;
        }

        log::info!("Processing {mode} batch {}: {:?}", i + 1, batch);
        timed_out = run_batch(&provider, batch, mode, &semaphore, deadline, &mut outcomes).await;

        // stay friendly with the provider between batches
        if !timed_out && i + 1 < batches.len() && !options.batch_pause.is_zero() {
            tokio::time::sleep(options.batch_pause).await;
        }
    }

    outcomes
}

// Returns true when the deadline cut the batch short.
async fn run_batch(
    provider: &Arc<dyn QuoteProvider>,
    batch: &[String],
    mode: FetchMode,
    semaphore: &Arc<Semaphore>,
    deadline: Option<Instant>,
    outcomes: &mut HashMap<String, FetchOutcome>,
) -> bool {
    let mut tasks = JoinSet::new();
    let mut pending: HashSet<String> = batch.iter().cloned().collect();

    for symbol in batch {
        let provider = provider.clone();
        let semaphore = semaphore.clone();
        let symbol = symbol.clone();
        tasks.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let outcome = fetch_one(provider.as_ref(), &symbol, mode).await;
            (symbol, outcome)
        });
    }

    let mut timed_out = false;
    loop {
        let next = match deadline {
            Some(d) => match tokio::time::timeout_at(d, tasks.join_next()).await {
                Ok(next) => next,
                Err(_) => {
                    timed_out = true;
                    break;
                }
            },
            None => tasks.join_next().await,
        };
        match next {
            Some(Ok((symbol, outcome))) => {
                log::debug!("{symbol} done with {} records", outcome.count());
                pending.remove(&symbol);
                outcomes.insert(symbol, outcome);
            }
            Some(Err(e)) => log::error!("fetch task failed: {e}"),
            None => break,
        }
    }

    if timed_out {
        log::warn!("deadline reached, abandoning {} in-flight fetches", pending.len());
        tasks.abort_all();
    }
    // anything still pending either panicked or was abandoned
    for symbol in pending {
        let outcome = if timed_out {
            FetchOutcome::Cancelled
        } else {
            FetchOutcome::Failed {
                kind: ErrorKind::Internal,
                message: "fetch task panicked".into(),
            }
        };
        outcomes.insert(symbol, outcome);
    }
    timed_out
}

async fn fetch_one(provider: &dyn QuoteProvider, symbol: &str, mode: FetchMode) -> FetchOutcome {
    let series = match provider.fetch(symbol, mode).await {
        Ok(series) => series,
        Err(e) => {
            log::error!("Failed to fetch {mode} data for {symbol}: {e}");
            return FetchOutcome::failed(&QuotesError::Http(e));
        }
    };
    if series.entries.is_empty() {
        return FetchOutcome::Empty {
            reason: "provider returned no entries".into(),
        };
    }

    let now = Utc::now();
    let total = series.entries.len();
    let mut records = Vec::with_capacity(total);
    for entry in &series.entries {
        match validate::validate_entry(symbol, mode, series.time_zone.as_deref(), entry, now) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!("Discarding {symbol} entry {}: {e}", entry.timestamp),
        }
    }
    let rejected = total - records.len();
    log::info!("Filtered {symbol}: {}/{total} valid entries", records.len());

    if records.is_empty() {
        FetchOutcome::Empty {
            reason: format!("all {total} entries rejected"),
        }
    } else {
        FetchOutcome::Success { records, rejected }
    }
}
