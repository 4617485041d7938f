use std::{collections::BTreeMap, fmt::Display, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{
    config::Config,
    constants,
    marketdata::api_caller::QuoteProvider,
    model::{ErrorKind, FetchMode, FetchOutcome, OutcomeTag},
    quotes::{self, FetchOptions},
    store::{quote, sqlite::Pool},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    CheckConnectivity,
    FetchDaily,
    FetchIntraday,
    ValidateQuality,
    CleanupRetention,
    Summarize,
}

/// How a step's dependencies must have finished for it to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyPolicy {
    None,
    AllSucceeded,
    AnySucceeded,
    AllDone,
}

impl Step {
    pub const ALL: [Step; 6] = [
        Step::CheckConnectivity,
        Step::FetchDaily,
        Step::FetchIntraday,
        Step::ValidateQuality,
        Step::CleanupRetention,
        Step::Summarize,
    ];

    pub fn depends_on(&self) -> &'static [Step] {
        match self {
            Step::CheckConnectivity => &[],
            Step::FetchDaily | Step::FetchIntraday => &[Step::CheckConnectivity],
            Step::ValidateQuality => &[Step::FetchDaily, Step::FetchIntraday],
            Step::CleanupRetention => &[Step::ValidateQuality],
            Step::Summarize => &[
                Step::CheckConnectivity,
                Step::FetchDaily,
                Step::FetchIntraday,
                Step::ValidateQuality,
                Step::CleanupRetention,
            ],
        }
    }

    pub fn policy(&self) -> DependencyPolicy {
        match self {
            Step::CheckConnectivity => DependencyPolicy::None,
            Step::FetchDaily | Step::FetchIntraday => DependencyPolicy::AllSucceeded,
            Step::ValidateQuality => DependencyPolicy::AnySucceeded,
            Step::CleanupRetention | Step::Summarize => DependencyPolicy::AllDone,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Step::CheckConnectivity => "check_connectivity",
            Step::FetchDaily => "fetch_daily",
            Step::FetchIntraday => "fetch_intraday",
            Step::ValidateQuality => "validate_quality",
            Step::CleanupRetention => "cleanup_retention",
            Step::Summarize => "summarize",
        }
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed { kind: ErrorKind, message: String },
    Skipped { reason: String },
}

/// Per-mode result of [`Pipeline::fetch_and_store`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSummary {
    pub mode: FetchMode,
    pub outcomes: BTreeMap<String, OutcomeTag>,
    pub records_written: usize,
    pub records_rejected: usize,
    pub success_rate: f64,
    pub error_count: usize,
    pub errors: Vec<String>, // First few only.
    pub duration_ms: u64,
}

impl FetchSummary {
    /// Symbols whose records reached the store.
    pub fn persisted(&self) -> usize {
        self.outcomes
            .values()
            .filter(|tag| matches!(tag, OutcomeTag::Success { .. }))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub total_records: u64,
    pub checks_passed: usize,
    pub checks_total: usize,
    pub score: f64,
    pub missing_symbols: Vec<String>,
    pub extra_symbols: Vec<String>,
    pub stale_symbols: Vec<String>,
    pub missing_close_symbols: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepMetadata {
    None,
    Connectivity {
        provider_ok: bool,
        store_ok: bool,
        warning: Option<String>,
    },
    Fetch(FetchSummary),
    Quality(QualityReport),
    Cleanup { deleted: usize, horizon_days: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: Step,
    pub status: StepStatus,
    pub metadata: StepMetadata,
}

impl StepResult {
    fn skipped(step: Step, reason: impl Into<String>) -> Self {
        StepResult {
            step,
            status: StepStatus::Skipped { reason: reason.into() },
            metadata: StepMetadata::None,
        }
    }

    fn failed(step: Step, kind: ErrorKind, message: impl Into<String>, metadata: StepMetadata) -> Self {
        StepResult {
            step,
            status: StepStatus::Failed {
                kind,
                message: message.into(),
            },
            metadata,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Succeeded
    }
}

/// State handed from step to step: the run id and every result so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub results: Vec<StepResult>,
}

impl StepContext {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        StepContext {
            run_id: started_at.format("run-%Y%m%dT%H%M%SZ").to_string(),
            started_at,
            results: Vec::new(),
        }
    }

    pub fn result(&self, step: Step) -> Option<&StepResult> {
        self.results.iter().rev().find(|r| r.step == step)
    }

    fn step_succeeded(&self, step: Step) -> bool {
        self.result(step).is_some_and(StepResult::succeeded)
    }

    /// True once connectivity has failed outright.
    pub fn aborted(&self) -> bool {
        matches!(
            self.result(Step::CheckConnectivity).map(|r| &r.status),
            Some(StepStatus::Failed { .. })
        )
    }

    /// Why `step` may not run yet, if anything.
    pub fn unmet(&self, step: Step) -> Option<String> {
        if self.aborted() && !matches!(step, Step::CheckConnectivity | Step::Summarize) {
            return Some("run aborted".into());
        }
        let deps = step.depends_on();
        match step.policy() {
            DependencyPolicy::None => None,
            DependencyPolicy::AllSucceeded => deps
                .iter()
                .find(|dep| !self.step_succeeded(**dep))
                .map(|dep| format!("{dep} did not succeed")),
            DependencyPolicy::AnySucceeded => {
                if deps.iter().any(|dep| self.step_succeeded(*dep)) {
                    None
                } else {
                    let names: Vec<&str> = deps.iter().map(Step::name).collect();
                    Some(format!("none of {} succeeded", names.join(", ")))
                }
            }
            DependencyPolicy::AllDone => deps
                .iter()
                .find(|dep| self.result(**dep).is_none())
                .map(|dep| format!("{dep} has not run")),
        }
    }
}

/// End-of-run report. Logged line by line and printed as JSON by the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub aborted: bool,
    pub steps: Vec<StepResult>,
    pub outcomes: BTreeMap<String, BTreeMap<String, OutcomeTag>>,
    pub records_written: usize,
    pub records_rejected: usize,
    pub errors_by_kind: BTreeMap<ErrorKind, usize>,
    pub stored_records: Option<u64>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        let fetched = self
            .steps
            .iter()
            .any(|r| matches!(r.step, Step::FetchDaily | Step::FetchIntraday) && r.succeeded());
        !self.aborted && fetched
    }

    pub fn log(&self) {
        log::info!("Pipeline run {} finished", self.run_id);
        log::info!(
            "Duration: {}s",
            (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
        );
        for result in &self.steps {
            match &result.status {
                StepStatus::Succeeded => log::info!("  {}: succeeded", result.step),
                StepStatus::Failed { kind, message } => {
                    log::error!("  {}: failed ({kind:?}) {message}", result.step)
                }
                StepStatus::Skipped { reason } => log::warn!("  {}: skipped ({reason})", result.step),
            }
        }
        for (mode, outcomes) in &self.outcomes {
            let ok = outcomes
                .values()
                .filter(|t| matches!(t, OutcomeTag::Success { .. }))
                .count();
            log::info!("  {mode}: {ok}/{} symbols stored", outcomes.len());
        }
        log::info!("Records written: {}", self.records_written);
        if self.records_rejected > 0 {
            log::warn!("Entries rejected by validation: {}", self.records_rejected);
        }
        for (kind, n) in &self.errors_by_kind {
            log::warn!("  {kind:?} errors: {n}");
        }
        match self.stored_records {
            Some(n) => log::info!("Records in store: {n}"),
            None => log::warn!("Records in store: unavailable"),
        }
    }
}

/// Runs the six steps against one provider and one store.
pub struct Pipeline {
    config: Arc<Config>,
    provider: Arc<dyn QuoteProvider>,
    pool: Pool,
}

impl Pipeline {
    pub fn new(config: Arc<Config>, provider: Arc<dyn QuoteProvider>, pool: Pool) -> Self {
        Pipeline { config, provider, pool }
    }

    pub async fn run(&self) -> RunSummary {
        let mut ctx = StepContext::new(Utc::now());
        log::info!("Starting pipeline run {}", ctx.run_id);

        for step in Step::ALL {
            let result = match step {
                Step::CheckConnectivity => self.check_connectivity(&ctx).await,
                Step::FetchDaily => self.fetch_daily(&ctx).await,
                Step::FetchIntraday => self.fetch_intraday(&ctx).await,
                Step::ValidateQuality => self.validate_quality(&ctx).await,
                Step::CleanupRetention => self.cleanup_retention(&ctx).await,
                Step::Summarize => break,
            };
            ctx.results.push(result);
        }

        let summary = self.summarize(&ctx).await;
        summary.log();
        summary
    }

    pub async fn check_connectivity(&self, ctx: &StepContext) -> StepResult {
        let step = Step::CheckConnectivity;
        let provider = self.provider.probe().await;
        if let Err(e) = &provider {
            log::error!("Provider probe failed: {e}");
        }
        let store = quote::ping(&self.pool).and_then(|_| quote::ensure_schema(&self.pool));
        if let Err(e) = &store {
            log::error!("Store probe failed: {e}");
        }

        let metadata = |warning: Option<String>| StepMetadata::Connectivity {
            provider_ok: provider.is_ok(),
            store_ok: store.is_ok(),
            warning,
        };
        match (&provider, &store) {
            (Ok(_), Ok(_)) => {
                log::info!("[{}] provider and store reachable", ctx.run_id);
                StepResult {
                    step,
                    status: StepStatus::Succeeded,
                    metadata: metadata(None),
                }
            }
            (Err(p), Err(s)) => StepResult::failed(
                step,
                p.kind(),
                format!("provider unreachable ({p}); store unreachable ({s})"),
                metadata(None),
            ),
            (Err(e), Ok(_)) => {
                let warning = format!("provider probe failed: {e}");
                log::warn!("[{}] {warning}", ctx.run_id);
                StepResult {
                    step,
                    status: StepStatus::Succeeded,
                    metadata: metadata(Some(warning)),
                }
            }
            (Ok(_), Err(e)) => {
                let warning = format!("store probe failed: {e}");
                log::warn!("[{}] {warning}", ctx.run_id);
                StepResult {
                    step,
                    status: StepStatus::Succeeded,
                    metadata: metadata(Some(warning)),
                }
            }
        }
    }

    pub async fn fetch_daily(&self, ctx: &StepContext) -> StepResult {
        let symbols = self.config.pipeline.symbols.clone();
        self.fetch_step(Step::FetchDaily, ctx, &symbols, FetchMode::Daily).await
    }

    pub async fn fetch_intraday(&self, ctx: &StepContext) -> StepResult {
        let pipeline = &self.config.pipeline;
        let mode = FetchMode::Intraday(pipeline.intraday_interval);
        self.fetch_step(Step::FetchIntraday, ctx, pipeline.priority_symbols(), mode)
            .await
    }

    async fn fetch_step(&self, step: Step, ctx: &StepContext, symbols: &[String], mode: FetchMode) -> StepResult {
        if let Some(reason) = ctx.unmet(step) {
            log::warn!("[{}] skipping {step}: {reason}", ctx.run_id);
            return StepResult::skipped(step, reason);
        }
        if symbols.is_empty() {
            return StepResult::skipped(step, "no symbols configured");
        }

        let summary = self.fetch_and_store(symbols, mode, self.deadline(ctx)).await;
        if summary.persisted() > 0 {
            StepResult {
                step,
                status: StepStatus::Succeeded,
                metadata: StepMetadata::Fetch(summary),
            }
        } else {
            let kind = summary
                .outcomes
                .values()
                .find_map(OutcomeTag::error_kind)
                .unwrap_or(ErrorKind::Provider);
            StepResult::failed(
                step,
                kind,
                "no symbols were successfully processed",
                StepMetadata::Fetch(summary),
            )
        }
    }

    /// Fetches `symbols` and upserts each successful symbol's records.
    pub async fn fetch_and_store(&self, symbols: &[String], mode: FetchMode, deadline: Option<Instant>) -> FetchSummary {
        let started = Instant::now();
        let outcomes = quotes::fetch_many(self.provider.clone(), symbols, mode, &self.fetch_options(), deadline).await;

        let mut outcomes: Vec<(String, FetchOutcome)> = outcomes.into_iter().collect();
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut tags = BTreeMap::new();
        let mut errors = Vec::new();
        let mut records_written = 0;
        let mut records_rejected = 0;
        for (symbol, outcome) in outcomes {
            let tag = match outcome {
                FetchOutcome::Success { records, rejected } => {
                    records_rejected += rejected;
                    match quote::upsert_many(&self.pool, &records, Utc::now()) {
                        Ok(count) => {
                            log::info!(
                                "Stored {symbol} {mode}: {} inserted, {} updated",
                                count.inserted,
                                count.updated
                            );
                            records_written += count.total();
                            OutcomeTag::Success {
                                count: count.total(),
                                rejected,
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to store {symbol}: {e}");
                            errors.push(format!("{symbol}: {e}"));
                            OutcomeTag::Failed { kind: e.kind() }
                        }
                    }
                }
                other => {
                    let reason = match &other {
                        FetchOutcome::Empty { reason } => {
                            log::warn!("No {mode} data for {symbol}: {reason}");
                            reason.clone()
                        }
                        FetchOutcome::Failed { message, .. } => message.clone(),
                        _ => "cancelled".to_string(),
                    };
                    errors.push(format!("{symbol}: {reason}"));
                    other.tag()
                }
            };
            tags.insert(symbol, tag);
        }

        let error_count = errors.len();
        errors.truncate(constants::MAX_REPORTED_ERRORS);
        let mut summary = FetchSummary {
            mode,
            outcomes: tags,
            records_written,
            records_rejected,
            success_rate: 0.0,
            error_count,
            errors,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if !summary.outcomes.is_empty() {
            summary.success_rate = summary.persisted() as f64 / summary.outcomes.len() as f64 * 100.0;
        }
        log::info!(
            "{mode}: {}/{} symbols stored, {} records in {}ms",
            summary.persisted(),
            summary.outcomes.len(),
            summary.records_written,
            summary.duration_ms
        );
        summary
    }

    pub async fn validate_quality(&self, ctx: &StepContext) -> StepResult {
        let step = Step::ValidateQuality;
        if let Some(reason) = ctx.unmet(step) {
            log::warn!("[{}] skipping {step}: {reason}", ctx.run_id);
            return StepResult::skipped(step, reason);
        }

        let stats = match quote::query_stats(&self.pool, None, None) {
            Ok(stats) => stats,
            Err(e) => return StepResult::failed(step, e.kind(), e.to_string(), StepMetadata::None),
        };

        let configured = &self.config.pipeline.symbols;
        let staleness_cutoff = Utc::now() - Duration::days(i64::from(self.config.pipeline.max_staleness_days));
        let total_records: u64 = stats.values().map(|s| s.count).sum();

        let missing_symbols: Vec<String> = configured.iter().filter(|s| !stats.contains_key(*s)).cloned().collect();
        let mut extra_symbols: Vec<String> = stats.keys().filter(|s| !configured.contains(*s)).cloned().collect();
        extra_symbols.sort();
        let mut stale_symbols: Vec<String> = configured
            .iter()
            .filter(|s| {
                stats
                    .get(*s)
                    .is_some_and(|st| st.latest.is_none_or(|latest| latest < staleness_cutoff))
            })
            .cloned()
            .collect();
        stale_symbols.sort();
        let mut missing_close_symbols: Vec<String> = stats
            .iter()
            .filter(|(_, st)| st.missing_close_count > 0)
            .map(|(s, _)| s.clone())
            .collect();
        missing_close_symbols.sort();

        let checks = [
            total_records > 0,
            missing_symbols.len() < configured.len(),
            stale_symbols.is_empty(),
        ];
        let checks_passed = checks.iter().filter(|c| **c).count();
        let score = checks_passed as f64 / checks.len() as f64 * 100.0;

        if score < constants::QUALITY_WARN_SCORE {
            log::warn!("[{}] data quality score {score:.1}% is below threshold", ctx.run_id);
        } else {
            log::info!("[{}] data quality score {score:.1}%", ctx.run_id);
        }
        if !missing_symbols.is_empty() {
            log::warn!("No stored data for {missing_symbols:?}");
        }

        StepResult {
            step,
            status: StepStatus::Succeeded,
            metadata: StepMetadata::Quality(QualityReport {
                total_records,
                checks_passed,
                checks_total: checks.len(),
                score,
                missing_symbols,
                extra_symbols,
                stale_symbols,
                missing_close_symbols,
            }),
        }
    }

    pub async fn cleanup_retention(&self, ctx: &StepContext) -> StepResult {
        let step = Step::CleanupRetention;
        if let Some(reason) = ctx.unmet(step) {
            log::warn!("[{}] skipping {step}: {reason}", ctx.run_id);
            return StepResult::skipped(step, reason);
        }

        let horizon_days = self.config.pipeline.retention_days;
        match quote::delete_older_than(&self.pool, horizon_days, Utc::now()) {
            Ok(deleted) => StepResult {
                step,
                status: StepStatus::Succeeded,
                metadata: StepMetadata::Cleanup { deleted, horizon_days },
            },
            Err(e) => StepResult::failed(step, e.kind(), e.to_string(), StepMetadata::None),
        }
    }

    /// Always runs. Builds the summary from whatever the earlier steps left.
    pub async fn summarize(&self, ctx: &StepContext) -> RunSummary {
        let mut outcomes = BTreeMap::new();
        let mut records_written = 0;
        let mut records_rejected = 0;
        let mut errors_by_kind: BTreeMap<ErrorKind, usize> = BTreeMap::new();

        for result in &ctx.results {
            match &result.metadata {
                StepMetadata::Fetch(fetch) => {
                    records_written += fetch.records_written;
                    records_rejected += fetch.records_rejected;
                    // every rejected entry is a validation error
                    if fetch.records_rejected > 0 {
                        *errors_by_kind.entry(ErrorKind::Validation).or_default() += fetch.records_rejected;
                    }
                    for kind in fetch.outcomes.values().filter_map(OutcomeTag::error_kind) {
                        *errors_by_kind.entry(kind).or_default() += 1;
                    }
                    outcomes.insert(fetch.mode.to_string(), fetch.outcomes.clone());
                }
                // fetch failures are already counted per symbol
                _ => {
                    if let StepStatus::Failed { kind, .. } = &result.status {
                        *errors_by_kind.entry(*kind).or_default() += 1;
                    }
                }
            }
        }

        let stored_records = match quote::total_count(&self.pool) {
            Ok(n) => Some(n),
            Err(e) => {
                log::warn!("Could not count stored records: {e}");
                None
            }
        };

        let mut steps = ctx.results.clone();
        steps.push(StepResult {
            step: Step::Summarize,
            status: StepStatus::Succeeded,
            metadata: StepMetadata::None,
        });

        RunSummary {
            run_id: ctx.run_id.clone(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            aborted: ctx.aborted(),
            steps,
            outcomes,
            records_written,
            records_rejected,
            errors_by_kind,
            stored_records,
        }
    }

    fn fetch_options(&self) -> FetchOptions {
        let pipeline = &self.config.pipeline;
        FetchOptions {
            max_workers: pipeline.max_workers,
            batch_size: pipeline.batch_size,
            batch_pause: pipeline.batch_pause,
        }
    }

    // The run deadline is measured from the context start so every step shares it.
    fn deadline(&self, ctx: &StepContext) -> Option<Instant> {
        let budget = self.config.pipeline.run_deadline?;
        let elapsed = (Utc::now() - ctx.started_at).to_std().unwrap_or_default();
        Some(Instant::now() + budget.saturating_sub(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        time::Duration as StdDuration,
    };

    use super::*;
    use crate::{
        config::StoreConfig,
        http::client::RequestError,
        quotes::tests::FakeProvider,
        store::sqlite::{init_pool, tests::temp_pool},
    };

    fn config(symbols: &str, intraday_symbols: &str) -> Arc<Config> {
        let vars = HashMap::from([
            ("ALPHA_VANTAGE_API_KEY", "test-key"),
            ("STOCK_SYMBOLS", symbols),
            ("INTRADAY_SYMBOLS", intraday_symbols),
            ("BATCH_PAUSE", "0"),
            // fake bars are dated 2024
            ("RETENTION_DAYS", "36500"),
        ]);
        let config = Config::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        Arc::new(config)
    }

    fn failing(symbols: &[&str]) -> FakeProvider {
        FakeProvider {
            errors: symbols
                .iter()
                .map(|s| (s.to_string(), RequestError::Provider("Invalid API call".into())))
                .collect(),
            ..Default::default()
        }
    }

    fn unreachable_pool() -> Pool {
        init_pool(&StoreConfig {
            sqlite_file: "/nonexistent-dir/quotes.db".into(),
            pool_size: 1,
            pool_timeout: StdDuration::from_millis(100),
        })
    }

    fn status(summary: &RunSummary, step: Step) -> &StepStatus {
        &summary.steps.iter().find(|r| r.step == step).unwrap().status
    }

    #[tokio::test]
    async fn bad_symbol_does_not_stop_the_others() {
        let (_dir, pool) = temp_pool(4);
        let pipeline = Pipeline::new(config("AAPL,BADSYM", "1"), Arc::new(failing(&["BADSYM"])), pool.clone());

        let summary = pipeline.run().await;

        assert!(summary.is_success());
        assert!(!summary.aborted);
        let daily = &summary.outcomes["daily"];
        assert_eq!(daily["AAPL"], OutcomeTag::Success { count: 1, rejected: 0 });
        assert_eq!(daily["BADSYM"], OutcomeTag::Failed { kind: ErrorKind::Provider });
        assert_eq!(summary.outcomes["intraday/60min"].len(), 1);
        assert_eq!(summary.records_written, 2);
        assert_eq!(summary.stored_records, Some(2));
        assert_eq!(summary.errors_by_kind.get(&ErrorKind::Provider), Some(&1));
        assert_eq!(summary.steps.len(), Step::ALL.len());
        assert!(summary.steps.iter().all(StepResult::succeeded));
        assert_eq!(quote::total_count(&pool).unwrap(), 2);
    }

    #[tokio::test]
    async fn rerun_updates_instead_of_duplicating() {
        let (_dir, pool) = temp_pool(4);
        let pipeline = Pipeline::new(config("AAPL", "0"), Arc::new(FakeProvider::default()), pool.clone());

        pipeline.run().await;
        let second = pipeline.run().await;

        assert_eq!(second.records_written, 1);
        assert_eq!(second.stored_records, Some(1));
        assert!(matches!(
            status(&second, Step::FetchIntraday),
            StepStatus::Skipped { reason } if reason == "no symbols configured"
        ));
    }

    #[tokio::test]
    async fn connectivity_failure_aborts_but_still_summarizes() {
        let provider = FakeProvider {
            probe_fails: true,
            ..Default::default()
        };
        let pipeline = Pipeline::new(config("AAPL", "1"), Arc::new(provider), unreachable_pool());

        let summary = pipeline.run().await;

        assert!(summary.aborted);
        assert!(!summary.is_success());
        assert!(matches!(
            status(&summary, Step::CheckConnectivity),
            StepStatus::Failed {
                kind: ErrorKind::Transient,
                ..
            }
        ));
        for step in [
            Step::FetchDaily,
            Step::FetchIntraday,
            Step::ValidateQuality,
            Step::CleanupRetention,
        ] {
            assert_eq!(
                status(&summary, step),
                &StepStatus::Skipped {
                    reason: "run aborted".into()
                }
            );
        }
        assert_eq!(status(&summary, Step::Summarize), &StepStatus::Succeeded);
        assert_eq!(summary.stored_records, None);
        assert!(summary.outcomes.is_empty());
    }

    #[tokio::test]
    async fn one_failed_probe_only_warns() {
        let (_dir, pool) = temp_pool(2);
        let provider = FakeProvider {
            probe_fails: true,
            ..Default::default()
        };
        let pipeline = Pipeline::new(config("AAPL", "0"), Arc::new(provider), pool);

        let ctx = StepContext::new(Utc::now());
        let result = pipeline.check_connectivity(&ctx).await;

        assert!(result.succeeded());
        match result.metadata {
            StepMetadata::Connectivity {
                provider_ok,
                store_ok,
                warning,
            } => {
                assert!(!provider_ok);
                assert!(store_ok);
                assert!(warning.is_some());
            }
            other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[tokio::test]
    async fn both_fetches_failing_skips_validation_only() {
        let (_dir, pool) = temp_pool(2);
        let pipeline = Pipeline::new(config("AAPL,MSFT", "1"), Arc::new(failing(&["AAPL", "MSFT"])), pool);

        let summary = pipeline.run().await;

        assert!(!summary.is_success());
        assert!(!summary.aborted);
        for step in [Step::FetchDaily, Step::FetchIntraday] {
            assert!(matches!(
                status(&summary, step),
                StepStatus::Failed { message, .. } if message == "no symbols were successfully processed"
            ));
        }
        assert!(matches!(status(&summary, Step::ValidateQuality), StepStatus::Skipped { .. }));
        assert_eq!(status(&summary, Step::CleanupRetention), &StepStatus::Succeeded);
        assert_eq!(summary.errors_by_kind.get(&ErrorKind::Provider), Some(&3));
        assert_eq!(summary.stored_records, Some(0));
    }

    #[tokio::test]
    async fn steps_check_their_own_dependencies() {
        let (_dir, pool) = temp_pool(2);
        let pipeline = Pipeline::new(config("AAPL", "1"), Arc::new(FakeProvider::default()), pool);
        let ctx = StepContext::new(Utc::now());

        let result = pipeline.fetch_daily(&ctx).await;
        assert_eq!(
            result.status,
            StepStatus::Skipped {
                reason: "check_connectivity did not succeed".into()
            }
        );
        let result = pipeline.cleanup_retention(&ctx).await;
        assert!(matches!(result.status, StepStatus::Skipped { .. }));
    }

    #[tokio::test]
    async fn quality_report_flags_missing_and_stale_symbols() {
        let (_dir, pool) = temp_pool(2);
        let pipeline = Pipeline::new(config("AAPL,MSFT", "0"), Arc::new(failing(&["MSFT"])), pool);

        let mut ctx = StepContext::new(Utc::now());
        let result = pipeline.check_connectivity(&ctx).await;
        ctx.results.push(result);
        let result = pipeline.fetch_daily(&ctx).await;
        ctx.results.push(result);
        let result = pipeline.fetch_intraday(&ctx).await;
        ctx.results.push(result);
        let result = pipeline.validate_quality(&ctx).await;

        assert!(result.succeeded());
        match result.metadata {
            StepMetadata::Quality(report) => {
                assert_eq!(report.total_records, 1);
                assert_eq!(report.missing_symbols, vec!["MSFT"]);
                // the fake bar is from 2024
                assert_eq!(report.stale_symbols, vec!["AAPL"]);
                assert_eq!(report.checks_passed, 2);
                assert!(report.score < constants::QUALITY_WARN_SCORE);
            }
            other => panic!("unexpected metadata {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_cancels_slow_symbols() {
        let (_dir, pool) = temp_pool(2);
        let provider = FakeProvider {
            slow: HashSet::from(["SLOW".to_string()]),
            ..Default::default()
        };
        quote::ensure_schema(&pool).unwrap();
        let pipeline = Pipeline::new(config("AAPL,SLOW", "0"), Arc::new(provider), pool);

        let summary = pipeline
            .fetch_and_store(
                &["AAPL".to_string(), "SLOW".to_string()],
                FetchMode::Daily,
                Some(Instant::now() + StdDuration::from_millis(300)),
            )
            .await;

        assert_eq!(summary.outcomes["SLOW"], OutcomeTag::Cancelled);
        assert_eq!(summary.persisted(), 1);
        assert_eq!(summary.success_rate, 50.0);
        assert_eq!(summary.errors, vec!["SLOW: cancelled"]);
    }

    #[tokio::test]
    async fn rejected_entries_count_as_validation_errors() {
        let (_dir, pool) = temp_pool(2);
        let provider = FakeProvider {
            inverted_range: HashSet::from(["AAPL".to_string()]),
            ..Default::default()
        };
        let pipeline = Pipeline::new(config("AAPL", "0"), Arc::new(provider), pool);

        let summary = pipeline.run().await;

        assert!(summary.is_success());
        assert_eq!(summary.outcomes["daily"]["AAPL"], OutcomeTag::Success { count: 1, rejected: 1 });
        assert_eq!(summary.records_rejected, 1);
        assert_eq!(summary.errors_by_kind.get(&ErrorKind::Validation), Some(&1));
        assert_eq!(summary.stored_records, Some(1));
    }

    #[tokio::test]
    async fn summary_serializes_to_json() {
        let (_dir, pool) = temp_pool(2);
        let pipeline = Pipeline::new(config("AAPL", "0"), Arc::new(FakeProvider::default()), pool);

        let summary = pipeline.run().await;
        let json = serde_json::to_value(&summary).unwrap();

        assert_eq!(json["steps"][0]["step"], "check_connectivity");
        assert_eq!(json["steps"][0]["status"]["status"], "succeeded");
        assert_eq!(json["outcomes"]["daily"]["AAPL"]["status"], "success");
        assert!(json["run_id"].as_str().unwrap().starts_with("run-"));
    }

    #[test]
    fn dependency_table() {
        assert_eq!(Step::ALL.first(), Some(&Step::CheckConnectivity));
        assert_eq!(Step::ALL.last(), Some(&Step::Summarize));
        for step in Step::ALL {
            // every dependency comes earlier in the run order
            let pos = Step::ALL.iter().position(|s| *s == step).unwrap();
            assert!(step.depends_on().iter().all(|d| Step::ALL[..pos].contains(d)));
        }
        assert_eq!(Step::ValidateQuality.policy(), DependencyPolicy::AnySucceeded);
        assert_eq!(Step::CleanupRetention.policy(), DependencyPolicy::AllDone);
    }
}
