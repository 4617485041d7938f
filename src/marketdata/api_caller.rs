use std::sync::Arc;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use super::response::{RawSeries, TimeSeriesPayload};
use super::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::config::ApiConfig;
use crate::constants;
use crate::http::client::{self, RequestError};
use crate::model::FetchMode;

/// Source of raw time-series entries for one symbol.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Fetches the entries for `symbol`, retrying transient failures.
    async fn fetch(&self, symbol: &str, mode: FetchMode) -> Result<RawSeries, RequestError>;

    /// Single cheap request used to check the provider is reachable.
    async fn probe(&self) -> Result<(), RequestError>;
}

/// Client for the Alpha Vantage `query` endpoint.
pub struct AlphaVantageClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    probe_symbol: String,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    // shared by every worker so pacing holds across concurrent fetches
    pacer: Option<DefaultDirectRateLimiter>,
}

impl AlphaVantageClient {
    pub fn new(api: &ApiConfig) -> Result<Self, RequestError> {
        Ok(Self {
            client: client::build_client(api.timeout)?,
            base_url: api.base_url.clone(),
            api_key: api.api_key.clone(),
            probe_symbol: api.probe_symbol.clone(),
            retry: RetryPolicy::new(api.retry_attempts, api.backoff, constants::RATE_LIMIT_BACKOFF_FACTOR),
            sleeper: Arc::new(TokioSleeper),
            pacer: Quota::with_period(api.call_interval).map(RateLimiter::direct),
        })
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    async fn fetch_once(&self, symbol: &str, mode: FetchMode) -> Result<RawSeries, RequestError> {
        if let Some(pacer) = &self.pacer {
            pacer.until_ready().await;
        }

        let interval;
        let mut params = vec![("symbol", symbol), ("outputsize", "compact"), ("apikey", self.api_key.as_str())];
        match mode {
            FetchMode::Daily => params.push(("function", "TIME_SERIES_DAILY")),
            FetchMode::Intraday(i) => {
                interval = i.to_string();
                params.push(("function", "TIME_SERIES_INTRADAY"));
                params.push(("interval", interval.as_str()));
            }
        }

        log::debug!("Fetching {mode} data for {symbol}");
        let payload: TimeSeriesPayload = client::get(&self.client, &self.base_url, &params).await?;
        check_notice(&payload)?;

        let series = payload.into_series(mode).map_err(RequestError::Parse)?;
        log::info!("Fetched {} {mode} entries for {symbol}", series.entries.len());
        Ok(series)
    }
}

#[async_trait]
impl QuoteProvider for AlphaVantageClient {
    async fn fetch(&self, symbol: &str, mode: FetchMode) -> Result<RawSeries, RequestError> {
        self.retry
            .run(self.sleeper.as_ref(), symbol, |_| self.fetch_once(symbol, mode))
            .await
    }

    async fn probe(&self) -> Result<(), RequestError> {
        RetryPolicy::no_retry()
            .run(self.sleeper.as_ref(), "probe", |_| self.fetch_once(&self.probe_symbol, FetchMode::Daily))
            .await
            .map(|_| ())
    }
}

// Checks the notice fields the provider embeds in an otherwise successful response.
fn check_notice(payload: &TimeSeriesPayload) -> Result<(), RequestError> {
    if let Some(msg) = &payload.error_message {
        let lower = msg.to_lowercase();
        return Err(if lower.contains("apikey") || lower.contains("api key") {
            RequestError::Unauthorized(msg.clone())
        } else {
            RequestError::Provider(msg.clone())
        });
    }
    if let Some(note) = &payload.note {
        return Err(RequestError::RateLimited(note.clone()));
    }
    if let Some(info) = &payload.information {
        let lower = info.to_lowercase();
        return Err(
            if ["rate limit", "call frequency", "requests per"]
                .iter()
                .any(|needle| lower.contains(needle))
            {
                RequestError::RateLimited(info.clone())
            } else if lower.contains("apikey") || lower.contains("api key") {
                RequestError::Unauthorized(info.clone())
            } else {
                RequestError::Provider(info.clone())
            },
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use httpmock::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::marketdata::retry::{Backoff, tests::RecordingSleeper};
    use crate::model::Interval;

    fn client_for(server: &MockServer, sleeper: Arc<RecordingSleeper>) -> AlphaVantageClient {
        client_with_timeout(server, sleeper, Duration::from_secs(5))
    }

    fn client_with_timeout(
        server: &MockServer,
        sleeper: Arc<RecordingSleeper>,
        timeout: Duration,
    ) -> AlphaVantageClient {
        let api = ApiConfig {
            api_key: "test-key".into(),
            base_url: server.url("/query"),
            timeout,
            retry_attempts: 3,
            backoff: Backoff::Linear {
                step: Duration::from_secs(5),
            },
            call_interval: Duration::ZERO,
            probe_symbol: "AAPL".into(),
        };
        AlphaVantageClient::new(&api).unwrap().with_sleeper(sleeper)
    }

    #[tokio::test]
    async fn daily_success() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/query")
                    .query_param("function", "TIME_SERIES_DAILY")
                    .query_param("symbol", "AAPL")
                    .query_param("apikey", "test-key");
                then.status(200).json_body(json!({
                    "Meta Data": {"2. Symbol": "AAPL", "5. Time Zone": "US/Eastern"},
                    "Time Series (Daily)": {
                        "2024-01-02": {"1. open": "187.15", "2. high": "188.44", "3. low": "183.89", "4. close": "185.64", "5. volume": "82488674"}
                    }
                }));
            })
            .await;

        let client = client_for(&server, Arc::default());
        let series = client.fetch("AAPL", FetchMode::Daily).await.unwrap();

        mock.assert_async().await;
        assert_eq!(series.entries.len(), 1);
        assert_eq!(series.entries[0].fields.close.as_deref(), Some("185.64"));
    }

    #[tokio::test]
    async fn intraday_sends_interval() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/query")
                    .query_param("function", "TIME_SERIES_INTRADAY")
                    .query_param("interval", "60min");
                then.status(200).json_body(json!({
                    "Meta Data": {"6. Time Zone": "US/Eastern"},
                    "Time Series (60min)": {"2024-01-02 10:00:00": {"4. close": "1.5"}}
                }));
            })
            .await;

        let client = client_for(&server, Arc::default());
        let series = client
            .fetch("IBM", FetchMode::Intraday(Interval::SixtyMin))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(series.time_zone.as_deref(), Some("US/Eastern"));
    }

    #[tokio::test]
    async fn error_message_is_not_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/query");
                then.status(200)
                    .json_body(json!({"Error Message": "Invalid API call. Please retry or visit the documentation."}));
            })
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_for(&server, sleeper.clone());
        let err = client.fetch("BADSYM", FetchMode::Daily).await.unwrap_err();

        assert!(matches!(err, RequestError::Provider(_)));
        mock.assert_calls_async(1).await;
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_note_is_retried_with_longer_backoff() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/query");
                then.status(200).json_body(json!({
                    "Note": "Thank you for using Alpha Vantage! Our standard API call frequency is 5 calls per minute."
                }));
            })
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_for(&server, sleeper.clone());
        let err = client.fetch("AAPL", FetchMode::Daily).await.unwrap_err();

        assert!(matches!(err, RequestError::RateLimited(_)));
        mock.assert_calls_async(3).await;
        assert_eq!(
            *sleeper.delays.lock().unwrap(),
            vec![Duration::from_secs(20), Duration::from_secs(40)]
        );
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/query");
                then.status(503).body("unavailable");
            })
            .await;

        let client = client_for(&server, Arc::default());
        let err = client.fetch("AAPL", FetchMode::Daily).await.unwrap_err();

        assert!(matches!(err, RequestError::Transient(_)));
        mock.assert_calls_async(3).await;
    }

    #[tokio::test]
    async fn slow_response_times_out_and_is_retried() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/query");
                then.status(200).delay(Duration::from_millis(800)).json_body(json!({
                    "Meta Data": {"2. Symbol": "AAPL"},
                    "Time Series (Daily)": {}
                }));
            })
            .await;

        let sleeper = Arc::new(RecordingSleeper::default());
        let client = client_with_timeout(&server, sleeper.clone(), Duration::from_millis(200));
        let err = client.fetch("AAPL", FetchMode::Daily).await.unwrap_err();

        assert!(matches!(err, RequestError::Transient(_)));
        mock.assert_calls_async(3).await;
        assert_eq!(sleeper.delays.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_series_is_a_parse_error() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/query");
                then.status(200).json_body(json!({"Meta Data": {}}));
            })
            .await;

        let client = client_for(&server, Arc::default());
        let err = client.fetch("AAPL", FetchMode::Daily).await.unwrap_err();

        assert!(matches!(err, RequestError::Parse(_)));
        mock.assert_calls_async(1).await;
    }

    #[tokio::test]
    async fn probe_makes_a_single_attempt() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/query").query_param("symbol", "AAPL");
                then.status(500);
            })
            .await;

        let client = client_for(&server, Arc::default());
        assert!(client.probe().await.is_err());
        mock.assert_calls_async(1).await;
    }

    #[test]
    fn information_notices_are_classified() {
        let payload = |info: &str| TimeSeriesPayload {
            error_message: None,
            note: None,
            information: Some(info.to_string()),
            meta: Default::default(),
            series: Default::default(),
        };
        assert!(matches!(
            check_notice(&payload("Our standard API rate limit is 25 requests per day.")),
            Err(RequestError::RateLimited(_))
        ));
        assert!(matches!(
            check_notice(&payload("Please provide a valid API key.")),
            Err(RequestError::Unauthorized(_))
        ));
        assert!(matches!(
            check_notice(&payload("This is a premium endpoint.")),
            Err(RequestError::Provider(_))
        ));
    }
}
