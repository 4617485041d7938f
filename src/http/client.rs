use reqwest::{self, StatusCode};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

use crate::model::ErrorKind;

/// Custom error type for HTTP requests.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RequestError {
    #[error("Transient failure: {0}")]
    Transient(String),
    #[error("Rate limited: {0}")]
    RateLimited(String),
    #[error("Error deserializing response: {0}")]
    Parse(String),
    #[error("Authentication rejected: {0}")]
    Unauthorized(String),
    #[error("Provider error: {0}")]
    Provider(String),
}

impl RequestError {
    /// Only network-level and rate-limit failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RequestError::Transient(_) | RequestError::RateLimited(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RequestError::Transient(_) => ErrorKind::Transient,
            RequestError::RateLimited(_) => ErrorKind::RateLimited,
            RequestError::Parse(_) => ErrorKind::Parse,
            RequestError::Unauthorized(_) => ErrorKind::Unauthorized,
            RequestError::Provider(_) => ErrorKind::Provider,
        }
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(e: reqwest::Error) -> Self {
        // strip the url, it carries the api key
        let e = e.without_url();
        if e.is_decode() {
            RequestError::Parse(e.to_string())
        } else {
            RequestError::Transient(e.to_string())
        }
    }
}

/// Builds the shared client; the timeout applies to every request made with it.
pub fn build_client(timeout: std::time::Duration) -> Result<reqwest::Client, RequestError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("quote_ingest/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| RequestError::Transient(e.to_string()))
}

/// Makes a GET request to `base_url` with the given query parameters and decodes the JSON body.
pub async fn get<T: DeserializeOwned>(
    client: &reqwest::Client,
    base_url: &str,           // Endpoint, without query string.
    params: &[(&str, &str)],  // Query parameters.
) -> Result<T, RequestError> {
    let url = Url::parse_with_params(base_url, params)
        .map_err(|e| RequestError::Provider(format!("invalid url {base_url}: {e}")))?;

    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "application/json")
        .send()
        .await?;

    // Handle non-success status codes.
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(classify_status(status, body));
    }

    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|e| RequestError::Parse(e.to_string()))
}

fn classify_status(status: StatusCode, body: String) -> RequestError {
    let msg = format!("HTTP {}: {}", status.as_u16(), body.chars().take(200).collect::<String>());
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RequestError::Unauthorized(msg),
        StatusCode::TOO_MANY_REQUESTS => RequestError::RateLimited(msg),
        StatusCode::REQUEST_TIMEOUT => RequestError::Transient(msg),
        s if s.is_server_error() => RequestError::Transient(msg),
        _ => RequestError::Provider(msg),
    }
}
