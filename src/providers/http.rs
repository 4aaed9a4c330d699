//! Shared plumbing for the REST-speaking adapters

use crate::config::ProviderCommon;
use crate::provider::{AdapterError, AdapterResult};
use reqwest::StatusCode;
use std::time::Duration;

/// Build a reqwest client with the provider's distinct connect and read
/// timeouts.
pub fn build_client(common: &ProviderCommon) -> AdapterResult<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_millis(common.connect_timeout_ms))
        .timeout(Duration::from_millis(common.read_timeout_ms))
        .build()
        .map_err(|e| AdapterError::Fatal(format!("http client build: {e}")))
}

/// Classify a non-success HTTP status into the canonical outcome.
pub fn classify_status(status: StatusCode, body: &str) -> AdapterError {
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        AdapterError::Retryable(format!("http {status}: {body}"))
    } else {
        AdapterError::Fatal(format!("http {status}: {body}"))
    }
}

/// Transport-level failures (connect, timeout, body read) are transient.
pub fn classify_transport(err: reqwest::Error) -> AdapterError {
    AdapterError::Retryable(format!("transport: {err}"))
}

pub fn dollars_to_cents(dollars: f64) -> i64 {
    (dollars * 100.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_retryable());
    }

    #[test]
    fn client_errors_are_fatal() {
        assert!(!classify_status(StatusCode::UNAUTHORIZED, "").is_retryable());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_retryable());
    }

    #[test]
    fn price_conversion_rounds() {
        assert_eq!(dollars_to_cents(0.526), 53);
        assert_eq!(dollars_to_cents(1.0), 100);
        assert_eq!(dollars_to_cents(0.0), 0);
    }
}
