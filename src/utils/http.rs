// src/utils/http.rs

//! HTTP client utilities.

use std::time::Duration;

use crate::error::Result;
use crate::models::FetchConfig;

/// Create a configured asynchronous HTTP client.
pub fn create_async_client(config: &FetchConfig) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(&config.user_agent)
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(client)
}

/// Reduce a request error to a short reason, without the URL.
pub fn describe_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        "connection failed".to_string()
    } else if let Some(status) = error.status() {
        format!("HTTP {status}")
    } else if error.is_body() || error.is_decode() {
        "failed to read response body".to_string()
    } else {
        let message = error.to_string();
        match error.url() {
            Some(url) => message.replace(&format!(" for url ({url})"), ""),
            None => message,
        }
    }
}
