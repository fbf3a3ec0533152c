// src/services/fetcher.rs

//! Content acquisition for targets.
//!
//! Static targets are fetched with a plain GET; dynamic targets go through
//! the render pool. Both share the same retry loop: connection failures,
//! timeouts, 5xx, and 429 are retried with backoff; other 4xx responses
//! end the fetch at once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use scraper::{Html, Selector};
use tokio::time::Instant;

use crate::error::{FetchError, Result};
use crate::models::{Config, Readiness, RenderMode, Target};
use crate::services::render::{HttpRenderer, RenderError, RenderPool, SessionGuard};
use crate::utils::content_hash;
use crate::utils::http::{create_async_client, describe_error};
use crate::utils::retry::RetryPolicy;

/// Unprocessed page content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContent {
    pub body: String,
    /// URL after redirects
    pub final_url: String,
}

/// Outcome of a single attempt.
#[derive(Debug)]
enum AttemptError {
    Retryable {
        reason: String,
        /// Host could not be reached at all
        unreachable: bool,
    },
    Fatal(String),
}

impl AttemptError {
    fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable {
            reason: reason.into(),
            unreachable: false,
        }
    }
}

impl From<RenderError> for AttemptError {
    fn from(error: RenderError) -> Self {
        if error.is_retryable() {
            Self::retryable(error.to_string())
        } else {
            Self::Fatal(error.to_string())
        }
    }
}

/// Fetches raw content for targets.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
    retry: RetryPolicy,
    render: Option<RenderPool>,
}

impl Fetcher {
    pub fn new(client: Client, retry: RetryPolicy, render: Option<RenderPool>) -> Self {
        Self {
            client,
            retry,
            render,
        }
    }

    /// Build the fetcher from `[fetch]` and `[render]`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = create_async_client(&config.fetch)?;
        let render = config.render.endpoint.as_ref().map(|endpoint| {
            let renderer = HttpRenderer::new(client.clone(), endpoint, config.render.token.clone());
            RenderPool::new(
                Arc::new(renderer),
                config.render.pool_size,
                Duration::from_secs(config.render.session_timeout_secs),
            )
        });

        Ok(Self::new(client, config.fetch.retry.policy(), render))
    }

    /// Fetch a target's current content.
    ///
    /// Has no side effects beyond the network calls.
    pub async fn fetch(&self, target: &Target) -> std::result::Result<RawContent, FetchError> {
        let url = url::Url::parse(&target.url)
            .map_err(|e| FetchError::permanent(format!("invalid URL: {e}")))?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match target.render_mode {
                RenderMode::Static => self.fetch_static(url.as_str()).await,
                RenderMode::Dynamic => self.fetch_rendered(target).await,
            };

            let (reason, unreachable) = match result {
                Ok(raw) => {
                    log::debug!(
                        "[{}] Fetched {} bytes on attempt {}",
                        target.id,
                        raw.body.len(),
                        attempt
                    );
                    return Ok(raw);
                }
                Err(AttemptError::Fatal(reason)) => {
                    log::warn!("[{}] Fetch rejected: {}", target.id, reason);
                    return Err(FetchError::permanent(reason));
                }
                Err(AttemptError::Retryable {
                    reason,
                    unreachable,
                }) => (reason, unreachable),
            };

            if !self.retry.allows_retry(attempt) {
                log::warn!(
                    "[{}] Fetch failed after {} attempt(s): {}",
                    target.id,
                    attempt,
                    reason
                );
                return Err(if unreachable {
                    FetchError::permanent(format!("unreachable: {reason}"))
                } else {
                    FetchError::transient(attempt, reason)
                });
            }

            let delay = self.retry.delay_for(attempt);
            log::debug!(
                "[{}] Attempt {}/{} failed ({}); retrying in {:?}",
                target.id,
                attempt,
                self.retry.max_attempts,
                reason,
                delay
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn fetch_static(&self, url: &str) -> std::result::Result<RawContent, AttemptError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status));
        }

        let final_url = response.url().to_string();
        let body = response.text().await.map_err(|e| request_error(&e))?;
        Ok(RawContent { body, final_url })
    }

    async fn fetch_rendered(&self, target: &Target) -> std::result::Result<RawContent, AttemptError> {
        let Some(pool) = &self.render else {
            return Err(AttemptError::Fatal(
                "dynamic target but no rendering service configured".to_string(),
            ));
        };

        let mut session = pool.acquire().await?;
        let rendered = tokio::time::timeout(
            pool.session_timeout(),
            render_page(&mut session, &target.url, &target.readiness),
        )
        .await;
        session.release().await;

        match rendered {
            Ok(Ok(body)) => Ok(RawContent {
                body,
                final_url: target.url.clone(),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(RenderError::Timeout.into()),
        }
    }
}

/// Navigate and wait until the page satisfies its readiness condition.
async fn render_page(
    session: &mut SessionGuard,
    url: &str,
    readiness: &Readiness,
) -> std::result::Result<String, RenderError> {
    session.navigate(url).await?;

    match readiness {
        Readiness::FixedDelay { ms } => {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
            session.content().await
        }

        Readiness::DomStable {
            poll_ms,
            stable_polls,
            max_wait_ms,
        } => {
            let deadline = Instant::now() + Duration::from_millis(*max_wait_ms);
            let mut last_hash = String::new();
            let mut stable = 0;
            loop {
                let content = session.content().await?;
                let hash = content_hash(&content);
                if hash == last_hash {
                    stable += 1;
                    if stable >= *stable_polls {
                        return Ok(content);
                    }
                } else {
                    stable = 0;
                    last_hash = hash;
                }

                if Instant::now() >= deadline {
                    return Err(RenderError::NotReady(*max_wait_ms));
                }
                tokio::time::sleep(Duration::from_millis(*poll_ms)).await;
            }
        }

        Readiness::Selector { css, max_wait_ms } => {
            let deadline = Instant::now() + Duration::from_millis(*max_wait_ms);
            loop {
                let content = session.content().await?;
                if selector_present(&content, css) {
                    return Ok(content);
                }
                if Instant::now() >= deadline {
                    return Err(RenderError::NotReady(*max_wait_ms));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn selector_present(html: &str, css: &str) -> bool {
    match Selector::parse(css) {
        Ok(selector) => Html::parse_document(html).select(&selector).next().is_some(),
        Err(_) => false,
    }
}

fn request_error(error: &reqwest::Error) -> AttemptError {
    let reason = describe_error(error);
    if error.is_timeout() {
        AttemptError::retryable(reason)
    } else if error.is_connect() {
        AttemptError::Retryable {
            reason,
            unreachable: true,
        }
    } else if error.is_builder() || error.is_redirect() {
        AttemptError::Fatal(reason)
    } else {
        AttemptError::retryable(reason)
    }
}

fn status_error(status: StatusCode) -> AttemptError {
    let reason = format!("HTTP {status}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AttemptError::retryable(reason)
    } else {
        AttemptError::Fatal(reason)
    }
}
