// src/services/render.rs

//! Headless rendering for JavaScript-built pages.
//!
//! The browser engine itself is outside this crate. A [`Renderer`] opens
//! sessions on some rendering backend; [`RenderPool`] bounds how many are
//! open at once and hands them out wrapped in a [`SessionGuard`], which
//! closes the session and frees the slot however the caller exits.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Rendering failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// Backend unreachable, overloaded, or failing
    #[error("rendering service unavailable: {0}")]
    Unavailable(String),

    /// The page itself answered with a client error
    #[error("page rejected with HTTP {0}")]
    Rejected(u16),

    /// Readiness condition not met in time
    #[error("page not ready after {0}ms")]
    NotReady(u64),

    #[error("rendering timed out")]
    Timeout,
}

impl RenderError {
    /// Whether trying again might succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RenderError::Rejected(status) if *status != 429)
    }
}

/// A rendering backend.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError>;
}

/// One browser-like session.
#[async_trait]
pub trait RenderSession: Send {
    /// Load a page.
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError>;

    /// Serialized DOM of the loaded page as it is now.
    async fn content(&mut self) -> Result<String, RenderError>;

    /// Release backend resources. Must be safe to call once after any error.
    async fn close(&mut self);
}

/// Bounded pool of rendering sessions.
#[derive(Clone)]
pub struct RenderPool {
    renderer: Arc<dyn Renderer>,
    permits: Arc<Semaphore>,
    session_timeout: Duration,
}

impl RenderPool {
    pub fn new(renderer: Arc<dyn Renderer>, pool_size: usize, session_timeout: Duration) -> Self {
        Self {
            renderer,
            permits: Arc::new(Semaphore::new(pool_size.max(1))),
            session_timeout,
        }
    }

    /// Wait for a free slot and open a session in it.
    ///
    /// Waiting for the slot and opening the session share one
    /// `session_timeout` budget.
    pub async fn acquire(&self) -> Result<SessionGuard, RenderError> {
        tokio::time::timeout(self.session_timeout, self.open())
            .await
            .map_err(|_| RenderError::Timeout)?
    }

    async fn open(&self) -> Result<SessionGuard, RenderError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| RenderError::Unavailable("render pool closed".to_string()))?;
        let session = self.renderer.open_session().await?;

        Ok(SessionGuard {
            session: Some(session),
            permit: Some(permit),
        })
    }

    /// Upper bound for one render, from navigation to content.
    pub fn session_timeout(&self) -> Duration {
        self.session_timeout
    }

    /// Free session slots.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// An open session holding one pool slot.
///
/// Dropping the guard closes the session in the background and frees the
/// slot once the close has finished.
pub struct SessionGuard {
    session: Option<Box<dyn RenderSession>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl SessionGuard {
    pub async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        match self.session.as_mut() {
            Some(session) => session.navigate(url).await,
            None => Err(RenderError::Unavailable("session released".to_string())),
        }
    }

    pub async fn content(&mut self) -> Result<String, RenderError> {
        match self.session.as_mut() {
            Some(session) => session.content().await,
            None => Err(RenderError::Unavailable("session released".to_string())),
        }
    }

    /// Close the session and free the slot.
    pub async fn release(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        self.permit.take();
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let permit = self.permit.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    session.close().await;
                    drop(permit);
                });
            }
            Err(_) => log::warn!("Render session dropped outside a runtime; not closed"),
        }
    }
}

/// Renderer backed by a remote rendering service over HTTP.
///
/// Each navigation posts `{"url": ..}` to `{endpoint}/content` and keeps the
/// returned HTML as the session's document.
#[derive(Clone)]
pub struct HttpRenderer {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpRenderer {
    pub fn new(client: Client, endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl Renderer for HttpRenderer {
    async fn open_session(&self) -> Result<Box<dyn RenderSession>, RenderError> {
        Ok(Box::new(HttpRenderSession {
            renderer: self.clone(),
            document: None,
        }))
    }
}

struct HttpRenderSession {
    renderer: HttpRenderer,
    document: Option<String>,
}

#[async_trait]
impl RenderSession for HttpRenderSession {
    async fn navigate(&mut self, url: &str) -> Result<(), RenderError> {
        let renderer = &self.renderer;
        let mut request = renderer
            .client
            .post(format!("{}/content", renderer.endpoint))
            .json(&json!({
                "url": url,
                "gotoOptions": { "waitUntil": "networkidle2" },
            }));
        if let Some(token) = &renderer.token {
            request = request.query(&[("token", token)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| RenderError::Unavailable(crate::utils::http::describe_error(&e)))?;

        let status = response.status();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            return Err(RenderError::Rejected(status.as_u16()));
        }
        if !status.is_success() {
            return Err(RenderError::Unavailable(format!("HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| RenderError::Unavailable(crate::utils::http::describe_error(&e)))?;
        self.document = Some(body);
        Ok(())
    }

    async fn content(&mut self) -> Result<String, RenderError> {
        self.document
            .clone()
            .ok_or_else(|| RenderError::Unavailable("no page loaded".to_string()))
    }

    async fn close(&mut self) {
        self.document = None;
    }
}
