// src/services/channels.rs

//! Notification channels.
//!
//! A channel turns an [`AlertMessage`] into one delivery attempt on its
//! transport and reports whether a failed attempt is worth retrying. Retry
//! policy, timeouts, and delivery state live in the dispatcher.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};

use crate::error::DeliveryError;
use crate::models::{AlertMessage, ChannelConfig, ChannelKind};
use crate::utils::http::describe_error;

/// A notification transport.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Configured channel name.
    fn name(&self) -> &str;

    /// Make one delivery attempt.
    async fn send(&self, message: &AlertMessage) -> Result<(), DeliveryError>;
}

/// Generic JSON webhook receiving the alert message as-is.
pub struct WebhookChannel {
    name: String,
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
}

impl WebhookChannel {
    pub fn new(
        name: impl Into<String>,
        client: Client,
        url: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            client,
            url: url.into(),
            headers,
        }
    }
}

#[async_trait]
impl Channel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), DeliveryError> {
        let mut request = self.client.post(&self.url).json(message);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        check_response(request.send().await).await
    }
}

/// Slack incoming webhook.
pub struct SlackChannel {
    name: String,
    client: Client,
    webhook_url: String,
}

impl SlackChannel {
    pub fn new(name: impl Into<String>, client: Client, webhook_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            webhook_url: webhook_url.into(),
        }
    }

    fn payload(message: &AlertMessage) -> Value {
        let mut text = format!("*{}*\n", message.subject);
        if let Some(agency) = &message.agency {
            text.push_str(&format!("• *Agency:* {agency}\n"));
        }
        text.push_str(&format!(
            "• *Severity:* {}\n",
            message.significance.as_str().to_uppercase()
        ));
        text.push_str(&format!("• *Details:* {}\n", message.summary));
        text.push_str(&format!("• *Link:* <{}|View Form>", message.url));
        json!({ "text": text })
    }
}

#[async_trait]
impl Channel for SlackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), DeliveryError> {
        let request = self.client.post(&self.webhook_url).json(&Self::payload(message));
        check_response(request.send().await).await
    }
}

/// Microsoft Teams incoming webhook, as a MessageCard.
pub struct TeamsChannel {
    name: String,
    client: Client,
    webhook_url: String,
}

impl TeamsChannel {
    pub fn new(name: impl Into<String>, client: Client, webhook_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
            webhook_url: webhook_url.into(),
        }
    }

    fn payload(message: &AlertMessage) -> Value {
        json!({
            "@type": "MessageCard",
            "@context": "http://schema.org/extensions",
            "themeColor": message.color(),
            "summary": message.subject,
            "sections": [{
                "activityTitle": format!("Change Detected: {}", message.target_name),
                "activitySubtitle": message
                    .agency
                    .as_deref()
                    .map(|agency| format!("Agency: {agency}"))
                    .unwrap_or_default(),
                "facts": [
                    { "name": "Severity", "value": message.significance.as_str().to_uppercase() },
                    {
                        "name": "Timestamp",
                        "value": format!("{} UTC", message.detected_at.format("%Y-%m-%d %H:%M:%S")),
                    },
                    { "name": "Details", "value": message.summary },
                ],
                "markdown": true,
            }],
            "potentialAction": [{
                "@type": "OpenUri",
                "name": "View Form",
                "targets": [{ "os": "default", "uri": message.url }],
            }],
        })
    }
}

#[async_trait]
impl Channel for TeamsChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), DeliveryError> {
        let request = self.client.post(&self.webhook_url).json(&Self::payload(message));
        check_response(request.send().await).await
    }
}

/// SMTP mail with a plain text part and an HTML part.
pub struct EmailChannel {
    name: String,
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailChannel {
    pub fn new(
        name: impl Into<String>,
        transport: AsyncSmtpTransport<Tokio1Executor>,
        from: &str,
        to: &[String],
    ) -> Result<Self, DeliveryError> {
        let parse = |address: &str| {
            address
                .parse::<Mailbox>()
                .map_err(|e| DeliveryError::Permanent(format!("invalid address '{address}': {e}")))
        };
        Ok(Self {
            name: name.into(),
            transport,
            from: parse(from)?,
            to: to.iter().map(|a| parse(a)).collect::<Result<_, _>>()?,
        })
    }

    /// Build the SMTP transport for a relay.
    pub fn transport(
        host: &str,
        port: u16,
        starttls: bool,
        credentials: Option<(String, String)>,
    ) -> Result<AsyncSmtpTransport<Tokio1Executor>, DeliveryError> {
        let builder = if starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
                .map_err(|e| DeliveryError::Permanent(format!("SMTP relay '{host}': {e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        let mut builder = builder.port(port);
        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }
        Ok(builder.build())
    }

    fn html(message: &AlertMessage) -> String {
        fn item(items: &mut String, label: &str, value: &str) {
            items.push_str(&format!("<li><strong>{label}:</strong> {value}</li>\n"));
        }

        let mut items = String::new();
        item(&mut items, "Form", &escape_html(&message.target_name));
        if let Some(agency) = &message.agency {
            item(&mut items, "Agency", &escape_html(agency));
        }
        item(
            &mut items,
            "Timestamp",
            &format!("{} UTC", message.detected_at.format("%Y-%m-%d %H:%M:%S")),
        );
        item(
            &mut items,
            "Severity",
            &format!(
                "<span style=\"color:#{};font-weight:bold;\">{}</span>",
                message.color(),
                message.significance.as_str().to_uppercase()
            ),
        );
        item(&mut items, "Details", &escape_html(&message.summary));
        let url = escape_html(&message.url);
        item(&mut items, "Form URL", &format!("<a href=\"{url}\">{url}</a>"));

        format!(
            "<html>\n<body>\n<p>A change has been detected for:</p>\n<ul>\n{items}</ul>\n</body>\n</html>\n"
        )
    }

    fn email(&self, message: &AlertMessage) -> Result<Message, DeliveryError> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone());
        for to in &self.to {
            builder = builder.to(to.clone());
        }
        builder
            .multipart(MultiPart::alternative_plain_html(
                message.body.clone(),
                Self::html(message),
            ))
            .map_err(|e| DeliveryError::Permanent(format!("failed to build email: {e}")))
    }
}

#[async_trait]
impl Channel for EmailChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), DeliveryError> {
        let email = self.email(message)?;
        match self.transport.send(email).await {
            Ok(_) => Ok(()),
            Err(e) => Err(classify_smtp_error(&e)),
        }
    }
}

/// 5xx replies and local failures are final; 4xx replies, timeouts, and
/// connection problems are worth another attempt.
fn classify_smtp_error(error: &lettre::transport::smtp::Error) -> DeliveryError {
    let reason = format!("SMTP: {error}");
    if error.is_permanent() || error.is_client() {
        DeliveryError::Permanent(reason)
    } else {
        DeliveryError::Retryable(reason)
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Writes alerts to the application log. Never fails.
pub struct LogChannel {
    name: String,
}

impl LogChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Channel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &AlertMessage) -> Result<(), DeliveryError> {
        log::warn!("[{}] {}", message.target_id, message.subject);
        for line in message.body.lines() {
            log::warn!("[{}]   {}", message.target_id, line);
        }
        Ok(())
    }
}

/// Classify an HTTP delivery response.
async fn check_response(
    result: Result<reqwest::Response, reqwest::Error>,
) -> Result<(), DeliveryError> {
    let response = match result {
        Ok(response) => response,
        Err(e) if e.is_builder() => return Err(DeliveryError::Permanent(describe_error(&e))),
        Err(e) => return Err(DeliveryError::Retryable(describe_error(&e))),
    };

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    let reason = if body.is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", body.chars().take(200).collect::<String>())
    };

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(DeliveryError::Retryable(reason))
    } else {
        Err(DeliveryError::Permanent(reason))
    }
}

/// Configured channels, by name.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, Arc<dyn Channel>>,
}

impl ChannelRegistry {
    /// Build every configured channel over a shared HTTP client.
    pub fn from_config(configs: &[ChannelConfig], client: &Client) -> Self {
        let mut registry = Self::default();
        for config in configs {
            let channel: Arc<dyn Channel> = match &config.kind {
                ChannelKind::Webhook { url, headers } => Arc::new(WebhookChannel::new(
                    &config.name,
                    client.clone(),
                    url,
                    headers.clone(),
                )),
                ChannelKind::Slack { webhook_url } => {
                    Arc::new(SlackChannel::new(&config.name, client.clone(), webhook_url))
                }
                ChannelKind::Teams { webhook_url } => {
                    Arc::new(TeamsChannel::new(&config.name, client.clone(), webhook_url))
                }
                ChannelKind::Email {
                    smtp_host,
                    port,
                    starttls,
                    username,
                    password,
                    from,
                    to,
                } => {
                    let credentials = username.clone().zip(password.clone());
                    let built = EmailChannel::transport(smtp_host, *port, *starttls, credentials)
                        .and_then(|transport| EmailChannel::new(&config.name, transport, from, to));
                    match built {
                        Ok(channel) => Arc::new(channel) as Arc<dyn Channel>,
                        Err(e) => {
                            log::error!("Channel '{}' not available: {}", config.name, e);
                            continue;
                        }
                    }
                }
                ChannelKind::Log => Arc::new(LogChannel::new(&config.name)),
            };
            registry.insert(channel);
        }
        registry
    }

    /// Add or replace a channel under its own name.
    pub fn insert(&mut self, channel: Arc<dyn Channel>) {
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }
}
