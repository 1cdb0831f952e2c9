use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    config::{Config, SmtpConfig},
    version::user_agent,
};

pub const ALERT_SUBJECT: &str = "Web Sentinel Alert - Content Changed";

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(30);
const SMTP_TIMEOUT: Duration = Duration::from_secs(30);
// Implicit TLS; every other port negotiates STARTTLS.
const SMTPS_PORT: u16 = 465;

pub type NotifyFuture = Pin<Box<dyn Future<Output = Result<(), NotifyError>> + Send>>;

/// Delivers a change alert to the operator.
pub trait Notifier: Send + Sync {
    fn notify(&self, alert: &ChangeAlert) -> NotifyFuture;
    fn name(&self) -> &'static str;
}

pub fn notifier_from_config(config: &Config) -> Result<Arc<dyn Notifier>, NotifyError> {
    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if let Some(smtp) = &config.smtp {
        notifiers.push(Arc::new(SmtpNotifier::new(smtp, SMTP_TIMEOUT)?));
    }
    if let Some(webhook) = &config.webhook {
        notifiers.push(Arc::new(WebhookNotifier::new(
            &webhook.url,
            webhook.token.clone(),
            WEBHOOK_TIMEOUT,
        )?));
    }

    match notifiers.len() {
        0 => Ok(Arc::new(LogNotifier)),
        1 => Ok(notifiers.remove(0)),
        _ => Ok(Arc::new(FanoutNotifier::new(notifiers))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeAlert {
    pub target_url: String,
    pub detected_at: DateTime<Utc>,
    pub content: String,
}

impl ChangeAlert {
    pub fn subject(&self) -> &'static str {
        ALERT_SUBJECT
    }

    pub fn body(&self) -> String {
        format!(
            "Website Change Detected\n\nTime: {}\n\nNew Content:\n{}\n",
            self.detected_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.content
        )
    }
}

#[derive(Debug)]
pub enum NotifyError {
    Http { message: String },
    Status { status: u16 },
    Smtp { message: String },
    InvalidAddress { address: String, message: String },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { message } => write!(f, "webhook request failed: {message}"),
            Self::Status { status } => write!(f, "webhook returned status {status}"),
            Self::Smtp { message } => write!(f, "smtp delivery failed: {message}"),
            Self::InvalidAddress { address, message } => {
                write!(f, "invalid email address {address:?}: {message}")
            }
        }
    }
}

impl std::error::Error for NotifyError {}

impl From<reqwest::Error> for NotifyError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http {
            message: value.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    subject: &'a str,
    text: String,
    target_url: &'a str,
    detected_at: String,
    content: &'a str,
}

/// Posts alerts as JSON to an HTTP endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl WebhookNotifier {
    pub fn new(
        url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            token: token.filter(|t| !t.is_empty()),
        })
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, alert: &ChangeAlert) -> NotifyFuture {
        let payload = WebhookPayload {
            subject: alert.subject(),
            text: alert.body(),
            target_url: &alert.target_url,
            detected_at: alert.detected_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            content: &alert.content,
        };
        let mut req = self.client.post(&self.url).json(&payload);
        if let Some(token) = self.token.as_deref() {
            req = req.bearer_auth(token);
        }

        Box::pin(async move {
            let resp = req.send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(NotifyError::Status {
                    status: status.as_u16(),
                });
            }
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

/// Emails alerts through an authenticated SMTP relay.
pub struct SmtpNotifier<T = AsyncSmtpTransport<Tokio1Executor>> {
    transport: Arc<T>,
    from: Mailbox,
    to: Mailbox,
}

impl SmtpNotifier {
    pub fn new(config: &SmtpConfig, timeout: Duration) -> Result<Self, NotifyError> {
        let builder = if config.port == SMTPS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
        }
        .map_err(|err| NotifyError::Smtp {
            message: err.to_string(),
        })?;
        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(config.user.clone(), config.pass.clone()))
            .timeout(Some(timeout))
            .build();
        Self::with_transport(transport, &config.user, &config.to)
    }
}

impl<T> SmtpNotifier<T> {
    pub fn with_transport(transport: T, from: &str, to: &str) -> Result<Self, NotifyError> {
        Ok(Self {
            transport: Arc::new(transport),
            from: parse_mailbox(from)?,
            to: parse_mailbox(to)?,
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

fn parse_mailbox(address: &str) -> Result<Mailbox, NotifyError> {
    address
        .parse::<Mailbox>()
        .map_err(|err| NotifyError::InvalidAddress {
            address: address.to_string(),
            message: err.to_string(),
        })
}

impl<T> Notifier for SmtpNotifier<T>
where
    T: AsyncTransport + Send + Sync + 'static,
    T::Error: std::fmt::Display,
{
    fn notify(&self, alert: &ChangeAlert) -> NotifyFuture {
        let message = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(alert.subject())
            .header(ContentType::TEXT_PLAIN)
            .body(alert.body());
        let transport = self.transport.clone();

        Box::pin(async move {
            let message = message.map_err(|err| NotifyError::Smtp {
                message: err.to_string(),
            })?;
            transport
                .send(message)
                .await
                .map_err(|err| NotifyError::Smtp {
                    message: err.to_string(),
                })?;
            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "smtp"
    }
}

/// Delivers every alert through each inner notifier in turn.
///
/// All notifiers are attempted; the first failure is returned.
pub struct FanoutNotifier {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, alert: &ChangeAlert) -> NotifyFuture {
        let pending: Vec<(&'static str, NotifyFuture)> = self
            .notifiers
            .iter()
            .map(|notifier| (notifier.name(), notifier.notify(alert)))
            .collect();

        Box::pin(async move {
            let mut first_err = None;
            for (name, fut) in pending {
                if let Err(err) = fut.await {
                    warn!(notifier = name, %err, "alert delivery failed");
                    first_err.get_or_insert(err);
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    fn name(&self) -> &'static str {
        "fanout"
    }
}

/// Used when no alert transport is configured; the alert only reaches the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, alert: &ChangeAlert) -> NotifyFuture {
        info!(
            subject = alert.subject(),
            target_url = %alert.target_url,
            detected_at = %alert.detected_at,
            content = %alert.content,
            "change alert (no notification transport configured)"
        );
        Box::pin(async { Ok(()) })
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lettre::transport::stub::AsyncStubTransport;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn alert() -> ChangeAlert {
        ChangeAlert {
            target_url: "https://example.com/status".to_string(),
            detected_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap(),
            content: "B".to_string(),
        }
    }

    #[test]
    fn body_carries_time_and_full_content() {
        assert_eq!(
            alert().body(),
            "Website Change Detected\n\nTime: 2026-03-01T08:30:00Z\n\nNew Content:\nB\n"
        );
        assert_eq!(alert().subject(), ALERT_SUBJECT);
    }

    #[tokio::test]
    async fn webhook_posts_json_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("authorization", "Bearer s3cret"))
            .and(body_partial_json(serde_json::json!({
                "subject": ALERT_SUBJECT,
                "target_url": "https://example.com/status",
                "detected_at": "2026-03-01T08:30:00Z",
                "content": "B",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            format!("{}/hook", server.uri()),
            Some("s3cret".to_string()),
            Duration::from_secs(5),
        )
        .unwrap();
        notifier.notify(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            format!("{}/hook", server.uri()),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        let err = notifier.notify(&alert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Status { status: 500 }));
    }

    #[tokio::test]
    async fn log_notifier_always_succeeds() {
        LogNotifier.notify(&alert()).await.unwrap();
    }

    #[tokio::test]
    async fn smtp_sends_alert_from_account_to_recipient() {
        let notifier = SmtpNotifier::with_transport(
            AsyncStubTransport::new_ok(),
            "me@example.com",
            "me@example.com",
        )
        .unwrap();
        notifier.notify(&alert()).await.unwrap();

        let sent = notifier.transport().messages().await;
        assert_eq!(sent.len(), 1);
        let (envelope, raw) = &sent[0];
        assert_eq!(
            envelope.from().map(ToString::to_string).as_deref(),
            Some("me@example.com")
        );
        assert_eq!(envelope.to().len(), 1);
        assert_eq!(envelope.to()[0].to_string(), "me@example.com");
        assert!(raw.contains(&format!("Subject: {ALERT_SUBJECT}")));
        assert!(raw.contains("Website Change Detected"));
        assert!(raw.contains("Time: 2026-03-01T08:30:00Z"));
        assert!(raw.contains("New Content:"));
    }

    #[tokio::test]
    async fn smtp_transport_failure_is_reported() {
        let notifier = SmtpNotifier::with_transport(
            AsyncStubTransport::new_error(),
            "me@example.com",
            "me@example.com",
        )
        .unwrap();
        let err = notifier.notify(&alert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Smtp { .. }));
    }

    #[test]
    fn smtp_rejects_malformed_address() {
        let err = SmtpNotifier::with_transport(
            AsyncStubTransport::new_ok(),
            "not an address",
            "me@example.com",
        )
        .err()
        .unwrap();
        assert!(matches!(err, NotifyError::InvalidAddress { .. }));
    }

    #[tokio::test]
    async fn fanout_tries_every_notifier_and_reports_failure() {
        let ok = Arc::new(
            SmtpNotifier::with_transport(AsyncStubTransport::new_ok(), "a@example.com", "a@example.com")
                .unwrap(),
        );
        let failing = Arc::new(
            SmtpNotifier::with_transport(
                AsyncStubTransport::new_error(),
                "b@example.com",
                "b@example.com",
            )
            .unwrap(),
        );
        let notifiers: Vec<Arc<dyn Notifier>> = vec![failing, ok.clone()];
        let fanout = FanoutNotifier::new(notifiers);

        let err = fanout.notify(&alert()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Smtp { .. }));
        assert_eq!(ok.transport().messages().await.len(), 1);
    }
}
