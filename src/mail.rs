// Outgoing mail for the feedback form.
// Delivery is best effort: sends run on detached tasks after the HTTP response
// has been built, and failures are only logged.

use async_trait::async_trait;
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::header::ContentType, transport::smtp::authentication::Credentials,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub subject: String,
    pub html_body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("invalid mailbox address: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Message(#[from] lettre::error::Error),
    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("mail send timed out after {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: MailMessage) -> Result<(), MailError>;
}

pub type SharedMailTransport = Arc<dyn MailTransport>;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Defaults to `username` when not set.
    pub receiver: Option<String>,
    pub timeout: Duration,
}

/// STARTTLS SMTP relay.
pub struct SmtpMailTransport {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: lettre::message::Mailbox,
    to: lettre::message::Mailbox,
}

impl SmtpMailTransport {
    pub fn new(config: &SmtpConfig) -> Result<Self, MailError> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .timeout(Some(config.timeout))
            .build();

        let receiver = config.receiver.as_deref().unwrap_or(&config.username);
        Ok(Self {
            transport,
            from: config.username.parse()?,
            to: receiver.parse()?,
        })
    }
}

#[async_trait]
impl MailTransport for SmtpMailTransport {
    async fn send(&self, message: MailMessage) -> Result<(), MailError> {
        let email = Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(message.subject)
            .header(ContentType::TEXT_HTML)
            .body(message.html_body)?;
        self.transport.send(email).await?;
        Ok(())
    }
}

/// Sends `message` on a detached task bounded by `timeout`.
/// The caller never learns the outcome.
pub fn dispatch_detached(
    transport: SharedMailTransport,
    message: MailMessage,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("Sending feedback mail: {}", message.subject);
        let result = match tokio::time::timeout(timeout, transport.send(message)).await {
            Ok(result) => result,
            Err(_) => Err(MailError::Timeout(timeout)),
        };
        match result {
            Ok(()) => info!("Feedback mail sent"),
            Err(e) => error!("Feedback mail failed, not retrying: {}", e),
        }
    })
}

/// Escapes text for inclusion in an HTML mail body.
pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records messages instead of sending them.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) sent: Mutex<Vec<MailMessage>>,
        pub(crate) fail: bool,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, message: MailMessage) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(message);
            if self.fail {
                Err(MailError::Timeout(Duration::ZERO))
            } else {
                Ok(())
            }
        }
    }

    struct StalledTransport;

    #[async_trait]
    impl MailTransport for StalledTransport {
        async fn send(&self, _message: MailMessage) -> Result<(), MailError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    fn message() -> MailMessage {
        MailMessage {
            subject: "s".into(),
            html_body: "<p>b</p>".into(),
        }
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#x27;Jerry&#x27;&lt;/b&gt;"
        );
        assert_eq!(escape_html("plain text"), "plain text");
    }

    #[tokio::test]
    async fn test_dispatch_delivers() {
        let transport = Arc::new(RecordingTransport::default());
        dispatch_detached(transport.clone(), message(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(transport.sent.lock().unwrap().as_slice(), &[message()]);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failure() {
        let transport = Arc::new(RecordingTransport {
            fail: true,
            ..Default::default()
        });
        let handle = dispatch_detached(transport.clone(), message(), Duration::from_secs(1));
        assert!(handle.await.is_ok());
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_times_out() {
        let handle = dispatch_detached(
            Arc::new(StalledTransport),
            message(),
            Duration::from_millis(20),
        );
        assert!(handle.await.is_ok());
    }

    #[test]
    fn test_smtp_transport_rejects_bad_address() {
        let config = SmtpConfig {
            host: "smtp.example.com".into(),
            port: 587,
            username: "not an address".into(),
            password: "secret".into(),
            receiver: None,
            timeout: Duration::from_secs(5),
        };
        assert!(matches!(
            SmtpMailTransport::new(&config),
            Err(MailError::Address(_))
        ));
    }
}
