//! SMTP transport (STARTTLS relay via lettre).

use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::time::Duration;

use nurture_core::config::MailConfig;
use nurture_core::{MailTransport, NurtureError, OutboundEmail, Result, TransportReceipt};

pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    /// Right-hand side of generated Message-IDs.
    domain: String,
}

impl SmtpTransport {
    pub fn new(config: &MailConfig) -> Result<Self> {
        if config.smtp_host.trim().is_empty() {
            return Err(NurtureError::Config("mail.smtp_host is required for the smtp provider".into()));
        }
        let from: Mailbox = crate::from_header(config)
            .parse()
            .map_err(|e| NurtureError::Config(format!("invalid from address: {e}")))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| NurtureError::Config(format!("SMTP relay: {e}")))?
            .port(config.smtp_port)
            .timeout(Some(Duration::from_secs(config.timeout_secs.max(1))));
        if !config.smtp_username.is_empty() {
            builder = builder.credentials(Credentials::new(
                config.smtp_username.clone(),
                config.smtp_password.clone(),
            ));
        }

        let domain = config
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d.to_string())
            .unwrap_or_else(|| "localhost".into());
        Ok(Self { mailer: builder.build(), from, domain })
    }

    fn build_message(&self, email: &OutboundEmail, message_id: &str) -> Result<Message> {
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|e| NurtureError::Transport(format!("invalid recipient {}: {e}", email.to)))?;
        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .message_id(Some(message_id.to_string()));
        let message = match &email.text {
            Some(text) => builder.multipart(MultiPart::alternative_plain_html(text.clone(), email.html.clone())),
            None => builder.singlepart(SinglePart::html(email.html.clone())),
        };
        message.map_err(|e| NurtureError::Transport(format!("build message: {e}")))
    }
}

#[async_trait]
impl MailTransport for SmtpTransport {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<TransportReceipt> {
        let message_id = format!("<nurture-{}-{}@{}>", email.delivery_id, uuid::Uuid::new_v4(), self.domain);
        let message = self.build_message(email, &message_id)?;
        self.mailer
            .send(message)
            .await
            .map_err(|e| NurtureError::Transport(format!("SMTP send: {e}")))?;
        tracing::info!("📤 Email for delivery #{} sent to {} via SMTP", email.delivery_id, email.to);
        Ok(TransportReceipt { id: message_id })
    }
}
