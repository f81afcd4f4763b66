//! Log-only transport for development and dry runs.

use async_trait::async_trait;

use nurture_core::{MailTransport, OutboundEmail, Result, TransportReceipt};

#[derive(Debug, Default)]
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailTransport for LogTransport {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<TransportReceipt> {
        tracing::info!(
            "📝 [log transport] delivery #{} to {}: {} ({} bytes html)",
            email.delivery_id,
            email.to,
            email.subject,
            email.html.len()
        );
        Ok(TransportReceipt { id: format!("log-{}", uuid::Uuid::new_v4()) })
    }
}
