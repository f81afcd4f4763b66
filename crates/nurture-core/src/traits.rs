//! The outbound mail transport seam.
//!
//! The campaign engine never talks to an email provider directly; it hands a
//! fully rendered [`OutboundEmail`] to whatever [`MailTransport`] it was built with.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A rendered email ready for the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub delivery_id: i64,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
}

/// Provider acknowledgement for an accepted email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportReceipt {
    /// Provider-side message id.
    pub id: String,
}

/// Outbound email capability. Errors must be `NurtureError::Transport`.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    async fn send(&self, email: &OutboundEmail) -> Result<TransportReceipt>;
}
