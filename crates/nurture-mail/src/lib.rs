//! # Nurture Mail
//!
//! [`MailTransport`] implementations selected by `mail.provider`:
//! - `http`: JSON email API with a bearer key (Resend-compatible)
//! - `smtp`: STARTTLS relay via async lettre
//! - `log`: writes the email to the log and reports success

pub mod http;
pub mod log;
pub mod smtp;

use std::sync::Arc;

use nurture_core::config::MailConfig;
use nurture_core::{MailTransport, NurtureError, Result};

pub use http::HttpApiTransport;
pub use log::LogTransport;
pub use smtp::SmtpTransport;

/// Build the configured transport.
pub fn build_transport(config: &MailConfig) -> Result<Arc<dyn MailTransport>> {
    let transport: Arc<dyn MailTransport> = match config.provider.as_str() {
        "http" => Arc::new(HttpApiTransport::new(config)?),
        "smtp" => Arc::new(SmtpTransport::new(config)?),
        "log" => Arc::new(LogTransport::new()),
        other => {
            return Err(NurtureError::Config(format!(
                "unknown mail provider '{other}' (expected http, smtp or log)"
            )));
        }
    };
    tracing::info!("📮 Mail transport: {}", transport.name());
    Ok(transport)
}

/// `Name <address>` for the From header.
pub(crate) fn from_header(config: &MailConfig) -> String {
    if config.from_name.trim().is_empty() {
        config.from_address.clone()
    } else {
        format!("{} <{}>", config.from_name, config.from_address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_selection() {
        let mut config = MailConfig::default();
        assert_eq!(build_transport(&config).unwrap().name(), "log");

        config.provider = "http".into();
        assert!(matches!(build_transport(&config), Err(NurtureError::Config(_))));
        config.api_key = "re_test".into();
        assert_eq!(build_transport(&config).unwrap().name(), "http");

        config.provider = "pigeon".into();
        assert!(build_transport(&config).is_err());
    }

    #[test]
    fn test_from_header() {
        let mut config = MailConfig::default();
        config.from_name = "Coach Kim".into();
        config.from_address = "kim@example.com".into();
        assert_eq!(from_header(&config), "Coach Kim <kim@example.com>");
        config.from_name = String::new();
        assert_eq!(from_header(&config), "kim@example.com");
    }
}
