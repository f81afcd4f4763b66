//! Error types for the campaign engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a delivery was not admitted for sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionDenial {
    /// Global sent-today count reached the global cap.
    DailyLimitReached,
    /// Sent-today count for this recipient reached the recipient cap.
    RecipientLimitReached,
    /// Recipient opted out.
    Unsubscribed,
}

impl AdmissionDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DailyLimitReached => "daily_limit_reached",
            Self::RecipientLimitReached => "recipient_limit_reached",
            Self::Unsubscribed => "unsubscribed",
        }
    }
}

impl std::fmt::Display for AdmissionDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum NurtureError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Delivery already exists for lead {lead_id} / template {template_id}")]
    AlreadyExists { lead_id: i64, template_id: i64 },

    #[error("Admission denied: {0}")]
    AdmissionDenied(AdmissionDenial),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Consistency violation: {0}")]
    ConsistencyViolation(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for NurtureError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, NurtureError>;
