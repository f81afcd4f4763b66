//! # Nurture Core
//!
//! Shared building blocks for the lead engagement campaign engine:
//! configuration, the error taxonomy, domain types and the
//! [`MailTransport`](traits::MailTransport) seam that the dispatcher calls.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::NurtureConfig;
pub use error::{AdmissionDenial, NurtureError, Result};
pub use traits::{MailTransport, OutboundEmail, TransportReceipt};
pub use types::*;
