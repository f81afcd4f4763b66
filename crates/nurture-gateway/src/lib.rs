//! # Nurture Gateway
//!
//! Axum server exposing the campaign service:
//! - `/api/v1/*`: lead events, catalog CRUD, deliveries, suppressions,
//!   reconciliation, metrics, usage and audit
//! - `/t/*`: open pixel, click redirect and one-click unsubscribe
//! - `/api/v1/webhooks/bounce`: provider bounce notifications

pub mod error;
pub mod routes;
pub mod server;
pub mod tracking;

pub use error::{ApiError, ApiResult};
pub use server::{AppState, build_router, start};
