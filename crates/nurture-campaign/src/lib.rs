//! # Nurture Campaign Engine
//!
//! Turns lead events into scheduled email deliveries and sends them without
//! duplicates, inside daily budgets, and never to an unsubscribed recipient.
//!
//! ## Architecture
//! ```text
//! LeadEvent ──► TriggerEvaluator ──► IdempotencyGuard ──► deliveries (pending)
//!
//! Dispatcher workers (tokio interval)
//!   ├── recover stale claims
//!   ├── claim due rows (conditional UPDATE)
//!   └── per row: suppression → admission reserve → idempotency re-check
//!                → render + instrument → MailTransport → sent | failed
//!
//! Tracking endpoints ──► TrackingIngester ──► tracking_events
//! MetricsAggregator / DuplicateReconciler read and clean the store
//! ```
//!
//! All state lives in one SQLite file ([`CampaignDb`]); every shared counter or
//! status change happens inside a transaction or a conditional update.

pub mod admission;
pub mod dispatch;
pub mod idempotency;
pub mod metrics;
pub mod operator;
pub mod persistence;
pub mod reconcile;
pub mod render;
pub mod suppression;
pub mod tracking;
pub mod trigger;

#[cfg(test)]
pub(crate) mod testing;

pub use admission::{Admission, AdmissionController, DailyUsage, Reservation};
pub use dispatch::{DispatchOutcome, Dispatcher, SweepReport, join_workers, spawn_dispatcher};
pub use idempotency::{Claim, IdempotencyGuard};
pub use metrics::{DailyMetrics, DeliveryMetrics, MetricsAggregator, MetricsQuery, SequenceMetrics};
pub use operator::{CampaignService, MetricsReport, SendReport};
pub use persistence::{AuditEntry, CampaignDb, CatalogDeletion, DeliveryFilter, NewDelivery};
pub use reconcile::{DuplicateGroup, DuplicateReconciler, DuplicateRow, ReconcileReport};
pub use render::{RenderedEmail, TemplateRenderer, TrackingLinks};
pub use suppression::{SuppressionList, UnsubscribeOutcome};
pub use tracking::{BounceRef, TrackingIngester};
pub use trigger::{IngestReport, Obligation, TriggerEvaluator};
