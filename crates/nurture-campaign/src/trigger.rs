//! Trigger evaluator: turns a lead event into pending deliveries.
//!
//! ## Flow
//! ```text
//! LeadEvent
//!   → validate + normalize email, snapshot lead profile
//!   → evaluate(event): active sequences for the kind (priority desc)
//!       → threshold check (days_without_conversion)
//!       → one Obligation per active template (position asc)
//!   → one write transaction:
//!       suppressed recipient → nothing
//!       else insert-if-absent per obligation
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use nurture_core::{DeliveryOrigin, LeadEvent, Result, Sequence, TriggerKind};

use crate::idempotency::{Claim, insert_if_absent_in};
use crate::persistence::{CampaignDb, NewDelivery};
use crate::suppression::is_subscribed_in;

/// A delivery the event asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Obligation {
    pub sequence_id: i64,
    pub template_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
    pub position: i32,
}

/// What ingesting one event did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestReport {
    pub lead_id: i64,
    pub email: String,
    pub obligations: usize,
    /// Ids of newly created pending deliveries.
    pub created: Vec<i64>,
    /// Ids of rows that already held the (lead, template) slot.
    pub existing: Vec<i64>,
    /// Recipient is unsubscribed; no rows were created.
    pub suppressed: bool,
}

pub struct TriggerEvaluator {
    db: Arc<CampaignDb>,
}

impl TriggerEvaluator {
    pub fn new(db: Arc<CampaignDb>) -> Self {
        Self { db }
    }

    /// Whether an (active) sequence fires for this event.
    pub fn matches(sequence: &Sequence, event: &LeadEvent) -> bool {
        if !sequence.active || sequence.trigger_kind != event.kind {
            return false;
        }
        match sequence.trigger_kind {
            TriggerKind::DaysWithoutConversion => match (sequence.trigger_days, event.days_since_conversion) {
                (Some(threshold), Some(days)) => days >= threshold,
                _ => false,
            },
            _ => true,
        }
    }

    /// Obligations for an event, by sequence priority then template position. Read-only.
    pub fn evaluate(&self, event: &LeadEvent) -> Result<Vec<Obligation>> {
        let mut obligations = Vec::new();
        for sequence in self.db.active_sequences_for(event.kind)? {
            if !Self::matches(&sequence, event) {
                continue;
            }
            for template in self.db.list_templates(sequence.id)? {
                if !template.active {
                    continue;
                }
                obligations.push(Obligation {
                    sequence_id: sequence.id,
                    template_id: template.id,
                    scheduled_at: template.scheduled_at(event.occurred_at)?,
                    priority: sequence.priority,
                    position: template.position,
                });
            }
        }
        Ok(obligations)
    }

    /// Validate the event and create any pending deliveries it obliges.
    ///
    /// Replaying the same event is a no-op for slots that are already held.
    pub fn ingest(&self, event: &LeadEvent) -> Result<IngestReport> {
        let lead = event.lead()?;
        self.db.upsert_lead(&lead)?;
        let obligations = self.evaluate(event)?;
        let now = Utc::now();

        let mut report = IngestReport {
            lead_id: lead.id,
            email: lead.email.clone(),
            obligations: obligations.len(),
            ..Default::default()
        };
        if obligations.is_empty() {
            tracing::debug!("📭 {} event for lead {}: no matching sequences", event.kind.as_str(), lead.id);
            return Ok(report);
        }

        self.db.with_tx(|tx| {
            if !is_subscribed_in(tx, &lead.email)? {
                report.suppressed = true;
                return Ok(());
            }
            for obligation in &obligations {
                let new = NewDelivery {
                    lead_id: lead.id,
                    lead_email: lead.email.clone(),
                    sequence_id: obligation.sequence_id,
                    template_id: obligation.template_id,
                    scheduled_at: obligation.scheduled_at,
                    origin: DeliveryOrigin::Automatic,
                    resend_of: None,
                };
                match insert_if_absent_in(tx, &new, now)? {
                    Claim::Claimed(id) => report.created.push(id),
                    Claim::AlreadyExists(id) => report.existing.push(id),
                }
            }
            Ok(())
        })?;

        if report.suppressed {
            tracing::info!("🔕 {} event for unsubscribed {}: nothing scheduled", event.kind.as_str(), lead.email);
        } else {
            tracing::info!(
                "📨 {} event for lead {}: {} scheduled, {} already present",
                event.kind.as_str(),
                lead.id,
                report.created.len(),
                report.existing.len()
            );
        }
        Ok(report)
    }
}
