//! Campaign service: the single entry point the gateway and CLI talk to.
//!
//! Wires the engine components around one shared [`CampaignDb`] and adds the
//! operator-only flows: send-now, resend, unsubscribe-by-link and audit.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use nurture_core::{
    ClientMeta, Delivery, DeliveryOrigin, LeadEvent, MailTransport, NurtureConfig, NurtureError, Result,
    Sequence, SequenceDraft, SuppressionEntry, Template, TemplateDraft, TrackingEvent, normalize_email,
};

use crate::admission::{AdmissionController, DailyUsage};
use crate::dispatch::{DispatchOutcome, Dispatcher, SweepReport};
use crate::idempotency::{Claim, IdempotencyGuard};
use crate::metrics::{DailyMetrics, DeliveryMetrics, MetricsAggregator, MetricsQuery, SequenceMetrics};
use crate::persistence::{AuditEntry, CampaignDb, CatalogDeletion, DeliveryFilter, NewDelivery};
use crate::reconcile::{DuplicateGroup, DuplicateReconciler, ReconcileReport};
use crate::render::{TemplateRenderer, TrackingLinks};
use crate::suppression::{SuppressionList, UnsubscribeOutcome};
use crate::tracking::{BounceRef, TrackingIngester};
use crate::trigger::{IngestReport, TriggerEvaluator};

/// Result of an interactive send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendReport {
    pub delivery: Delivery,
    pub outcome: DispatchOutcome,
}

/// Summary plus breakdowns for one metrics window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsReport {
    pub summary: DeliveryMetrics,
    pub daily: Vec<DailyMetrics>,
    pub by_sequence: Vec<SequenceMetrics>,
}

pub struct CampaignService {
    db: Arc<CampaignDb>,
    triggers: TriggerEvaluator,
    suppression: SuppressionList,
    guard: IdempotencyGuard,
    dispatcher: Arc<Dispatcher>,
    tracking: TrackingIngester,
    metrics: MetricsAggregator,
    reconciler: DuplicateReconciler,
}

impl CampaignService {
    pub fn new(db: Arc<CampaignDb>, config: &NurtureConfig, transport: Arc<dyn MailTransport>) -> Result<Self> {
        let dispatcher = Dispatcher::new(
            db.clone(),
            AdmissionController::new(db.clone(), &config.admission),
            TemplateRenderer::new(&config.render.fallback_name),
            TrackingLinks::from_config(&config.tracking)?,
            transport,
            config.dispatcher.clone(),
        );
        Ok(Self {
            triggers: TriggerEvaluator::new(db.clone()),
            suppression: SuppressionList::new(db.clone()),
            guard: IdempotencyGuard::new(db.clone()),
            dispatcher: Arc::new(dispatcher),
            tracking: TrackingIngester::new(db.clone()),
            metrics: MetricsAggregator::new(db.clone()),
            reconciler: DuplicateReconciler::new(db.clone()),
            db,
        })
    }

    pub fn db(&self) -> &Arc<CampaignDb> {
        &self.db
    }

    /// Shared dispatcher, for spawning background workers.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    // ─── Events & dispatch ──────────────────────────────────────

    pub fn ingest_event(&self, event: &LeadEvent) -> Result<IngestReport> {
        self.triggers.ingest(event)
    }

    /// Run a single sweep in the foreground.
    pub async fn dispatch_once(&self) -> Result<SweepReport> {
        self.dispatcher.sweep("cli", Utc::now()).await
    }

    // ─── Catalog ──────────────────────────────────────

    pub fn list_sequences(&self) -> Result<Vec<Sequence>> {
        self.db.list_sequences()
    }

    pub fn get_sequence(&self, id: i64) -> Result<Sequence> {
        self.db.require_sequence(id)
    }

    pub fn create_sequence(&self, draft: &SequenceDraft) -> Result<Sequence> {
        self.db.create_sequence(draft)
    }

    pub fn update_sequence(&self, id: i64, draft: &SequenceDraft) -> Result<Sequence> {
        self.db.update_sequence(id, draft)
    }

    pub fn delete_sequence(&self, id: i64) -> Result<CatalogDeletion> {
        self.db.delete_sequence(id)
    }

    pub fn list_templates(&self, sequence_id: i64) -> Result<Vec<Template>> {
        self.db.require_sequence(sequence_id)?;
        self.db.list_templates(sequence_id)
    }

    pub fn get_template(&self, id: i64) -> Result<Template> {
        self.db.require_template(id)
    }

    pub fn create_template(&self, sequence_id: i64, draft: &TemplateDraft) -> Result<Template> {
        self.db.create_template(sequence_id, draft)
    }

    pub fn update_template(&self, id: i64, draft: &TemplateDraft) -> Result<Template> {
        self.db.update_template(id, draft)
    }

    pub fn delete_template(&self, id: i64) -> Result<CatalogDeletion> {
        self.db.delete_template(id)
    }

    // ─── Deliveries ──────────────────────────────────────

    pub fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>> {
        self.db.list_deliveries(filter)
    }

    pub fn get_delivery(&self, id: i64) -> Result<Delivery> {
        self.db.require_delivery(id)
    }

    /// Send a template to a lead right now. The idempotency guard applies:
    /// an existing live row is reported as `AlreadyExists` (use resend instead).
    pub async fn send_now(&self, lead_id: i64, template_id: i64, email: Option<&str>) -> Result<SendReport> {
        let template = self.live_template(template_id)?;
        let lead_email = match email {
            Some(raw) => normalize_email(raw)?,
            None => self
                .db
                .get_lead(lead_id)?
                .map(|lead| lead.email)
                .ok_or_else(|| NurtureError::Validation(format!("no email known for lead {lead_id}")))?,
        };
        let now = Utc::now();
        let new = NewDelivery {
            lead_id,
            lead_email: lead_email.clone(),
            sequence_id: template.sequence_id,
            template_id,
            scheduled_at: now,
            origin: DeliveryOrigin::Manual,
            resend_of: None,
        };
        let id = match self.guard.claim(&new)? {
            Claim::Claimed(id) => id,
            Claim::AlreadyExists(_) => return Err(NurtureError::AlreadyExists { lead_id, template_id }),
        };
        self.db.log_audit(
            "send_now",
            &format!("delivery:{id}"),
            Some(&format!("lead={lead_id} template={template_id} to={lead_email}")),
        )?;
        self.dispatch_interactive(id).await
    }

    /// Send an existing delivery's template again as a new `resend` row.
    pub async fn resend(&self, delivery_id: i64) -> Result<SendReport> {
        let source = self.db.require_delivery(delivery_id)?;
        if !source.status.is_terminal() {
            return Err(NurtureError::Validation(format!(
                "delivery {delivery_id} is still {}",
                source.status.as_str()
            )));
        }
        self.live_template(source.template_id)?;
        let new = NewDelivery {
            lead_id: source.lead_id,
            lead_email: source.lead_email.clone(),
            sequence_id: source.sequence_id,
            template_id: source.template_id,
            scheduled_at: Utc::now(),
            origin: DeliveryOrigin::Resend,
            resend_of: Some(source.id),
        };
        let id = self.guard.claim(&new)?.delivery_id();
        self.db.log_audit("resend", &format!("delivery:{id}"), Some(&format!("resend_of={delivery_id}")))?;
        self.dispatch_interactive(id).await
    }

    async fn dispatch_interactive(&self, id: i64) -> Result<SendReport> {
        let outcome = self.dispatcher.dispatch_now(id, Utc::now()).await?;
        match &outcome {
            DispatchOutcome::Denied { reason } => return Err(NurtureError::AdmissionDenied(*reason)),
            DispatchOutcome::Failed { error } => return Err(NurtureError::Transport(error.clone())),
            _ => {}
        }
        Ok(SendReport { delivery: self.db.require_delivery(id)?, outcome })
    }

    fn live_template(&self, template_id: i64) -> Result<Template> {
        let template = self
            .db
            .get_template(template_id)?
            .ok_or_else(|| NurtureError::Validation(format!("unknown template {template_id}")))?;
        let sequence = self.db.get_sequence(template.sequence_id)?;
        if !template.active || !sequence.is_some_and(|s| s.active) {
            return Err(NurtureError::Validation(format!("template {template_id} is not active")));
        }
        Ok(template)
    }

    // ─── Suppression ──────────────────────────────────────

    pub fn unsubscribe(&self, email: &str, reason: Option<&str>) -> Result<UnsubscribeOutcome> {
        self.suppression.unsubscribe(email, reason, Utc::now())
    }

    /// One-click opt-out from a delivery's unsubscribe link.
    pub fn unsubscribe_delivery(&self, delivery_id: i64) -> Result<UnsubscribeOutcome> {
        let delivery = self.db.require_delivery(delivery_id)?;
        self.suppression
            .unsubscribe(&delivery.lead_email, Some("unsubscribe link"), Utc::now())
    }

    pub fn resubscribe(&self, email: &str) -> Result<bool> {
        self.suppression.resubscribe(email, Utc::now())
    }

    pub fn suppression_entry(&self, email: &str) -> Result<Option<SuppressionEntry>> {
        self.suppression.entry(email)
    }

    pub fn list_unsubscribed(&self) -> Result<Vec<SuppressionEntry>> {
        self.suppression.list_unsubscribed()
    }

    // ─── Tracking ──────────────────────────────────────

    pub fn record_open(&self, delivery_id: i64, meta: &ClientMeta) -> Result<i64> {
        self.tracking.record_open(delivery_id, meta, Utc::now())
    }

    pub fn record_click(&self, delivery_id: i64, link_url: &str, meta: &ClientMeta) -> Result<i64> {
        self.tracking.record_click(delivery_id, link_url, meta, Utc::now())
    }

    pub fn record_bounce(&self, reference: &BounceRef) -> Result<Delivery> {
        self.tracking.record_bounce(reference, Utc::now())
    }

    pub fn tracking_events(&self, delivery_id: i64) -> Result<Vec<TrackingEvent>> {
        self.db.require_delivery(delivery_id)?;
        self.tracking.events_for(delivery_id)
    }

    // ─── Metrics & usage ──────────────────────────────────────

    pub fn metrics(&self, query: &MetricsQuery) -> Result<MetricsReport> {
        Ok(MetricsReport {
            summary: self.metrics.summary(query)?,
            daily: self.metrics.daily(query)?,
            by_sequence: self.metrics.by_sequence(query)?,
        })
    }

    pub fn usage(&self) -> Result<DailyUsage> {
        self.dispatcher.admission().usage(Utc::now())
    }

    // ─── Reconciliation & audit ──────────────────────────────────────

    pub fn find_duplicates(&self) -> Result<Vec<DuplicateGroup>> {
        self.reconciler.find_duplicates()
    }

    pub fn reconcile(&self, groups: &[DuplicateGroup]) -> Result<ReconcileReport> {
        self.reconciler.reconcile(groups)
    }

    pub fn reconcile_all(&self) -> Result<ReconcileReport> {
        self.reconciler.reconcile_all()
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.db.recent_audit(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, RecordingTransport, test_config};
    use nurture_core::{AdmissionDenial, DeliveryStatus, Lead, TriggerKind};

    fn service(fx: &Fixture, transport: Arc<RecordingTransport>) -> CampaignService {
        CampaignService::new(fx.db.clone(), &test_config(), transport).unwrap()
    }

    #[tokio::test]
    async fn test_send_now_then_already_exists() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let svc = service(&fx, transport.clone());

        let report = svc.send_now(3, fx.template.id, Some("Lead@X.com")).await.unwrap();
        assert!(matches!(report.outcome, DispatchOutcome::Sent { .. }));
        assert_eq!(report.delivery.origin, DeliveryOrigin::Manual);
        assert_eq!(transport.recipients(), vec!["lead@x.com"]);

        let err = svc.send_now(3, fx.template.id, Some("lead@x.com")).await.unwrap_err();
        assert!(matches!(err, NurtureError::AlreadyExists { lead_id: 3, .. }));
        assert_eq!(svc.recent_audit(5).unwrap()[0].action, "send_now");
    }

    #[tokio::test]
    async fn test_send_now_requires_known_email() {
        let fx = Fixture::new();
        let svc = service(&fx, Arc::new(RecordingTransport::default()));
        let err = svc.send_now(3, fx.template.id, None).await.unwrap_err();
        assert!(matches!(err, NurtureError::Validation(_)));

        fx.db
            .upsert_lead(&Lead { id: 3, email: "known@x.com".into(), ..Default::default() })
            .unwrap();
        let report = svc.send_now(3, fx.template.id, None).await.unwrap();
        assert_eq!(report.delivery.lead_email, "known@x.com");

        let err = svc.send_now(3, 9_999, None).await.unwrap_err();
        assert!(matches!(err, NurtureError::Validation(_)));
    }

    #[tokio::test]
    async fn test_manual_denial_is_reported_and_cancelled() {
        let fx = Fixture::new();
        let mut config = test_config();
        config.admission.recipient_daily_cap = 0;
        let svc = CampaignService::new(fx.db.clone(), &config, Arc::new(RecordingTransport::default())).unwrap();

        let err = svc.send_now(3, fx.template.id, Some("lead@x.com")).await.unwrap_err();
        assert!(matches!(err, NurtureError::AdmissionDenied(AdmissionDenial::RecipientLimitReached)));
        let rows = svc.list_deliveries(&DeliveryFilter::default()).unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Cancelled);
        assert_eq!(rows[0].error_message.as_deref(), Some("recipient_limit_reached"));
    }

    #[tokio::test]
    async fn test_resend_bypasses_guard_but_not_suppression() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let svc = service(&fx, transport.clone());
        let first = svc.send_now(3, fx.template.id, Some("lead@x.com")).await.unwrap();

        let again = svc.resend(first.delivery.id).await.unwrap();
        assert_eq!(again.delivery.origin, DeliveryOrigin::Resend);
        assert_eq!(again.delivery.resend_of, Some(first.delivery.id));
        assert_eq!(transport.sent_count(), 2);

        svc.unsubscribe("lead@x.com", Some("stop")).unwrap();
        let err = svc.resend(first.delivery.id).await.unwrap_err();
        assert!(matches!(err, NurtureError::AdmissionDenied(AdmissionDenial::Unsubscribed)));
        assert_eq!(transport.sent_count(), 2);
    }

    #[tokio::test]
    async fn test_resend_rejects_in_flight_rows() {
        let fx = Fixture::new();
        let svc = service(&fx, Arc::new(RecordingTransport::default()));
        let id = fx.insert_delivery(1, "lead@x.com", Utc::now(), DeliveryStatus::Pending);
        assert!(matches!(svc.resend(id).await, Err(NurtureError::Validation(_))));
    }

    #[tokio::test]
    async fn test_transport_failure_surfaces_to_operator() {
        let fx = Fixture::new();
        let svc = service(&fx, Arc::new(RecordingTransport::failing()));
        let err = svc.send_now(3, fx.template.id, Some("lead@x.com")).await.unwrap_err();
        assert!(matches!(err, NurtureError::Transport(_)));
        let rows = svc.list_deliveries(&DeliveryFilter::default()).unwrap();
        assert_eq!(rows[0].status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_unsubscribe_link_opts_out_recipient() {
        let fx = Fixture::new();
        let svc = service(&fx, Arc::new(RecordingTransport::default()));
        let sent = fx.insert_delivery(1, "lead@x.com", Utc::now(), DeliveryStatus::Sent);
        let outcome = svc.unsubscribe_delivery(sent).unwrap();
        assert!(outcome.newly_unsubscribed);
        let entry = svc.suppression_entry("lead@x.com").unwrap().unwrap();
        assert_eq!(entry.reason.as_deref(), Some("unsubscribe link"));
        assert!(matches!(svc.unsubscribe_delivery(404), Err(NurtureError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_event_to_metrics_round() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let svc = service(&fx, transport.clone());
        let now = Utc::now();
        svc.ingest_event(&LeadEvent::new(TriggerKind::QuizCompleted, 8, "lead@x.com", now - chrono::Duration::minutes(5)))
            .unwrap();
        let report = svc.dispatch_once().await.unwrap();
        assert_eq!(report.sent, 1);

        let delivery = svc.list_deliveries(&DeliveryFilter::default()).unwrap().remove(0);
        svc.record_open(delivery.id, &ClientMeta::default()).unwrap();
        let metrics = svc
            .metrics(&MetricsQuery::new(now - chrono::Duration::days(1), now + chrono::Duration::days(1)))
            .unwrap();
        assert_eq!(metrics.summary.sent, 1);
        assert_eq!(metrics.summary.unique_opens, 1);
        assert_eq!(metrics.by_sequence[0].sequence_id, fx.sequence.id);
        assert_eq!(svc.usage().unwrap().global_sent, 1);
    }
}
