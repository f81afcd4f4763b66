//! Dispatcher: claims due deliveries and drives each through the send pipeline.
//!
//! ```text
//! pending ──claim──► claimed ──transport ok──► sent
//!    ▲                  │ ──transport err──► failed (never retried)
//!    └──admission deny──┤
//!                       └──unsubscribed / duplicate / template gone──► cancelled
//! ```
//!
//! The store lock is only taken for short statements; the transport call runs
//! with nothing held. Per-key exclusivity comes from the claim predicate.
//!
//! Every update after the claim is conditional on the claim still being ours
//! (`claimed_by` and `claimed_at`). Stale-claim recovery never touches a row
//! this dispatcher is still working on, and the transport call is bounded so
//! a full batch finishes inside the claim TTL.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use nurture_core::config::DispatcherConfig;
use nurture_core::{
    AdmissionDenial, Delivery, Lead, MailTransport, NurtureError, OutboundEmail, Result, Template,
};

use crate::admission::{Admission, AdmissionController};
use crate::idempotency::IdempotencyGuard;
use crate::persistence::{CampaignDb, get_delivery_in, ts};
use crate::render::{TemplateRenderer, TrackingLinks};
use crate::suppression::SuppressionList;

/// Terminal result of processing one claimed delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Sent { transport_id: String },
    Failed { error: String },
    Cancelled { reason: String },
    /// Automatic row returned to `pending` for a later sweep.
    Deferred { reason: AdmissionDenial },
    /// Manual/resend row cancelled; the reason is for the operator.
    Denied { reason: AdmissionDenial },
    /// Row was not claimable (already claimed, not pending, or not yet due).
    Skipped,
}

/// Counts from one sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub recovered: usize,
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub deferred: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent { .. } => self.sent += 1,
            DispatchOutcome::Failed { .. } => self.failed += 1,
            DispatchOutcome::Cancelled { .. } | DispatchOutcome::Denied { .. } => self.cancelled += 1,
            DispatchOutcome::Deferred { .. } => self.deferred += 1,
            DispatchOutcome::Skipped => {}
        }
    }
}

/// Conditional claim: only a due pending row, and only if no sibling for the
/// same (lead, template) is currently claimed.
fn claim_in(conn: &Connection, id: i64, worker: &str, now: DateTime<Utc>) -> Result<bool> {
    let changed = conn.execute(
        "UPDATE deliveries SET status = 'claimed', claimed_at = ?1, claimed_by = ?2
         WHERE id = ?3 AND status = 'pending' AND scheduled_at <= ?1
           AND NOT EXISTS (
               SELECT 1 FROM deliveries other
               WHERE other.lead_id = deliveries.lead_id
                 AND other.template_id = deliveries.template_id
                 AND other.status = 'claimed'
           )",
        params![ts(now), worker, id],
    )?;
    Ok(changed == 1)
}

/// Who holds a claim, as stored on the row at claim time.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Lease {
    worker: String,
    claimed_at: String,
}

impl Lease {
    fn of(delivery: &Delivery) -> Option<Self> {
        Some(Self {
            worker: delivery.claimed_by.clone()?,
            claimed_at: ts(delivery.claimed_at?),
        })
    }
}

/// Rows this dispatcher is working on; recovery skips them.
#[derive(Default)]
struct InFlight(Mutex<HashSet<i64>>);

impl InFlight {
    fn ids(&self) -> std::sync::MutexGuard<'_, HashSet<i64>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// `None` when the row is already being worked on.
    fn enter(&self, id: i64) -> Option<InFlightEntry<'_>> {
        self.ids().insert(id).then_some(InFlightEntry { set: self, id })
    }

    fn contains(&self, id: i64) -> bool {
        self.ids().contains(&id)
    }
}

struct InFlightEntry<'a> {
    set: &'a InFlight,
    id: i64,
}

impl Drop for InFlightEntry<'_> {
    fn drop(&mut self) {
        self.set.ids().remove(&self.id);
    }
}

pub struct Dispatcher {
    db: Arc<CampaignDb>,
    suppression: SuppressionList,
    admission: AdmissionController,
    guard: IdempotencyGuard,
    renderer: TemplateRenderer,
    links: Option<TrackingLinks>,
    transport: Arc<dyn MailTransport>,
    config: DispatcherConfig,
    in_flight: InFlight,
}

impl Dispatcher {
    pub fn new(
        db: Arc<CampaignDb>,
        admission: AdmissionController,
        renderer: TemplateRenderer,
        links: Option<TrackingLinks>,
        transport: Arc<dyn MailTransport>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            suppression: SuppressionList::new(db.clone()),
            guard: IdempotencyGuard::new(db.clone()),
            db,
            admission,
            renderer,
            links,
            transport,
            config,
            in_flight: InFlight::default(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Upper bound on one transport call: a whole batch fits inside the claim TTL.
    pub fn send_timeout(&self) -> std::time::Duration {
        let per_row = self.config.claim_ttl_secs / (self.config.batch_size as u64 + 1);
        std::time::Duration::from_secs(per_row.max(1))
    }

    /// Return claims older than the TTL to `pending` (their worker died mid-dispatch).
    /// Rows this dispatcher is still processing are left alone.
    pub fn recover_stale_claims(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = ts(now - Duration::seconds(self.config.claim_ttl_secs as i64));
        let recovered = self.db.with_tx(|tx| {
            let stale: Vec<i64> = {
                let mut stmt =
                    tx.prepare("SELECT id FROM deliveries WHERE status = 'claimed' AND claimed_at < ?1")?;
                let rows = stmt.query_map([&cutoff], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let mut recovered = 0;
            for id in stale.into_iter().filter(|id| !self.in_flight.contains(*id)) {
                recovered += tx.execute(
                    "UPDATE deliveries SET status = 'pending', claimed_at = NULL, claimed_by = NULL
                     WHERE id = ?1 AND status = 'claimed' AND claimed_at < ?2",
                    params![id, cutoff],
                )?;
            }
            Ok(recovered)
        })?;
        if recovered > 0 {
            tracing::warn!("♻️ Recovered {recovered} stale claimed deliveries");
        }
        Ok(recovered)
    }

    /// Claim up to `limit` due rows, oldest schedule first.
    pub fn claim_due(&self, worker: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>> {
        self.db.with_tx(|tx| {
            let candidates: Vec<i64> = {
                let mut stmt = tx.prepare(
                    "SELECT id FROM deliveries
                     WHERE status = 'pending' AND scheduled_at <= ?1
                     ORDER BY scheduled_at, id LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![ts(now), limit as i64], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };
            let mut claimed = Vec::new();
            for id in candidates {
                if claim_in(tx, id, worker, now)?
                    && let Some(delivery) = get_delivery_in(tx, id)?
                {
                    claimed.push(delivery);
                }
            }
            Ok(claimed)
        })
    }

    /// Claim a single row by id.
    pub fn claim_one(&self, id: i64, worker: &str, now: DateTime<Utc>) -> Result<Option<Delivery>> {
        self.db.with_tx(|tx| {
            if claim_in(tx, id, worker, now)? {
                get_delivery_in(tx, id)
            } else {
                Ok(None)
            }
        })
    }

    /// Recover, claim and process one batch.
    pub async fn sweep(&self, worker: &str, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport {
            recovered: self.recover_stale_claims(now)?,
            ..Default::default()
        };
        let batch = self.claim_due(worker, now, self.config.batch_size)?;
        report.claimed = batch.len();
        let mut entries: Vec<_> = batch.iter().filter_map(|d| self.in_flight.enter(d.id)).collect();
        for delivery in batch {
            let id = delivery.id;
            let result = self.process_claimed(delivery, now).await;
            entries.retain(|entry| entry.id != id);
            match result {
                Ok(outcome) => report.record(&outcome),
                Err(e) => {
                    // row stays claimed; stale-claim recovery returns it to pending
                    tracing::error!("❌ Delivery #{id} dispatch error: {e}");
                    report.errors += 1;
                }
            }
        }
        if report.claimed > 0 {
            tracing::info!(
                "📬 [{worker}] sweep: {} claimed, {} sent, {} failed, {} cancelled, {} deferred",
                report.claimed,
                report.sent,
                report.failed,
                report.cancelled,
                report.deferred
            );
        } else {
            tracing::debug!("[{worker}] sweep: nothing due");
        }
        Ok(report)
    }

    /// Claim and process one specific row now (send-now / resend).
    pub async fn dispatch_now(&self, id: i64, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        match self.claim_one(id, "interactive", now)? {
            Some(delivery) => self.process(delivery, now).await,
            None => Ok(DispatchOutcome::Skipped),
        }
    }

    /// Drive one claimed row to its outcome. A row another call is already
    /// processing is skipped.
    pub async fn process(&self, delivery: Delivery, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let Some(_entry) = self.in_flight.enter(delivery.id) else {
            return Ok(DispatchOutcome::Skipped);
        };
        self.process_claimed(delivery, now).await
    }

    async fn process_claimed(&self, delivery: Delivery, now: DateTime<Utc>) -> Result<DispatchOutcome> {
        let Some(lease) = Lease::of(&delivery) else {
            return Ok(DispatchOutcome::Skipped);
        };
        let interactive = delivery.origin.is_interactive();

        // (a) suppression
        if !self.suppression.is_subscribed(&delivery.lead_email)? {
            self.cancel(delivery.id, &lease, AdmissionDenial::Unsubscribed.as_str())?;
            return Ok(if interactive {
                DispatchOutcome::Denied { reason: AdmissionDenial::Unsubscribed }
            } else {
                DispatchOutcome::Cancelled { reason: AdmissionDenial::Unsubscribed.to_string() }
            });
        }

        let Some(template) = self.live_template(&delivery)? else {
            let reason = "template or sequence no longer active";
            self.cancel(delivery.id, &lease, reason)?;
            return Ok(DispatchOutcome::Cancelled { reason: reason.into() });
        };

        // (b) admission
        let reservation = match self.admission.try_reserve(&delivery.lead_email, now)? {
            Admission::Allowed(reservation) => reservation,
            Admission::Denied(reason) if interactive || reason == AdmissionDenial::Unsubscribed => {
                self.cancel(delivery.id, &lease, reason.as_str())?;
                return Ok(if interactive {
                    DispatchOutcome::Denied { reason }
                } else {
                    DispatchOutcome::Cancelled { reason: reason.to_string() }
                });
            }
            Admission::Denied(reason) => {
                self.release_claim(delivery.id, &lease)?;
                tracing::debug!("⏸️ Delivery #{} deferred: {reason}", delivery.id);
                return Ok(DispatchOutcome::Deferred { reason });
            }
        };

        // (c) idempotency re-check
        if let Some(other) = self.guard.recheck(&delivery)? {
            self.admission.release(&reservation)?;
            let reason = format!("duplicate of delivery #{other}");
            tracing::warn!("⚠️ Delivery #{} cancelled: {reason}", delivery.id);
            self.cancel(delivery.id, &lease, &reason)?;
            return Ok(DispatchOutcome::Cancelled { reason });
        }

        // (d) render
        let lead = self.lead_for(&delivery)?;
        let mut extras = BTreeMap::new();
        if let Some(links) = &self.links {
            extras.insert("unsubscribe_url".to_string(), links.unsubscribe_url(delivery.id));
        }
        let rendered = self.renderer.render_with(&template, &lead, &extras);
        let html = match &self.links {
            Some(links) => links.instrument(&rendered.html, delivery.id),
            None => rendered.html,
        };
        let email = OutboundEmail {
            delivery_id: delivery.id,
            to: delivery.lead_email.clone(),
            subject: rendered.subject,
            html,
            text: rendered.text,
        };

        // the claim may have been recovered and taken by another dispatcher meanwhile
        if !self.holds(delivery.id, &lease)? {
            self.admission.release(&reservation)?;
            tracing::warn!("⚠️ Delivery #{} lost its claim before sending; skipped", delivery.id);
            return Ok(DispatchOutcome::Skipped);
        }

        // (e) transport, nothing held
        let limit = self.send_timeout();
        let sent = match tokio::time::timeout(limit, self.transport.send(&email)).await {
            Ok(result) => result,
            Err(_) => Err(NurtureError::Transport(format!("timed out after {}s", limit.as_secs()))),
        };
        match sent {
            Ok(receipt) => {
                self.mark_sent(delivery.id, &lease, now, &receipt.id, &email)?;
                tracing::info!(
                    "✅ Delivery #{} sent to {} via {} ({})",
                    delivery.id,
                    email.to,
                    self.transport.name(),
                    receipt.id
                );
                Ok(DispatchOutcome::Sent { transport_id: receipt.id })
            }
            Err(e) => {
                self.admission.release(&reservation)?;
                let error = e.to_string();
                self.mark_failed(delivery.id, &lease, &error, &email)?;
                tracing::warn!("⚠️ Delivery #{} to {} failed: {error}", delivery.id, email.to);
                Ok(DispatchOutcome::Failed { error })
            }
        }
    }

    fn live_template(&self, delivery: &Delivery) -> Result<Option<Template>> {
        let Some(template) = self.db.get_template(delivery.template_id)? else {
            return Ok(None);
        };
        if !template.active {
            return Ok(None);
        }
        Ok(self
            .db
            .get_sequence(template.sequence_id)?
            .filter(|s| s.active)
            .map(|_| template))
    }

    /// Latest profile snapshot; the delivery's own email always wins.
    fn lead_for(&self, delivery: &Delivery) -> Result<Lead> {
        let mut lead = self.db.get_lead(delivery.lead_id)?.unwrap_or_default();
        lead.id = delivery.lead_id;
        lead.email = delivery.lead_email.clone();
        Ok(lead)
    }

    fn holds(&self, id: i64, lease: &Lease) -> Result<bool> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM deliveries
                 WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2 AND claimed_at = ?3",
                params![id, lease.worker, lease.claimed_at],
                |r| r.get(0),
            )?;
            Ok(n == 1)
        })
    }

    fn cancel(&self, id: i64, lease: &Lease, reason: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE deliveries SET status = 'cancelled', error_message = ?1
                 WHERE id = ?2 AND status = 'claimed' AND claimed_by = ?3 AND claimed_at = ?4",
                params![reason, id, lease.worker, lease.claimed_at],
            )?;
            Ok(())
        })
    }

    fn release_claim(&self, id: i64, lease: &Lease) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE deliveries SET status = 'pending', claimed_at = NULL, claimed_by = NULL
                 WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2 AND claimed_at = ?3",
                params![id, lease.worker, lease.claimed_at],
            )?;
            Ok(())
        })
    }

    fn mark_sent(
        &self,
        id: i64,
        lease: &Lease,
        now: DateTime<Utc>,
        transport_id: &str,
        email: &OutboundEmail,
    ) -> Result<()> {
        let changed = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE deliveries SET status = 'sent', sent_at = ?1, transport_id = ?2,
                        subject = ?3, html = ?4, error_message = NULL
                 WHERE id = ?5 AND status = 'claimed' AND claimed_by = ?6 AND claimed_at = ?7",
                params![ts(now), transport_id, email.subject, email.html, id, lease.worker, lease.claimed_at],
            )?)
        })?;
        if changed == 0 {
            tracing::warn!("⚠️ Delivery #{id} was sent but its claim moved on; status left unchanged");
        }
        Ok(())
    }

    fn mark_failed(&self, id: i64, lease: &Lease, error: &str, email: &OutboundEmail) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE deliveries SET status = 'failed', error_message = ?1, subject = ?2, html = ?3
                 WHERE id = ?4 AND status = 'claimed' AND claimed_by = ?5 AND claimed_at = ?6",
                params![error, email.subject, email.html, id, lease.worker, lease.claimed_at],
            )?;
            Ok(())
        })
    }
}

/// Worker loop: sweep every `poll_interval_secs` until `shutdown` flips to true.
pub async fn run_worker(dispatcher: Arc<Dispatcher>, worker: String, mut shutdown: watch::Receiver<bool>) {
    let every = std::time::Duration::from_secs(dispatcher.config.poll_interval_secs.max(1));
    tracing::info!("⏰ Dispatcher worker {worker} started (every {}s)", every.as_secs());
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = dispatcher.sweep(&worker, Utc::now()).await {
                    tracing::error!("❌ [{worker}] sweep failed: {e}");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("🛑 Dispatcher worker {worker} stopped");
}

/// Spawn `config.workers` sweep loops sharing one dispatcher.
pub fn spawn_dispatcher(dispatcher: Arc<Dispatcher>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
    (0..dispatcher.config.workers)
        .map(|n| {
            let short = uuid::Uuid::new_v4().simple().to_string();
            let worker = format!("worker-{n}-{}", &short[..8]);
            tokio::spawn(run_worker(dispatcher.clone(), worker, shutdown.clone()))
        })
        .collect()
}

/// Wait for every worker to exit.
pub async fn join_workers(handles: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            tracing::error!("❌ Dispatcher worker panicked: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Fixture, RecordingTransport, test_config};
    use crate::trigger::TriggerEvaluator;
    use chrono::TimeZone;
    use nurture_core::config::AdmissionConfig;
    use nurture_core::{DeliveryStatus, LeadEvent, TriggerKind};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap()
    }

    fn dispatcher(fx: &Fixture, transport: Arc<RecordingTransport>, global: u32, recipient: u32) -> Dispatcher {
        let config = test_config();
        Dispatcher::new(
            fx.db.clone(),
            AdmissionController::new(
                fx.db.clone(),
                &AdmissionConfig { global_daily_cap: global, recipient_daily_cap: recipient },
            ),
            TemplateRenderer::default(),
            TrackingLinks::from_config(&config.tracking).unwrap(),
            transport,
            config.dispatcher,
        )
    }

    #[tokio::test]
    async fn test_duplicate_webhook_sends_once() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let evaluator = TriggerEvaluator::new(fx.db.clone());
        let event = LeadEvent::new(TriggerKind::QuizCompleted, 1, "lead@x.com", noon());
        evaluator.ingest(&event).unwrap();
        evaluator.ingest(&event).unwrap();

        let d = dispatcher(&fx, transport.clone(), 100, 3);
        let report = d.sweep("w1", noon()).await.unwrap();
        d.sweep("w1", noon()).await.unwrap();

        assert_eq!(report.sent, 1);
        assert_eq!(transport.sent_count(), 1);
        let sent = fx.db.list_deliveries(&crate::DeliveryFilter {
            status: Some(DeliveryStatus::Sent),
            ..Default::default()
        });
        assert_eq!(sent.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sent_row_is_rendered_and_instrumented() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let mut lead = Lead { id: 1, email: "lead@x.com".into(), name: Some("Ana".into()), ..Default::default() };
        lead.attributes.insert("goal".into(), "strength".into());
        fx.db.upsert_lead(&lead).unwrap();
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);

        let outcome = dispatcher(&fx, transport.clone(), 100, 3).dispatch_now(id, noon()).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Sent { transport_id: "msg-1".into() });

        let email = transport.sent.lock().unwrap()[0].clone();
        assert_eq!(email.subject, "day-0 for Ana");
        assert!(email.html.contains(&format!("https://t.example.com/t/click/{id}?url=")));
        assert!(email.html.contains(&format!("https://t.example.com/t/open/{id}")));

        let row = fx.db.require_delivery(id).unwrap();
        assert_eq!(row.status, DeliveryStatus::Sent);
        assert_eq!(row.sent_at, Some(noon()));
        assert_eq!(row.transport_id.as_deref(), Some("msg-1"));
        assert_eq!(row.subject.as_deref(), Some("day-0 for Ana"));
    }

    #[tokio::test]
    async fn test_global_cap_defers_without_sending() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        for lead in 100..102 {
            fx.insert_delivery(lead, &format!("l{lead}@x.com"), noon(), DeliveryStatus::Sent);
        }
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);

        let report = dispatcher(&fx, transport.clone(), 2, 3).sweep("w1", noon()).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(transport.sent_count(), 0);
        let row = fx.db.require_delivery(id).unwrap();
        assert_eq!(row.status, DeliveryStatus::Pending);
        assert!(row.claimed_by.is_none());
    }

    #[tokio::test]
    async fn test_recipient_cap_holds_fourth_until_next_day() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let mut ids = Vec::new();
        for n in 0..4 {
            let template = fx
                .db
                .create_template(fx.sequence.id, &crate::testing::template_draft(&format!("t{n}"), 0, 0))
                .unwrap();
            ids.push(fx.insert_delivery_for(template.id, 1, "lead@x.com", noon(), DeliveryStatus::Pending));
        }

        let d = dispatcher(&fx, transport.clone(), 100, 3);
        let report = d.sweep("w1", noon()).await.unwrap();
        assert_eq!(report.sent, 3);
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.db.require_delivery(ids[3]).unwrap().status, DeliveryStatus::Pending);

        // still blocked later the same day
        d.sweep("w1", noon() + Duration::hours(11)).await.unwrap();
        assert_eq!(transport.sent_count(), 3);

        d.sweep("w1", noon() + Duration::hours(13)).await.unwrap();
        assert_eq!(transport.sent_count(), 4);
        assert_eq!(fx.db.require_delivery(ids[3]).unwrap().status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_unsubscribe_between_sends_cancels_later_delivery() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let later = fx
            .db
            .create_template(fx.sequence.id, &crate::testing::template_draft("day-2", 2, 0))
            .unwrap();
        TriggerEvaluator::new(fx.db.clone())
            .ingest(&LeadEvent::new(TriggerKind::QuizCompleted, 1, "lead@x.com", noon()))
            .unwrap();

        let d = dispatcher(&fx, transport.clone(), 100, 3);
        d.sweep("w1", noon()).await.unwrap();
        SuppressionList::new(fx.db.clone())
            .unsubscribe("lead@x.com", Some("clicked unsubscribe"), noon() + Duration::days(1))
            .unwrap();
        d.sweep("w1", noon() + Duration::days(2)).await.unwrap();

        assert_eq!(transport.sent_count(), 1);
        let rows = fx.db.list_deliveries(&crate::DeliveryFilter {
            template_id: Some(later.id),
            ..Default::default()
        });
        assert_eq!(rows.unwrap()[0].status, DeliveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_suppression_checked_after_claim() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let d = dispatcher(&fx, transport.clone(), 100, 3);
        let claimed = d.claim_one(id, "w1", noon()).unwrap().unwrap();

        // unsubscribe lands while the row is claimed; only pending rows are swept by it
        SuppressionList::new(fx.db.clone()).unsubscribe("lead@x.com", None, noon()).unwrap();
        let outcome = d.process(claimed, noon()).await.unwrap();

        assert!(matches!(outcome, DispatchOutcome::Cancelled { .. }));
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(fx.db.require_delivery(id).unwrap().status, DeliveryStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_transport_failure_is_terminal_and_releases_budget() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::failing());
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let d = dispatcher(&fx, transport.clone(), 100, 3);

        let report = d.sweep("w1", noon()).await.unwrap();
        assert_eq!(report.failed, 1);
        let row = fx.db.require_delivery(id).unwrap();
        assert_eq!(row.status, DeliveryStatus::Failed);
        assert!(row.error_message.unwrap().contains("provider rejected"));
        assert_eq!(d.admission().usage(noon()).unwrap().global_sent, 0);

        // never retried
        transport.fail.store(false, std::sync::atomic::Ordering::SeqCst);
        d.sweep("w1", noon()).await.unwrap();
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_future_rows_are_not_claimed() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        fx.insert_delivery(1, "lead@x.com", noon() + Duration::minutes(1), DeliveryStatus::Pending);
        let report = dispatcher(&fx, transport, 100, 3).sweep("w1", noon()).await.unwrap();
        assert_eq!(report.claimed, 0);
    }

    #[tokio::test]
    async fn test_claim_excludes_sibling_in_flight() {
        let fx = Fixture::new();
        fx.drop_idempotency_index();
        let first = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let second = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let d = dispatcher(&fx, Arc::new(RecordingTransport::default()), 100, 3);

        let claimed = d.claim_due("w1", noon(), 10).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, first);
        assert!(d.claim_one(second, "w2", noon()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_claims_are_recovered() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let d = dispatcher(&fx, transport.clone(), 100, 3);
        d.claim_one(id, "crashed", noon()).unwrap().unwrap();

        let ttl = d.config().claim_ttl_secs as i64;
        let report = d.sweep("w1", noon() + Duration::seconds(ttl + 1)).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.sent, 1);
        assert_eq!(transport.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_claim_still_sending_is_not_recovered() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::slow(300));
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let d = Arc::new(dispatcher(&fx, transport.clone(), 100, 3));
        let claimed = d.claim_one(id, "w1", noon()).unwrap().unwrap();

        let first = tokio::spawn({
            let d = d.clone();
            async move { d.process(claimed, noon()).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let ttl = d.config().claim_ttl_secs as i64;
        let report = d.sweep("w2", noon() + Duration::seconds(ttl + 1)).await.unwrap();
        assert_eq!(report.recovered, 0);
        assert_eq!(report.sent, 0);

        let outcome = first.await.unwrap().unwrap();
        assert_eq!(outcome, DispatchOutcome::Sent { transport_id: "msg-1".into() });
        assert_eq!(transport.attempts(), 1);
        assert_eq!(fx.db.require_delivery(id).unwrap().status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn test_lost_claim_is_not_sent() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let d = dispatcher(&fx, transport.clone(), 100, 3);
        let stale = d.claim_one(id, "w1", noon()).unwrap().unwrap();

        let later = noon() + Duration::seconds(d.config().claim_ttl_secs as i64 + 1);
        assert_eq!(d.recover_stale_claims(later).unwrap(), 1);
        let current = d.claim_one(id, "w2", later).unwrap().unwrap();

        assert_eq!(d.process(stale, later).await.unwrap(), DispatchOutcome::Skipped);
        assert_eq!(transport.attempts(), 0);
        let row = fx.db.require_delivery(id).unwrap();
        assert_eq!(row.status, DeliveryStatus::Claimed);
        assert_eq!(row.claimed_by.as_deref(), Some("w2"));

        let outcome = d.process(current, later).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::Sent { transport_id: "msg-1".into() });
        assert_eq!(transport.sent_count(), 1);
        // the reservation released by the skipped attempt is not double counted
        assert_eq!(d.admission().usage(later).unwrap().global_sent, 1);
    }

    #[tokio::test]
    async fn test_stalled_transport_times_out_inside_claim_ttl() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::slow(1500));
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let mut config = test_config();
        config.dispatcher.claim_ttl_secs = 2;
        config.dispatcher.batch_size = 1;
        let d = Dispatcher::new(
            fx.db.clone(),
            AdmissionController::new(
                fx.db.clone(),
                &AdmissionConfig { global_daily_cap: 100, recipient_daily_cap: 3 },
            ),
            TemplateRenderer::default(),
            TrackingLinks::from_config(&config.tracking).unwrap(),
            transport.clone(),
            config.dispatcher,
        );
        assert_eq!(d.send_timeout(), std::time::Duration::from_secs(1));

        let outcome = d.dispatch_now(id, noon()).await.unwrap();
        let DispatchOutcome::Failed { error } = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert!(error.contains("timed out"), "{error}");
        assert_eq!(transport.sent_count(), 0);
        assert_eq!(fx.db.require_delivery(id).unwrap().status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn test_deleted_template_cancels_row() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        let id = fx.insert_delivery(1, "lead@x.com", noon(), DeliveryStatus::Pending);
        let mut draft = crate::testing::template_draft("day-0", 0, 0);
        draft.active = false;
        fx.db.update_template(fx.template.id, &draft).unwrap();

        let outcome = dispatcher(&fx, transport.clone(), 100, 3).dispatch_now(id, noon()).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Cancelled { .. }));
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let fx = Fixture::new();
        let transport = Arc::new(RecordingTransport::default());
        fx.insert_delivery(1, "lead@x.com", Utc::now() - Duration::minutes(1), DeliveryStatus::Pending);
        let d = Arc::new(dispatcher(&fx, transport.clone(), 100, 3));

        let (tx, rx) = watch::channel(false);
        let handles = spawn_dispatcher(d, rx);
        assert_eq!(handles.len(), 2);
        // the first interval tick fires immediately
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        join_workers(handles).await;
        assert_eq!(transport.sent_count(), 1);
    }
}
