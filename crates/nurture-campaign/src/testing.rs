//! Test fixtures shared by the engine's unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use nurture_core::{
    DeliveryOrigin, DeliveryStatus, MailTransport, NurtureConfig, NurtureError, OutboundEmail,
    Result, Sequence, SequenceDraft, Template, TemplateDraft, TransportReceipt, TriggerKind,
};

use crate::persistence::{CampaignDb, NewDelivery, insert_delivery_in, ts};

pub fn sequence_draft(name: &str, kind: TriggerKind) -> SequenceDraft {
    SequenceDraft {
        name: name.into(),
        trigger_kind: kind,
        trigger_days: (kind == TriggerKind::DaysWithoutConversion).then_some(7),
        active: true,
        priority: 0,
    }
}

pub fn template_draft(name: &str, delay_days: u32, delay_hours: u32) -> TemplateDraft {
    TemplateDraft {
        name: name.into(),
        subject: format!("{name} for {{{{name}}}}"),
        html_body: format!(
            "<html><body><p>Hi {{{{name}}}}, {name}</p><a href=\"https://coach.example.com/plan\">plan</a></body></html>"
        ),
        text_body: Some(format!("Hi {{{{name}}}}, {name}")),
        delay_days,
        delay_hours,
        position: 0,
        active: true,
    }
}

/// In-memory database seeded with one `quiz_completed` sequence and one immediate template.
pub struct Fixture {
    pub db: Arc<CampaignDb>,
    pub sequence: Sequence,
    pub template: Template,
}

impl Fixture {
    pub fn new() -> Self {
        let db = Arc::new(CampaignDb::open_in_memory().unwrap());
        let sequence = db
            .create_sequence(&sequence_draft("welcome", TriggerKind::QuizCompleted))
            .unwrap();
        let template = db.create_template(sequence.id, &template_draft("day-0", 0, 0)).unwrap();
        Self { db, sequence, template }
    }

    /// Insert a row for the fixture template directly, bypassing the guard.
    /// `sent` rows get `sent_at = scheduled_at`.
    pub fn insert_delivery(
        &self,
        lead_id: i64,
        email: &str,
        scheduled_at: DateTime<Utc>,
        status: DeliveryStatus,
    ) -> i64 {
        self.insert_delivery_for(self.template.id, lead_id, email, scheduled_at, status)
    }

    pub fn insert_delivery_for(
        &self,
        template_id: i64,
        lead_id: i64,
        email: &str,
        scheduled_at: DateTime<Utc>,
        status: DeliveryStatus,
    ) -> i64 {
        let new = NewDelivery {
            lead_id,
            lead_email: email.into(),
            sequence_id: self.sequence.id,
            template_id,
            scheduled_at,
            origin: DeliveryOrigin::Automatic,
            resend_of: None,
        };
        self.db
            .with_conn(|conn| {
                let id = insert_delivery_in(conn, &new, scheduled_at)?;
                let sent_at = (status == DeliveryStatus::Sent).then(|| ts(scheduled_at));
                conn.execute(
                    "UPDATE deliveries SET status = ?1, sent_at = ?2 WHERE id = ?3",
                    params![status.as_str(), sent_at, id],
                )?;
                Ok(id)
            })
            .unwrap()
    }

    /// Simulate a database from before the unique index existed.
    pub fn drop_idempotency_index(&self) {
        self.db
            .with_conn(|conn| {
                conn.execute_batch("DROP INDEX IF EXISTS uq_deliveries_lead_template;")?;
                Ok(())
            })
            .unwrap();
    }

    /// Override `created_at` to build deterministic histories.
    pub fn set_created_at(&self, delivery_id: i64, at: DateTime<Utc>) {
        self.db
            .with_conn(|conn| {
                conn.execute(
                    "UPDATE deliveries SET created_at = ?1 WHERE id = ?2",
                    params![ts(at), delivery_id],
                )?;
                Ok(())
            })
            .unwrap();
    }
}

pub fn test_config() -> NurtureConfig {
    let mut config = NurtureConfig::default();
    config.tracking.enabled = true;
    config.tracking.base_url = "https://t.example.com".into();
    config
}

/// Transport that records every email and can be switched to fail or to stall.
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutboundEmail>>,
    pub fail: AtomicBool,
    /// Sleep this long before accepting each message.
    pub delay_ms: AtomicU64,
    attempts: AtomicUsize,
    counter: AtomicUsize,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        let transport = Self::default();
        transport.fail.store(true, Ordering::SeqCst);
        transport
    }

    pub fn slow(delay_ms: u64) -> Self {
        let transport = Self::default();
        transport.delay_ms.store(delay_ms, Ordering::SeqCst);
        transport
    }

    /// Calls to `send`, including ones that failed or never finished.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn recipients(&self) -> Vec<String> {
        self.sent.lock().unwrap().iter().map(|e| e.to.clone()).collect()
    }
}

#[async_trait]
impl MailTransport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<TransportReceipt> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(NurtureError::Transport("provider rejected message".into()));
        }
        self.sent.lock().unwrap().push(email.clone());
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TransportReceipt { id: format!("msg-{n}") })
    }
}
