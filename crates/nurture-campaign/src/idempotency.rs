//! Delivery idempotency guard.
//!
//! At most one non-failed, non-resend delivery may exist per (lead, template).
//! Creation goes through insert-if-absent inside a write transaction; the
//! dispatcher re-checks right before the transport call.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::sync::Arc;

use nurture_core::{Delivery, DeliveryOrigin, Result};

use crate::persistence::{CampaignDb, NewDelivery, insert_delivery_in};

/// Result of asking the guard for a (lead, template) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// A new row was created with this id.
    Claimed(i64),
    /// A live row already holds the slot.
    AlreadyExists(i64),
}

impl Claim {
    pub fn delivery_id(&self) -> i64 {
        match self {
            Self::Claimed(id) | Self::AlreadyExists(id) => *id,
        }
    }
}

/// Live (non-failed, non-resend) row holding the slot, if any.
pub(crate) fn live_delivery_in(conn: &Connection, lead_id: i64, template_id: i64) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM deliveries
             WHERE lead_id = ?1 AND template_id = ?2
               AND status <> 'failed' AND origin <> 'resend'
             ORDER BY id LIMIT 1",
            params![lead_id, template_id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Insert a pending row unless the slot is taken. Resend rows bypass the guard.
pub(crate) fn insert_if_absent_in(conn: &Connection, new: &NewDelivery, now: DateTime<Utc>) -> Result<Claim> {
    if new.origin != DeliveryOrigin::Resend
        && let Some(existing) = live_delivery_in(conn, new.lead_id, new.template_id)?
    {
        return Ok(Claim::AlreadyExists(existing));
    }
    match insert_delivery_in(conn, new, now) {
        Ok(id) => Ok(Claim::Claimed(id)),
        Err(nurture_core::NurtureError::Database(rusqlite::Error::SqliteFailure(err, _)))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            let existing = live_delivery_in(conn, new.lead_id, new.template_id)?.unwrap_or_default();
            Ok(Claim::AlreadyExists(existing))
        }
        Err(e) => Err(e),
    }
}

/// Another row for the same key that is already sent or in flight.
pub(crate) fn conflicting_send_in(conn: &Connection, delivery: &Delivery) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT id FROM deliveries
             WHERE lead_id = ?1 AND template_id = ?2 AND id <> ?3
               AND origin <> 'resend' AND status IN ('sent', 'claimed')
             ORDER BY id LIMIT 1",
            params![delivery.lead_id, delivery.template_id, delivery.id],
            |r| r.get(0),
        )
        .optional()?)
}

/// Standalone entry points onto the guard.
pub struct IdempotencyGuard {
    db: Arc<CampaignDb>,
}

impl IdempotencyGuard {
    pub fn new(db: Arc<CampaignDb>) -> Self {
        Self { db }
    }

    /// Create a pending row for the key, or report the row that already holds it.
    pub fn claim(&self, new: &NewDelivery) -> Result<Claim> {
        let now = Utc::now();
        self.db.with_tx(|tx| insert_if_absent_in(tx, new, now))
    }

    /// The live row for a key, if any.
    pub fn holder(&self, lead_id: i64, template_id: i64) -> Result<Option<i64>> {
        self.db.with_conn(|conn| live_delivery_in(conn, lead_id, template_id))
    }

    /// Pre-send re-check; `Some(id)` means another row already sent (or is sending) this key.
    pub fn recheck(&self, delivery: &Delivery) -> Result<Option<i64>> {
        if delivery.origin == DeliveryOrigin::Resend {
            return Ok(None);
        }
        self.db.with_conn(|conn| conflicting_send_in(conn, delivery))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use nurture_core::DeliveryStatus;

    fn new_delivery(fx: &Fixture, origin: DeliveryOrigin) -> NewDelivery {
        NewDelivery {
            lead_id: 7,
            lead_email: "lead@x.com".into(),
            sequence_id: fx.sequence.id,
            template_id: fx.template.id,
            scheduled_at: Utc::now(),
            origin,
            resend_of: None,
        }
    }

    #[test]
    fn test_second_claim_reports_existing() {
        let fx = Fixture::new();
        let guard = IdempotencyGuard::new(fx.db.clone());
        let first = guard.claim(&new_delivery(&fx, DeliveryOrigin::Automatic)).unwrap();
        let second = guard.claim(&new_delivery(&fx, DeliveryOrigin::Automatic)).unwrap();
        assert!(matches!(first, Claim::Claimed(_)));
        assert_eq!(second, Claim::AlreadyExists(first.delivery_id()));
    }

    #[test]
    fn test_manual_origin_is_guarded_too() {
        let fx = Fixture::new();
        let guard = IdempotencyGuard::new(fx.db.clone());
        guard.claim(&new_delivery(&fx, DeliveryOrigin::Automatic)).unwrap();
        let manual = guard.claim(&new_delivery(&fx, DeliveryOrigin::Manual)).unwrap();
        assert!(matches!(manual, Claim::AlreadyExists(_)));
    }

    #[test]
    fn test_failed_row_frees_the_slot() {
        let fx = Fixture::new();
        let guard = IdempotencyGuard::new(fx.db.clone());
        fx.insert_delivery(7, "lead@x.com", Utc::now(), DeliveryStatus::Failed);
        let claim = guard.claim(&new_delivery(&fx, DeliveryOrigin::Automatic)).unwrap();
        assert!(matches!(claim, Claim::Claimed(_)));
    }

    #[test]
    fn test_resend_bypasses_guard() {
        let fx = Fixture::new();
        let guard = IdempotencyGuard::new(fx.db.clone());
        let sent = fx.insert_delivery(7, "lead@x.com", Utc::now(), DeliveryStatus::Sent);
        let mut resend = new_delivery(&fx, DeliveryOrigin::Resend);
        resend.resend_of = Some(sent);
        let claim = guard.claim(&resend).unwrap();
        assert!(matches!(claim, Claim::Claimed(id) if id != sent));

        let row = fx.db.require_delivery(claim.delivery_id()).unwrap();
        assert_eq!(guard.recheck(&row).unwrap(), None);
    }

    #[test]
    fn test_recheck_sees_sent_sibling() {
        let fx = Fixture::new();
        fx.drop_idempotency_index();
        let sent = fx.insert_delivery(7, "lead@x.com", Utc::now(), DeliveryStatus::Sent);
        let pending = fx.insert_delivery(7, "lead@x.com", Utc::now(), DeliveryStatus::Pending);
        let guard = IdempotencyGuard::new(fx.db.clone());
        let row = fx.db.require_delivery(pending).unwrap();
        assert_eq!(guard.recheck(&row).unwrap(), Some(sent));
    }
}
