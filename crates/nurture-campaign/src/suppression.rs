//! Suppression list: the opt-out registry consulted before every send.
//!
//! Unsubscribing is monotonic: only an explicit operator `resubscribe` flips it back.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use nurture_core::{Result, SuppressionEntry, normalize_email};

use crate::persistence::{CampaignDb, col_ts_opt, log_audit_in, ts};

/// What an unsubscribe call changed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsubscribeOutcome {
    pub email: String,
    /// False when the address was already opted out.
    pub newly_unsubscribed: bool,
    /// Pending deliveries moved to `cancelled`.
    pub cancelled: usize,
}

/// Unknown addresses count as subscribed. `email` must already be normalized.
pub(crate) fn is_subscribed_in(conn: &Connection, email: &str) -> Result<bool> {
    let flag: Option<i32> = conn
        .query_row(
            "SELECT is_subscribed FROM suppressions WHERE email = ?1",
            [email],
            |r| r.get(0),
        )
        .optional()?;
    Ok(flag.is_none_or(|f| f != 0))
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<SuppressionEntry> {
    Ok(SuppressionEntry {
        email: row.get(0)?,
        is_subscribed: row.get::<_, i32>(1)? != 0,
        unsubscribed_at: col_ts_opt(row, 2)?,
        reason: row.get(3)?,
    })
}

pub struct SuppressionList {
    db: Arc<CampaignDb>,
}

impl SuppressionList {
    pub fn new(db: Arc<CampaignDb>) -> Self {
        Self { db }
    }

    pub fn is_subscribed(&self, email: &str) -> Result<bool> {
        let email = normalize_email(email)?;
        self.db.with_conn(|conn| is_subscribed_in(conn, &email))
    }

    pub fn entry(&self, email: &str) -> Result<Option<SuppressionEntry>> {
        let email = normalize_email(email)?;
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT email, is_subscribed, unsubscribed_at, reason FROM suppressions WHERE email = ?1",
                    [&email],
                    map_entry,
                )
                .optional()?)
        })
    }

    /// Opted-out addresses, most recent first.
    pub fn list_unsubscribed(&self) -> Result<Vec<SuppressionEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT email, is_subscribed, unsubscribed_at, reason FROM suppressions
                 WHERE is_subscribed = 0 ORDER BY unsubscribed_at DESC",
            )?;
            let rows = stmt.query_map([], map_entry)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Opt an address out and cancel its pending deliveries in the same transaction.
    ///
    /// Repeating the call keeps the original timestamp and reason.
    pub fn unsubscribe(
        &self,
        email: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<UnsubscribeOutcome> {
        let email = normalize_email(email)?;
        let outcome = self.db.with_tx(|tx| {
            let newly_unsubscribed = is_subscribed_in(tx, &email)?;
            if newly_unsubscribed {
                tx.execute(
                    "INSERT INTO suppressions (email, is_subscribed, unsubscribed_at, reason, updated_at)
                     VALUES (?1, 0, ?2, ?3, ?2)
                     ON CONFLICT(email) DO UPDATE SET
                        is_subscribed = 0, unsubscribed_at = excluded.unsubscribed_at,
                        reason = excluded.reason, updated_at = excluded.updated_at",
                    params![email, ts(now), reason],
                )?;
            }
            let cancelled = tx.execute(
                "UPDATE deliveries SET status = 'cancelled', error_message = 'unsubscribed'
                 WHERE lead_email = ?1 AND status = 'pending'",
                [&email],
            )?;
            log_audit_in(
                tx,
                "unsubscribe",
                &email,
                Some(&format!("reason={} cancelled={cancelled}", reason.unwrap_or("-"))),
            )?;
            Ok(UnsubscribeOutcome { email: email.clone(), newly_unsubscribed, cancelled })
        })?;
        tracing::info!(
            "🔕 {} unsubscribed ({} pending deliveries cancelled)",
            outcome.email,
            outcome.cancelled
        );
        Ok(outcome)
    }

    /// Operator opt-in. Cancelled deliveries stay cancelled. Returns whether anything changed.
    pub fn resubscribe(&self, email: &str, now: DateTime<Utc>) -> Result<bool> {
        let email = normalize_email(email)?;
        let changed = self.db.with_tx(|tx| {
            let changed = tx.execute(
                "UPDATE suppressions SET is_subscribed = 1, unsubscribed_at = NULL, reason = NULL,
                        updated_at = ?2
                 WHERE email = ?1 AND is_subscribed = 0",
                params![email, ts(now)],
            )?;
            if changed > 0 {
                log_audit_in(tx, "resubscribe", &email, None)?;
            }
            Ok(changed > 0)
        })?;
        if changed {
            tracing::info!("🔔 {email} resubscribed");
        }
        Ok(changed)
    }
}
