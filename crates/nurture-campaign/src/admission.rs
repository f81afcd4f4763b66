//! Admission control: per-day send budgets, global and per recipient.
//!
//! A reservation is an atomic increment of two counter rows in `daily_usage`
//! (scope `*` and `rcpt:<email>`), checked and written inside one immediate
//! transaction so concurrent workers can never overshoot a cap. A reservation
//! whose send fails at the transport is released again.
//!
//! Rows already marked `sent` for the day also count, so deliveries recorded
//! without going through a reservation still consume budget.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use nurture_core::config::AdmissionConfig;
use nurture_core::{AdmissionDenial, Result};

use crate::persistence::{CampaignDb, day_key, ts};
use crate::suppression::is_subscribed_in;

const GLOBAL_SCOPE: &str = "*";

fn recipient_scope(email: &str) -> String {
    format!("rcpt:{email}")
}

/// Budget held for one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub day: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed(Reservation),
    Denied(AdmissionDenial),
}

/// Counter snapshot for one day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyUsage {
    pub day: String,
    pub global_sent: u32,
    pub global_cap: u32,
    pub recipient_cap: u32,
    /// Recipients with at least one send that day, highest first.
    pub recipients: Vec<(String, u32)>,
}

fn day_bounds(now: DateTime<Utc>) -> (String, String) {
    let start = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    (ts(start), ts(start + Duration::days(1)))
}

fn counter_in(conn: &Connection, day: &str, scope: &str) -> Result<u32> {
    let sent: Option<u32> = conn
        .query_row(
            "SELECT sent FROM daily_usage WHERE day = ?1 AND scope = ?2",
            params![day, scope],
            |r| r.get(0),
        )
        .optional()?;
    Ok(sent.unwrap_or(0))
}

/// Sends recorded on deliveries for the day, optionally for one recipient.
fn recorded_sends_in(conn: &Connection, now: DateTime<Utc>, email: Option<&str>) -> Result<u32> {
    let (start, end) = day_bounds(now);
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM deliveries
         WHERE status = 'sent' AND sent_at >= ?1 AND sent_at < ?2
           AND (?3 IS NULL OR lead_email = ?3)",
        params![start, end, email],
        |r| r.get(0),
    )?)
}

fn set_in(conn: &Connection, day: &str, scope: &str, sent: u32) -> Result<()> {
    conn.execute(
        "INSERT INTO daily_usage (day, scope, sent) VALUES (?1, ?2, ?3)
         ON CONFLICT(day, scope) DO UPDATE SET sent = excluded.sent",
        params![day, scope, sent],
    )?;
    Ok(())
}

fn decrement_in(conn: &Connection, day: &str, scope: &str) -> Result<()> {
    conn.execute(
        "UPDATE daily_usage SET sent = MAX(sent - 1, 0) WHERE day = ?1 AND scope = ?2",
        params![day, scope],
    )?;
    Ok(())
}

pub struct AdmissionController {
    db: Arc<CampaignDb>,
    global_cap: u32,
    recipient_cap: u32,
}

impl AdmissionController {
    pub fn new(db: Arc<CampaignDb>, config: &AdmissionConfig) -> Self {
        Self {
            db,
            global_cap: config.global_daily_cap,
            recipient_cap: config.recipient_daily_cap,
        }
    }

    /// Reserve budget for one send to `email` on the UTC day of `now`.
    ///
    /// Suppression is checked first and consumes nothing. `email` must be normalized.
    pub fn try_reserve(&self, email: &str, now: DateTime<Utc>) -> Result<Admission> {
        let day = day_key(now);
        let rcpt = recipient_scope(email);
        let admission = self.db.with_tx(|tx| {
            if !is_subscribed_in(tx, email)? {
                return Ok(Admission::Denied(AdmissionDenial::Unsubscribed));
            }
            let global = counter_in(tx, &day, GLOBAL_SCOPE)?.max(recorded_sends_in(tx, now, None)?);
            if global >= self.global_cap {
                return Ok(Admission::Denied(AdmissionDenial::DailyLimitReached));
            }
            let recipient = counter_in(tx, &day, &rcpt)?.max(recorded_sends_in(tx, now, Some(email))?);
            if recipient >= self.recipient_cap {
                return Ok(Admission::Denied(AdmissionDenial::RecipientLimitReached));
            }
            // counters may lag recorded sends; the new value covers both
            set_in(tx, &day, GLOBAL_SCOPE, global + 1)?;
            set_in(tx, &day, &rcpt, recipient + 1)?;
            Ok(Admission::Allowed(Reservation { day: day.clone(), email: email.to_string() }))
        })?;
        if let Admission::Denied(reason) = &admission {
            tracing::debug!("🚦 Admission denied for {email}: {reason}");
        }
        Ok(admission)
    }

    /// Give back a reservation whose send did not happen.
    pub fn release(&self, reservation: &Reservation) -> Result<()> {
        self.db.with_tx(|tx| {
            decrement_in(tx, &reservation.day, GLOBAL_SCOPE)?;
            decrement_in(tx, &reservation.day, &recipient_scope(&reservation.email))?;
            Ok(())
        })
    }

    /// Counters for the UTC day of `now`.
    pub fn usage(&self, now: DateTime<Utc>) -> Result<DailyUsage> {
        let day = day_key(now);
        self.db.with_conn(|conn| {
            let global_sent = counter_in(conn, &day, GLOBAL_SCOPE)?.max(recorded_sends_in(conn, now, None)?);
            let mut stmt = conn.prepare(
                "SELECT substr(scope, 6), sent FROM daily_usage
                 WHERE day = ?1 AND scope LIKE 'rcpt:%' AND sent > 0
                 ORDER BY sent DESC, scope",
            )?;
            let recipients = stmt
                .query_map([&day], |r| Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(DailyUsage {
                day: day.clone(),
                global_sent,
                global_cap: self.global_cap,
                recipient_cap: self.recipient_cap,
                recipients,
            })
        })
    }

    /// Sends counted against one recipient today.
    pub fn recipient_usage(&self, email: &str, now: DateTime<Utc>) -> Result<u32> {
        let day = day_key(now);
        self.db.with_conn(|conn| {
            Ok(counter_in(conn, &day, &recipient_scope(email))?
                .max(recorded_sends_in(conn, now, Some(email))?))
        })
    }
}
