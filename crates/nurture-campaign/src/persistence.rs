//! SQLite-backed persistence for sequences, templates, deliveries, tracking,
//! suppression and daily usage counters.
//!
//! One connection behind a mutex. The lock is only ever held for the duration of
//! a single statement or transaction, never across an `.await`.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use nurture_core::{
    Delivery, DeliveryOrigin, DeliveryStatus, Lead, MAX_DELAY_DAYS, MAX_DELAY_HOURS, NurtureError,
    Result, Sequence, SequenceDraft, Template, TemplateDraft, TriggerKind,
};

/// Fixed-width UTC timestamp, so lexical order in SQL equals time order.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Calendar day key (UTC) used by the usage counters and daily metrics.
pub(crate) fn day_key(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d").to_string()
}

fn conversion_err(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

pub(crate) fn col_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

pub(crate) fn col_ts_opt(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| conversion_err(idx, e))
    })
    .transpose()
}

pub(crate) const DELIVERY_COLUMNS: &str = "id, lead_id, lead_email, sequence_id, template_id, subject, html, \
     status, origin, resend_of, scheduled_at, sent_at, error_message, transport_id, \
     claimed_at, claimed_by, bounced_at, created_at";

pub(crate) fn map_delivery(row: &Row<'_>) -> rusqlite::Result<Delivery> {
    let status: String = row.get(7)?;
    let origin: String = row.get(8)?;
    Ok(Delivery {
        id: row.get(0)?,
        lead_id: row.get(1)?,
        lead_email: row.get(2)?,
        sequence_id: row.get(3)?,
        template_id: row.get(4)?,
        subject: row.get(5)?,
        html: row.get(6)?,
        status: DeliveryStatus::parse(&status).map_err(|e| conversion_err(7, e))?,
        origin: DeliveryOrigin::parse(&origin).map_err(|e| conversion_err(8, e))?,
        resend_of: row.get(9)?,
        scheduled_at: col_ts(row, 10)?,
        sent_at: col_ts_opt(row, 11)?,
        error_message: row.get(12)?,
        transport_id: row.get(13)?,
        claimed_at: col_ts_opt(row, 14)?,
        claimed_by: row.get(15)?,
        bounced_at: col_ts_opt(row, 16)?,
        created_at: col_ts(row, 17)?,
    })
}

const SEQUENCE_COLUMNS: &str = "id, name, trigger_kind, trigger_days, active, priority, created_at";

fn map_sequence(row: &Row<'_>) -> rusqlite::Result<Sequence> {
    let kind: String = row.get(2)?;
    Ok(Sequence {
        id: row.get(0)?,
        name: row.get(1)?,
        trigger_kind: TriggerKind::parse(&kind).map_err(|e| conversion_err(2, e))?,
        trigger_days: row.get(3)?,
        active: row.get::<_, i32>(4)? != 0,
        priority: row.get(5)?,
        created_at: col_ts(row, 6)?,
    })
}

const TEMPLATE_COLUMNS: &str =
    "id, sequence_id, name, subject, html_body, text_body, delay_days, delay_hours, position, active";

fn map_template(row: &Row<'_>) -> rusqlite::Result<Template> {
    Ok(Template {
        id: row.get(0)?,
        sequence_id: row.get(1)?,
        name: row.get(2)?,
        subject: row.get(3)?,
        html_body: row.get(4)?,
        text_body: row.get(5)?,
        delay_days: row.get(6)?,
        delay_hours: row.get(7)?,
        position: row.get(8)?,
        active: row.get::<_, i32>(9)? != 0,
    })
}

/// Fields for a new delivery row.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub lead_id: i64,
    pub lead_email: String,
    pub sequence_id: i64,
    pub template_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub origin: DeliveryOrigin,
    pub resend_of: Option<i64>,
}

/// Filters for listing deliveries. All fields are optional and ANDed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryFilter {
    pub status: Option<DeliveryStatus>,
    pub sequence_id: Option<i64>,
    pub template_id: Option<i64>,
    pub lead_id: Option<i64>,
    /// Inclusive lower bound on `scheduled_at`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `scheduled_at`.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

/// Operator action record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub action: String,
    pub subject: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Counts returned when a sequence or template is deleted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogDeletion {
    pub templates_deleted: usize,
    pub deliveries_cancelled: usize,
}

/// SQLite-backed store for all campaign data.
pub struct CampaignDb {
    conn: Mutex<Connection>,
}

impl CampaignDb {
    /// Open or create the campaign database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // WAL for concurrent readers alongside the dispatch workers
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self { conn: Mutex::new(conn) };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves no open transaction behind (rolled back on drop).
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run a read or single-statement write against the connection.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside an immediate (write-locking) transaction; commit on `Ok`.
    pub(crate) fn with_tx<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                "
            CREATE TABLE IF NOT EXISTS sequences (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                trigger_kind TEXT NOT NULL,      -- quiz_completed, quiz_qualified, ...
                trigger_days INTEGER,            -- days_without_conversion only
                active INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS templates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sequence_id INTEGER NOT NULL REFERENCES sequences(id),
                name TEXT NOT NULL,
                subject TEXT NOT NULL,
                html_body TEXT NOT NULL,
                text_body TEXT,
                delay_days INTEGER NOT NULL DEFAULT 0,
                delay_hours INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL DEFAULT 0,
                active INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_templates_sequence ON templates(sequence_id, position);

            -- template_id carries no FK: delivery history outlives catalog edits
            CREATE TABLE IF NOT EXISTS deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                lead_id INTEGER NOT NULL,
                lead_email TEXT NOT NULL,
                sequence_id INTEGER NOT NULL,
                template_id INTEGER NOT NULL,
                subject TEXT,
                html TEXT,
                status TEXT NOT NULL DEFAULT 'pending',   -- pending, claimed, sent, failed, cancelled
                origin TEXT NOT NULL DEFAULT 'automatic', -- automatic, manual, resend
                resend_of INTEGER,
                scheduled_at TEXT NOT NULL,
                sent_at TEXT,
                error_message TEXT,
                transport_id TEXT,
                claimed_at TEXT,
                claimed_by TEXT,
                bounced_at TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_deliveries_key ON deliveries(lead_id, template_id);
            CREATE INDEX IF NOT EXISTS idx_deliveries_due ON deliveries(status, scheduled_at);
            CREATE INDEX IF NOT EXISTS idx_deliveries_recipient ON deliveries(lead_email, status);
            CREATE INDEX IF NOT EXISTS idx_deliveries_sent ON deliveries(status, sent_at);
            CREATE INDEX IF NOT EXISTS idx_deliveries_transport ON deliveries(transport_id);

            CREATE TABLE IF NOT EXISTS tracking_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                delivery_id INTEGER NOT NULL REFERENCES deliveries(id),
                event_type TEXT NOT NULL CHECK (event_type IN ('open', 'click')),
                link_url TEXT,
                ip TEXT,
                user_agent TEXT,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_delivery ON tracking_events(delivery_id, event_type);

            CREATE TABLE IF NOT EXISTS suppressions (
                email TEXT PRIMARY KEY,          -- lowercased
                is_subscribed INTEGER NOT NULL DEFAULT 1,
                unsubscribed_at TEXT,
                reason TEXT,
                updated_at TEXT NOT NULL
            );

            -- scope is '*' for the global budget or 'rcpt:<email>'
            CREATE TABLE IF NOT EXISTS daily_usage (
                day TEXT NOT NULL,
                scope TEXT NOT NULL,
                sent INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (day, scope)
            );

            CREATE TABLE IF NOT EXISTS lead_profiles (
                lead_id INTEGER PRIMARY KEY,
                email TEXT NOT NULL,
                name TEXT,
                attributes TEXT NOT NULL DEFAULT '{}',
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                action TEXT NOT NULL,
                subject TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );
         ",
            )?;
            Ok(())
        })?;
        self.ensure_idempotency_index()?;
        Ok(())
    }

    /// Create the partial unique index behind the idempotency guard.
    ///
    /// Databases carrying duplicates from before the guard existed cannot take the
    /// index until the reconciler has run; the guard's insert-if-absent check still
    /// applies in the meantime. Returns whether the index is in place.
    pub fn ensure_idempotency_index(&self) -> Result<bool> {
        self.with_conn(|conn| {
            let result = conn.execute_batch(
                "CREATE UNIQUE INDEX IF NOT EXISTS uq_deliveries_lead_template
                 ON deliveries(lead_id, template_id)
                 WHERE status <> 'failed' AND origin <> 'resend';",
            );
            match result {
                Ok(()) => Ok(true),
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    tracing::warn!(
                        "⚠️ Duplicate deliveries present, idempotency index not created; run reconciliation"
                    );
                    Ok(false)
                }
                Err(e) => Err(e.into()),
            }
        })
    }

    // ─── Sequences ──────────────────────────────────────

    pub fn create_sequence(&self, draft: &SequenceDraft) -> Result<Sequence> {
        validate_sequence(draft)?;
        let now = Utc::now();
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sequences (name, trigger_kind, trigger_days, active, priority, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    draft.name.trim(),
                    draft.trigger_kind.as_str(),
                    draft.trigger_days,
                    draft.active as i32,
                    draft.priority,
                    ts(now),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        tracing::info!("📋 Sequence #{id} '{}' created ({})", draft.name, draft.trigger_kind.as_str());
        self.require_sequence(id)
    }

    pub fn update_sequence(&self, id: i64, draft: &SequenceDraft) -> Result<Sequence> {
        validate_sequence(draft)?;
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE sequences SET name = ?1, trigger_kind = ?2, trigger_days = ?3, active = ?4, priority = ?5
                 WHERE id = ?6",
                params![
                    draft.name.trim(),
                    draft.trigger_kind.as_str(),
                    draft.trigger_days,
                    draft.active as i32,
                    draft.priority,
                    id,
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(NurtureError::NotFound(format!("sequence {id}")));
        }
        self.require_sequence(id)
    }

    pub fn get_sequence(&self, id: i64) -> Result<Option<Sequence>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {SEQUENCE_COLUMNS} FROM sequences WHERE id = ?1"),
                    [id],
                    map_sequence,
                )
                .optional()?)
        })
    }

    pub fn require_sequence(&self, id: i64) -> Result<Sequence> {
        self.get_sequence(id)?
            .ok_or_else(|| NurtureError::NotFound(format!("sequence {id}")))
    }

    pub fn list_sequences(&self) -> Result<Vec<Sequence>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SEQUENCE_COLUMNS} FROM sequences ORDER BY priority DESC, id"
            ))?;
            let rows = stmt.query_map([], map_sequence)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Active sequences for a trigger kind, highest priority first.
    pub fn active_sequences_for(&self, kind: TriggerKind) -> Result<Vec<Sequence>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SEQUENCE_COLUMNS} FROM sequences
                 WHERE active = 1 AND trigger_kind = ?1 ORDER BY priority DESC, id"
            ))?;
            let rows = stmt.query_map([kind.as_str()], map_sequence)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Delete a sequence and its templates; pending deliveries of those templates
    /// are cancelled rather than dropped.
    pub fn delete_sequence(&self, id: i64) -> Result<CatalogDeletion> {
        let deletion = self.with_tx(|tx| {
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM sequences WHERE id = ?1", [id], |r| r.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(NurtureError::NotFound(format!("sequence {id}")));
            }
            let deliveries_cancelled = tx.execute(
                "UPDATE deliveries SET status = 'cancelled', error_message = 'sequence deleted',
                        claimed_at = NULL, claimed_by = NULL
                 WHERE status = 'pending'
                   AND template_id IN (SELECT id FROM templates WHERE sequence_id = ?1)",
                [id],
            )?;
            let templates_deleted = tx.execute("DELETE FROM templates WHERE sequence_id = ?1", [id])?;
            tx.execute("DELETE FROM sequences WHERE id = ?1", [id])?;
            Ok(CatalogDeletion { templates_deleted, deliveries_cancelled })
        })?;
        self.log_audit(
            "sequence_deleted",
            &format!("sequence:{id}"),
            Some(&format!(
                "templates={} cancelled={}",
                deletion.templates_deleted, deletion.deliveries_cancelled
            )),
        )?;
        tracing::info!(
            "🗑️ Sequence #{id} deleted ({} templates, {} pending cancelled)",
            deletion.templates_deleted,
            deletion.deliveries_cancelled
        );
        Ok(deletion)
    }

    // ─── Templates ──────────────────────────────────────

    pub fn create_template(&self, sequence_id: i64, draft: &TemplateDraft) -> Result<Template> {
        validate_template(draft)?;
        self.require_sequence(sequence_id)?;
        let id = self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO templates (sequence_id, name, subject, html_body, text_body,
                                        delay_days, delay_hours, position, active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    sequence_id,
                    draft.name.trim(),
                    draft.subject,
                    draft.html_body,
                    draft.text_body,
                    draft.delay_days,
                    draft.delay_hours,
                    draft.position,
                    draft.active as i32,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.require_template(id)
    }

    pub fn update_template(&self, id: i64, draft: &TemplateDraft) -> Result<Template> {
        validate_template(draft)?;
        let changed = self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE templates SET name = ?1, subject = ?2, html_body = ?3, text_body = ?4,
                        delay_days = ?5, delay_hours = ?6, position = ?7, active = ?8
                 WHERE id = ?9",
                params![
                    draft.name.trim(),
                    draft.subject,
                    draft.html_body,
                    draft.text_body,
                    draft.delay_days,
                    draft.delay_hours,
                    draft.position,
                    draft.active as i32,
                    id,
                ],
            )?)
        })?;
        if changed == 0 {
            return Err(NurtureError::NotFound(format!("template {id}")));
        }
        self.require_template(id)
    }

    pub fn get_template(&self, id: i64) -> Result<Option<Template>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {TEMPLATE_COLUMNS} FROM templates WHERE id = ?1"),
                    [id],
                    map_template,
                )
                .optional()?)
        })
    }

    pub fn require_template(&self, id: i64) -> Result<Template> {
        self.get_template(id)?
            .ok_or_else(|| NurtureError::NotFound(format!("template {id}")))
    }

    /// Templates of a sequence in delivery order.
    pub fn list_templates(&self, sequence_id: i64) -> Result<Vec<Template>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TEMPLATE_COLUMNS} FROM templates WHERE sequence_id = ?1 ORDER BY position, id"
            ))?;
            let rows = stmt.query_map([sequence_id], map_template)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    pub fn delete_template(&self, id: i64) -> Result<CatalogDeletion> {
        let deletion = self.with_tx(|tx| {
            let deliveries_cancelled = tx.execute(
                "UPDATE deliveries SET status = 'cancelled', error_message = 'template deleted',
                        claimed_at = NULL, claimed_by = NULL
                 WHERE status = 'pending' AND template_id = ?1",
                [id],
            )?;
            let templates_deleted = tx.execute("DELETE FROM templates WHERE id = ?1", [id])?;
            if templates_deleted == 0 {
                return Err(NurtureError::NotFound(format!("template {id}")));
            }
            Ok(CatalogDeletion { templates_deleted, deliveries_cancelled })
        })?;
        self.log_audit(
            "template_deleted",
            &format!("template:{id}"),
            Some(&format!("cancelled={}", deletion.deliveries_cancelled)),
        )?;
        Ok(deletion)
    }

    // ─── Deliveries ──────────────────────────────────────

    pub fn get_delivery(&self, id: i64) -> Result<Option<Delivery>> {
        self.with_conn(|conn| get_delivery_in(conn, id))
    }

    pub fn require_delivery(&self, id: i64) -> Result<Delivery> {
        self.get_delivery(id)?
            .ok_or_else(|| NurtureError::NotFound(format!("delivery {id}")))
    }

    /// List deliveries, newest schedule first.
    pub fn list_deliveries(&self, filter: &DeliveryFilter) -> Result<Vec<Delivery>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {DELIVERY_COLUMNS} FROM deliveries
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR sequence_id = ?2)
                   AND (?3 IS NULL OR template_id = ?3)
                   AND (?4 IS NULL OR lead_id = ?4)
                   AND (?5 IS NULL OR scheduled_at >= ?5)
                   AND (?6 IS NULL OR scheduled_at < ?6)
                 ORDER BY scheduled_at DESC, id DESC
                 LIMIT ?7"
            ))?;
            let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
            let rows = stmt.query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.sequence_id,
                    filter.template_id,
                    filter.lead_id,
                    filter.from.map(ts),
                    filter.to.map(ts),
                    limit,
                ],
                map_delivery,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    // ─── Lead profiles ──────────────────────────────────────

    /// Remember the latest profile seen for a lead.
    pub fn upsert_lead(&self, lead: &Lead) -> Result<()> {
        let attributes = serde_json::to_string(&lead.attributes)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO lead_profiles (lead_id, email, name, attributes, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(lead_id) DO UPDATE SET
                    email = excluded.email, name = excluded.name,
                    attributes = excluded.attributes, updated_at = excluded.updated_at",
                params![lead.id, lead.email, lead.name, attributes, ts(Utc::now())],
            )?;
            Ok(())
        })
    }

    pub fn get_lead(&self, lead_id: i64) -> Result<Option<Lead>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT lead_id, email, name, attributes FROM lead_profiles WHERE lead_id = ?1",
                    [lead_id],
                    |r| {
                        Ok((
                            r.get::<_, i64>(0)?,
                            r.get::<_, String>(1)?,
                            r.get::<_, Option<String>>(2)?,
                            r.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()?;
            row.map(|(id, email, name, attributes)| {
                Ok(Lead {
                    id,
                    email,
                    name,
                    attributes: serde_json::from_str(&attributes)?,
                })
            })
            .transpose()
        })
    }

    // ─── Audit ──────────────────────────────────────

    pub fn log_audit(&self, action: &str, subject: &str, detail: Option<&str>) -> Result<i64> {
        self.with_conn(|conn| log_audit_in(conn, action, subject, detail))
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, action, subject, detail, created_at FROM audit_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit as i64], |r| {
                Ok(AuditEntry {
                    id: r.get(0)?,
                    action: r.get(1)?,
                    subject: r.get(2)?,
                    detail: r.get(3)?,
                    created_at: col_ts(r, 4)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

pub(crate) fn get_delivery_in(conn: &Connection, id: i64) -> Result<Option<Delivery>> {
    Ok(conn
        .query_row(
            &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?1"),
            [id],
            map_delivery,
        )
        .optional()?)
}

/// Insert a delivery row unconditionally. Callers enforce the idempotency guard.
pub(crate) fn insert_delivery_in(conn: &Connection, new: &NewDelivery, now: DateTime<Utc>) -> Result<i64> {
    conn.execute(
        "INSERT INTO deliveries (lead_id, lead_email, sequence_id, template_id, status, origin,
                                 resend_of, scheduled_at, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)",
        params![
            new.lead_id,
            new.lead_email,
            new.sequence_id,
            new.template_id,
            new.origin.as_str(),
            new.resend_of,
            ts(new.scheduled_at),
            ts(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn log_audit_in(
    conn: &Connection,
    action: &str,
    subject: &str,
    detail: Option<&str>,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO audit_log (action, subject, detail, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![action, subject, detail, ts(Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

fn validate_sequence(draft: &SequenceDraft) -> Result<()> {
    if draft.name.trim().is_empty() {
        return Err(NurtureError::Validation("sequence name is required".into()));
    }
    if draft.trigger_kind == TriggerKind::DaysWithoutConversion && draft.trigger_days.is_none() {
        return Err(NurtureError::Validation(
            "days_without_conversion sequences need trigger_days".into(),
        ));
    }
    Ok(())
}

fn validate_template(draft: &TemplateDraft) -> Result<()> {
    if draft.name.trim().is_empty() {
        return Err(NurtureError::Validation("template name is required".into()));
    }
    if draft.subject.trim().is_empty() {
        return Err(NurtureError::Validation("template subject is required".into()));
    }
    if draft.html_body.trim().is_empty() {
        return Err(NurtureError::Validation("template html body is required".into()));
    }
    if draft.delay_days > MAX_DELAY_DAYS || draft.delay_hours > MAX_DELAY_HOURS {
        return Err(NurtureError::Validation(format!(
            "template delay must be at most {MAX_DELAY_DAYS} days and {MAX_DELAY_HOURS} hours"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_open_and_migrate() {
        let db = CampaignDb::open_in_memory().unwrap();
        assert!(db.list_sequences().unwrap().is_empty());
        assert!(db.ensure_idempotency_index().unwrap());
    }

    #[test]
    fn test_file_database_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("campaigns.db");
        {
            let db = CampaignDb::open(&path).unwrap();
            db.create_sequence(&testing::sequence_draft("welcome", TriggerKind::QuizCompleted))
                .unwrap();
        }
        let db = CampaignDb::open(&path).unwrap();
        assert_eq!(db.list_sequences().unwrap().len(), 1);
    }

    #[test]
    fn test_sequence_validation() {
        let db = CampaignDb::open_in_memory().unwrap();
        let mut draft = testing::sequence_draft("nudge", TriggerKind::DaysWithoutConversion);
        draft.trigger_days = None;
        assert!(matches!(db.create_sequence(&draft), Err(NurtureError::Validation(_))));
        draft.trigger_days = Some(7);
        let seq = db.create_sequence(&draft).unwrap();
        assert_eq!(seq.trigger_days, Some(7));
    }

    #[test]
    fn test_templates_ordered_by_position() {
        let db = CampaignDb::open_in_memory().unwrap();
        let seq = db
            .create_sequence(&testing::sequence_draft("welcome", TriggerKind::QuizCompleted))
            .unwrap();
        let mut second = testing::template_draft("second", 1, 0);
        second.position = 2;
        let mut first = testing::template_draft("first", 0, 0);
        first.position = 1;
        db.create_template(seq.id, &second).unwrap();
        db.create_template(seq.id, &first).unwrap();

        let names: Vec<_> = db.list_templates(seq.id).unwrap().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_template_delay_is_bounded() {
        let db = CampaignDb::open_in_memory().unwrap();
        let seq = db
            .create_sequence(&testing::sequence_draft("welcome", TriggerKind::QuizCompleted))
            .unwrap();
        let err = db.create_template(seq.id, &testing::template_draft("forever", u32::MAX, 0)).unwrap_err();
        assert!(matches!(err, NurtureError::Validation(_)));
        let err = db.create_template(seq.id, &testing::template_draft("late", 0, MAX_DELAY_HOURS + 1)).unwrap_err();
        assert!(matches!(err, NurtureError::Validation(_)));
        assert!(db.create_template(seq.id, &testing::template_draft("max", MAX_DELAY_DAYS, 0)).is_ok());
    }

    #[test]
    fn test_delete_sequence_cascades_and_cancels_pending() {
        let fx = testing::Fixture::new();
        let id = fx.insert_delivery(5, "a@x.com", Utc::now(), DeliveryStatus::Pending);

        let deletion = fx.db.delete_sequence(fx.sequence.id).unwrap();
        assert_eq!(deletion.templates_deleted, 1);
        assert_eq!(deletion.deliveries_cancelled, 1);
        assert!(fx.db.get_template(fx.template.id).unwrap().is_none());

        let delivery = fx.db.require_delivery(id).unwrap();
        assert_eq!(delivery.status, DeliveryStatus::Cancelled);
        assert_eq!(fx.db.recent_audit(10).unwrap()[0].action, "sequence_deleted");
    }

    #[test]
    fn test_list_deliveries_filters() {
        let fx = testing::Fixture::new();
        let now = Utc::now();
        fx.insert_delivery(1, "a@x.com", now, DeliveryStatus::Pending);
        fx.insert_delivery(2, "b@x.com", now, DeliveryStatus::Sent);

        let filter = DeliveryFilter { status: Some(DeliveryStatus::Sent), ..Default::default() };
        let sent = fx.db.list_deliveries(&filter).unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].lead_id, 2);

        let filter = DeliveryFilter { lead_id: Some(1), ..Default::default() };
        assert_eq!(fx.db.list_deliveries(&filter).unwrap().len(), 1);

        let filter = DeliveryFilter {
            from: Some(now + chrono::Duration::seconds(1)),
            ..Default::default()
        };
        assert!(fx.db.list_deliveries(&filter).unwrap().is_empty());
    }

    #[test]
    fn test_lead_profile_upsert() {
        let db = CampaignDb::open_in_memory().unwrap();
        let mut lead = Lead { id: 9, email: "a@x.com".into(), name: Some("Ana".into()), ..Default::default() };
        lead.attributes.insert("goal".into(), "strength".into());
        db.upsert_lead(&lead).unwrap();
        lead.name = Some("Ana Maria".into());
        db.upsert_lead(&lead).unwrap();

        let loaded = db.get_lead(9).unwrap().unwrap();
        assert_eq!(loaded.name.as_deref(), Some("Ana Maria"));
        assert_eq!(loaded.attributes["goal"], "strength");
    }
}
