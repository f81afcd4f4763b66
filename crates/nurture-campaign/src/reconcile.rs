//! Duplicate reconciliation: removes surplus `sent` rows left by historic
//! double sends, keeping the earliest-created row of every group.
//!
//! Runs only on explicit invocation. A batch is applied in one transaction and
//! any row that no longer looks the way the plan expects aborts all of it.

use chrono::{DateTime, Utc};
use rusqlite::{Transaction, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use nurture_core::{DeliveryStatus, NurtureError, Result};

use crate::persistence::{CampaignDb, col_ts, get_delivery_in, log_audit_in};

/// One delivery inside a duplicate group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRow {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub events: u64,
}

/// Sent deliveries sharing one (lead email, template).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub lead_email: String,
    pub template_id: i64,
    pub keep: DuplicateRow,
    pub remove: Vec<DuplicateRow>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub groups: usize,
    pub deliveries_removed: usize,
    pub events_removed: usize,
    /// Whether the idempotency index could be created afterwards.
    pub index_restored: bool,
}

pub struct DuplicateReconciler {
    db: Arc<CampaignDb>,
}

impl DuplicateReconciler {
    pub fn new(db: Arc<CampaignDb>) -> Self {
        Self { db }
    }

    /// Groups with more than one sent row, ordered by key. Read-only.
    pub fn find_duplicates(&self) -> Result<Vec<DuplicateGroup>> {
        let rows = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT d.lead_email, d.template_id, d.id, d.created_at,
                        (SELECT COUNT(*) FROM tracking_events e WHERE e.delivery_id = d.id)
                 FROM deliveries d
                 JOIN (
                     SELECT lead_email, template_id FROM deliveries
                     WHERE status = 'sent'
                     GROUP BY lead_email, template_id HAVING COUNT(*) > 1
                 ) g ON g.lead_email = d.lead_email AND g.template_id = d.template_id
                 WHERE d.status = 'sent'
                 ORDER BY d.lead_email, d.template_id, d.created_at, d.id",
            )?;
            let rows = stmt.query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    DuplicateRow { id: r.get(2)?, created_at: col_ts(r, 3)?, events: r.get::<_, i64>(4)? as u64 },
                ))
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })?;

        let mut grouped: BTreeMap<(String, i64), Vec<DuplicateRow>> = BTreeMap::new();
        for (email, template_id, row) in rows {
            grouped.entry((email, template_id)).or_default().push(row);
        }
        Ok(grouped
            .into_iter()
            .filter_map(|((lead_email, template_id), mut rows)| {
                if rows.len() < 2 {
                    return None;
                }
                let keep = rows.remove(0);
                Some(DuplicateGroup { lead_email, template_id, keep, remove: rows })
            })
            .collect())
    }

    /// Apply a plan from [`find_duplicates`](Self::find_duplicates): delete
    /// tracking events, then the surplus rows, all or nothing.
    pub fn reconcile(&self, groups: &[DuplicateGroup]) -> Result<ReconcileReport> {
        let mut report = self.db.with_tx(|tx| {
            let mut report = ReconcileReport { groups: groups.len(), ..Default::default() };
            for group in groups {
                verify_group(tx, group)?;
                for row in &group.remove {
                    report.events_removed +=
                        tx.execute("DELETE FROM tracking_events WHERE delivery_id = ?1", [row.id])?;
                    report.deliveries_removed += tx.execute(
                        "DELETE FROM deliveries WHERE id = ?1 AND status = 'sent'",
                        [row.id],
                    )?;
                }
            }
            if report.groups > 0 {
                log_audit_in(
                    tx,
                    "reconcile_apply",
                    "deliveries",
                    Some(&format!(
                        "groups={} deliveries={} events={}",
                        report.groups, report.deliveries_removed, report.events_removed
                    )),
                )?;
            }
            Ok(report)
        })?;
        report.index_restored = self.db.ensure_idempotency_index()?;
        tracing::info!(
            "🧹 Reconciled {} duplicate groups: {} deliveries and {} events removed",
            report.groups,
            report.deliveries_removed,
            report.events_removed
        );
        Ok(report)
    }

    /// Find and remove every duplicate in one go.
    pub fn reconcile_all(&self) -> Result<ReconcileReport> {
        let groups = self.find_duplicates()?;
        self.reconcile(&groups)
    }
}

/// The group must still match the store: every row present, sent, on the same key,
/// and `keep` the earliest sent row for that key.
fn verify_group(tx: &Transaction<'_>, group: &DuplicateGroup) -> Result<()> {
    let violation = |msg: String| {
        Err(NurtureError::ConsistencyViolation(format!(
            "group ({}, template {}): {msg}",
            group.lead_email, group.template_id
        )))
    };
    if group.remove.is_empty() {
        return violation("fewer than two rows".into());
    }
    if group.remove.iter().any(|r| r.id == group.keep.id) {
        return violation(format!("row {} is both kept and removed", group.keep.id));
    }

    for row in std::iter::once(&group.keep).chain(&group.remove) {
        let Some(delivery) = get_delivery_in(tx, row.id)? else {
            return violation(format!("row {} is missing", row.id));
        };
        if delivery.status != DeliveryStatus::Sent {
            return violation(format!("row {} is {}", row.id, delivery.status.as_str()));
        }
        if delivery.lead_email != group.lead_email || delivery.template_id != group.template_id {
            return violation(format!("row {} has a different key", row.id));
        }
    }

    let earliest: i64 = tx.query_row(
        "SELECT id FROM deliveries
         WHERE lead_email = ?1 AND template_id = ?2 AND status = 'sent'
         ORDER BY created_at, id LIMIT 1",
        params![group.lead_email, group.template_id],
        |r| r.get(0),
    )?;
    if earliest != group.keep.id {
        return violation(format!("row {earliest} is older than kept row {}", group.keep.id));
    }
    Ok(())
}
