//! Open/click/bounce ingestion. Events are append-only.

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use nurture_core::{
    ClientMeta, Delivery, DeliveryStatus, NurtureError, Result, TrackingEvent, TrackingEventType,
};

use crate::persistence::{CampaignDb, col_ts, get_delivery_in, map_delivery, ts, DELIVERY_COLUMNS};

/// How a bounce notification identifies its delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BounceRef {
    Delivery(i64),
    /// Provider message id as returned by the transport.
    Transport(String),
}

pub struct TrackingIngester {
    db: Arc<CampaignDb>,
}

impl TrackingIngester {
    pub fn new(db: Arc<CampaignDb>) -> Self {
        Self { db }
    }

    pub fn record_open(&self, delivery_id: i64, meta: &ClientMeta, at: DateTime<Utc>) -> Result<i64> {
        self.append(delivery_id, TrackingEventType::Open, None, meta, at)
    }

    pub fn record_click(
        &self,
        delivery_id: i64,
        link_url: &str,
        meta: &ClientMeta,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        if link_url.trim().is_empty() {
            return Err(NurtureError::Validation("click without a link url".into()));
        }
        self.append(delivery_id, TrackingEventType::Click, Some(link_url), meta, at)
    }

    fn append(
        &self,
        delivery_id: i64,
        event_type: TrackingEventType,
        link_url: Option<&str>,
        meta: &ClientMeta,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let id = self.db.with_tx(|tx| {
            if get_delivery_in(tx, delivery_id)?.is_none() {
                return Err(NurtureError::NotFound(format!("delivery {delivery_id}")));
            }
            tx.execute(
                "INSERT INTO tracking_events (delivery_id, event_type, link_url, ip, user_agent, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    delivery_id,
                    event_type.as_str(),
                    link_url,
                    meta.ip,
                    meta.user_agent,
                    ts(at),
                ],
            )?;
            Ok(tx.last_insert_rowid())
        })?;
        tracing::debug!("👁️ {} recorded for delivery #{delivery_id}", event_type.as_str());
        Ok(id)
    }

    /// Mark a sent delivery as bounced. Repeated notifications keep the first timestamp.
    pub fn record_bounce(&self, reference: &BounceRef, at: DateTime<Utc>) -> Result<Delivery> {
        let delivery = self.db.with_tx(|tx| {
            let found = match reference {
                BounceRef::Delivery(id) => get_delivery_in(tx, *id)?,
                BounceRef::Transport(transport_id) => tx
                    .query_row(
                        &format!("SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE transport_id = ?1"),
                        [transport_id],
                        map_delivery,
                    )
                    .optional()?,
            };
            let delivery =
                found.ok_or_else(|| NurtureError::NotFound(format!("delivery for bounce {reference:?}")))?;
            if delivery.status != DeliveryStatus::Sent {
                return Err(NurtureError::Validation(format!(
                    "delivery {} is {}, only sent deliveries can bounce",
                    delivery.id,
                    delivery.status.as_str()
                )));
            }
            tx.execute(
                "UPDATE deliveries SET bounced_at = COALESCE(bounced_at, ?1) WHERE id = ?2",
                params![ts(at), delivery.id],
            )?;
            get_delivery_in(tx, delivery.id)?
                .ok_or_else(|| NurtureError::NotFound(format!("delivery {}", delivery.id)))
        })?;
        tracing::warn!("📛 Delivery #{} to {} bounced", delivery.id, delivery.lead_email);
        Ok(delivery)
    }

    /// Events for one delivery in arrival order.
    pub fn events_for(&self, delivery_id: i64) -> Result<Vec<TrackingEvent>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, delivery_id, event_type, link_url, ip, user_agent, occurred_at
                 FROM tracking_events WHERE delivery_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map([delivery_id], |r| {
                let kind: String = r.get(2)?;
                Ok(TrackingEvent {
                    id: r.get(0)?,
                    delivery_id: r.get(1)?,
                    event_type: TrackingEventType::parse(&kind).map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
                    })?,
                    link_url: r.get(3)?,
                    meta: ClientMeta { ip: r.get(4)?, user_agent: r.get(5)? },
                    occurred_at: col_ts(r, 6)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}
