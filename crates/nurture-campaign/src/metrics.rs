//! Delivery metrics: pure aggregation over deliveries and tracking events.
//!
//! The window is `[from, to)` over `scheduled_at`. Rates are 0 when their
//! denominator is 0.

use chrono::{DateTime, Utc};
use rusqlite::params;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use nurture_core::{NurtureError, Result};

use crate::persistence::{CampaignDb, ts};

/// Window and optional filters for a metrics query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    #[serde(default)]
    pub sequence_id: Option<i64>,
    #[serde(default)]
    pub template_id: Option<i64>,
}

impl MetricsQuery {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to, sequence_id: None, template_id: None }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryMetrics {
    pub total: u64,
    pub pending: u64,
    pub claimed: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub bounced: u64,
    pub total_opens: u64,
    pub total_clicks: u64,
    pub unique_opens: u64,
    pub unique_clicks: u64,
    pub open_rate: f64,
    pub click_rate: f64,
    pub click_to_open_rate: f64,
    pub delivery_rate: f64,
    pub bounce_rate: f64,
}

impl DeliveryMetrics {
    fn with_rates(mut self) -> Self {
        self.open_rate = ratio(self.unique_opens, self.sent);
        self.click_rate = ratio(self.unique_clicks, self.sent);
        self.click_to_open_rate = ratio(self.unique_clicks, self.unique_opens);
        self.delivery_rate = ratio(self.sent, self.total);
        self.bounce_rate = ratio(self.bounced, self.total);
        self
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 { 0.0 } else { numerator as f64 / denominator as f64 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyMetrics {
    /// `YYYY-MM-DD` (UTC) of `scheduled_at`.
    pub day: String,
    pub metrics: DeliveryMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceMetrics {
    pub sequence_id: i64,
    pub metrics: DeliveryMetrics,
}

pub struct MetricsAggregator {
    db: Arc<CampaignDb>,
}

impl MetricsAggregator {
    pub fn new(db: Arc<CampaignDb>) -> Self {
        Self { db }
    }

    pub fn summary(&self, query: &MetricsQuery) -> Result<DeliveryMetrics> {
        Ok(self
            .grouped(query, "'all'")?
            .into_iter()
            .next()
            .map(|(_, metrics)| metrics)
            .unwrap_or_else(|| DeliveryMetrics::default().with_rates()))
    }

    /// One entry per day that has deliveries, ascending.
    pub fn daily(&self, query: &MetricsQuery) -> Result<Vec<DailyMetrics>> {
        Ok(self
            .grouped(query, "substr(d.scheduled_at, 1, 10)")?
            .into_iter()
            .map(|(day, metrics)| DailyMetrics { day, metrics })
            .collect())
    }

    /// One entry per sequence that has deliveries, by sequence id.
    pub fn by_sequence(&self, query: &MetricsQuery) -> Result<Vec<SequenceMetrics>> {
        self.grouped(query, "d.sequence_id")?
            .into_iter()
            .map(|(key, metrics)| {
                let sequence_id = key
                    .parse()
                    .map_err(|_| NurtureError::Serialization(format!("bad sequence key {key}")))?;
                Ok(SequenceMetrics { sequence_id, metrics })
            })
            .collect()
    }

    fn grouped(&self, query: &MetricsQuery, group_key: &str) -> Result<Vec<(String, DeliveryMetrics)>> {
        if query.to < query.from {
            return Err(NurtureError::Validation("metrics window ends before it starts".into()));
        }
        let sql = format!(
            "SELECT {group_key} AS k,
                    COUNT(*),
                    SUM(d.status = 'pending'),
                    SUM(d.status = 'claimed'),
                    SUM(d.status = 'sent'),
                    SUM(d.status = 'failed'),
                    SUM(d.status = 'cancelled'),
                    SUM(d.bounced_at IS NOT NULL),
                    COALESCE(SUM(ev.opens), 0),
                    COALESCE(SUM(ev.clicks), 0),
                    SUM(COALESCE(ev.opens, 0) > 0),
                    SUM(COALESCE(ev.clicks, 0) > 0)
             FROM deliveries d
             LEFT JOIN (
                 SELECT delivery_id,
                        SUM(event_type = 'open') AS opens,
                        SUM(event_type = 'click') AS clicks
                 FROM tracking_events GROUP BY delivery_id
             ) ev ON ev.delivery_id = d.id
             WHERE d.scheduled_at >= ?1 AND d.scheduled_at < ?2
               AND (?3 IS NULL OR d.sequence_id = ?3)
               AND (?4 IS NULL OR d.template_id = ?4)
             GROUP BY k ORDER BY k"
        );
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                params![ts(query.from), ts(query.to), query.sequence_id, query.template_id],
                |r| {
                    let n = |idx: usize| r.get::<_, i64>(idx).map(|v| v.max(0) as u64);
                    let key = match r.get::<_, Value>(0)? {
                        Value::Integer(i) => i.to_string(),
                        Value::Text(s) => s,
                        other => format!("{other:?}"),
                    };
                    let metrics = DeliveryMetrics {
                        total: n(1)?,
                        pending: n(2)?,
                        claimed: n(3)?,
                        sent: n(4)?,
                        failed: n(5)?,
                        cancelled: n(6)?,
                        bounced: n(7)?,
                        total_opens: n(8)?,
                        total_clicks: n(9)?,
                        unique_opens: n(10)?,
                        unique_clicks: n(11)?,
                        ..Default::default()
                    };
                    Ok((key, metrics.with_rates()))
                },
            )?;
            let grouped = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(grouped)
        })
    }
}
