//! Domain types: sequences, templates, deliveries and tracking events.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{NurtureError, Result};

/// Lead event kinds a sequence can be triggered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    QuizCompleted,
    QuizQualified,
    QuizDisqualified,
    DaysWithoutConversion,
    Manual,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QuizCompleted => "quiz_completed",
            Self::QuizQualified => "quiz_qualified",
            Self::QuizDisqualified => "quiz_disqualified",
            Self::DaysWithoutConversion => "days_without_conversion",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "quiz_completed" => Ok(Self::QuizCompleted),
            "quiz_qualified" => Ok(Self::QuizQualified),
            "quiz_disqualified" => Ok(Self::QuizDisqualified),
            "days_without_conversion" => Ok(Self::DaysWithoutConversion),
            "manual" => Ok(Self::Manual),
            _ => Err(NurtureError::Validation(format!("unknown trigger kind: {s}"))),
        }
    }
}

/// A named campaign triggered by a lead event kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sequence {
    pub id: i64,
    pub name: String,
    pub trigger_kind: TriggerKind,
    /// Threshold in days; only consulted for `days_without_conversion`.
    pub trigger_days: Option<u32>,
    pub active: bool,
    /// Higher fires first. All matching sequences fire.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

/// Fields an operator supplies when creating or updating a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceDraft {
    pub name: String,
    pub trigger_kind: TriggerKind,
    #[serde(default)]
    pub trigger_days: Option<u32>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub priority: i32,
}

/// One email inside a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: i64,
    pub sequence_id: i64,
    pub name: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
    pub delay_days: u32,
    pub delay_hours: u32,
    pub position: i32,
    pub active: bool,
}

/// Upper bounds on `delay_days` and `delay_hours`.
pub const MAX_DELAY_DAYS: u32 = 3_650;
pub const MAX_DELAY_HOURS: u32 = MAX_DELAY_DAYS * 24;

impl Template {
    /// Offset from the trigger time.
    pub fn delay(&self) -> Duration {
        Duration::days(i64::from(self.delay_days)) + Duration::hours(i64::from(self.delay_hours))
    }

    /// When this template is due for a trigger that happened at `trigger_time`.
    pub fn scheduled_at(&self, trigger_time: DateTime<Utc>) -> Result<DateTime<Utc>> {
        trigger_time.checked_add_signed(self.delay()).ok_or_else(|| {
            NurtureError::Validation(format!(
                "template '{}' delay of {}d {}h is out of range",
                self.name, self.delay_days, self.delay_hours
            ))
        })
    }
}

/// Fields an operator supplies when creating or updating a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDraft {
    pub name: String,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
    #[serde(default)]
    pub delay_days: u32,
    #[serde(default)]
    pub delay_hours: u32,
    #[serde(default)]
    pub position: i32,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// Read-only view of a lead as far as rendering is concerned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lead {
    pub id: i64,
    pub email: String,
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Inbound signal from the quiz/CRM side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadEvent {
    pub kind: TriggerKind,
    pub lead_id: i64,
    pub lead_email: String,
    #[serde(default)]
    pub lead_name: Option<String>,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub days_since_conversion: Option<u32>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl LeadEvent {
    pub fn new(kind: TriggerKind, lead_id: i64, lead_email: &str, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            lead_id,
            lead_email: lead_email.to_string(),
            lead_name: None,
            occurred_at,
            days_since_conversion: None,
            attributes: BTreeMap::new(),
        }
    }

    /// Profile snapshot carried by this event, with a normalized email.
    pub fn lead(&self) -> Result<Lead> {
        Ok(Lead {
            id: self.lead_id,
            email: normalize_email(&self.lead_email)?,
            name: self.lead_name.clone().filter(|n| !n.trim().is_empty()),
            attributes: self.attributes.clone(),
        })
    }
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Claimed,
    Sent,
    Failed,
    Cancelled,
}

impl DeliveryStatus {
    pub const ALL: [DeliveryStatus; 5] = [
        Self::Pending,
        Self::Claimed,
        Self::Sent,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(NurtureError::Serialization(format!("unknown delivery status: {s}"))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Cancelled)
    }
}

/// How a delivery row came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOrigin {
    /// Created by the trigger evaluator.
    Automatic,
    /// Operator send-now; still subject to the idempotency guard.
    Manual,
    /// Operator resend of an earlier delivery; exempt from the idempotency guard.
    Resend,
}

impl DeliveryOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Resend => "resend",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            "resend" => Ok(Self::Resend),
            _ => Err(NurtureError::Serialization(format!("unknown delivery origin: {s}"))),
        }
    }

    /// Whether operator-facing dispatch should report denials instead of deferring.
    pub fn is_interactive(&self) -> bool {
        !matches!(self, Self::Automatic)
    }
}

/// One scheduled/attempted/completed email for a (lead, template) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub lead_id: i64,
    pub lead_email: String,
    pub sequence_id: i64,
    pub template_id: i64,
    pub subject: Option<String>,
    pub html: Option<String>,
    pub status: DeliveryStatus,
    pub origin: DeliveryOrigin,
    pub resend_of: Option<i64>,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub transport_id: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Tracking event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingEventType {
    Open,
    Click,
}

impl TrackingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Click => "click",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(Self::Open),
            "click" => Ok(Self::Click),
            _ => Err(NurtureError::Serialization(format!("unknown event type: {s}"))),
        }
    }
}

/// Client metadata captured by the tracking endpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientMeta {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Append-only open/click record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingEvent {
    pub id: i64,
    pub delivery_id: i64,
    pub event_type: TrackingEventType,
    pub link_url: Option<String>,
    pub meta: ClientMeta,
    pub occurred_at: DateTime<Utc>,
}

/// Opt-out record keyed by lowercased email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub email: String,
    pub is_subscribed: bool,
    pub unsubscribed_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

/// Trim and lowercase an email, rejecting anything that is obviously not an address.
pub fn normalize_email(raw: &str) -> Result<String> {
    let email = raw.trim().to_lowercase();
    let invalid = || NurtureError::Validation(format!("invalid email address: '{raw}'"));
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty()
        || domain.is_empty()
        || domain.contains('@')
        || !domain.contains('.')
        || domain.starts_with('.')
        || domain.ends_with('.')
        || email.chars().any(char::is_whitespace)
    {
        return Err(invalid());
    }
    Ok(email)
}
