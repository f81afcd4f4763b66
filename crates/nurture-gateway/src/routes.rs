//! Operator API route handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use nurture_campaign::{DeliveryFilter, DuplicateGroup, MetricsQuery};
use nurture_core::{LeadEvent, SequenceDraft, TemplateDraft};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::ApiResult;
use crate::server::AppState;

/// Health check endpoint.
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "nurture-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let cfg = &state.config;
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "mail_provider": cfg.mail.provider,
        "tracking_enabled": cfg.tracking.enabled,
        "admission": {
            "global_daily_cap": cfg.admission.global_daily_cap,
            "recipient_daily_cap": cfg.admission.recipient_daily_cap,
        },
        "dispatcher": {
            "workers": cfg.dispatcher.workers,
            "poll_interval_secs": cfg.dispatcher.poll_interval_secs,
        },
    }))
}

// ─── Events & dispatch ──────────────────────────────────────

/// Inbound lead event from the quiz/CRM side.
pub async fn ingest_event(State(state): State<Arc<AppState>>, Json(event): Json<LeadEvent>) -> ApiResult {
    let report = state.service.ingest_event(&event)?;
    Ok(Json(json!({ "ok": true, "report": report })))
}

/// Run one dispatch sweep now.
pub async fn dispatch_once(State(state): State<Arc<AppState>>) -> ApiResult {
    let report = state.service.dispatch_once().await?;
    Ok(Json(json!({ "ok": true, "report": report })))
}

// ─── Catalog ──────────────────────────────────────

pub async fn list_sequences(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "sequences": state.service.list_sequences()? })))
}

pub async fn get_sequence(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "sequence": state.service.get_sequence(id)? })))
}

pub async fn create_sequence(State(state): State<Arc<AppState>>, Json(draft): Json<SequenceDraft>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "sequence": state.service.create_sequence(&draft)? })))
}

pub async fn update_sequence(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(draft): Json<SequenceDraft>,
) -> ApiResult {
    Ok(Json(json!({ "ok": true, "sequence": state.service.update_sequence(id, &draft)? })))
}

pub async fn delete_sequence(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "deleted": state.service.delete_sequence(id)? })))
}

pub async fn list_templates(State(state): State<Arc<AppState>>, Path(sequence_id): Path<i64>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "templates": state.service.list_templates(sequence_id)? })))
}

pub async fn get_template(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "template": state.service.get_template(id)? })))
}

pub async fn create_template(
    State(state): State<Arc<AppState>>,
    Path(sequence_id): Path<i64>,
    Json(draft): Json<TemplateDraft>,
) -> ApiResult {
    Ok(Json(json!({ "ok": true, "template": state.service.create_template(sequence_id, &draft)? })))
}

pub async fn update_template(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(draft): Json<TemplateDraft>,
) -> ApiResult {
    Ok(Json(json!({ "ok": true, "template": state.service.update_template(id, &draft)? })))
}

pub async fn delete_template(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "deleted": state.service.delete_template(id)? })))
}

// ─── Deliveries ──────────────────────────────────────

/// `?status=&sequence_id=&template_id=&lead_id=&from=&to=&limit=`
pub async fn list_deliveries(State(state): State<Arc<AppState>>, Query(filter): Query<DeliveryFilter>) -> ApiResult {
    let deliveries = state.service.list_deliveries(&filter)?;
    Ok(Json(json!({ "ok": true, "count": deliveries.len(), "deliveries": deliveries })))
}

/// One delivery with its tracking events.
pub async fn get_delivery(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    let delivery = state.service.get_delivery(id)?;
    let events = state.service.tracking_events(id)?;
    Ok(Json(json!({ "ok": true, "delivery": delivery, "events": events })))
}

#[derive(Debug, Deserialize)]
pub struct SendNowRequest {
    pub lead_id: i64,
    pub template_id: i64,
    /// Needed only when the lead has no stored profile.
    #[serde(default)]
    pub email: Option<String>,
}

pub async fn send_now(State(state): State<Arc<AppState>>, Json(req): Json<SendNowRequest>) -> ApiResult {
    let report = state
        .service
        .send_now(req.lead_id, req.template_id, req.email.as_deref())
        .await?;
    Ok(Json(json!({ "ok": true, "delivery": report.delivery, "outcome": report.outcome })))
}

pub async fn resend(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> ApiResult {
    let report = state.service.resend(id).await?;
    Ok(Json(json!({ "ok": true, "delivery": report.delivery, "outcome": report.outcome })))
}

// ─── Suppressions ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SuppressionRequest {
    pub email: String,
    #[serde(default)]
    pub reason: Option<String>,
}

pub async fn list_suppressions(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "unsubscribed": state.service.list_unsubscribed()? })))
}

/// Unknown addresses report as subscribed.
pub async fn get_suppression(State(state): State<Arc<AppState>>, Path(email): Path<String>) -> ApiResult {
    let entry = state.service.suppression_entry(&email)?;
    let subscribed = entry.as_ref().is_none_or(|e| e.is_subscribed);
    Ok(Json(json!({ "ok": true, "email": email, "is_subscribed": subscribed, "entry": entry })))
}

pub async fn unsubscribe(State(state): State<Arc<AppState>>, Json(req): Json<SuppressionRequest>) -> ApiResult {
    let outcome = state.service.unsubscribe(&req.email, req.reason.as_deref())?;
    Ok(Json(json!({ "ok": true, "outcome": outcome })))
}

pub async fn resubscribe(State(state): State<Arc<AppState>>, Json(req): Json<SuppressionRequest>) -> ApiResult {
    let changed = state.service.resubscribe(&req.email)?;
    Ok(Json(json!({ "ok": true, "changed": changed })))
}

// ─── Reconciliation ──────────────────────────────────────

/// Dry run: the duplicate groups an apply would touch.
pub async fn reconcile_plan(State(state): State<Arc<AppState>>) -> ApiResult {
    let groups = state.service.find_duplicates()?;
    let removable: usize = groups.iter().map(|g| g.remove.len()).sum();
    Ok(Json(json!({ "ok": true, "groups": groups, "removable": removable })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReconcileRequest {
    /// A previously reviewed plan. Absent means "find and apply now".
    #[serde(default)]
    pub groups: Option<Vec<DuplicateGroup>>,
}

pub async fn reconcile_apply(State(state): State<Arc<AppState>>, Json(req): Json<ReconcileRequest>) -> ApiResult {
    let report = match &req.groups {
        Some(groups) => state.service.reconcile(groups)?,
        None => state.service.reconcile_all()?,
    };
    Ok(Json(json!({ "ok": true, "report": report })))
}

// ─── Metrics, usage, audit ──────────────────────────────────────

/// `?from=&to=&sequence_id=&template_id=` with RFC 3339 bounds.
pub async fn metrics(State(state): State<Arc<AppState>>, Query(query): Query<MetricsQuery>) -> ApiResult {
    let report = state.service.metrics(&query)?;
    Ok(Json(json!({ "ok": true, "metrics": report })))
}

pub async fn usage(State(state): State<Arc<AppState>>) -> ApiResult {
    Ok(Json(json!({ "ok": true, "usage": state.service.usage()? })))
}

#[derive(Debug, Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn audit_log(State(state): State<Arc<AppState>>, Query(q): Query<AuditQuery>) -> ApiResult {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    Ok(Json(json!({ "ok": true, "entries": state.service.recent_audit(limit)? })))
}
