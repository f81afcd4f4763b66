//! Public tracking endpoints hit by mail clients and the email provider.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Redirect, Response},
};
use nurture_campaign::BounceRef;
use nurture_core::{ClientMeta, NurtureError};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::server::AppState;

/// Transparent 1x1 GIF.
const PIXEL_GIF: [u8; 43] = [
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff,
    0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00,
    0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Client address from proxy headers plus the user agent.
fn client_meta(headers: &HeaderMap) -> ClientMeta {
    let ip = header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .or_else(|| header_str(headers, "x-real-ip"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    ClientMeta { ip, user_agent: header_str(headers, "user-agent").map(String::from) }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// `GET /t/open/{id}`: always answers with the pixel, recording is best effort.
pub async fn open_pixel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    if let Err(e) = state.service.record_open(id, &client_meta(&headers)) {
        tracing::debug!("open for delivery #{id} not recorded: {e}");
    }
    (
        [
            (header::CONTENT_TYPE, "image/gif"),
            (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
        ],
        PIXEL_GIF.to_vec(),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct ClickQuery {
    pub url: String,
}

/// `GET /t/click/{id}?url=`: record, then redirect. Only http(s) targets of
/// known deliveries are followed.
pub async fn click_redirect(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(q): Query<ClickQuery>,
    headers: HeaderMap,
) -> Result<Redirect, ApiError> {
    let target = reqwest::Url::parse(&q.url)
        .ok()
        .filter(|u| matches!(u.scheme(), "http" | "https"))
        .ok_or_else(|| NurtureError::Validation(format!("refusing to redirect to '{}'", q.url)))?;
    state.service.record_click(id, target.as_str(), &client_meta(&headers))?;
    Ok(Redirect::temporary(target.as_str()))
}

/// `GET /t/unsubscribe/{id}`: one-click opt-out with an HTML confirmation.
pub async fn unsubscribe_link(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.service.unsubscribe_delivery(id) {
        Ok(outcome) => {
            tracing::info!("🔕 Unsubscribe link used for delivery #{id} ({} pending cancelled)", outcome.cancelled);
            Html(
                "<!doctype html><html><body style=\"font-family:sans-serif;text-align:center;padding:3em\">\
                 <h2>You have been unsubscribed</h2>\
                 <p>You will not receive further emails from this sequence.</p>\
                 </body></html>",
            )
            .into_response()
        }
        Err(NurtureError::NotFound(_)) => (
            StatusCode::NOT_FOUND,
            Html("<!doctype html><html><body><h2>Link not recognised</h2></body></html>"),
        )
            .into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

/// Provider bounce notification. Either id identifies the delivery.
#[derive(Debug, Deserialize)]
pub struct BounceNotice {
    #[serde(default)]
    pub delivery_id: Option<i64>,
    #[serde(default, alias = "message_id", alias = "email_id")]
    pub transport_id: Option<String>,
}

pub async fn bounce_webhook(State(state): State<Arc<AppState>>, Json(notice): Json<BounceNotice>) -> ApiResult {
    let reference = match (notice.delivery_id, notice.transport_id) {
        (Some(id), _) => BounceRef::Delivery(id),
        (None, Some(transport_id)) if !transport_id.is_empty() => BounceRef::Transport(transport_id),
        _ => {
            return Err(NurtureError::Validation("bounce needs delivery_id or transport_id".into()).into());
        }
    };
    let delivery = state.service.record_bounce(&reference)?;
    Ok(Json(json!({ "ok": true, "delivery_id": delivery.id, "bounced_at": delivery.bounced_at })))
}
