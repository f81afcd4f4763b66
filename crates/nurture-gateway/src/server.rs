//! HTTP server implementation using Axum.

use axum::{
    Router,
    routing::{get, post},
};
use nurture_campaign::CampaignService;
use nurture_core::NurtureConfig;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{routes, tracking};

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CampaignService>,
    pub config: Arc<NurtureConfig>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(service: Arc<CampaignService>, config: NurtureConfig) -> Self {
        Self { service, config: Arc::new(config), start_time: std::time::Instant::now() }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);

    let api = Router::new()
        .route("/api/v1/info", get(routes::system_info))
        .route("/api/v1/events", post(routes::ingest_event))
        .route("/api/v1/dispatch", post(routes::dispatch_once))
        // Catalog
        .route("/api/v1/sequences", get(routes::list_sequences).post(routes::create_sequence))
        .route(
            "/api/v1/sequences/{id}",
            get(routes::get_sequence).put(routes::update_sequence).delete(routes::delete_sequence),
        )
        .route(
            "/api/v1/sequences/{id}/templates",
            get(routes::list_templates).post(routes::create_template),
        )
        .route(
            "/api/v1/templates/{id}",
            get(routes::get_template).put(routes::update_template).delete(routes::delete_template),
        )
        // Deliveries
        .route("/api/v1/deliveries", get(routes::list_deliveries))
        .route("/api/v1/deliveries/send-now", post(routes::send_now))
        .route("/api/v1/deliveries/{id}", get(routes::get_delivery))
        .route("/api/v1/deliveries/{id}/resend", post(routes::resend))
        // Suppressions
        .route("/api/v1/suppressions", get(routes::list_suppressions))
        .route("/api/v1/suppressions/unsubscribe", post(routes::unsubscribe))
        .route("/api/v1/suppressions/resubscribe", post(routes::resubscribe))
        .route("/api/v1/suppressions/{email}", get(routes::get_suppression))
        // Reconciliation, metrics, audit
        .route("/api/v1/reconcile", get(routes::reconcile_plan).post(routes::reconcile_apply))
        .route("/api/v1/metrics", get(routes::metrics))
        .route("/api/v1/usage", get(routes::usage))
        .route("/api/v1/audit", get(routes::audit_log));

    // Public endpoints hit by mail clients and the provider
    let public = Router::new()
        .route("/health", get(routes::health_check))
        .route("/t/open/{id}", get(tracking::open_pixel))
        .route("/t/click/{id}", get(tracking::click_redirect))
        .route("/t/unsubscribe/{id}", get(tracking::unsubscribe_link))
        .route("/api/v1/webhooks/bounce", post(tracking::bounce_webhook));

    api.merge(public)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::PUT,
                    axum::http::Method::DELETE,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // Example: NURTURE_CORS_ORIGINS=https://admin.example.com,https://crm.example.com
            if let Ok(origins_str) = std::env::var("NURTURE_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server and run until `shutdown` resolves.
pub async fn start(state: AppState, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("🌐 Gateway server listening on http://{}", addr);
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await?;
    tracing::info!("👋 Gateway server stopped");
    Ok(())
}
