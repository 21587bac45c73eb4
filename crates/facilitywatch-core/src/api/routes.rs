//! API routes

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, AppState};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))

        // Alert rules
        .route(
            "/api/v1/alert-rules",
            get(handlers::list_alert_rules).post(handlers::create_alert_rule),
        )
        .route(
            "/api/v1/alert-rules/:rule_id",
            get(handlers::get_alert_rule)
                .put(handlers::update_alert_rule)
                .patch(handlers::update_alert_rule)
                .delete(handlers::delete_alert_rule),
        )

        // Alerts
        .route(
            "/api/v1/alerts",
            get(handlers::list_alerts).post(handlers::create_alert),
        )
        .route("/api/v1/alerts/evaluate", post(handlers::evaluate_alerts))
        .route("/api/v1/alerts/:alert_id", get(handlers::get_alert))
        .route("/api/v1/alerts/:alert_id/acknowledge", post(handlers::acknowledge_alert))
        .route("/api/v1/alerts/:alert_id/resolve", post(handlers::resolve_alert))
        .route("/api/v1/alerts/:alert_id/close", post(handlers::close_alert))
        .route("/api/v1/alerts/:alert_id/work-orders", post(handlers::create_work_order))

        // Real-time streaming
        .route("/api/v1/ws", get(handlers::alert_stream))

        .with_state(state)
}
