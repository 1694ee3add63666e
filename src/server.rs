use axum::{
    routing::{get, post},
    Router,
};
use std::future::Future;
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    api::handler::{
        advance_payment, approve_release, cancel_payment, create_payment, get_payment,
        get_payment_events, health_check, raise_dispute, resolve_dispute, run_safety_scan,
        AppState,
    },
    config::Config,
    middleware::create_cors_layer,
};

pub fn create_app(state: AppState, config: &Config) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    let app = Router::new()
        // Public health check endpoint
        .route("/health", get(health_check))
        .nest(
            "/api/v1",
            Router::new()
                // Payment lifecycle
                .route("/payments", post(create_payment))
                .route("/payments/:id", get(get_payment))
                .route("/payments/:id/events", get(get_payment_events))
                .route("/payments/:id/advance", post(advance_payment))
                .route("/payments/:id/approve", post(approve_release))
                .route("/payments/:id/cancel", post(cancel_payment))
                // Disputes
                .route("/payments/:id/dispute", post(raise_dispute))
                .route("/payments/:id/dispute/resolve", post(resolve_dispute))
                // Admin endpoints
                .route("/admin/safety/scan", post(run_safety_scan)),
        )
        .layer(CompressionLayer::new())
        .layer(create_cors_layer(&config.cors_origin_list()))
        // Add request tracing
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!("✓ HTTP routes configured");
    app
}

pub async fn run_server<F>(
    app: Router,
    bind_address: &str,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    use crate::config::{RailMode, SafetyConfig};
    use crate::notifications::LogNotifier;
    use crate::orchestrator::testing::Harness;
    use crate::settlement::{ApprovalGate, SafetyMonitor};

    fn app(h: &Harness) -> Router {
        let state = AppState {
            orchestrator: h.orchestrator.clone(),
            approval_gate: Arc::new(ApprovalGate::new(h.ledger.clone(), h.orchestrator.clone())),
            safety_monitor: Arc::new(SafetyMonitor::new(
                h.ledger.clone(),
                h.orchestrator.clone(),
                h.escrow.clone(),
                Arc::new(LogNotifier),
                SafetyConfig::default(),
                Duration::from_secs(60),
            )),
            rail_mode: RailMode::Sandbox,
        };
        create_app(state, &Config::default())
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn payment_body() -> serde_json::Value {
        serde_json::json!({
            "amount": "1000",
            "currency": "MXN",
            "payer_id": "payer-1",
            "payee_id": "payee-1",
            "payout_clabe": "646180157000000004",
            "payout_holder_name": "Ana Lopez",
            "deposit_clabe": "710969000000000001",
            "description": "Laptop",
            "custody_percent": "20",
            "custody_period_hours": 24
        })
    }

    #[tokio::test]
    async fn health_reports_rail_mode() {
        let h = Harness::new();
        let (status, body) = send(app(&h), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["rail_mode"], "sandbox");
    }

    #[tokio::test]
    async fn create_then_read_payment_and_events() {
        let h = Harness::new();
        let router = app(&h);

        let (status, created) =
            send(router.clone(), post_json("/api/v1/payments", payment_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        let id = created["id"].as_str().unwrap().to_string();

        let (status, view) = send(router.clone(), get(&format!("/api/v1/payments/{}", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["payment"]["id"], id.as_str());
        assert!(view["escrow"].is_null());

        let (status, events) =
            send(router, get(&format!("/api/v1/payments/{}/events", id))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(events["events"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_before_the_ledger() {
        let h = Harness::new();
        let mut body = payment_body();
        body["payout_clabe"] = serde_json::json!("123");

        let (status, error) = send(app(&h), post_json("/api/v1/payments", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["error_code"], "VALIDATION_FAILED");
    }

    #[tokio::test]
    async fn unknown_payment_is_404() {
        let h = Harness::new();
        let uri = format!("/api/v1/payments/{}", uuid::Uuid::new_v4());
        let (status, error) = send(app(&h), get(&uri)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(error["error_code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn dispute_on_pending_payment_conflicts() {
        let h = Harness::new();
        let router = app(&h);
        let (_, created) =
            send(router.clone(), post_json("/api/v1/payments", payment_body())).await;
        let id = created["id"].as_str().unwrap().to_string();

        let (status, error) = send(
            router,
            post_json(
                &format!("/api/v1/payments/{}/dispute", id),
                serde_json::json!({ "reason": "item never arrived" }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(error["error_code"], "INVALID_STATE");
    }
}
