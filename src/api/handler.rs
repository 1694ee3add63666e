use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use super::models::*;
use crate::{
    config::RailMode,
    error::AppResult,
    ledger::models::Payment,
    orchestrator::{PaymentOrchestrator, PaymentView},
    settlement::{ApprovalGate, ApprovalOutcome, SafetyMonitor, SafetyReport},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<PaymentOrchestrator>,
    pub approval_gate: Arc<ApprovalGate>,
    pub safety_monitor: Arc<SafetyMonitor>,
    pub rail_mode: RailMode,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        rail_mode: format!("{:?}", state.rail_mode).to_lowercase(),
    })
}

/// Create an escrowed payment awaiting its deposit
/// POST /payments
pub async fn create_payment(
    State(state): State<AppState>,
    Json(request): Json<CreatePaymentRequest>,
) -> AppResult<(StatusCode, Json<Payment>)> {
    request.validate()?;
    info!("📝 Creating payment {} -> {}", request.payer_id, request.payee_id);

    let payment = state.orchestrator.create_payment(request.into()).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

/// GET /payments/:id
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<PaymentView>> {
    Ok(Json(state.orchestrator.status(payment_id).await?))
}

/// GET /payments/:id/events
pub async fn get_payment_events(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<EventListResponse>> {
    let events = state.orchestrator.events(payment_id).await?;
    Ok(Json(EventListResponse { payment_id, events }))
}

/// Push the payment one step further if that step is due
/// POST /payments/:id/advance
pub async fn advance_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<Payment>> {
    Ok(Json(state.orchestrator.advance(payment_id).await?))
}

/// POST /payments/:id/approve
pub async fn approve_release(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<ApproveRequest>,
) -> AppResult<Json<ApprovalOutcome>> {
    request.validate()?;

    let outcome = state
        .approval_gate
        .approve(
            payment_id,
            request.party,
            &request.actor_id,
            request.approved,
            request.tx_hash,
        )
        .await?;
    Ok(Json(outcome))
}

/// POST /payments/:id/cancel
pub async fn cancel_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> AppResult<Json<PaymentView>> {
    state.orchestrator.cancel(payment_id).await?;
    Ok(Json(state.orchestrator.status(payment_id).await?))
}

/// POST /payments/:id/dispute
pub async fn raise_dispute(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<DisputeRequest>,
) -> AppResult<Json<PaymentView>> {
    request.validate()?;

    state
        .orchestrator
        .raise_dispute(payment_id, &request.reason)
        .await?;
    Ok(Json(state.orchestrator.status(payment_id).await?))
}

/// POST /payments/:id/dispute/resolve
pub async fn resolve_dispute(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<ResolveDisputeRequest>,
) -> AppResult<Json<PaymentView>> {
    state
        .orchestrator
        .resolve_dispute(payment_id, request.resolution)
        .await?;
    Ok(Json(state.orchestrator.status(payment_id).await?))
}

/// Run a safety scan now instead of waiting for the next tick
/// POST /admin/safety/scan
pub async fn run_safety_scan(State(state): State<AppState>) -> AppResult<Json<SafetyReport>> {
    info!("🛡️  On-demand safety scan requested");
    Ok(Json(state.safety_monitor.scan_at(Utc::now()).await?))
}
