//! API Routes
//!
//! HTTP endpoint definitions.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aggregate::AggregateRecord;
use crate::domain::{
    AggregateKind, AmountDelta, CurrencyCode, EconomicEvent, OperationContext, RawEconomicEvent,
};
use crate::error::{AppError, AppResult};
use crate::ledger::LedgerEntry;
use crate::reconciler::{BalanceAudit, PaymentWebhook, ReconciliationReport};
use crate::wallet::{HistoryPage, PageRequest, Wallet, WalletTransaction};

use super::AppState;

// =========================================================================
// Request/Response types
// =========================================================================

#[derive(Debug, Deserialize)]
pub struct OpenWalletRequest {
    /// Defaults to the `X-Request-User-Id` of the caller
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub app_id: Option<String>,
    #[serde(default)]
    pub currency: Option<CurrencyCode>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterTransactionRequest {
    pub payment_intent_id: String,
    pub amount_delta: i64,
}

#[derive(Debug, Serialize)]
pub struct EventAccepted {
    pub event_type: String,
    pub aggregate_id: String,
    pub correlation_id: String,
    pub fingerprint: String,
}

#[derive(Debug, Serialize)]
pub struct LedgerResponse {
    pub wallet_id: Uuid,
    pub total: i64,
    pub entries: Vec<LedgerEntry>,
}

// =========================================================================
// API Router
// =========================================================================

/// Create the API router
pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/webhooks/payments", post(payment_webhook))
        .route("/events", post(publish_event))
        .route("/wallets", post(open_wallet))
        .route("/wallets/:wallet_id", get(get_wallet))
        .route("/wallets/:wallet_id/history", get(get_history))
        .route("/wallets/:wallet_id/ledger", get(get_ledger))
        .route("/wallets/:wallet_id/audit", get(get_audit))
        .route("/wallets/:wallet_id/transactions", post(register_transaction))
        .route("/aggregates/:kind/:aggregate_id", get(get_aggregate))
}

async fn health_check() -> &'static str {
    "OK"
}

// =========================================================================
// POST /webhooks/payments
// =========================================================================

async fn payment_webhook(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(webhook): Json<PaymentWebhook>,
) -> AppResult<Json<ReconciliationReport>> {
    let report = state.reconciler.handle_webhook(&webhook, &context).await?;
    Ok(Json(report))
}

// =========================================================================
// POST /events
// =========================================================================

/// Validate an economic event and hand it to the bus.
async fn publish_event(
    State(state): State<AppState>,
    Extension(mut context): Extension<OperationContext>,
    Json(mut raw): Json<RawEconomicEvent>,
) -> AppResult<(StatusCode, Json<EventAccepted>)> {
    if raw.correlation_id.trim().is_empty() {
        raw.correlation_id = context.ensure_correlation_id();
    }
    let event = EconomicEvent::try_from(raw)?;

    let accepted = EventAccepted {
        event_type: event.event_type.as_str().to_string(),
        aggregate_id: event.aggregate_id.clone(),
        correlation_id: event.correlation_id.clone(),
        fingerprint: event.fingerprint(),
    };
    state.publisher.publish(event).await?;

    tracing::info!(
        event_type = %accepted.event_type,
        aggregate_id = %accepted.aggregate_id,
        correlation_id = %accepted.correlation_id,
        "Event accepted"
    );

    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

// =========================================================================
// Wallets
// =========================================================================

/// 201 when created, 200 when the wallet already existed
async fn open_wallet(
    State(state): State<AppState>,
    Extension(context): Extension<OperationContext>,
    Json(request): Json<OpenWalletRequest>,
) -> AppResult<(StatusCode, Json<Wallet>)> {
    let owner = request
        .owner_user_id
        .or(context.actor_user_id)
        .ok_or_else(|| AppError::Validation("owner_user_id or X-Request-User-Id is required".into()))?;
    let currency = request.currency.unwrap_or_else(|| state.default_currency.clone());

    let (wallet, created) = state
        .wallets
        .open_wallet(&owner, request.app_id.as_deref(), &currency)
        .await?;

    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(wallet)))
}

async fn get_wallet(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> AppResult<Json<Wallet>> {
    Ok(Json(state.wallets.wallet(wallet_id).await?))
}

async fn get_history(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    Query(page): Query<PageRequest>,
) -> AppResult<Json<HistoryPage>> {
    Ok(Json(state.wallets.history(wallet_id, page.clamped()).await?))
}

async fn get_ledger(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> AppResult<Json<LedgerResponse>> {
    // 404 for unknown wallets rather than an empty ledger
    state.wallets.wallet(wallet_id).await?;

    let entries = state.ledger.entries_by_wallet(wallet_id).await?;
    let total = entries.iter().map(|e| e.amount).sum();
    Ok(Json(LedgerResponse {
        wallet_id,
        total,
        entries,
    }))
}

async fn get_audit(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
) -> AppResult<Json<BalanceAudit>> {
    Ok(Json(state.reconciler.audit_wallet(wallet_id).await?))
}

async fn register_transaction(
    State(state): State<AppState>,
    Path(wallet_id): Path<Uuid>,
    Json(request): Json<RegisterTransactionRequest>,
) -> AppResult<(StatusCode, Json<WalletTransaction>)> {
    let amount_delta = AmountDelta::new(request.amount_delta)?;
    let (transaction, created) = state
        .wallets
        .register_pending(wallet_id, &request.payment_intent_id, amount_delta)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(transaction)))
}

// =========================================================================
// GET /aggregates/:kind/:aggregate_id
// =========================================================================

async fn get_aggregate(
    State(state): State<AppState>,
    Path((kind, aggregate_id)): Path<(String, String)>,
) -> AppResult<Json<AggregateRecord>> {
    let kind: AggregateKind = kind.parse()?;
    state
        .engine
        .state(kind, &aggregate_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{} {}", kind, aggregate_id)))
}
