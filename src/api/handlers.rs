//! Request Handlers
//!
//! Thin adapters from HTTP to the ledger engine. Player endpoints identify the
//! caller through [`CallerId`]; provider and match-engine endpoints present the
//! service key instead. Units of work block on the store's write lock, so they
//! run on the blocking pool rather than on the async workers.

use super::{
    errors::ApiError,
    middleware::{validate_api_key, CallerId, RequestId},
    models::*,
};
use crate::bonus::{BonusGrant, BonusSummary, ClaimContext};
use crate::casino::{LaunchRequest, LaunchTicket, ProviderCallback, SettlementOutcome, SpinAck};
use crate::commission::{CommissionOverview, CommissionPayout};
use crate::engine::LedgerEngine;
use crate::errors::{LedgerError, LedgerResult};
use crate::matches::{MatchResult, PeerMatch};
use crate::money::{parse_major_units, Amount};
use crate::workflow::{DepositRequest, WithdrawRequest};
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap},
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub engine: Arc<LedgerEngine>,
    pub version: String,
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn reject(request_id: &RequestId) -> impl Fn(LedgerError) -> ApiError + '_ {
    move |e| ApiError::ledger(request_id.0.clone(), e)
}

/// Run a ledger operation on the blocking pool
async fn blocking<T, F>(state: &AppState, request_id: &RequestId, op: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&LedgerEngine) -> LedgerResult<T> + Send + 'static,
{
    let engine = state.engine.clone();
    match tokio::task::spawn_blocking(move || op(engine.as_ref())).await {
        Ok(result) => result.map_err(reject(request_id)),
        Err(e) => Err(ApiError::internal(request_id.0.clone(), e.to_string())),
    }
}

const MAX_HISTORY: usize = 500;

fn parse_amount(state: &AppState, request_id: &RequestId, raw: &str) -> Result<Amount, ApiError> {
    parse_major_units(raw, state.engine.config().cashier.minor_unit_digits).map_err(reject(request_id))
}

fn require_service_key(state: &AppState, headers: &HeaderMap, request_id: &RequestId) -> Result<(), ApiError> {
    validate_api_key(state.engine.config().api.api_key.as_deref(), headers, &request_id.0)
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "Running".to_string(),
        version: state.version.clone(),
    })
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.engine.metrics().to_prometheus_format(),
    )
}

/// GET /accounts/me
pub async fn account_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
) -> ApiResult<AccountResponse> {
    let account = blocking(&state, &request_id, move |engine| engine.store.account(&user_id)).await?;
    Ok(Json(AccountResponse {
        withdrawable: account.withdrawable(),
        account,
    }))
}

/// GET /accounts/me/transactions?limit={n}
pub async fn transactions_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<TransactionsResponse> {
    if query.limit == 0 || query.limit > MAX_HISTORY {
        return Err(ApiError::bad_request(
            request_id.0.clone(),
            format!("limit must be between 1 and {}", MAX_HISTORY),
        ));
    }
    let transactions = blocking(&state, &request_id, move |engine| {
        engine.store.transactions(&user_id, query.limit)
    })
    .await?;
    Ok(Json(TransactionsResponse {
        total_returned: transactions.len(),
        transactions,
    }))
}

/// POST /deposits
pub async fn deposit_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Json(body): Json<DepositBody>,
) -> ApiResult<DepositRequest> {
    let amount = parse_amount(&state, &request_id, &body.amount)?;
    let request = blocking(&state, &request_id, move |engine| {
        engine
            .cashier
            .request_deposit(&user_id, amount, &body.method, &body.trx_id)
    })
    .await?;
    Ok(Json(request))
}

/// POST /withdrawals
pub async fn withdraw_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Json(body): Json<WithdrawBody>,
) -> ApiResult<WithdrawRequest> {
    let amount = parse_amount(&state, &request_id, &body.amount)?;
    let request = blocking(&state, &request_id, move |engine| {
        engine
            .cashier
            .request_withdraw(&user_id, amount, &body.method, &body.account)
    })
    .await?;
    Ok(Json(request))
}

/// GET /admin/deposits
pub async fn pending_deposits_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(admin_id): CallerId,
) -> ApiResult<Vec<DepositRequest>> {
    let requests = blocking(&state, &request_id, move |engine| engine.cashier.pending_deposits(&admin_id)).await?;
    Ok(Json(requests))
}

/// GET /admin/withdrawals
pub async fn pending_withdrawals_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(admin_id): CallerId,
) -> ApiResult<Vec<WithdrawRequest>> {
    let requests = blocking(&state, &request_id, move |engine| {
        engine.cashier.pending_withdrawals(&admin_id)
    })
    .await?;
    Ok(Json(requests))
}

/// POST /admin/deposits/:id/approve
pub async fn approve_deposit_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(admin_id): CallerId,
    Path(deposit_id): Path<u64>,
) -> ApiResult<DepositRequest> {
    let request = blocking(&state, &request_id, move |engine| {
        engine.cashier.approve_deposit(&admin_id, deposit_id)
    })
    .await?;
    Ok(Json(request))
}

/// POST /admin/deposits/:id/reject
pub async fn reject_deposit_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(admin_id): CallerId,
    Path(deposit_id): Path<u64>,
) -> ApiResult<DepositRequest> {
    let request = blocking(&state, &request_id, move |engine| {
        engine.cashier.reject_deposit(&admin_id, deposit_id)
    })
    .await?;
    Ok(Json(request))
}

/// POST /admin/withdrawals/:id/approve
pub async fn approve_withdraw_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(admin_id): CallerId,
    Path(withdraw_id): Path<u64>,
) -> ApiResult<WithdrawRequest> {
    let request = blocking(&state, &request_id, move |engine| {
        engine.cashier.approve_withdraw(&admin_id, withdraw_id)
    })
    .await?;
    Ok(Json(request))
}

/// POST /bonuses/claim
pub async fn claim_bonus_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Json(body): Json<BonusClaimBody>,
) -> ApiResult<BonusGrant> {
    let amount = match body.amount.as_deref() {
        Some(raw) => Some(parse_amount(&state, &request_id, raw)?),
        None => None,
    };
    let context = ClaimContext {
        amount,
        friend_id: body.friend_id,
    };
    let kind = body.kind;
    let grant = blocking(&state, &request_id, move |engine| engine.bonus.claim(&user_id, kind, &context)).await?;
    Ok(Json(grant))
}

/// GET /bonuses
pub async fn bonus_summary_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
) -> ApiResult<BonusSummary> {
    let summary = blocking(&state, &request_id, move |engine| engine.bonus.summary(&user_id)).await?;
    Ok(Json(summary))
}

/// GET /commission
pub async fn commission_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(agent_id): CallerId,
) -> ApiResult<CommissionOverview> {
    let overview = blocking(&state, &request_id, move |engine| engine.commission.overview(&agent_id)).await?;
    Ok(Json(overview))
}

/// POST /commission/claim
pub async fn claim_commission_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(agent_id): CallerId,
    Json(body): Json<CommissionClaimBody>,
) -> ApiResult<CommissionPayout> {
    let amount = parse_amount(&state, &request_id, &body.amount)?;
    let payout = blocking(&state, &request_id, move |engine| engine.commission.claim(&agent_id, amount)).await?;
    Ok(Json(payout))
}

/// POST /casino/launch
pub async fn casino_launch_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    CallerId(user_id): CallerId,
    Json(body): Json<LaunchBody>,
) -> ApiResult<LaunchTicket> {
    let request = LaunchRequest {
        user_id,
        game_uid: body.game_uid,
        mode: body.mode,
    };
    let ticket = state.engine.casino.launch(&request).await.map_err(reject(&request_id))?;
    Ok(Json(ticket))
}

/// POST /casino/callback
pub async fn casino_callback_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ProviderCallback>,
) -> ApiResult<SpinAck> {
    require_service_key(&state, &headers, &request_id)?;
    let ack = blocking(&state, &request_id, move |engine| engine.casino.record_spin(&body)).await?;
    Ok(Json(ack))
}

/// POST /casino/settle
pub async fn casino_settle_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CasinoSettleBody>,
) -> ApiResult<SettlementOutcome> {
    require_service_key(&state, &headers, &request_id)?;
    let outcome = blocking(&state, &request_id, move |engine| {
        engine.casino.settle(&body.match_id, body.balance)
    })
    .await?;
    Ok(Json(outcome))
}

/// POST /matches
pub async fn open_match_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OpenMatchBody>,
) -> ApiResult<PeerMatch> {
    require_service_key(&state, &headers, &request_id)?;
    let created = blocking(&state, &request_id, move |engine| engine.matches.open_match(body.kind, body.stake)).await?;
    Ok(Json(created))
}

/// POST /matches/:id/join
pub async fn join_match_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<JoinMatchBody>,
) -> ApiResult<PeerMatch> {
    require_service_key(&state, &headers, &request_id)?;
    let joined = blocking(&state, &request_id, move |engine| {
        engine.matches.join_match(match_id, &body.user_id)
    })
    .await?;
    Ok(Json(joined))
}

/// POST /matches/:id/settle
pub async fn settle_match_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(match_id): Path<u64>,
    headers: HeaderMap,
    Json(body): Json<SettleMatchBody>,
) -> ApiResult<MatchResult> {
    require_service_key(&state, &headers, &request_id)?;
    let result = blocking(&state, &request_id, move |engine| {
        engine.matches.settle_match(match_id, &body.winners)
    })
    .await?;
    Ok(Json(result))
}
