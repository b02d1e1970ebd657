//! Route Definitions
//!
//! Maps URLs to handlers with type-safe routing.

use super::handlers::*;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    let metrics_enabled = state.engine.config().monitoring.enable_metrics;

    let router = Router::new()
        .route("/health", get(health_handler))
        // Player account
        .route("/accounts/me", get(account_handler))
        .route("/accounts/me/transactions", get(transactions_handler))
        // Cashier
        .route("/deposits", post(deposit_handler))
        .route("/withdrawals", post(withdraw_handler))
        .route("/admin/deposits", get(pending_deposits_handler))
        .route("/admin/withdrawals", get(pending_withdrawals_handler))
        .route("/admin/deposits/:id/approve", post(approve_deposit_handler))
        .route("/admin/deposits/:id/reject", post(reject_deposit_handler))
        .route("/admin/withdrawals/:id/approve", post(approve_withdraw_handler))
        // Bonuses and commission
        .route("/bonuses", get(bonus_summary_handler))
        .route("/bonuses/claim", post(claim_bonus_handler))
        .route("/commission", get(commission_handler))
        .route("/commission/claim", post(claim_commission_handler))
        // Casino provider
        .route("/casino/launch", post(casino_launch_handler))
        .route("/casino/callback", post(casino_callback_handler))
        .route("/casino/settle", post(casino_settle_handler))
        // Peer matches
        .route("/matches", post(open_match_handler))
        .route("/matches/:id/join", post(join_match_handler))
        .route("/matches/:id/settle", post(settle_match_handler));

    let router = if metrics_enabled {
        router.route("/metrics", get(metrics_handler))
    } else {
        router
    };

    router.with_state(state)
}
