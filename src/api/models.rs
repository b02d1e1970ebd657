//! API Request and Response Models
//!
//! Player-facing amounts travel as major-unit decimal strings ("300.00");
//! provider and match-engine calls use integer minor units.

use crate::bonus::BonusKind;
use crate::config::SettlementMode;
use crate::ledger::{Account, GameKind, Transaction};
use crate::money::Amount;
use serde::{Deserialize, Serialize};

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountResponse {
    #[serde(flatten)]
    pub account: Account,
    pub withdrawable: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionsResponse {
    pub transactions: Vec<Transaction>,
    pub total_returned: usize,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositBody {
    pub amount: String,
    pub method: String,
    pub trx_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawBody {
    pub amount: String,
    pub method: String,
    pub account: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BonusClaimBody {
    pub kind: BonusKind,
    #[serde(default)]
    pub amount: Option<String>,
    #[serde(default)]
    pub friend_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommissionClaimBody {
    pub amount: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchBody {
    pub game_uid: String,
    #[serde(default)]
    pub mode: Option<SettlementMode>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CasinoSettleBody {
    pub match_id: String,
    /// Final provider balance for Immediate sessions
    #[serde(default)]
    pub balance: Option<Amount>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpenMatchBody {
    pub kind: GameKind,
    pub stake: Amount,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinMatchBody {
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettleMatchBody {
    pub winners: Vec<String>,
}
