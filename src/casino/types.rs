use crate::config::SettlementMode;
use crate::ledger::UserId;
use crate::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CasinoGameStatus {
    Playing,
    /// Batch game whose pending spins were applied at least once
    Completed,
    /// Closed; no further callbacks are accepted
    Settled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CasinoGame {
    pub id: u64,
    pub user_id: UserId,
    /// Correlation key shared with the provider
    pub match_id: String,
    pub game_uid: String,
    pub mode: SettlementMode,
    pub status: CasinoGameStatus,
    pub bet_amount: Amount,
    pub win_amount: Amount,
    pub net_result: Amount,
    /// Account funds held for this game until settlement
    #[serde(default)]
    pub held: Amount,
    pub token: String,
    pub launch_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpinStatus {
    Pending,
    Completed,
    Settled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CasinoSpin {
    pub id: u64,
    pub match_id: String,
    pub user_id: UserId,
    pub round_id: String,
    pub bet_amount: Amount,
    pub win_amount: Amount,
    pub net_result: Amount,
    pub status: SpinStatus,
    pub created_at: DateTime<Utc>,
}

/// Provider-side balance of an Immediate session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionBalance {
    pub match_id: String,
    pub user_id: UserId,
    pub balance: Amount,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub user_id: UserId,
    pub game_uid: String,
    #[serde(default)]
    pub mode: Option<SettlementMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchTicket {
    pub game_id: u64,
    pub match_id: String,
    pub mode: SettlementMode,
    pub launch_url: String,
}

/// One provider round reported through the callback endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCallback {
    pub match_id: String,
    pub round_id: String,
    pub bet_amount: Amount,
    pub win_amount: Amount,
    /// Provider's balance after the round; Immediate sessions adopt it when present
    #[serde(default)]
    pub balance_after: Option<Amount>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpinAck {
    pub spin_id: u64,
    pub match_id: String,
    pub round_id: String,
    pub status: SpinStatus,
    /// Balance the provider should display after this round
    pub balance: Amount,
    /// The round was already recorded by an earlier delivery
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SettlementOutcome {
    pub match_id: String,
    pub mode: SettlementMode,
    pub spins_settled: usize,
    pub net_result: Amount,
    pub balance: Amount,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SweepReport {
    pub settled: usize,
    pub closed_idle: usize,
}
