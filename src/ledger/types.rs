use crate::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque user identifier assigned by the platform
pub type UserId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    User,
    SubAgent,
    Admin,
}

/// Game families whose results are tracked per account
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    Ludo,
    CallBreak,
    TeenPatti,
    Rummy,
    Casino,
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameKind::Ludo => write!(f, "ludo"),
            GameKind::CallBreak => write!(f, "call_break"),
            GameKind::TeenPatti => write!(f, "teen_patti"),
            GameKind::Rummy => write!(f, "rummy"),
            GameKind::Casino => write!(f, "casino"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GameOutcome {
    Win,
    Loss,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameStats {
    pub played: u64,
    pub wins: u64,
    pub losses: u64,
}

/// Durable monetary state of one user
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub user_id: UserId,
    pub role: Role,
    pub referred_by: Option<UserId>,
    pub is_banned: bool,

    /// Spendable funds
    pub balance: Amount,
    /// Bonus-encumbered funds, not withdrawable until turnover is met
    pub locked_balance: Amount,
    /// Funds committed to open casino games; settlement releases them
    #[serde(default)]
    pub held_balance: Amount,

    pub total_deposited: Amount,
    pub total_withdrawn: Amount,
    pub total_wagered: Amount,
    pub total_turnover: Amount,

    pub games_played: u64,
    pub wins: u64,
    pub losses: u64,
    #[serde(default)]
    pub game_stats: BTreeMap<GameKind, GameStats>,

    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(user_id: UserId, role: Role, referred_by: Option<UserId>, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            role,
            referred_by,
            is_banned: false,
            balance: 0,
            locked_balance: 0,
            held_balance: 0,
            total_deposited: 0,
            total_withdrawn: 0,
            total_wagered: 0,
            total_turnover: 0,
            games_played: 0,
            wins: 0,
            losses: 0,
            game_stats: BTreeMap::new(),
            created_at: now,
        }
    }

    /// Balance not encumbered by active bonuses or open casino games
    pub fn withdrawable(&self) -> Amount {
        (self.balance - self.locked_balance - self.held_balance).max(0)
    }

    /// Balance not held by open casino games
    pub fn spendable(&self) -> Amount {
        (self.balance - self.held_balance).max(0)
    }

    pub fn stats_for(&self, kind: GameKind) -> GameStats {
        self.game_stats.get(&kind).copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Deposit,
    Withdraw,
    Bonus,
    Win,
    Loss,
    /// Peer match entry fee taken at join
    Stake,
    Commission,
    CommissionPayout,
    /// Unearned bonus taken back when the bonus expires
    BonusForfeit,
}

impl TransactionKind {
    /// Sign of this kind in the ledger reconciliation identity, zero if not counted
    pub fn reconciliation_sign(self) -> i64 {
        match self {
            TransactionKind::Deposit
            | TransactionKind::Win
            | TransactionKind::Bonus
            | TransactionKind::Commission => 1,
            TransactionKind::Withdraw | TransactionKind::Loss | TransactionKind::BonusForfeit => -1,
            TransactionKind::Stake | TransactionKind::CommissionPayout => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Completed,
}

/// Immutable ledger entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub id: u64,
    pub user_id: UserId,
    pub kind: TransactionKind,
    /// Unsigned magnitude of the movement
    pub amount: Amount,
    /// Exact change applied to `balance` in the same unit of work
    pub balance_delta: Amount,
    pub status: TransactionStatus,
    pub reference: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Transaction row to append alongside a mutation
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub kind: TransactionKind,
    pub amount: Amount,
    pub status: TransactionStatus,
    pub reference: String,
    pub description: String,
}

impl NewTransaction {
    pub fn completed(kind: TransactionKind, amount: Amount, reference: impl Into<String>) -> Self {
        Self {
            kind,
            amount,
            status: TransactionStatus::Completed,
            reference: reference.into(),
            description: String::new(),
        }
    }

    pub fn pending(kind: TransactionKind, amount: Amount, reference: impl Into<String>) -> Self {
        Self {
            status: TransactionStatus::Pending,
            ..Self::completed(kind, amount, reference)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Deltas applied to one account in one unit of work
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    pub balance_delta: Amount,
    pub locked_delta: Amount,
    pub held_delta: Amount,
    pub deposited_delta: Amount,
    pub withdrawn_delta: Amount,
    pub wagered_delta: Amount,
    pub turnover_delta: Amount,
    pub game_result: Option<(GameKind, GameOutcome)>,
}

impl Mutation {
    pub fn credit(amount: Amount) -> Self {
        Self {
            balance_delta: amount,
            ..Default::default()
        }
    }

    pub fn debit(amount: Amount) -> Self {
        Self {
            balance_delta: -amount,
            ..Default::default()
        }
    }

    pub fn locked(mut self, delta: Amount) -> Self {
        self.locked_delta = delta;
        self
    }

    pub fn held(mut self, delta: Amount) -> Self {
        self.held_delta = delta;
        self
    }

    pub fn deposited(mut self, delta: Amount) -> Self {
        self.deposited_delta = delta;
        self
    }

    pub fn withdrawn(mut self, delta: Amount) -> Self {
        self.withdrawn_delta = delta;
        self
    }

    pub fn wagered(mut self, delta: Amount) -> Self {
        self.wagered_delta = delta;
        self
    }

    pub fn turnover(mut self, delta: Amount) -> Self {
        self.turnover_delta = delta;
        self
    }

    pub fn game(mut self, kind: GameKind, outcome: GameOutcome) -> Self {
        self.game_result = Some((kind, outcome));
        self
    }
}

/// Comparison of the transaction log against the account row
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationReport {
    pub user_id: UserId,
    pub balance: Amount,
    /// Sum of `balance_delta` over every transaction
    pub delta_sum: Amount,
    /// Completed credits minus debits by transaction kind
    pub typed_sum: Amount,
    pub pending_withdrawals: Amount,
    pub transaction_count: usize,
}

impl ReconciliationReport {
    pub fn is_consistent(&self) -> bool {
        self.delta_sum == self.balance
    }
}
