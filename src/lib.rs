//! Wager Ledger - consistency engine for a real-money gaming platform
//!
//! Every money movement (deposits, withdrawals, bonuses, casino settlements,
//! commissions and match pots) goes through one atomic unit of work on the
//! ledger store, so account balances always equal the sum of their
//! transaction log.

pub mod api;
pub mod bonus;
pub mod casino;
pub mod clock;
pub mod commission;
pub mod config;
pub mod engine;
pub mod errors;
pub mod ledger;
pub mod matches;
pub mod metrics;
pub mod money;
pub mod storage;
pub mod testing;
pub mod workflow;

pub use config::{ConfigLoader, LedgerConfig};
pub use engine::LedgerEngine;
pub use errors::{LedgerError, LedgerResult};
pub use ledger::{Account, LedgerStore, Transaction, TransactionKind};
pub use money::Amount;
