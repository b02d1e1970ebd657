//! Accounts, transactions and the atomic unit of work every money movement goes through

pub mod store;
pub mod types;

pub use store::{LedgerStore, LedgerTxn};
pub use types::*;
