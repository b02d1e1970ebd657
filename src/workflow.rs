//! Deposit and withdrawal approval workflow
//!
//! Deposits are credited only when an administrator approves them. Withdrawals
//! debit the balance when requested and hold a Pending ledger row that approval
//! flips to Completed without moving money again.

use crate::bonus;
use crate::config::CashierConfig;
use crate::errors::{LedgerError, LedgerResult};
use crate::ledger::store::{id_segment, validate_key_segment};
use crate::ledger::{LedgerStore, LedgerTxn, Mutation, NewTransaction, TransactionKind, UserId};
use crate::metrics::MetricsRegistry;
use crate::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const DEPOSIT_PREFIX: &str = "deposit:id:";
const DEPOSIT_PENDING_PREFIX: &str = "deposit:pending:";
const DEPOSIT_APPROVED_PREFIX: &str = "deposit:approved:";
const DEPOSIT_TRX_PREFIX: &str = "deposit:trx:";
const WITHDRAW_PREFIX: &str = "withdraw:id:";
const WITHDRAW_PENDING_PREFIX: &str = "withdraw:pending:";

fn deposit_key(id: u64) -> Vec<u8> {
    format!("{}{}", DEPOSIT_PREFIX, id_segment(id)).into_bytes()
}

fn deposit_pending_key(id: u64) -> Vec<u8> {
    format!("{}{}", DEPOSIT_PENDING_PREFIX, id_segment(id)).into_bytes()
}

fn deposit_approved_prefix(user_id: &str) -> String {
    format!("{}{}:", DEPOSIT_APPROVED_PREFIX, user_id)
}

fn deposit_trx_key(method: &str, trx_id: &str) -> Vec<u8> {
    format!("{}{}:{}", DEPOSIT_TRX_PREFIX, method, trx_id).into_bytes()
}

fn withdraw_key(id: u64) -> Vec<u8> {
    format!("{}{}", WITHDRAW_PREFIX, id_segment(id)).into_bytes()
}

fn withdraw_pending_key(id: u64) -> Vec<u8> {
    format!("{}{}", WITHDRAW_PENDING_PREFIX, id_segment(id)).into_bytes()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DepositRequest {
    pub id: u64,
    pub user_id: UserId,
    pub amount: Amount,
    pub method: String,
    pub trx_id: String,
    pub status: RequestStatus,
    /// DEPOSIT ledger row written at approval
    pub transaction_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WithdrawRequest {
    pub id: u64,
    pub user_id: UserId,
    pub amount: Amount,
    pub method: String,
    /// Payout destination, e.g. a mobile wallet number
    pub account: String,
    pub status: RequestStatus,
    /// Pending WITHDRAW ledger row completed at approval
    pub transaction_id: u64,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub processed_by: Option<UserId>,
}

/// Approved deposits of one user, oldest first
pub(crate) fn approved_deposits_in(txn: &LedgerTxn<'_>, user_id: &str) -> LedgerResult<Vec<DepositRequest>> {
    let ids: Vec<u64> = txn.scan(&deposit_approved_prefix(user_id))?;
    let mut deposits = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(deposit) = txn.get::<DepositRequest>(&deposit_key(id))? {
            deposits.push(deposit);
        }
    }
    Ok(deposits)
}

fn ensure_active(txn: &LedgerTxn<'_>, user_id: &str) -> LedgerResult<()> {
    if txn.account(user_id)?.is_banned {
        return Err(LedgerError::AccountBanned(user_id.to_string()));
    }
    Ok(())
}

fn ensure_in_range(amount: Amount, min: Amount, max: Amount, what: &str) -> LedgerResult<()> {
    if amount < min || amount > max {
        return Err(LedgerError::InvalidAmount(format!(
            "{} amount {} outside [{}, {}]",
            what, amount, min, max
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct CashierWorkflow {
    store: Arc<LedgerStore>,
    config: CashierConfig,
}

impl CashierWorkflow {
    pub fn new(store: Arc<LedgerStore>, config: CashierConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CashierConfig {
        &self.config
    }

    pub fn request_deposit(
        &self,
        user_id: &str,
        amount: Amount,
        method: &str,
        trx_id: &str,
    ) -> LedgerResult<DepositRequest> {
        ensure_in_range(amount, self.config.min_deposit, self.config.max_deposit, "deposit")?;
        validate_key_segment(method, "payment method")?;
        validate_key_segment(trx_id, "transaction id")?;

        let request = self.store.transact(|txn| {
            ensure_active(txn, user_id)?;

            let trx_key = deposit_trx_key(method, trx_id);
            if txn.contains(&trx_key)? {
                return Err(LedgerError::InvalidRequestState(format!(
                    "{} transaction {} was already submitted",
                    method, trx_id
                )));
            }

            let id = txn.next_id("deposit")?;
            let request = DepositRequest {
                id,
                user_id: user_id.to_string(),
                amount,
                method: method.to_string(),
                trx_id: trx_id.to_string(),
                status: RequestStatus::Pending,
                transaction_id: None,
                created_at: txn.now(),
                processed_at: None,
                processed_by: None,
            };
            txn.put(deposit_key(id), &request)?;
            txn.put(deposit_pending_key(id), &id)?;
            txn.put(trx_key, &id)?;
            Ok(request)
        })?;

        MetricsRegistry::incr(&self.store.metrics().deposits_requested);
        tracing::info!(deposit_id = request.id, user = user_id, amount, method, "Deposit requested");
        Ok(request)
    }

    /// Credit the deposit. Non-pending requests are refused without mutation.
    pub fn approve_deposit(&self, admin_id: &str, deposit_id: u64) -> LedgerResult<DepositRequest> {
        let request = self.store.transact(|txn| {
            txn.require_admin(admin_id)?;
            let mut request = self.pending_deposit(txn, deposit_id)?;

            let (_, tx) = txn.apply_mutation(
                &request.user_id,
                Mutation::credit(request.amount).deposited(request.amount),
                NewTransaction::completed(
                    TransactionKind::Deposit,
                    request.amount,
                    format!("{}:{}", request.method, request.trx_id),
                )
                .describe(format!("Deposit via {}", request.method)),
            )?;

            request.status = RequestStatus::Approved;
            request.transaction_id = Some(tx.id);
            request.processed_at = Some(txn.now());
            request.processed_by = Some(admin_id.to_string());

            txn.put(deposit_key(deposit_id), &request)?;
            txn.delete(deposit_pending_key(deposit_id));
            txn.put(
                format!("{}{}", deposit_approved_prefix(&request.user_id), id_segment(deposit_id)).into_bytes(),
                &deposit_id,
            )?;
            Ok(request)
        })?;

        MetricsRegistry::incr(&self.store.metrics().deposits_approved);
        tracing::info!(
            deposit_id,
            admin = admin_id,
            user = %request.user_id,
            amount = request.amount,
            "Deposit approved"
        );
        Ok(request)
    }

    pub fn reject_deposit(&self, admin_id: &str, deposit_id: u64) -> LedgerResult<DepositRequest> {
        let request = self.store.transact(|txn| {
            txn.require_admin(admin_id)?;
            let mut request = self.pending_deposit(txn, deposit_id)?;

            request.status = RequestStatus::Rejected;
            request.processed_at = Some(txn.now());
            request.processed_by = Some(admin_id.to_string());
            txn.put(deposit_key(deposit_id), &request)?;
            txn.delete(deposit_pending_key(deposit_id));
            // The provider transaction id may be resubmitted after a rejection
            txn.delete(deposit_trx_key(&request.method, &request.trx_id));
            Ok(request)
        })?;

        tracing::info!(deposit_id, admin = admin_id, user = %request.user_id, "Deposit rejected");
        Ok(request)
    }

    fn pending_deposit(&self, txn: &LedgerTxn<'_>, deposit_id: u64) -> LedgerResult<DepositRequest> {
        let request: DepositRequest = txn
            .get(&deposit_key(deposit_id))?
            .ok_or_else(|| LedgerError::RequestNotFound(format!("deposit {}", deposit_id)))?;
        if request.status != RequestStatus::Pending {
            return Err(LedgerError::InvalidRequestState(format!(
                "deposit {} is {:?}",
                deposit_id, request.status
            )));
        }
        Ok(request)
    }

    /// Debit immediately and hold a Pending WITHDRAW row until approval
    pub fn request_withdraw(
        &self,
        user_id: &str,
        amount: Amount,
        method: &str,
        account: &str,
    ) -> LedgerResult<WithdrawRequest> {
        ensure_in_range(amount, self.config.min_withdraw, self.config.max_withdraw, "withdraw")?;
        if method.is_empty() || account.is_empty() {
            return Err(LedgerError::InvalidInput("withdraw method and account are required".to_string()));
        }

        let request = self.store.transact(|txn| {
            ensure_active(txn, user_id)?;

            let available = txn.account(user_id)?.withdrawable();
            if amount > available {
                return Err(LedgerError::InsufficientFunds {
                    required: amount,
                    available,
                });
            }

            let id = txn.next_id("withdraw")?;
            let (_, tx) = txn.apply_mutation(
                user_id,
                Mutation::debit(amount).withdrawn(amount),
                NewTransaction::pending(TransactionKind::Withdraw, amount, format!("withdraw:{}", id))
                    .describe(format!("Withdraw via {} to {}", method, account)),
            )?;
            bonus::mark_used_in(txn, user_id)?;

            let request = WithdrawRequest {
                id,
                user_id: user_id.to_string(),
                amount,
                method: method.to_string(),
                account: account.to_string(),
                status: RequestStatus::Pending,
                transaction_id: tx.id,
                created_at: txn.now(),
                processed_at: None,
                processed_by: None,
            };
            txn.put(withdraw_key(id), &request)?;
            txn.put(withdraw_pending_key(id), &id)?;
            Ok(request)
        })?;

        MetricsRegistry::incr(&self.store.metrics().withdrawals_requested);
        tracing::info!(withdraw_id = request.id, user = user_id, amount, method, "Withdraw requested");
        Ok(request)
    }

    /// Flip request and ledger row to their final state; the balance moved at request time
    pub fn approve_withdraw(&self, admin_id: &str, withdraw_id: u64) -> LedgerResult<WithdrawRequest> {
        let request = self.store.transact(|txn| {
            txn.require_admin(admin_id)?;
            let mut request: WithdrawRequest = txn
                .get(&withdraw_key(withdraw_id))?
                .ok_or_else(|| LedgerError::RequestNotFound(format!("withdraw {}", withdraw_id)))?;
            if request.status != RequestStatus::Pending {
                return Err(LedgerError::InvalidRequestState(format!(
                    "withdraw {} is {:?}",
                    withdraw_id, request.status
                )));
            }

            txn.complete_transaction(request.transaction_id)?;
            request.status = RequestStatus::Approved;
            request.processed_at = Some(txn.now());
            request.processed_by = Some(admin_id.to_string());
            txn.put(withdraw_key(withdraw_id), &request)?;
            txn.delete(withdraw_pending_key(withdraw_id));
            Ok(request)
        })?;

        MetricsRegistry::incr(&self.store.metrics().withdrawals_approved);
        tracing::info!(
            withdraw_id,
            admin = admin_id,
            user = %request.user_id,
            amount = request.amount,
            "Withdraw approved"
        );
        Ok(request)
    }

    pub fn deposit(&self, deposit_id: u64) -> LedgerResult<DepositRequest> {
        self.store.read(|txn| {
            txn.get(&deposit_key(deposit_id))?
                .ok_or_else(|| LedgerError::RequestNotFound(format!("deposit {}", deposit_id)))
        })
    }

    pub fn withdraw(&self, withdraw_id: u64) -> LedgerResult<WithdrawRequest> {
        self.store.read(|txn| {
            txn.get(&withdraw_key(withdraw_id))?
                .ok_or_else(|| LedgerError::RequestNotFound(format!("withdraw {}", withdraw_id)))
        })
    }

    pub fn pending_deposits(&self, admin_id: &str) -> LedgerResult<Vec<DepositRequest>> {
        self.store.read(|txn| {
            txn.require_admin(admin_id)?;
            let ids: Vec<u64> = txn.scan(DEPOSIT_PENDING_PREFIX)?;
            let mut requests = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(request) = txn.get(&deposit_key(id))? {
                    requests.push(request);
                }
            }
            Ok(requests)
        })
    }

    pub fn pending_withdrawals(&self, admin_id: &str) -> LedgerResult<Vec<WithdrawRequest>> {
        self.store.read(|txn| {
            txn.require_admin(admin_id)?;
            let ids: Vec<u64> = txn.scan(WITHDRAW_PENDING_PREFIX)?;
            let mut requests = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(request) = txn.get(&withdraw_key(id))? {
                    requests.push(request);
                }
            }
            Ok(requests)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TransactionStatus;
    use crate::testing::TestHarness;

    #[test]
    fn test_deposit_approval_credits_once() {
        let h = TestHarness::new();
        h.user("alice");
        let admin = h.admin();
        let cashier = &h.engine.cashier;

        let request = cashier.request_deposit("alice", 300_00, "bkash", "TRX1").unwrap();
        assert_eq!(h.store.account("alice").unwrap().balance, 0);

        let approved = cashier.approve_deposit(&admin, request.id).unwrap();
        assert_eq!(approved.status, RequestStatus::Approved);
        assert_eq!(approved.processed_by.as_deref(), Some(admin.as_str()));

        let err = cashier.approve_deposit(&admin, request.id).unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequestState(_)));

        let account = h.store.account("alice").unwrap();
        assert_eq!(account.balance, 300_00);
        assert_eq!(account.total_deposited, 300_00);

        let history = h.store.transactions("alice", 10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, TransactionKind::Deposit);
        assert_eq!(history[0].reference, "bkash:TRX1");
    }

    #[test]
    fn test_approval_requires_admin() {
        let h = TestHarness::new();
        h.user("bob");
        let request = h.engine.cashier.request_deposit("bob", 500_00, "nagad", "N1").unwrap();

        let err = h.engine.cashier.approve_deposit("bob", request.id).unwrap_err();
        assert!(matches!(err, LedgerError::PermissionDenied(_)));
        assert_eq!(h.engine.cashier.deposit(request.id).unwrap().status, RequestStatus::Pending);
    }

    #[test]
    fn test_duplicate_trx_id_rejected() {
        let h = TestHarness::new();
        h.user("carol");
        h.engine.cashier.request_deposit("carol", 500_00, "bkash", "DUP").unwrap();

        let err = h.engine.cashier.request_deposit("carol", 500_00, "bkash", "DUP").unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequestState(_)));
    }

    #[test]
    fn test_rejected_deposit_moves_no_money() {
        let h = TestHarness::new();
        h.user("dave");
        let admin = h.admin();

        let request = h.engine.cashier.request_deposit("dave", 500_00, "bkash", "R1").unwrap();
        h.engine.cashier.reject_deposit(&admin, request.id).unwrap();

        assert!(matches!(
            h.engine.cashier.approve_deposit(&admin, request.id),
            Err(LedgerError::InvalidRequestState(_))
        ));
        assert_eq!(h.store.account("dave").unwrap().balance, 0);
        assert!(h.engine.cashier.pending_deposits(&admin).unwrap().is_empty());
    }

    #[test]
    fn test_deposit_amount_limits() {
        let h = TestHarness::new();
        h.user("erin");

        assert!(matches!(
            h.engine.cashier.request_deposit("erin", 99_99, "bkash", "L1"),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            h.engine.cashier.request_deposit("erin", 25_000_01, "bkash", "L2"),
            Err(LedgerError::InvalidAmount(_))
        ));
    }

    #[test]
    fn test_withdraw_lifecycle() {
        let h = TestHarness::new();
        h.funded_user("frank", 1_000_00);
        let admin = h.admin();

        let request = h.engine.cashier.request_withdraw("frank", 600_00, "bkash", "01700000000").unwrap();
        let account = h.store.account("frank").unwrap();
        assert_eq!(account.balance, 400_00);
        assert_eq!(account.total_withdrawn, 600_00);

        let pending_tx = h.store.transactions("frank", 1).unwrap().remove(0);
        assert_eq!(pending_tx.status, TransactionStatus::Pending);
        assert_eq!(pending_tx.id, request.transaction_id);
        assert_eq!(h.engine.cashier.pending_withdrawals(&admin).unwrap().len(), 1);

        h.engine.cashier.approve_withdraw(&admin, request.id).unwrap();
        assert_eq!(h.store.account("frank").unwrap().balance, 400_00);
        let completed_tx = h.store.transactions("frank", 1).unwrap().remove(0);
        assert_eq!(completed_tx.status, TransactionStatus::Completed);

        assert!(matches!(
            h.engine.cashier.approve_withdraw(&admin, request.id),
            Err(LedgerError::InvalidRequestState(_))
        ));
        assert!(h.store.reconcile("frank").unwrap().is_consistent());
    }

    #[test]
    fn test_withdraw_cannot_touch_locked_funds() {
        let h = TestHarness::new();
        h.funded_user("grace", 1_000_00);
        h.store
            .transact(|txn| txn.adjust_account("grace", Mutation::default().locked(600_00)))
            .unwrap();

        let err = h.engine.cashier.request_withdraw("grace", 500_00, "bkash", "0170").unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { required: 500_00, available: 400_00 }));
        assert_eq!(h.store.account("grace").unwrap().balance, 1_000_00);
    }

    #[test]
    fn test_banned_user_cannot_request() {
        let h = TestHarness::new();
        h.funded_user("heidi", 1_000_00);
        let admin = h.admin();
        h.store.set_banned(&admin, "heidi", true).unwrap();

        assert!(matches!(
            h.engine.cashier.request_withdraw("heidi", 500_00, "bkash", "0170"),
            Err(LedgerError::AccountBanned(_))
        ));
    }
}
