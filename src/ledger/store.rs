//! Ledger store: the single choke point for balance mutation
//!
//! Every money movement runs inside [`LedgerStore::transact`]. The closure reads
//! through a staged overlay and writes into it; the overlay is committed as one
//! RocksDB `WriteBatch` only if the closure returns `Ok`. Units of work are
//! serialized by a store-wide write lock, so two settlements of the same match
//! or two approvals of the same request can never interleave.

use super::types::*;
use crate::clock::Clock;
use crate::errors::{LedgerError, LedgerResult, StorageError};
use crate::metrics::MetricsRegistry;
use crate::money::Amount;
use crate::storage::{OptimizedStorage, StorageSnapshot};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

const ACCOUNT_PREFIX: &str = "account:";
const REFERRAL_INDEX_PREFIX: &str = "account:referral:";
const TX_PREFIX: &str = "tx:id:";
const TX_USER_INDEX_PREFIX: &str = "tx:user:";
const SEQUENCE_PREFIX: &str = "seq:";

fn account_key(user_id: &str) -> Vec<u8> {
    format!("{}user:{}", ACCOUNT_PREFIX, user_id).into_bytes()
}

pub(crate) fn referral_index_prefix(referrer: &str) -> String {
    format!("{}{}:", REFERRAL_INDEX_PREFIX, referrer)
}

fn tx_key(id: u64) -> Vec<u8> {
    format!("{}{:020}", TX_PREFIX, id).into_bytes()
}

fn tx_user_index_key(user_id: &str, id: u64) -> Vec<u8> {
    format!("{}{}:{:020}", TX_USER_INDEX_PREFIX, user_id, id).into_bytes()
}

/// Zero-padded so lexicographic key order equals numeric order
pub(crate) fn id_segment(id: u64) -> String {
    format!("{:020}", id)
}

/// Identifiers end up inside prefix-scanned keys and must not contain the separator
pub(crate) fn validate_key_segment(value: &str, what: &str) -> LedgerResult<()> {
    if value.is_empty() || value.len() > 128 || value.contains(':') {
        return Err(LedgerError::InvalidInput(format!(
            "{} must be 1-128 characters without ':'",
            what
        )));
    }
    Ok(())
}

pub struct LedgerStore {
    storage: Arc<OptimizedStorage>,
    write_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
    metrics: Arc<MetricsRegistry>,
}

impl LedgerStore {
    pub fn new(storage: Arc<OptimizedStorage>, clock: Arc<dyn Clock>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
            clock,
            metrics,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    /// Run `op` as one atomic unit of work
    pub fn transact<T, F>(&self, op: F) -> LedgerResult<T>
    where
        F: FnOnce(&mut LedgerTxn<'_>) -> LedgerResult<T>,
    {
        let _guard = self.write_lock.lock().map_err(|_| StorageError::LockPoisoned)?;
        let mut txn = LedgerTxn::new(&self.storage, self.clock.now());

        match op(&mut txn) {
            Ok(value) => {
                txn.commit()?;
                MetricsRegistry::incr(&self.metrics.units_committed);
                Ok(value)
            }
            Err(e) => {
                MetricsRegistry::incr(&self.metrics.units_aborted);
                tracing::debug!(error = %e, code = e.code(), "Unit of work rolled back");
                Err(e)
            }
        }
    }

    /// Read-only view over one RocksDB snapshot, so multi-key reads agree
    /// with each other while units of work commit
    pub fn read<T, F>(&self, op: F) -> LedgerResult<T>
    where
        F: FnOnce(&LedgerTxn<'_>) -> LedgerResult<T>,
    {
        let txn = LedgerTxn::at_snapshot(&self.storage, self.clock.now());
        op(&txn)
    }

    pub fn register_account(
        &self,
        user_id: &str,
        role: Role,
        referred_by: Option<&str>,
    ) -> LedgerResult<Account> {
        self.transact(|txn| txn.register_account(user_id, role, referred_by))
    }

    pub fn account(&self, user_id: &str) -> LedgerResult<Account> {
        self.read(|txn| txn.account(user_id))
    }

    /// Standalone form of [`LedgerTxn::apply_mutation`]
    pub fn apply_mutation(
        &self,
        user_id: &str,
        mutation: Mutation,
        record: NewTransaction,
    ) -> LedgerResult<(Account, Transaction)> {
        self.transact(|txn| txn.apply_mutation(user_id, mutation, record))
    }

    /// Newest-first transaction history for one user
    pub fn transactions(&self, user_id: &str, limit: usize) -> LedgerResult<Vec<Transaction>> {
        self.read(|txn| {
            let mut rows = txn.user_transactions(user_id)?;
            rows.reverse();
            rows.truncate(limit);
            Ok(rows)
        })
    }

    pub fn reconcile(&self, user_id: &str) -> LedgerResult<ReconciliationReport> {
        self.read(|txn| {
            let account = txn.account(user_id)?;
            let rows = txn.user_transactions(user_id)?;

            let mut report = ReconciliationReport {
                user_id: account.user_id.clone(),
                balance: account.balance,
                delta_sum: 0,
                typed_sum: 0,
                pending_withdrawals: 0,
                transaction_count: rows.len(),
            };
            for tx in &rows {
                report.delta_sum += tx.balance_delta;
                match tx.status {
                    TransactionStatus::Completed => {
                        report.typed_sum += tx.kind.reconciliation_sign() * tx.amount;
                    }
                    TransactionStatus::Pending if tx.kind == TransactionKind::Withdraw => {
                        report.pending_withdrawals += tx.amount;
                    }
                    TransactionStatus::Pending => {}
                }
            }
            Ok(report)
        })
    }

    pub fn set_banned(&self, admin_id: &str, user_id: &str, banned: bool) -> LedgerResult<Account> {
        self.transact(|txn| {
            txn.require_admin(admin_id)?;
            let mut account = txn.account(user_id)?;
            account.is_banned = banned;
            txn.put_account(&account)?;
            tracing::info!(admin = admin_id, user = user_id, banned, "Account ban flag changed");
            Ok(account)
        })
    }
}

/// Where a unit of work reads committed rows from
enum ReadSource<'a> {
    /// Live database; the write lock keeps it still for the unit's lifetime
    Live,
    Snapshot(StorageSnapshot<'a>),
}

/// Staged view of the store for one unit of work
pub struct LedgerTxn<'a> {
    storage: &'a OptimizedStorage,
    source: ReadSource<'a>,
    overlay: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    now: DateTime<Utc>,
}

impl<'a> LedgerTxn<'a> {
    fn new(storage: &'a OptimizedStorage, now: DateTime<Utc>) -> Self {
        Self {
            storage,
            source: ReadSource::Live,
            overlay: BTreeMap::new(),
            now,
        }
    }

    fn at_snapshot(storage: &'a OptimizedStorage, now: DateTime<Utc>) -> Self {
        Self {
            source: ReadSource::Snapshot(storage.snapshot()),
            ..Self::new(storage, now)
        }
    }

    fn committed(&self, key: &[u8]) -> Result<Option<Vec<u8>>, rocksdb::Error> {
        match &self.source {
            ReadSource::Live => self.storage.get(key),
            ReadSource::Snapshot(snapshot) => snapshot.get(key),
        }
    }

    fn committed_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, rocksdb::Error> {
        match &self.source {
            ReadSource::Live => self.storage.scan_prefix(prefix),
            ReadSource::Snapshot(snapshot) => snapshot.scan_prefix(prefix),
        }
    }

    /// Timestamp shared by every row written in this unit of work
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    fn commit(self) -> LedgerResult<()> {
        if self.overlay.is_empty() {
            return Ok(());
        }
        self.storage
            .commit(self.overlay)
            .map_err(|e| LedgerError::Storage(StorageError::WriteFailed(e.to_string())))
    }

    // ------------------------------------------------------------------
    // Raw access
    // ------------------------------------------------------------------

    fn get_raw(&self, key: &[u8]) -> LedgerResult<Option<Vec<u8>>> {
        if let Some(staged) = self.overlay.get(key) {
            return Ok(staged.clone());
        }
        self.committed(key)
            .map_err(|e| LedgerError::Storage(StorageError::ReadFailed(e.to_string())))
    }

    pub(crate) fn get<T: DeserializeOwned>(&self, key: &[u8]) -> LedgerResult<Option<T>> {
        match self.get_raw(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| {
                StorageError::CorruptedData(format!(
                    "Failed to decode {}: {}",
                    String::from_utf8_lossy(key),
                    e
                ))
            })?)),
            None => Ok(None),
        }
    }

    pub(crate) fn contains(&self, key: &[u8]) -> LedgerResult<bool> {
        Ok(self.get_raw(key)?.is_some())
    }

    pub(crate) fn put<T: Serialize>(&mut self, key: Vec<u8>, value: &T) -> LedgerResult<()> {
        let bytes = serde_json::to_vec(value).map_err(|e| {
            StorageError::WriteFailed(format!(
                "Failed to encode {}: {}",
                String::from_utf8_lossy(&key),
                e
            ))
        })?;
        self.overlay.insert(key, Some(bytes));
        Ok(())
    }

    pub(crate) fn delete(&mut self, key: Vec<u8>) {
        self.overlay.insert(key, None);
    }

    /// Decoded values under `prefix` in key order, staged writes included
    pub(crate) fn scan<T: DeserializeOwned>(&self, prefix: &str) -> LedgerResult<Vec<T>> {
        let prefix = prefix.as_bytes();
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = self
            .committed_prefix(prefix)
            .map_err(|e| LedgerError::Storage(StorageError::ReadFailed(e.to_string())))?
            .into_iter()
            .collect();

        for (key, value) in self.overlay.range(prefix.to_vec()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match value {
                Some(bytes) => {
                    merged.insert(key.clone(), bytes.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }

        merged
            .into_iter()
            .map(|(key, bytes)| {
                serde_json::from_slice(&bytes).map_err(|e| {
                    StorageError::CorruptedData(format!(
                        "Failed to decode {}: {}",
                        String::from_utf8_lossy(&key),
                        e
                    ))
                    .into()
                })
            })
            .collect()
    }

    /// Allocate the next id of a durable sequence
    pub(crate) fn next_id(&mut self, sequence: &str) -> LedgerResult<u64> {
        let key = format!("{}{}", SEQUENCE_PREFIX, sequence).into_bytes();
        let next = self.get::<u64>(&key)?.unwrap_or(0) + 1;
        self.put(key, &next)?;
        Ok(next)
    }

    // ------------------------------------------------------------------
    // Accounts
    // ------------------------------------------------------------------

    pub fn find_account(&self, user_id: &str) -> LedgerResult<Option<Account>> {
        self.get(&account_key(user_id))
    }

    pub fn account(&self, user_id: &str) -> LedgerResult<Account> {
        self.find_account(user_id)?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))
    }

    pub(crate) fn put_account(&mut self, account: &Account) -> LedgerResult<()> {
        self.put(account_key(&account.user_id), account)
    }

    pub fn register_account(
        &mut self,
        user_id: &str,
        role: Role,
        referred_by: Option<&str>,
    ) -> LedgerResult<Account> {
        validate_key_segment(user_id, "user id")?;
        if self.find_account(user_id)?.is_some() {
            return Err(LedgerError::InvalidRequestState(format!(
                "account {} already exists",
                user_id
            )));
        }

        if let Some(referrer) = referred_by {
            if referrer == user_id {
                return Err(LedgerError::InvalidInput("a user cannot refer themselves".to_string()));
            }
            self.account(referrer)?;
            let index_key = format!("{}{}", referral_index_prefix(referrer), user_id).into_bytes();
            self.put(index_key, &user_id)?;
        }

        let account = Account::new(
            user_id.to_string(),
            role,
            referred_by.map(str::to_string),
            self.now,
        );
        self.put_account(&account)?;
        tracing::info!(user = user_id, ?role, referred_by, "Account registered");
        Ok(account)
    }

    /// Users whose `referred_by` is `referrer`, in user-id order
    pub fn referred_users(&self, referrer: &str) -> LedgerResult<Vec<UserId>> {
        self.scan(&referral_index_prefix(referrer))
    }

    pub fn require_admin(&self, user_id: &str) -> LedgerResult<Account> {
        let account = self.account(user_id)?;
        if account.role != Role::Admin {
            return Err(LedgerError::PermissionDenied(format!(
                "{} is not an administrator",
                user_id
            )));
        }
        Ok(account)
    }

    /// Apply account deltas and append the matching transaction row.
    ///
    /// Fails with `InsufficientFunds` and stages nothing if `balance` or
    /// `locked_balance` would go negative.
    pub fn apply_mutation(
        &mut self,
        user_id: &str,
        mutation: Mutation,
        record: NewTransaction,
    ) -> LedgerResult<(Account, Transaction)> {
        if record.amount < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "transaction amount must be unsigned, got {}",
                record.amount
            )));
        }

        let account = self.mutated_account(user_id, &mutation)?;
        let id = self.next_id("tx")?;
        let tx = Transaction {
            id,
            user_id: user_id.to_string(),
            kind: record.kind,
            amount: record.amount,
            balance_delta: mutation.balance_delta,
            status: record.status,
            reference: record.reference,
            description: record.description,
            created_at: self.now,
        };

        self.put_account(&account)?;
        self.put(tx_key(id), &tx)?;
        self.put(tx_user_index_key(user_id, id), &id)?;

        tracing::debug!(
            user = user_id,
            tx_id = id,
            kind = ?tx.kind,
            amount = tx.amount,
            balance_delta = tx.balance_delta,
            balance = account.balance,
            locked = account.locked_balance,
            "Ledger mutation staged"
        );
        Ok((account, tx))
    }

    /// Bookkeeping-only deltas (lock release, turnover, stats) that move no money
    pub fn adjust_account(&mut self, user_id: &str, mutation: Mutation) -> LedgerResult<Account> {
        if mutation.balance_delta != 0 {
            return Err(LedgerError::InvalidInput(
                "balance changes require a transaction record".to_string(),
            ));
        }
        let account = self.mutated_account(user_id, &mutation)?;
        self.put_account(&account)?;
        Ok(account)
    }

    fn mutated_account(&self, user_id: &str, m: &Mutation) -> LedgerResult<Account> {
        let mut account = self.account(user_id)?;

        let balance = checked(account.balance, m.balance_delta)?;
        if balance < 0 {
            return Err(LedgerError::InsufficientFunds {
                required: -m.balance_delta,
                available: account.balance,
            });
        }
        let locked = checked(account.locked_balance, m.locked_delta)?;
        if locked < 0 {
            return Err(LedgerError::InsufficientFunds {
                required: -m.locked_delta,
                available: account.locked_balance,
            });
        }

        let held = checked(account.held_balance, m.held_delta)?;
        if held < 0 {
            return Err(LedgerError::InsufficientFunds {
                required: -m.held_delta,
                available: account.held_balance,
            });
        }
        if (m.balance_delta < 0 || m.held_delta > 0) && balance < held {
            return Err(LedgerError::InsufficientFunds {
                required: (-m.balance_delta).max(m.held_delta),
                available: account.spendable(),
            });
        }

        account.balance = balance;
        account.locked_balance = locked;
        account.held_balance = held;
        account.total_deposited = checked(account.total_deposited, m.deposited_delta)?;
        account.total_withdrawn = checked(account.total_withdrawn, m.withdrawn_delta)?;
        account.total_wagered = checked(account.total_wagered, m.wagered_delta)?;
        account.total_turnover = checked(account.total_turnover, m.turnover_delta)?;

        if let Some((kind, outcome)) = m.game_result {
            let stats = account.game_stats.entry(kind).or_default();
            stats.played += 1;
            account.games_played += 1;
            match outcome {
                GameOutcome::Win => {
                    stats.wins += 1;
                    account.wins += 1;
                }
                GameOutcome::Loss => {
                    stats.losses += 1;
                    account.losses += 1;
                }
            }
        }

        Ok(account)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn transaction(&self, id: u64) -> LedgerResult<Option<Transaction>> {
        self.get(&tx_key(id))
    }

    /// The one permitted update of a ledger row: Pending -> Completed
    pub(crate) fn complete_transaction(&mut self, id: u64) -> LedgerResult<Transaction> {
        let mut tx = self.transaction(id)?.ok_or_else(|| {
            StorageError::CorruptedData(format!("transaction {} referenced but missing", id))
        })?;
        if tx.status != TransactionStatus::Pending {
            return Err(LedgerError::InvalidRequestState(format!(
                "transaction {} is already {:?}",
                id, tx.status
            )));
        }
        tx.status = TransactionStatus::Completed;
        self.put(tx_key(id), &tx)?;
        Ok(tx)
    }

    /// Oldest-first transaction history of one user
    pub fn user_transactions(&self, user_id: &str) -> LedgerResult<Vec<Transaction>> {
        let ids: Vec<u64> = self.scan(&format!("{}{}:", TX_USER_INDEX_PREFIX, user_id))?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            match self.transaction(id)? {
                Some(tx) => rows.push(tx),
                None => tracing::warn!(tx_id = id, user = user_id, "Transaction index points at missing row"),
            }
        }
        Ok(rows)
    }
}

fn checked(value: Amount, delta: Amount) -> LedgerResult<Amount> {
    value
        .checked_add(delta)
        .ok_or_else(|| LedgerError::InvalidAmount(format!("{} + {} overflows", value, delta)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    #[test]
    fn test_mutation_and_transaction_commit_together() {
        let h = TestHarness::new();
        h.user("alice");

        let (account, tx) = h
            .store
            .apply_mutation(
                "alice",
                Mutation::credit(1_000).deposited(1_000),
                NewTransaction::completed(TransactionKind::Deposit, 1_000, "seed"),
            )
            .unwrap();

        assert_eq!(account.balance, 1_000);
        assert_eq!(account.total_deposited, 1_000);
        assert_eq!(tx.balance_delta, 1_000);
        assert_eq!(h.store.transactions("alice", 10).unwrap(), vec![tx]);
    }

    #[test]
    fn test_held_funds_cannot_be_spent() {
        let h = TestHarness::new();
        h.funded_user("hal", 500);

        h.store.transact(|txn| txn.adjust_account("hal", Mutation::default().held(400))).unwrap();
        let err = h
            .store
            .apply_mutation(
                "hal",
                Mutation::debit(101),
                NewTransaction::completed(TransactionKind::Loss, 101, "over hold"),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { required: 101, available: 100 }));
        assert!(matches!(
            h.store.transact(|txn| txn.adjust_account("hal", Mutation::default().held(101))),
            Err(LedgerError::InsufficientFunds { required: 101, available: 100 })
        ));

        h.store
            .apply_mutation("hal", Mutation::credit(50), NewTransaction::completed(TransactionKind::Win, 50, "win"))
            .unwrap();
        let account = h.store.account("hal").unwrap();
        assert_eq!(account.held_balance, 400);
        assert_eq!(account.withdrawable(), 150);
        assert_eq!(account.spendable(), 150);
    }

    #[test]
    fn test_negative_balance_rejected_without_partial_write() {
        let h = TestHarness::new();
        h.funded_user("bob", 300);

        let err = h
            .store
            .apply_mutation(
                "bob",
                Mutation::debit(301),
                NewTransaction::completed(TransactionKind::Loss, 301, "too much"),
            )
            .unwrap_err();

        assert!(matches!(err, LedgerError::InsufficientFunds { required: 301, available: 300 }));
        assert_eq!(h.store.account("bob").unwrap().balance, 300);
        assert_eq!(h.store.transactions("bob", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_unit_of_work_discards_earlier_staged_writes() {
        let h = TestHarness::new();
        h.funded_user("carol", 100);

        let result = h.store.transact(|txn| {
            txn.apply_mutation(
                "carol",
                Mutation::credit(50),
                NewTransaction::completed(TransactionKind::Win, 50, "first"),
            )?;
            txn.apply_mutation(
                "carol",
                Mutation::debit(500),
                NewTransaction::completed(TransactionKind::Loss, 500, "second"),
            )
        });

        assert!(result.is_err());
        let account = h.store.account("carol").unwrap();
        assert_eq!(account.balance, 100);
        assert_eq!(h.store.transactions("carol", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_locked_balance_cannot_go_negative() {
        let h = TestHarness::new();
        h.funded_user("dave", 100);

        let err = h
            .store
            .transact(|txn| txn.adjust_account("dave", Mutation::default().locked(-1)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
    }

    #[test]
    fn test_adjust_account_refuses_balance_changes() {
        let h = TestHarness::new();
        h.funded_user("erin", 100);

        let err = h
            .store
            .transact(|txn| txn.adjust_account("erin", Mutation::credit(1)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidInput(_)));
    }

    #[test]
    fn test_game_stats_are_keyed_by_kind() {
        let h = TestHarness::new();
        h.user("frank");

        h.store
            .transact(|txn| {
                txn.adjust_account("frank", Mutation::default().game(GameKind::Ludo, GameOutcome::Win))?;
                txn.adjust_account("frank", Mutation::default().game(GameKind::Ludo, GameOutcome::Loss))?;
                txn.adjust_account("frank", Mutation::default().game(GameKind::Rummy, GameOutcome::Loss))
            })
            .unwrap();

        let account = h.store.account("frank").unwrap();
        assert_eq!(account.games_played, 3);
        assert_eq!(account.stats_for(GameKind::Ludo), GameStats { played: 2, wins: 1, losses: 1 });
        assert_eq!(account.stats_for(GameKind::Rummy).losses, 1);
        assert_eq!(account.stats_for(GameKind::Casino), GameStats::default());
    }

    #[test]
    fn test_register_rejects_bad_ids_and_duplicates() {
        let h = TestHarness::new();
        h.user("grace");

        assert!(matches!(
            h.store.register_account("grace", Role::User, None),
            Err(LedgerError::InvalidRequestState(_))
        ));
        assert!(matches!(
            h.store.register_account("bad:id", Role::User, None),
            Err(LedgerError::InvalidInput(_))
        ));
        assert!(matches!(
            h.store.register_account("heidi", Role::User, Some("nobody")),
            Err(LedgerError::UserNotFound(_))
        ));
    }

    #[test]
    fn test_referral_index() {
        let h = TestHarness::new();
        h.store.register_account("agent", Role::SubAgent, None).unwrap();
        h.store.register_account("u2", Role::User, Some("agent")).unwrap();
        h.store.register_account("u1", Role::User, Some("agent")).unwrap();

        let referred = h.store.read(|txn| txn.referred_users("agent")).unwrap();
        assert_eq!(referred, vec!["u1".to_string(), "u2".to_string()]);
    }

    #[test]
    fn test_ban_requires_admin() {
        let h = TestHarness::new();
        h.user("ivan");
        h.store.register_account("root", Role::Admin, None).unwrap();

        assert!(matches!(
            h.store.set_banned("ivan", "ivan", true),
            Err(LedgerError::PermissionDenied(_))
        ));
        assert!(h.store.set_banned("root", "ivan", true).unwrap().is_banned);
    }
}
