//! Referral commission for sub-agents
//!
//! A sub-agent earns a fixed share of every approved deposit made by the users
//! they referred. Each deposit can be claimed once; the claim marker is written
//! in the same unit of work as the COMMISSION row that pays it out.

use crate::config::CommissionConfig;
use crate::errors::{LedgerError, LedgerResult};
use crate::ledger::store::id_segment;
use crate::ledger::{LedgerStore, LedgerTxn, Mutation, NewTransaction, Role, TransactionKind, UserId};
use crate::metrics::MetricsRegistry;
use crate::money::{apply_bps, Amount};
use crate::workflow::approved_deposits_in;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

const CLAIM_PREFIX: &str = "commission:claimed:";
const LAST_PAYOUT_PREFIX: &str = "commission:last_payout:";

fn claim_key(agent_id: &str, deposit_id: u64) -> Vec<u8> {
    format!("{}{}:{}", CLAIM_PREFIX, agent_id, id_segment(deposit_id)).into_bytes()
}

fn last_payout_key(agent_id: &str) -> Vec<u8> {
    format!("{}{}", LAST_PAYOUT_PREFIX, agent_id).into_bytes()
}

/// One referred deposit and the commission it still owes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EligibleDeposit {
    pub deposit_id: u64,
    pub user_id: UserId,
    pub deposit_amount: Amount,
    pub commission: Amount,
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommissionPayout {
    pub credited: Amount,
    pub deposits: Vec<u64>,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionOverview {
    pub available: Amount,
    pub next_claim_at: Option<DateTime<Utc>>,
    pub deposits: Vec<EligibleDeposit>,
}

#[derive(Clone)]
pub struct CommissionLedger {
    store: Arc<LedgerStore>,
    config: CommissionConfig,
}

impl CommissionLedger {
    pub fn new(store: Arc<LedgerStore>, config: CommissionConfig) -> Self {
        Self { store, config }
    }

    /// Unclaimed deposits of referred users, oldest approval first
    fn eligible_in(&self, txn: &LedgerTxn<'_>, agent_id: &str) -> LedgerResult<Vec<EligibleDeposit>> {
        let mut eligible = Vec::new();
        for user_id in txn.referred_users(agent_id)? {
            for deposit in approved_deposits_in(txn, &user_id)? {
                if txn.contains(&claim_key(agent_id, deposit.id))? {
                    continue;
                }
                eligible.push(EligibleDeposit {
                    deposit_id: deposit.id,
                    user_id: deposit.user_id,
                    deposit_amount: deposit.amount,
                    commission: apply_bps(deposit.amount, self.config.rate_bps),
                    approved_at: deposit.processed_at,
                });
            }
        }
        eligible.sort_by_key(|d| (d.approved_at, d.deposit_id));
        Ok(eligible)
    }

    pub fn eligible_deposits(&self, agent_id: &str) -> LedgerResult<Vec<EligibleDeposit>> {
        self.store.read(|txn| {
            txn.account(agent_id)?;
            self.eligible_in(txn, agent_id)
        })
    }

    pub fn available_commission(&self, agent_id: &str) -> LedgerResult<Amount> {
        Ok(self.eligible_deposits(agent_id)?.iter().map(|d| d.commission).sum())
    }

    pub fn overview(&self, agent_id: &str) -> LedgerResult<CommissionOverview> {
        self.store.read(|txn| {
            txn.account(agent_id)?;
            let deposits = self.eligible_in(txn, agent_id)?;
            let last: Option<DateTime<Utc>> = txn.get(&last_payout_key(agent_id))?;
            Ok(CommissionOverview {
                available: deposits.iter().map(|d| d.commission).sum(),
                next_claim_at: last.map(|at| at + Duration::days(self.config.cooldown_days)),
                deposits,
            })
        })
    }

    /// Pay out up to `amount` by consuming whole deposits oldest first
    pub fn claim(&self, agent_id: &str, amount: Amount) -> LedgerResult<CommissionPayout> {
        let payout = self.store.transact(|txn| {
            let account = txn.account(agent_id)?;
            if account.role != Role::SubAgent {
                return Err(LedgerError::PermissionDenied(format!("{} is not a sub-agent", agent_id)));
            }
            if account.is_banned {
                return Err(LedgerError::AccountBanned(agent_id.to_string()));
            }
            if amount <= 0 {
                return Err(LedgerError::InvalidAmount(format!("claim amount {} is not positive", amount)));
            }

            let now = txn.now();
            if let Some(last) = txn.get::<DateTime<Utc>>(&last_payout_key(agent_id))? {
                let retry_after = last + Duration::days(self.config.cooldown_days);
                if now < retry_after {
                    return Err(LedgerError::CooldownActive { retry_after });
                }
            }

            let eligible = self.eligible_in(txn, agent_id)?;
            let available: Amount = eligible.iter().map(|d| d.commission).sum();
            if amount > available {
                return Err(LedgerError::InsufficientCommission {
                    requested: amount,
                    available,
                });
            }

            let mut remaining = amount;
            let mut consumed = Vec::new();
            for deposit in eligible {
                if deposit.commission == 0 || deposit.commission > remaining {
                    continue;
                }
                remaining -= deposit.commission;
                txn.apply_mutation(
                    agent_id,
                    Mutation::credit(deposit.commission),
                    NewTransaction::completed(
                        TransactionKind::Commission,
                        deposit.commission,
                        format!("deposit:{}", deposit.deposit_id),
                    )
                    .describe(format!("Commission on deposit by {}", deposit.user_id)),
                )?;
                txn.put(claim_key(agent_id, deposit.deposit_id), &now)?;
                consumed.push(deposit.deposit_id);
                if remaining == 0 {
                    break;
                }
            }

            let credited = amount - remaining;
            if consumed.is_empty() {
                return Err(LedgerError::InsufficientCommission {
                    requested: amount,
                    available: 0,
                });
            }

            txn.apply_mutation(
                agent_id,
                Mutation::default(),
                NewTransaction::completed(TransactionKind::CommissionPayout, credited, "commission:payout")
                    .describe(format!("Commission payout for {} deposits", consumed.len())),
            )?;
            txn.put(last_payout_key(agent_id), &now)?;

            Ok(CommissionPayout {
                credited,
                deposits: consumed,
                paid_at: now,
            })
        })?;

        MetricsRegistry::incr(&self.store.metrics().commission_payouts);
        tracing::info!(
            agent = agent_id,
            requested = amount,
            credited = payout.credited,
            deposits = payout.deposits.len(),
            "Commission paid out"
        );
        Ok(payout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestHarness;

    fn agent_with_referrals(h: &TestHarness) {
        h.store.register_account("agent", Role::SubAgent, None).unwrap();
        h.store.register_account("u1", Role::User, Some("agent")).unwrap();
        h.store.register_account("u2", Role::User, Some("agent")).unwrap();
    }

    #[test]
    fn test_commission_is_nine_percent_floored() {
        let h = TestHarness::new();
        agent_with_referrals(&h);
        h.deposit("u1", 1_000_00);
        h.deposit("u2", 333_33);

        let eligible = h.engine.commission.eligible_deposits("agent").unwrap();
        assert_eq!(eligible.iter().map(|d| d.commission).collect::<Vec<_>>(), vec![90_00, 29_99]);
        assert_eq!(h.engine.commission.available_commission("agent").unwrap(), 119_99);
    }

    #[test]
    fn test_claim_consumes_whole_deposits_oldest_first() {
        let h = TestHarness::new();
        agent_with_referrals(&h);
        let first = h.deposit("u1", 1_000_00);
        h.deposit("u2", 500_00);
        let third = h.deposit("u1", 200_00);

        let payout = h.engine.commission.claim("agent", 110_00).unwrap();
        assert_eq!(payout.deposits, vec![first.id, third.id]);
        assert_eq!(payout.credited, 108_00);

        let account = h.store.account("agent").unwrap();
        assert_eq!(account.balance, 108_00);
        assert_eq!(h.engine.commission.available_commission("agent").unwrap(), 45_00);

        let history = h.store.transactions("agent", 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].kind, TransactionKind::CommissionPayout);
        assert_eq!(history[0].balance_delta, 0);
        assert!(h.store.reconcile("agent").unwrap().is_consistent());
    }

    #[test]
    fn test_cooldown_and_insufficient_commission() {
        let h = TestHarness::new();
        agent_with_referrals(&h);
        h.deposit("u1", 1_000_00);
        h.deposit("u2", 1_000_00);

        assert!(matches!(
            h.engine.commission.claim("agent", 180_01),
            Err(LedgerError::InsufficientCommission { requested: 180_01, available: 180_00 })
        ));

        h.engine.commission.claim("agent", 90_00).unwrap();
        assert!(matches!(
            h.engine.commission.claim("agent", 90_00),
            Err(LedgerError::CooldownActive { .. })
        ));

        h.clock.advance(Duration::days(7));
        let payout = h.engine.commission.claim("agent", 90_00).unwrap();
        assert_eq!(payout.credited, 90_00);
        assert_eq!(h.engine.commission.available_commission("agent").unwrap(), 0);
    }

    #[test]
    fn test_only_sub_agents_claim() {
        let h = TestHarness::new();
        h.user("plain");
        assert!(matches!(
            h.engine.commission.claim("plain", 1),
            Err(LedgerError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_unapproved_deposits_do_not_count() {
        let h = TestHarness::new();
        agent_with_referrals(&h);
        h.engine.cashier.request_deposit("u1", 1_000_00, "bkash", "P1").unwrap();
        assert_eq!(h.engine.commission.available_commission("agent").unwrap(), 0);
    }
}
