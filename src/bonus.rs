//! Bonus grants and wagering turnover
//!
//! A granted bonus credits both `balance` and `locked_balance`. Settled wagers
//! contribute effective turnover, allocated to active bonuses oldest first;
//! once the last active bonus reaches its requirement the lock is released.
//! A bonus that expires first is forfeited: its lock is dropped and the
//! unearned amount is debited back out of the balance.

use crate::config::BonusConfig;
use crate::errors::{LedgerError, LedgerResult};
use crate::ledger::store::{id_segment, validate_key_segment};
use crate::ledger::{LedgerStore, LedgerTxn, Mutation, NewTransaction, TransactionKind, UserId};
use crate::metrics::MetricsRegistry;
use crate::money::{apply_bps, Amount};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

const BONUS_PREFIX: &str = "bonus:rec:";
const REFERRAL_CLAIM_PREFIX: &str = "bonus:referral:";

fn user_bonus_prefix(user_id: &str) -> String {
    format!("{}{}:", BONUS_PREFIX, user_id)
}

fn bonus_key(user_id: &str, id: u64) -> Vec<u8> {
    format!("{}{}", user_bonus_prefix(user_id), id_segment(id)).into_bytes()
}

fn referral_claim_key(user_id: &str, friend_id: &str) -> Vec<u8> {
    format!("{}{}:{}", REFERRAL_CLAIM_PREFIX, user_id, friend_id).into_bytes()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BonusKind {
    FirstDeposit,
    Daily,
    ReferralReward,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BonusStatus {
    Active,
    Completed,
    /// Completed bonus whose funds were drawn by a withdrawal
    Used,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bonus {
    pub id: u64,
    pub user_id: UserId,
    pub kind: BonusKind,
    pub amount: Amount,
    pub turnover_amount: Amount,
    pub current_turnover: Amount,
    pub is_withdrawable: bool,
    pub status: BonusStatus,
    pub friend_id: Option<UserId>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Bonus {
    pub fn remaining_turnover(&self) -> Amount {
        (self.turnover_amount - self.current_turnover).max(0)
    }
}

/// Claim parameters that only some bonus kinds use
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClaimContext {
    /// Requested daily bonus amount
    pub amount: Option<Amount>,
    /// Referred friend for a referral reward
    pub friend_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BonusGrant {
    pub bonus_id: u64,
    pub bonus_amount: Amount,
    pub turnover_required: Amount,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WagerAllocation {
    pub turnover_added: Amount,
    /// (bonus id, turnover credited) in allocation order
    pub allocations: Vec<(u64, Amount)>,
    pub completed: Vec<u64>,
    pub lock_released: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BonusSummary {
    pub user_id: UserId,
    pub locked_balance: Amount,
    pub total_turnover: Amount,
    pub bonuses: Vec<Bonus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ExpiryReport {
    pub expired: usize,
    pub locks_released: usize,
    /// Total debited by BONUS_FORFEIT rows
    pub forfeited: Amount,
}

/// Turnover a settled wager contributes toward bonus requirements.
///
/// A total loss counts the full stake, a partial win counts the lost part,
/// and a win at or above the stake counts `win_bps` of the stake.
pub fn effective_turnover(stake: Amount, win: Amount, win_bps: i64) -> Amount {
    if stake <= 0 {
        return 0;
    }
    if win <= 0 {
        stake
    } else if win >= stake {
        apply_bps(stake, win_bps)
    } else {
        stake - win
    }
}

fn user_bonuses(txn: &LedgerTxn<'_>, user_id: &str) -> LedgerResult<Vec<Bonus>> {
    txn.scan(&user_bonus_prefix(user_id))
}

/// Drop an expired bonus's share of the lock and take back what the balance still holds of it
fn forfeit_expired(txn: &mut LedgerTxn<'_>, bonus: &Bonus) -> LedgerResult<Amount> {
    let account = txn.account(&bonus.user_id)?;
    let unlocked = bonus.amount.min(account.locked_balance);
    let forfeit = unlocked.min(account.spendable());
    if forfeit > 0 {
        txn.apply_mutation(
            &bonus.user_id,
            Mutation::debit(forfeit).locked(-unlocked),
            NewTransaction::completed(TransactionKind::BonusForfeit, forfeit, format!("bonus:{}", bonus.id))
                .describe(format!("{:?} bonus expired before turnover", bonus.kind)),
        )?;
    } else if unlocked > 0 {
        txn.adjust_account(&bonus.user_id, Mutation::default().locked(-unlocked))?;
    }
    Ok(forfeit)
}

fn release_lock_if_idle(txn: &mut LedgerTxn<'_>, user_id: &str) -> LedgerResult<bool> {
    let any_active = user_bonuses(txn, user_id)?
        .iter()
        .any(|b| b.status == BonusStatus::Active);
    if any_active {
        return Ok(false);
    }
    let locked = txn.account(user_id)?.locked_balance;
    if locked == 0 {
        return Ok(false);
    }
    txn.adjust_account(user_id, Mutation::default().locked(-locked))?;
    Ok(true)
}

/// Record turnover and allocate it to active bonuses inside an open unit of work
pub(crate) fn apply_wager_in(
    txn: &mut LedgerTxn<'_>,
    metrics: &MetricsRegistry,
    user_id: &str,
    effective: Amount,
) -> LedgerResult<WagerAllocation> {
    if effective < 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "effective turnover cannot be negative, got {}",
            effective
        )));
    }

    txn.adjust_account(user_id, Mutation::default().turnover(effective))?;
    let mut allocation = WagerAllocation {
        turnover_added: effective,
        ..Default::default()
    };

    let now = txn.now();
    let mut active: Vec<Bonus> = user_bonuses(txn, user_id)?
        .into_iter()
        .filter(|b| b.status == BonusStatus::Active && b.expires_at > now)
        .collect();
    if active.is_empty() {
        return Ok(allocation);
    }
    active.sort_by_key(|b| (b.created_at, b.id));

    let mut remaining = effective;
    for mut bonus in active {
        if remaining == 0 {
            break;
        }
        let credit = remaining.min(bonus.remaining_turnover());
        if credit == 0 {
            continue;
        }
        bonus.current_turnover += credit;
        remaining -= credit;
        allocation.allocations.push((bonus.id, credit));

        if bonus.current_turnover >= bonus.turnover_amount {
            bonus.status = BonusStatus::Completed;
            bonus.is_withdrawable = true;
            allocation.completed.push(bonus.id);
            MetricsRegistry::incr(&metrics.bonuses_completed);
            tracing::info!(user = user_id, bonus_id = bonus.id, "Bonus turnover requirement met");
        }
        txn.put(bonus_key(user_id, bonus.id), &bonus)?;
    }

    if !allocation.completed.is_empty() {
        allocation.lock_released = release_lock_if_idle(txn, user_id)?;
    }
    Ok(allocation)
}

/// Completed bonuses become Used once their owner withdraws
pub(crate) fn mark_used_in(txn: &mut LedgerTxn<'_>, user_id: &str) -> LedgerResult<usize> {
    let mut marked = 0;
    for mut bonus in user_bonuses(txn, user_id)? {
        if bonus.status == BonusStatus::Completed {
            bonus.status = BonusStatus::Used;
            txn.put(bonus_key(user_id, bonus.id), &bonus)?;
            marked += 1;
        }
    }
    Ok(marked)
}

#[derive(Clone)]
pub struct BonusEngine {
    store: Arc<LedgerStore>,
    config: BonusConfig,
}

impl BonusEngine {
    pub fn new(store: Arc<LedgerStore>, config: BonusConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &BonusConfig {
        &self.config
    }

    pub fn effective_turnover(&self, stake: Amount, win: Amount) -> Amount {
        effective_turnover(stake, win, self.config.win_turnover_bps)
    }

    pub fn claim(&self, user_id: &str, kind: BonusKind, context: &ClaimContext) -> LedgerResult<BonusGrant> {
        let grant = self.store.transact(|txn| {
            let account = txn.account(user_id)?;
            if account.is_banned {
                return Err(LedgerError::AccountBanned(user_id.to_string()));
            }

            let amount = match kind {
                BonusKind::FirstDeposit => self.first_deposit_amount(txn, user_id, account.total_deposited)?,
                BonusKind::Daily => self.daily_amount(txn, user_id, context)?,
                BonusKind::ReferralReward => self.referral_amount(txn, user_id, context)?,
            };
            self.grant(txn, user_id, kind, amount, context.friend_id.clone())
        })?;

        MetricsRegistry::incr(&self.store.metrics().bonuses_granted);
        tracing::info!(
            user = user_id,
            ?kind,
            bonus_id = grant.bonus_id,
            amount = grant.bonus_amount,
            turnover_required = grant.turnover_required,
            "Bonus granted"
        );
        Ok(grant)
    }

    fn first_deposit_amount(&self, txn: &LedgerTxn<'_>, user_id: &str, deposited: Amount) -> LedgerResult<Amount> {
        if user_bonuses(txn, user_id)?
            .iter()
            .any(|b| b.kind == BonusKind::FirstDeposit)
        {
            return Err(LedgerError::AlreadyClaimed("first deposit bonus".to_string()));
        }
        if deposited < self.config.first_deposit_min || deposited > self.config.first_deposit_max {
            return Err(LedgerError::ThresholdNotMet(format!(
                "total deposited {} outside [{}, {}]",
                deposited, self.config.first_deposit_min, self.config.first_deposit_max
            )));
        }
        let amount = (deposited as i128 * self.config.first_deposit_percent as i128 / 100) as Amount;
        Ok(amount.min(self.config.first_deposit_max_bonus))
    }

    fn daily_amount(&self, txn: &LedgerTxn<'_>, user_id: &str, context: &ClaimContext) -> LedgerResult<Amount> {
        let amount = context
            .amount
            .ok_or_else(|| LedgerError::InvalidInput("daily bonus requires an amount".to_string()))?;
        if amount < self.config.daily_min_amount || amount > self.config.daily_max_amount {
            return Err(LedgerError::InvalidAmount(format!(
                "daily bonus {} outside [{}, {}]",
                amount, self.config.daily_min_amount, self.config.daily_max_amount
            )));
        }

        let today = self.local_date(txn.now());
        let granted_today = user_bonuses(txn, user_id)?
            .iter()
            .filter(|b| b.kind == BonusKind::Daily && self.local_date(b.created_at) == today)
            .count();
        if granted_today >= self.config.daily_limit as usize {
            return Err(LedgerError::DailyLimitReached {
                limit: self.config.daily_limit,
            });
        }
        Ok(amount)
    }

    fn referral_amount(&self, txn: &LedgerTxn<'_>, user_id: &str, context: &ClaimContext) -> LedgerResult<Amount> {
        let friend_id = context
            .friend_id
            .as_deref()
            .ok_or_else(|| LedgerError::InvalidInput("referral reward requires a friend id".to_string()))?;
        validate_key_segment(friend_id, "friend id")?;

        if txn.contains(&referral_claim_key(user_id, friend_id))? {
            return Err(LedgerError::AlreadyClaimed(format!("referral reward for {}", friend_id)));
        }

        let friend = txn.account(friend_id)?;
        if friend.referred_by.as_deref() != Some(user_id) {
            return Err(LedgerError::InvalidInput(format!(
                "{} was not referred by {}",
                friend_id, user_id
            )));
        }
        if friend.total_deposited < self.config.referral_min_deposit
            || friend.total_turnover < self.config.referral_min_turnover
        {
            return Err(LedgerError::ThresholdNotMet(format!(
                "friend deposited {} (needs {}) with turnover {} (needs {})",
                friend.total_deposited,
                self.config.referral_min_deposit,
                friend.total_turnover,
                self.config.referral_min_turnover
            )));
        }
        Ok(self.config.referral_reward_amount)
    }

    fn grant(
        &self,
        txn: &mut LedgerTxn<'_>,
        user_id: &str,
        kind: BonusKind,
        amount: Amount,
        friend_id: Option<UserId>,
    ) -> LedgerResult<BonusGrant> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!("bonus amount {} is not positive", amount)));
        }

        let id = txn.next_id("bonus")?;
        let now = txn.now();
        let bonus = Bonus {
            id,
            user_id: user_id.to_string(),
            kind,
            amount,
            turnover_amount: amount * self.config.turnover_multiplier,
            current_turnover: 0,
            is_withdrawable: false,
            status: BonusStatus::Active,
            friend_id,
            created_at: now,
            expires_at: now + Duration::days(self.config.validity_days),
        };

        txn.apply_mutation(
            user_id,
            Mutation::credit(amount).locked(amount),
            NewTransaction::completed(TransactionKind::Bonus, amount, format!("bonus:{}", id))
                .describe(format!("{:?} bonus", kind)),
        )?;
        txn.put(bonus_key(user_id, id), &bonus)?;
        if let Some(friend) = &bonus.friend_id {
            txn.put(referral_claim_key(user_id, friend), &id)?;
        }

        Ok(BonusGrant {
            bonus_id: id,
            bonus_amount: amount,
            turnover_required: bonus.turnover_amount,
            expires_at: bonus.expires_at,
        })
    }

    fn local_date(&self, at: DateTime<Utc>) -> NaiveDate {
        (at + Duration::minutes(self.config.utc_offset_minutes as i64)).date_naive()
    }

    /// Standalone turnover contribution
    pub fn apply_wager(&self, user_id: &str, effective: Amount) -> LedgerResult<WagerAllocation> {
        self.store
            .transact(|txn| apply_wager_in(txn, self.store.metrics(), user_id, effective))
    }

    /// Expire active bonuses past their deadline and release idle locks
    pub fn expire_bonuses(&self) -> LedgerResult<ExpiryReport> {
        let report = self.store.transact(|txn| {
            let now = txn.now();
            let mut report = ExpiryReport::default();
            let mut touched = BTreeSet::new();

            for mut bonus in txn.scan::<Bonus>(BONUS_PREFIX)? {
                if bonus.status == BonusStatus::Active && bonus.expires_at <= now {
                    bonus.status = BonusStatus::Expired;
                    txn.put(bonus_key(&bonus.user_id, bonus.id), &bonus)?;
                    report.forfeited += forfeit_expired(txn, &bonus)?;
                    touched.insert(bonus.user_id);
                    report.expired += 1;
                }
            }
            for user_id in touched {
                if release_lock_if_idle(txn, &user_id)? {
                    report.locks_released += 1;
                }
            }
            Ok(report)
        })?;

        if report.expired > 0 {
            MetricsRegistry::add(&self.store.metrics().bonuses_expired, report.expired as u64);
            tracing::info!(
                expired = report.expired,
                locks_released = report.locks_released,
                forfeited = report.forfeited,
                "Bonuses expired"
            );
        }
        Ok(report)
    }

    pub fn summary(&self, user_id: &str) -> LedgerResult<BonusSummary> {
        self.store.read(|txn| {
            let account = txn.account(user_id)?;
            Ok(BonusSummary {
                user_id: account.user_id,
                locked_balance: account.locked_balance,
                total_turnover: account.total_turnover,
                bonuses: user_bonuses(txn, user_id)?,
            })
        })
    }
}
