//! Casino settlement reconciler
//!
//! Immediate games hold the player's spendable balance at launch and keep a
//! durable session balance that the provider moves with every round;
//! settlement releases the hold and books the session's profit or loss.
//! Batch games accumulate Pending spins that settlement sums into one ledger
//! movement, holding the pending loss so it stays covered until then.
//! Every settled spin feeds the bonus turnover counter in the same unit of work.

use super::gateway::{GatewayError, LaunchPayload, ProviderGateway};
use super::types::*;
use crate::bonus::{apply_wager_in, effective_turnover};
use crate::config::{CasinoConfig, SettlementMode};
use crate::errors::{LedgerError, LedgerResult};
use crate::ledger::store::{id_segment, validate_key_segment};
use crate::ledger::{GameKind, GameOutcome, LedgerStore, LedgerTxn, Mutation, NewTransaction, TransactionKind};
use crate::metrics::MetricsRegistry;
use crate::money::{checked_sum, total, Amount};
use chrono::Duration;
use std::sync::Arc;

const GAME_PREFIX: &str = "casino:game:";
const MATCH_INDEX_PREFIX: &str = "casino:match:";
const OPEN_INDEX_PREFIX: &str = "casino:open:";
const SESSION_PREFIX: &str = "casino:session:";
const SPIN_PREFIX: &str = "casino:spin:";
const ROUND_PREFIX: &str = "casino:round:";

fn game_key(id: u64) -> Vec<u8> {
    format!("{}{}", GAME_PREFIX, id_segment(id)).into_bytes()
}

fn match_index_key(match_id: &str) -> Vec<u8> {
    format!("{}{}", MATCH_INDEX_PREFIX, match_id).into_bytes()
}

fn open_index_key(id: u64) -> Vec<u8> {
    format!("{}{}", OPEN_INDEX_PREFIX, id_segment(id)).into_bytes()
}

fn session_key(match_id: &str) -> Vec<u8> {
    format!("{}{}", SESSION_PREFIX, match_id).into_bytes()
}

fn spin_prefix(match_id: &str) -> String {
    format!("{}{}:", SPIN_PREFIX, match_id)
}

fn spin_key(match_id: &str, id: u64) -> Vec<u8> {
    format!("{}{}", spin_prefix(match_id), id_segment(id)).into_bytes()
}

fn round_key(match_id: &str, round_id: &str) -> Vec<u8> {
    format!("{}{}:{}", ROUND_PREFIX, match_id, round_id).into_bytes()
}

fn game_by_match(txn: &LedgerTxn<'_>, match_id: &str) -> LedgerResult<CasinoGame> {
    let id: u64 = txn
        .get(&match_index_key(match_id))?
        .ok_or_else(|| LedgerError::GameNotFound(match_id.to_string()))?;
    txn.get(&game_key(id))?
        .ok_or_else(|| LedgerError::GameNotFound(match_id.to_string()))
}

fn match_spins(txn: &LedgerTxn<'_>, match_id: &str) -> LedgerResult<Vec<CasinoSpin>> {
    txn.scan(&spin_prefix(match_id))
}

fn pending_net(spins: &[CasinoSpin]) -> LedgerResult<Amount> {
    total(
        spins
            .iter()
            .filter(|s| s.status == SpinStatus::Pending)
            .map(|s| s.net_result),
    )
}

/// Hand the game's hold back to the account
fn release_hold(txn: &mut LedgerTxn<'_>, game: &mut CasinoGame) -> LedgerResult<()> {
    if game.held > 0 {
        txn.adjust_account(&game.user_id, Mutation::default().held(-game.held))?;
        game.held = 0;
    }
    Ok(())
}

/// Game, indexes and session; spins are only ever written for games that launched
fn remove_game(txn: &mut LedgerTxn<'_>, game: &mut CasinoGame) -> LedgerResult<()> {
    release_hold(txn, game)?;
    txn.delete(game_key(game.id));
    txn.delete(match_index_key(&game.match_id));
    txn.delete(open_index_key(game.id));
    txn.delete(session_key(&game.match_id));
    Ok(())
}

fn close_game(txn: &mut LedgerTxn<'_>, game: &mut CasinoGame) -> LedgerResult<()> {
    release_hold(txn, game)?;
    game.status = CasinoGameStatus::Settled;
    game.settled_at = Some(txn.now());
    txn.put(game_key(game.id), game)?;
    txn.delete(open_index_key(game.id));
    txn.delete(session_key(&game.match_id));
    Ok(())
}

/// Ledger movement for a casino result: WIN or LOSS row for the delta, stats always
fn apply_casino_result(
    txn: &mut LedgerTxn<'_>,
    game: &CasinoGame,
    delta: Amount,
    staked: Amount,
    description: &str,
) -> LedgerResult<()> {
    let outcome = if delta > 0 { GameOutcome::Win } else { GameOutcome::Loss };
    let mutation = Mutation {
        balance_delta: delta,
        ..Mutation::default()
    }
    .wagered(staked)
    .game(GameKind::Casino, outcome);

    if delta == 0 {
        txn.adjust_account(&game.user_id, mutation)?;
        return Ok(());
    }

    let kind = if delta > 0 { TransactionKind::Win } else { TransactionKind::Loss };
    txn.apply_mutation(
        &game.user_id,
        mutation,
        NewTransaction::completed(kind, delta.abs(), format!("casino:{}", game.match_id))
            .describe(format!("{} {}", description, game.game_uid)),
    )?;
    Ok(())
}

pub struct CasinoReconciler {
    store: Arc<LedgerStore>,
    gateway: Arc<dyn ProviderGateway>,
    config: CasinoConfig,
    win_turnover_bps: i64,
}

impl CasinoReconciler {
    pub fn new(
        store: Arc<LedgerStore>,
        gateway: Arc<dyn ProviderGateway>,
        config: CasinoConfig,
        win_turnover_bps: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            config,
            win_turnover_bps,
        }
    }

    /// Create the game record, then ask the provider for a session.
    ///
    /// The record exists before the provider call so callbacks racing the
    /// launch response find it; a failed or timed-out call deletes it again.
    pub async fn launch(&self, request: &LaunchRequest) -> LedgerResult<LaunchTicket> {
        if request.game_uid.is_empty() {
            return Err(LedgerError::InvalidInput("game_uid is required".to_string()));
        }
        let mode = request.mode.unwrap_or(self.config.default_mode);

        let (game, payload) = self.store.transact(|txn| {
            let account = txn.account(&request.user_id)?;
            if account.is_banned {
                return Err(LedgerError::AccountBanned(account.user_id));
            }
            let spendable = account.spendable();
            if spendable < self.config.min_launch_balance {
                return Err(LedgerError::InsufficientFunds {
                    required: self.config.min_launch_balance,
                    available: spendable,
                });
            }
            let held = match mode {
                SettlementMode::Immediate => spendable,
                SettlementMode::Batch => 0,
            };

            let now = txn.now();
            let id = txn.next_id("casino_game")?;
            let game = CasinoGame {
                id,
                user_id: account.user_id.clone(),
                match_id: uuid::Uuid::new_v4().simple().to_string(),
                game_uid: request.game_uid.clone(),
                mode,
                status: CasinoGameStatus::Playing,
                bet_amount: 0,
                win_amount: 0,
                net_result: 0,
                held,
                token: uuid::Uuid::new_v4().to_string(),
                launch_url: None,
                created_at: now,
                last_activity_at: now,
                settled_at: None,
            };
            txn.put(game_key(id), &game)?;
            txn.put(match_index_key(&game.match_id), &id)?;
            txn.put(open_index_key(id), &id)?;

            if mode == SettlementMode::Immediate {
                txn.adjust_account(&account.user_id, Mutation::default().held(held))?;
                let session = SessionBalance {
                    match_id: game.match_id.clone(),
                    user_id: account.user_id.clone(),
                    balance: held,
                    updated_at: now,
                    expires_at: now + Duration::seconds(self.config.abandon_after_secs),
                };
                txn.put(session_key(&game.match_id), &session)?;
            }

            let payload = LaunchPayload {
                user_id: account.user_id,
                balance: spendable,
                game_uid: game.game_uid.clone(),
                match_id: game.match_id.clone(),
                token: game.token.clone(),
                return_url: self.config.return_url.clone(),
                callback_url: self.config.callback_url.clone(),
                currency_code: self.config.currency_code.clone(),
            };
            Ok((game, payload))
        })?;

        let timeout = self.config.launch_timeout();
        let result = match tokio::time::timeout(timeout, self.gateway.launch(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout(timeout)),
        };

        match result {
            Ok(launch_url) => {
                self.store.transact(|txn| {
                    if let Some(mut stored) = txn.get::<CasinoGame>(&game_key(game.id))? {
                        stored.launch_url = Some(launch_url.clone());
                        txn.put(game_key(game.id), &stored)?;
                    }
                    Ok(())
                })?;

                MetricsRegistry::incr(&self.store.metrics().casino_launches);
                tracing::info!(
                    user = %game.user_id,
                    match_id = %game.match_id,
                    game_uid = %game.game_uid,
                    ?mode,
                    "Casino game launched"
                );
                Ok(LaunchTicket {
                    game_id: game.id,
                    match_id: game.match_id,
                    mode,
                    launch_url,
                })
            }
            Err(e) => {
                MetricsRegistry::incr(&self.store.metrics().casino_launch_failures);
                tracing::warn!(user = %game.user_id, match_id = %game.match_id, error = %e, "Casino launch failed");
                match self.abort_launch(&game) {
                    Ok(purged) if purged > 0 => {
                        tracing::info!(user = %game.user_id, purged, "Purged stale casino launches");
                    }
                    Ok(_) => {}
                    Err(cleanup) => {
                        tracing::error!(match_id = %game.match_id, error = %cleanup, "Launch cleanup failed");
                    }
                }
                Err(LedgerError::ExternalProviderError(e.to_string()))
            }
        }
    }

    /// Delete the failed game and the user's stale launches that never staked
    fn abort_launch(&self, failed: &CasinoGame) -> LedgerResult<usize> {
        self.store.transact(|txn| {
            if let Some(mut stored) = txn.get::<CasinoGame>(&game_key(failed.id))? {
                remove_game(txn, &mut stored)?;
            }

            let cutoff = txn.now() - Duration::seconds(self.config.stale_launch_secs);
            let mut purged = 0;
            for id in txn.scan::<u64>(OPEN_INDEX_PREFIX)? {
                let Some(mut game) = txn.get::<CasinoGame>(&game_key(id))? else {
                    continue;
                };
                if game.user_id != failed.user_id
                    || game.status != CasinoGameStatus::Playing
                    || game.created_at > cutoff
                {
                    continue;
                }
                if match_spins(txn, &game.match_id)?.is_empty() {
                    remove_game(txn, &mut game)?;
                    purged += 1;
                }
            }
            Ok(purged)
        })
    }

    /// Record one provider round. Retried deliveries of a round are acknowledged without effect.
    pub fn record_spin(&self, callback: &ProviderCallback) -> LedgerResult<SpinAck> {
        validate_key_segment(&callback.match_id, "match id")?;
        validate_key_segment(&callback.round_id, "round id")?;
        if callback.bet_amount < 0 || callback.win_amount < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "bet {} and win {} must not be negative",
                callback.bet_amount, callback.win_amount
            )));
        }

        let ack = self.store.transact(|txn| {
            let mut game = game_by_match(txn, &callback.match_id)?;
            if game.status == CasinoGameStatus::Settled {
                return Err(LedgerError::InvalidRequestState(format!(
                    "casino match {} is already settled",
                    game.match_id
                )));
            }

            let round = round_key(&game.match_id, &callback.round_id);
            if let Some(spin_id) = txn.get::<u64>(&round)? {
                let spin: CasinoSpin = txn
                    .get(&spin_key(&game.match_id, spin_id))?
                    .ok_or_else(|| LedgerError::GameNotFound(format!("spin {}", spin_id)))?;
                return Ok(SpinAck {
                    spin_id,
                    match_id: spin.match_id,
                    round_id: spin.round_id,
                    status: spin.status,
                    balance: self.display_balance(txn, &game)?,
                    duplicate: true,
                });
            }

            let now = txn.now();
            let net = checked_sum(callback.win_amount, -callback.bet_amount)?;
            let (status, balance) = match game.mode {
                SettlementMode::Immediate => {
                    let mut session: SessionBalance = txn
                        .get(&session_key(&game.match_id))?
                        .ok_or_else(|| {
                            LedgerError::InvalidRequestState(format!("no session for match {}", game.match_id))
                        })?;
                    let next = match callback.balance_after {
                        Some(balance) => balance,
                        None => checked_sum(session.balance, net)?,
                    };
                    if next < 0 {
                        return Err(LedgerError::InsufficientFunds {
                            required: callback.bet_amount,
                            available: session.balance,
                        });
                    }
                    session.balance = next;
                    session.updated_at = now;
                    session.expires_at = now + Duration::seconds(self.config.abandon_after_secs);
                    txn.put(session_key(&game.match_id), &session)?;
                    (SpinStatus::Completed, next)
                }
                SettlementMode::Batch => {
                    // The hold tracks the pending loss; the account refuses it past spendable funds
                    let pending = checked_sum(pending_net(&match_spins(txn, &game.match_id)?)?, net)?;
                    let exposure = pending.min(0).checked_neg().ok_or_else(|| {
                        LedgerError::InvalidAmount(format!("pending loss {} overflows", pending))
                    })?;
                    if exposure != game.held {
                        txn.adjust_account(&game.user_id, Mutation::default().held(exposure - game.held))?;
                        game.held = exposure;
                    }
                    let balance = checked_sum(txn.account(&game.user_id)?.balance, pending)?;
                    (SpinStatus::Pending, balance)
                }
            };

            let id = txn.next_id("casino_spin")?;
            let spin = CasinoSpin {
                id,
                match_id: game.match_id.clone(),
                user_id: game.user_id.clone(),
                round_id: callback.round_id.clone(),
                bet_amount: callback.bet_amount,
                win_amount: callback.win_amount,
                net_result: net,
                status,
                created_at: now,
            };
            txn.put(spin_key(&game.match_id, id), &spin)?;
            txn.put(round, &id)?;

            game.last_activity_at = now;
            txn.put(game_key(game.id), &game)?;

            Ok(SpinAck {
                spin_id: id,
                match_id: spin.match_id,
                round_id: spin.round_id,
                status,
                balance,
                duplicate: false,
            })
        })?;

        if !ack.duplicate {
            MetricsRegistry::incr(&self.store.metrics().casino_spins_recorded);
        }
        tracing::debug!(
            match_id = %ack.match_id,
            round_id = %ack.round_id,
            duplicate = ack.duplicate,
            balance = ack.balance,
            "Casino round recorded"
        );
        Ok(ack)
    }

    fn display_balance(&self, txn: &LedgerTxn<'_>, game: &CasinoGame) -> LedgerResult<Amount> {
        if let Some(session) = txn.get::<SessionBalance>(&session_key(&game.match_id))? {
            return Ok(session.balance);
        }
        let balance = txn.account(&game.user_id)?.balance;
        checked_sum(balance, pending_net(&match_spins(txn, &game.match_id)?)?)
    }

    /// Provider "settle"/"return" call, dispatched on the game's mode
    pub fn settle(&self, match_id: &str, final_balance: Option<Amount>) -> LedgerResult<SettlementOutcome> {
        let mode = self.store.read(|txn| Ok(game_by_match(txn, match_id)?.mode))?;
        match mode {
            SettlementMode::Immediate => self.settle_immediate(match_id, final_balance),
            SettlementMode::Batch => self.settle_batch(match_id),
        }
    }

    /// Release the launch hold and book the session's result against it
    pub fn settle_immediate(&self, match_id: &str, final_balance: Option<Amount>) -> LedgerResult<SettlementOutcome> {
        let outcome = self.store.transact(|txn| {
            let game = game_by_match(txn, match_id)?;
            if game.mode != SettlementMode::Immediate {
                return Err(LedgerError::InvalidRequestState(format!("match {} is not immediate", match_id)));
            }
            self.settle_immediate_in(txn, game, final_balance)
        })?;
        self.record_settlement(&outcome);
        Ok(outcome)
    }

    fn settle_immediate_in(
        &self,
        txn: &mut LedgerTxn<'_>,
        mut game: CasinoGame,
        final_balance: Option<Amount>,
    ) -> LedgerResult<SettlementOutcome> {
        if game.status == CasinoGameStatus::Settled {
            return Ok(SettlementOutcome {
                match_id: game.match_id,
                mode: game.mode,
                spins_settled: 0,
                net_result: 0,
                balance: txn.account(&game.user_id)?.balance,
            });
        }

        let session = txn.get::<SessionBalance>(&session_key(&game.match_id))?;
        let target = match (final_balance, session) {
            (Some(balance), _) => balance,
            (None, Some(session)) => session.balance,
            (None, None) => {
                return Err(LedgerError::InvalidRequestState(format!(
                    "no session balance for match {}",
                    game.match_id
                )))
            }
        };
        if target < 0 {
            return Err(LedgerError::InvalidAmount(format!("session balance {} is negative", target)));
        }

        let spins: Vec<CasinoSpin> = match_spins(txn, &game.match_id)?
            .into_iter()
            .filter(|s| s.status == SpinStatus::Completed)
            .collect();
        let staked = total(spins.iter().map(|s| s.bet_amount))?;
        let won = total(spins.iter().map(|s| s.win_amount))?;

        // Funds credited or spent outside the session since launch stay untouched
        let snapshot = game.held;
        release_hold(txn, &mut game)?;
        let delta = checked_sum(target, -snapshot)?;
        apply_casino_result(txn, &game, delta, staked, "Casino session")?;
        self.settle_spins(txn, &game, &spins, SpinStatus::Settled)?;

        game.bet_amount = checked_sum(game.bet_amount, staked)?;
        game.win_amount = checked_sum(game.win_amount, won)?;
        game.net_result = checked_sum(game.net_result, delta)?;
        close_game(txn, &mut game)?;

        Ok(SettlementOutcome {
            match_id: game.match_id,
            mode: game.mode,
            spins_settled: spins.len(),
            net_result: delta,
            balance: txn.account(&game.user_id)?.balance,
        })
    }

    /// Apply the net of all Pending spins as one movement
    pub fn settle_batch(&self, match_id: &str) -> LedgerResult<SettlementOutcome> {
        let outcome = self.store.transact(|txn| {
            let game = game_by_match(txn, match_id)?;
            if game.mode != SettlementMode::Batch {
                return Err(LedgerError::InvalidRequestState(format!("match {} is not batch", match_id)));
            }
            self.settle_batch_in(txn, game)
        })?;
        self.record_settlement(&outcome);
        Ok(outcome)
    }

    fn settle_batch_in(&self, txn: &mut LedgerTxn<'_>, mut game: CasinoGame) -> LedgerResult<SettlementOutcome> {
        let pending: Vec<CasinoSpin> = match_spins(txn, &game.match_id)?
            .into_iter()
            .filter(|s| s.status == SpinStatus::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(SettlementOutcome {
                match_id: game.match_id,
                mode: game.mode,
                spins_settled: 0,
                net_result: 0,
                balance: txn.account(&game.user_id)?.balance,
            });
        }

        let net = pending_net(&pending)?;
        let staked = total(pending.iter().map(|s| s.bet_amount))?;
        let won = total(pending.iter().map(|s| s.win_amount))?;

        release_hold(txn, &mut game)?;
        apply_casino_result(txn, &game, net, staked, "Casino rounds")?;
        self.settle_spins(txn, &game, &pending, SpinStatus::Completed)?;

        game.bet_amount = checked_sum(game.bet_amount, staked)?;
        game.win_amount = checked_sum(game.win_amount, won)?;
        game.net_result = checked_sum(game.net_result, net)?;
        if game.status == CasinoGameStatus::Playing {
            game.status = CasinoGameStatus::Completed;
        }
        txn.put(game_key(game.id), &game)?;

        Ok(SettlementOutcome {
            match_id: game.match_id,
            mode: game.mode,
            spins_settled: pending.len(),
            net_result: net,
            balance: txn.account(&game.user_id)?.balance,
        })
    }

    fn settle_spins(
        &self,
        txn: &mut LedgerTxn<'_>,
        game: &CasinoGame,
        spins: &[CasinoSpin],
        to: SpinStatus,
    ) -> LedgerResult<()> {
        for spin in spins {
            let mut spin = spin.clone();
            spin.status = to;
            txn.put(spin_key(&game.match_id, spin.id), &spin)?;

            let effective = effective_turnover(spin.bet_amount, spin.win_amount, self.win_turnover_bps);
            apply_wager_in(txn, self.store.metrics(), &game.user_id, effective)?;
        }
        Ok(())
    }

    fn record_settlement(&self, outcome: &SettlementOutcome) {
        MetricsRegistry::add(&self.store.metrics().casino_spins_settled, outcome.spins_settled as u64);
        tracing::info!(
            match_id = %outcome.match_id,
            mode = ?outcome.mode,
            spins = outcome.spins_settled,
            net_result = outcome.net_result,
            balance = outcome.balance,
            "Casino settlement applied"
        );
    }

    /// Force-settle games idle past the abandon limit; games that never saw a round are closed
    pub fn sweep_abandoned(&self) -> LedgerResult<SweepReport> {
        let cutoff = self.store.now() - Duration::seconds(self.config.abandon_after_secs);
        let candidates: Vec<u64> = self.store.read(|txn| {
            let mut ids = Vec::new();
            for id in txn.scan::<u64>(OPEN_INDEX_PREFIX)? {
                if let Some(game) = txn.get::<CasinoGame>(&game_key(id))? {
                    if game.last_activity_at <= cutoff {
                        ids.push(id);
                    }
                }
            }
            Ok(ids)
        })?;

        let mut report = SweepReport::default();
        for id in candidates {
            let swept = self.store.transact(|txn| {
                let Some(mut game) = txn.get::<CasinoGame>(&game_key(id))? else {
                    return Ok(None);
                };
                if game.status == CasinoGameStatus::Settled || game.last_activity_at > cutoff {
                    return Ok(None);
                }

                let spins = match_spins(txn, &game.match_id)?;
                if spins.is_empty() {
                    close_game(txn, &mut game)?;
                    return Ok(Some((game.match_id, None)));
                }

                let outcome = match game.mode {
                    SettlementMode::Immediate => self.settle_immediate_in(txn, game, None)?,
                    SettlementMode::Batch => {
                        let outcome = self.settle_batch_in(txn, game)?;
                        let mut game = game_by_match(txn, &outcome.match_id)?;
                        for mut spin in match_spins(txn, &game.match_id)? {
                            if spin.status == SpinStatus::Completed {
                                spin.status = SpinStatus::Settled;
                                txn.put(spin_key(&game.match_id, spin.id), &spin)?;
                            }
                        }
                        close_game(txn, &mut game)?;
                        outcome
                    }
                };
                Ok(Some((outcome.match_id.clone(), Some(outcome))))
            });

            match swept {
                Ok(Some((match_id, Some(outcome)))) => {
                    report.settled += 1;
                    self.record_settlement(&outcome);
                    tracing::info!(%match_id, "Abandoned casino game force-settled");
                }
                Ok(Some((match_id, None))) => {
                    report.closed_idle += 1;
                    tracing::info!(%match_id, "Idle casino game closed");
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(game_id = id, error = %e, "Failed to sweep casino game");
                }
            }
        }

        MetricsRegistry::add(
            &self.store.metrics().casino_sessions_swept,
            (report.settled + report.closed_idle) as u64,
        );
        Ok(report)
    }

    pub fn game(&self, match_id: &str) -> LedgerResult<CasinoGame> {
        self.store.read(|txn| game_by_match(txn, match_id))
    }

    pub fn spins(&self, match_id: &str) -> LedgerResult<Vec<CasinoSpin>> {
        self.store.read(|txn| match_spins(txn, match_id))
    }

    pub fn session(&self, match_id: &str) -> LedgerResult<Option<SessionBalance>> {
        self.store.read(|txn| txn.get(&session_key(match_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::testing::TestHarness;

    fn launch_request(user: &str, mode: SettlementMode) -> LaunchRequest {
        LaunchRequest {
            user_id: user.to_string(),
            game_uid: "slot-777".to_string(),
            mode: Some(mode),
        }
    }

    fn round(match_id: &str, round_id: &str, bet: Amount, win: Amount) -> ProviderCallback {
        ProviderCallback {
            match_id: match_id.to_string(),
            round_id: round_id.to_string(),
            bet_amount: bet,
            win_amount: win,
            balance_after: None,
        }
    }

    #[tokio::test]
    async fn test_batch_settlement_sums_pending_spins_once() {
        let h = TestHarness::new();
        h.funded_user("alice", 1_000_00);
        let casino = &h.engine.casino;

        let ticket = casino.launch(&launch_request("alice", SettlementMode::Batch)).await.unwrap();
        assert!(ticket.launch_url.contains(&ticket.match_id));

        casino.record_spin(&round(&ticket.match_id, "r1", 100_00, 0)).unwrap();
        let ack = casino.record_spin(&round(&ticket.match_id, "r2", 100_00, 250_00)).unwrap();
        assert_eq!(ack.balance, 1_050_00);

        let retry = casino.record_spin(&round(&ticket.match_id, "r1", 100_00, 0)).unwrap();
        assert!(retry.duplicate);
        assert_eq!(casino.spins(&ticket.match_id).unwrap().len(), 2);

        let outcome = casino.settle(&ticket.match_id, None).unwrap();
        assert_eq!(outcome.spins_settled, 2);
        assert_eq!(outcome.net_result, 50_00);
        assert_eq!(outcome.balance, 1_050_00);

        let again = casino.settle_batch(&ticket.match_id).unwrap();
        assert_eq!(again.spins_settled, 0);

        let account = h.store.account("alice").unwrap();
        assert_eq!(account.balance, 1_050_00);
        assert_eq!(account.total_wagered, 200_00);
        assert_eq!(account.total_turnover, 100_00 + 50);
        assert_eq!(account.stats_for(GameKind::Casino).wins, 1);
        assert_eq!(casino.game(&ticket.match_id).unwrap().status, CasinoGameStatus::Completed);
        assert!(casino
            .spins(&ticket.match_id)
            .unwrap()
            .iter()
            .all(|s| s.status == SpinStatus::Completed));
        assert!(h.store.reconcile("alice").unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_batch_bet_must_be_covered() {
        let h = TestHarness::new();
        h.funded_user("bob", 100_00);
        let casino = &h.engine.casino;
        let ticket = casino.launch(&launch_request("bob", SettlementMode::Batch)).await.unwrap();

        casino.record_spin(&round(&ticket.match_id, "r1", 80_00, 0)).unwrap();
        let err = casino.record_spin(&round(&ticket.match_id, "r2", 30_00, 0)).unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { required: 30_00, available: 20_00 }));
    }

    #[tokio::test]
    async fn test_immediate_settlement_adopts_session_balance() {
        let h = TestHarness::new();
        h.funded_user("carol", 1_000_00);
        let casino = &h.engine.casino;

        let ticket = casino.launch(&launch_request("carol", SettlementMode::Immediate)).await.unwrap();
        assert_eq!(h.gateway.calls()[0].balance, 1_000_00);
        assert_eq!(casino.session(&ticket.match_id).unwrap().unwrap().balance, 1_000_00);

        casino.record_spin(&round(&ticket.match_id, "r1", 200_00, 0)).unwrap();
        let ack = casino
            .record_spin(&ProviderCallback {
                balance_after: Some(900_00),
                ..round(&ticket.match_id, "r2", 100_00, 200_00)
            })
            .unwrap();
        assert_eq!(ack.balance, 900_00);

        let outcome = casino.settle(&ticket.match_id, None).unwrap();
        assert_eq!(outcome.spins_settled, 2);
        assert_eq!(outcome.net_result, -100_00);

        let account = h.store.account("carol").unwrap();
        assert_eq!(account.balance, 900_00);
        assert_eq!(account.held_balance, 0);
        assert_eq!(account.total_wagered, 300_00);
        assert_eq!(account.total_turnover, 200_00 + 50);
        assert!(casino.session(&ticket.match_id).unwrap().is_none());
        assert!(casino
            .spins(&ticket.match_id)
            .unwrap()
            .iter()
            .all(|s| s.status == SpinStatus::Settled));

        assert_eq!(casino.settle(&ticket.match_id, None).unwrap().spins_settled, 0);
        assert!(matches!(
            casino.record_spin(&round(&ticket.match_id, "r3", 10_00, 0)),
            Err(LedgerError::InvalidRequestState(_))
        ));
        assert!(h.store.reconcile("carol").unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_launch_preconditions() {
        let h = TestHarness::new();
        h.funded_user("dave", 5_00);
        let admin = h.admin();

        assert!(matches!(
            h.engine.casino.launch(&launch_request("dave", SettlementMode::Batch)).await,
            Err(LedgerError::InsufficientFunds { required: 10_00, available: 5_00 })
        ));

        h.funded_user("erin", 100_00);
        h.store.set_banned(&admin, "erin", true).unwrap();
        assert!(matches!(
            h.engine.casino.launch(&launch_request("erin", SettlementMode::Batch)).await,
            Err(LedgerError::AccountBanned(_))
        ));
        assert!(h.gateway.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_launch_removes_game_and_stale_sessions() {
        let h = TestHarness::new();
        h.funded_user("frank", 100_00);
        let casino = &h.engine.casino;

        let stale = casino.launch(&launch_request("frank", SettlementMode::Immediate)).await.unwrap();
        h.deposit("frank", 100_00);
        let played = casino.launch(&launch_request("frank", SettlementMode::Batch)).await.unwrap();
        casino.record_spin(&round(&played.match_id, "r1", 10_00, 0)).unwrap();
        assert_eq!(h.store.account("frank").unwrap().held_balance, 110_00);

        h.clock.advance(Duration::minutes(6));
        h.gateway.push_failure("provider down");
        let err = casino.launch(&launch_request("frank", SettlementMode::Batch)).await.unwrap_err();
        assert!(matches!(err, LedgerError::ExternalProviderError(_)));
        assert!(err.is_retryable());

        let failed_match = h.gateway.calls()[2].match_id.clone();
        assert!(matches!(casino.game(&failed_match), Err(LedgerError::GameNotFound(_))));
        assert!(matches!(casino.game(&stale.match_id), Err(LedgerError::GameNotFound(_))));
        assert!(casino.session(&stale.match_id).unwrap().is_none());
        assert_eq!(casino.game(&played.match_id).unwrap().status, CasinoGameStatus::Playing);
        assert_eq!(h.store.account("frank").unwrap().held_balance, 10_00);
    }

    #[tokio::test]
    async fn test_launch_timeout_is_provider_error() {
        let mut config = LedgerConfig::default();
        config.casino.launch_timeout_ms = 50;
        let h = TestHarness::with_config(config);
        h.funded_user("grace", 100_00);

        h.gateway.push_hang(std::time::Duration::from_millis(500));
        let err = h
            .engine
            .casino
            .launch(&launch_request("grace", SettlementMode::Batch))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ExternalProviderError(_)));

        let match_id = h.gateway.calls()[0].match_id.clone();
        assert!(matches!(h.engine.casino.game(&match_id), Err(LedgerError::GameNotFound(_))));
    }

    #[tokio::test]
    async fn test_sweep_settles_abandoned_and_closes_idle_games() {
        let h = TestHarness::new();
        h.funded_user("heidi", 500_00);
        let casino = &h.engine.casino;

        let played = casino.launch(&launch_request("heidi", SettlementMode::Batch)).await.unwrap();
        casino.record_spin(&round(&played.match_id, "r1", 50_00, 0)).unwrap();
        let idle = casino.launch(&launch_request("heidi", SettlementMode::Immediate)).await.unwrap();

        assert_eq!(casino.sweep_abandoned().unwrap(), SweepReport::default());

        h.clock.advance(Duration::minutes(11));
        let report = casino.sweep_abandoned().unwrap();
        assert_eq!(report, SweepReport { settled: 1, closed_idle: 1 });

        assert_eq!(h.store.account("heidi").unwrap().balance, 450_00);
        assert_eq!(casino.game(&played.match_id).unwrap().status, CasinoGameStatus::Settled);
        assert_eq!(casino.game(&idle.match_id).unwrap().status, CasinoGameStatus::Settled);
        assert!(casino
            .spins(&played.match_id)
            .unwrap()
            .iter()
            .all(|s| s.status == SpinStatus::Settled));
        assert_eq!(casino.sweep_abandoned().unwrap(), SweepReport::default());
        assert_eq!(h.store.account("heidi").unwrap().held_balance, 0);
    }

    #[tokio::test]
    async fn test_immediate_session_holds_funds_until_settled() {
        let h = TestHarness::new();
        h.funded_user("ivan", 1_000_00);
        let casino = &h.engine.casino;

        let ticket = casino.launch(&launch_request("ivan", SettlementMode::Immediate)).await.unwrap();
        let account = h.store.account("ivan").unwrap();
        assert_eq!(account.held_balance, 1_000_00);
        assert_eq!(account.withdrawable(), 0);

        assert!(matches!(
            h.engine.cashier.request_withdraw("ivan", 500_00, "bkash", "0170"),
            Err(LedgerError::InsufficientFunds { .. })
        ));
        let table = h.engine.matches.open_match(GameKind::Ludo, 50_00).unwrap();
        assert!(matches!(
            h.engine.matches.join_match(table.id, "ivan"),
            Err(LedgerError::InsufficientFunds { .. })
        ));
        assert!(matches!(
            casino.launch(&launch_request("ivan", SettlementMode::Immediate)).await,
            Err(LedgerError::InsufficientFunds { required: 10_00, available: 0 })
        ));
        assert_eq!(h.gateway.calls().len(), 1);

        // Credits that land during the session are not part of its result
        h.deposit("ivan", 200_00);
        casino.record_spin(&round(&ticket.match_id, "r1", 100_00, 0)).unwrap();
        let outcome = casino.settle(&ticket.match_id, None).unwrap();
        assert_eq!(outcome.net_result, -100_00);
        assert_eq!(outcome.balance, 1_100_00);

        let account = h.store.account("ivan").unwrap();
        assert_eq!(account.balance, 1_100_00);
        assert_eq!(account.held_balance, 0);
        assert_eq!(account.withdrawable(), 1_100_00);
        assert!(h.store.reconcile("ivan").unwrap().is_consistent());

        h.engine.cashier.request_withdraw("ivan", 1_100_00, "bkash", "0170").unwrap();
    }

    #[tokio::test]
    async fn test_batch_pending_loss_is_held_until_settled() {
        let h = TestHarness::new();
        h.funded_user("judy", 100_00);
        let casino = &h.engine.casino;
        let ticket = casino.launch(&launch_request("judy", SettlementMode::Batch)).await.unwrap();

        casino.record_spin(&round(&ticket.match_id, "r1", 60_00, 0)).unwrap();
        assert_eq!(h.store.account("judy").unwrap().held_balance, 60_00);
        assert!(matches!(
            h.engine.cashier.request_withdraw("judy", 50_00, "bkash", "0171"),
            Err(LedgerError::InsufficientFunds { .. })
        ));

        casino.record_spin(&round(&ticket.match_id, "r2", 10_00, 40_00)).unwrap();
        assert_eq!(h.store.account("judy").unwrap().held_balance, 30_00);
        h.engine.cashier.request_withdraw("judy", 70_00, "bkash", "0171").unwrap();

        let outcome = casino.settle_batch(&ticket.match_id).unwrap();
        assert_eq!(outcome.net_result, -30_00);
        let account = h.store.account("judy").unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.held_balance, 0);
        assert_eq!(casino.game(&ticket.match_id).unwrap().held, 0);
        assert!(h.store.reconcile("judy").unwrap().is_consistent());
    }

    #[test]
    fn test_pending_net_rejects_overflow() {
        let spin = |net: Amount| CasinoSpin {
            id: 1,
            match_id: "m".to_string(),
            user_id: "u".to_string(),
            round_id: "r".to_string(),
            bet_amount: 0,
            win_amount: net,
            net_result: net,
            status: SpinStatus::Pending,
            created_at: chrono::Utc::now(),
        };
        assert_eq!(pending_net(&[spin(5_00), spin(-2_00)]).unwrap(), 3_00);
        assert!(matches!(
            pending_net(&[spin(Amount::MAX), spin(1)]),
            Err(LedgerError::InvalidAmount(_))
        ));
    }
}
