//! Peer match pots
//!
//! The external match engine opens a match, seats players (each stake is
//! debited at join) and reports the winners. Settlement pays the pot minus the
//! platform fee to the winners exactly once.

use crate::bonus::{apply_wager_in, effective_turnover};
use crate::config::MatchConfig;
use crate::errors::{LedgerError, LedgerResult};
use crate::ledger::store::{id_segment, validate_key_segment};
use crate::ledger::{GameKind, GameOutcome, LedgerStore, Mutation, NewTransaction, TransactionKind, UserId};
use crate::metrics::MetricsRegistry;
use crate::money::{apply_bps, Amount};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

const MATCH_PREFIX: &str = "match:id:";

fn match_key(id: u64) -> Vec<u8> {
    format!("{}{}", MATCH_PREFIX, id_segment(id)).into_bytes()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Waiting,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerMatch {
    pub id: u64,
    pub kind: GameKind,
    pub stake: Amount,
    pub players: Vec<UserId>,
    pub status: MatchStatus,
    pub pot: Amount,
    pub fee: Amount,
    pub winners: Vec<UserId>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatchResult {
    pub match_id: u64,
    pub pot: Amount,
    pub fee: Amount,
    pub net: Amount,
    pub payout_per_winner: Amount,
    /// Remainder of the integer split, kept by the platform
    pub dust: Amount,
}

#[derive(Clone)]
pub struct MatchSettlement {
    store: Arc<LedgerStore>,
    config: MatchConfig,
    win_turnover_bps: i64,
}

impl MatchSettlement {
    pub fn new(store: Arc<LedgerStore>, config: MatchConfig, win_turnover_bps: i64) -> Self {
        Self {
            store,
            config,
            win_turnover_bps,
        }
    }

    pub fn open_match(&self, kind: GameKind, stake: Amount) -> LedgerResult<PeerMatch> {
        if stake <= 0 {
            return Err(LedgerError::InvalidAmount(format!("stake {} is not positive", stake)));
        }
        let created = self.store.transact(|txn| {
            let id = txn.next_id("match")?;
            let peer_match = PeerMatch {
                id,
                kind,
                stake,
                players: Vec::new(),
                status: MatchStatus::Waiting,
                pot: 0,
                fee: 0,
                winners: Vec::new(),
                created_at: txn.now(),
                finished_at: None,
            };
            txn.put(match_key(id), &peer_match)?;
            Ok(peer_match)
        })?;
        tracing::info!(match_id = created.id, %kind, stake, "Match opened");
        Ok(created)
    }

    /// Seat a player and take their stake
    pub fn join_match(&self, match_id: u64, user_id: &str) -> LedgerResult<PeerMatch> {
        validate_key_segment(user_id, "user id")?;
        let joined = self.store.transact(|txn| {
            let mut peer_match: PeerMatch = txn
                .get(&match_key(match_id))?
                .ok_or_else(|| LedgerError::MatchNotFound(match_id.to_string()))?;
            if peer_match.status != MatchStatus::Waiting {
                return Err(LedgerError::InvalidMatchState(format!("match {} is already finished", match_id)));
            }
            if peer_match.players.len() >= self.config.max_players {
                return Err(LedgerError::InvalidMatchState(format!("match {} is full", match_id)));
            }
            if peer_match.players.iter().any(|p| p == user_id) {
                return Err(LedgerError::InvalidMatchState(format!("{} already joined match {}", user_id, match_id)));
            }
            if txn.account(user_id)?.is_banned {
                return Err(LedgerError::AccountBanned(user_id.to_string()));
            }

            txn.apply_mutation(
                user_id,
                Mutation::debit(peer_match.stake).wagered(peer_match.stake),
                NewTransaction::completed(TransactionKind::Stake, peer_match.stake, format!("match:{}", match_id))
                    .describe(format!("{} match entry", peer_match.kind)),
            )?;
            peer_match.players.push(user_id.to_string());
            txn.put(match_key(match_id), &peer_match)?;
            Ok(peer_match)
        })?;
        tracing::info!(match_id, user = user_id, players = joined.players.len(), "Player joined match");
        Ok(joined)
    }

    /// Distribute the pot. A match settles exactly once.
    pub fn settle_match(&self, match_id: u64, winners: &[UserId]) -> LedgerResult<MatchResult> {
        let result = self.store.transact(|txn| {
            let mut peer_match: PeerMatch = txn
                .get(&match_key(match_id))?
                .ok_or_else(|| LedgerError::MatchNotFound(match_id.to_string()))?;
            if peer_match.status == MatchStatus::Finished {
                return Err(LedgerError::InvalidMatchState(format!("match {} is already settled", match_id)));
            }
            if peer_match.players.len() < 2 {
                return Err(LedgerError::InvalidMatchState(format!(
                    "match {} has {} players",
                    match_id,
                    peer_match.players.len()
                )));
            }

            let winner_set: BTreeSet<&str> = winners.iter().map(String::as_str).collect();
            if winner_set.is_empty() || winner_set.len() != winners.len() {
                return Err(LedgerError::InvalidInput("winners must be a non-empty set".to_string()));
            }
            if let Some(stranger) = winner_set.iter().find(|w| !peer_match.players.iter().any(|p| p == **w)) {
                return Err(LedgerError::InvalidInput(format!("{} did not play match {}", stranger, match_id)));
            }

            let stake = peer_match.stake;
            let pot = stake * peer_match.players.len() as Amount;
            let fee = apply_bps(pot, self.config.fee_bps);
            let net = pot - fee;
            let share = net / winners.len() as Amount;
            let reference = format!("match:{}", match_id);

            for player in &peer_match.players {
                if winner_set.contains(player.as_str()) {
                    txn.apply_mutation(
                        player,
                        Mutation::credit(share).game(peer_match.kind, GameOutcome::Win),
                        NewTransaction::completed(TransactionKind::Win, share, reference.clone())
                            .describe(format!("{} match won", peer_match.kind)),
                    )?;
                    let effective = effective_turnover(stake, share, self.win_turnover_bps);
                    apply_wager_in(txn, self.store.metrics(), player, effective)?;
                } else {
                    txn.apply_mutation(
                        player,
                        Mutation::default().game(peer_match.kind, GameOutcome::Loss),
                        NewTransaction::completed(TransactionKind::Loss, stake, reference.clone())
                            .describe(format!("{} match lost", peer_match.kind)),
                    )?;
                    apply_wager_in(txn, self.store.metrics(), player, stake)?;
                }
            }

            peer_match.status = MatchStatus::Finished;
            peer_match.pot = pot;
            peer_match.fee = fee;
            peer_match.winners = winners.to_vec();
            peer_match.finished_at = Some(txn.now());
            txn.put(match_key(match_id), &peer_match)?;

            Ok(MatchResult {
                match_id,
                pot,
                fee,
                net,
                payout_per_winner: share,
                dust: net - share * winners.len() as Amount,
            })
        })?;

        MetricsRegistry::incr(&self.store.metrics().matches_settled);
        tracing::info!(
            match_id,
            pot = result.pot,
            fee = result.fee,
            winners = winners.len(),
            payout = result.payout_per_winner,
            "Match settled"
        );
        Ok(result)
    }

    pub fn get_match(&self, match_id: u64) -> LedgerResult<PeerMatch> {
        self.store.read(|txn| {
            txn.get(&match_key(match_id))?
                .ok_or_else(|| LedgerError::MatchNotFound(match_id.to_string()))
        })
    }
}
