//! End-to-end ledger flows across the cashier, bonus, casino, commission
//! and match components, checked against the account/transaction-log
//! invariants.

use chrono::Duration;
use wager_ledger::bonus::{BonusKind, BonusStatus, ClaimContext};
use wager_ledger::casino::{LaunchRequest, ProviderCallback};
use wager_ledger::config::SettlementMode;
use wager_ledger::ledger::{GameKind, Role, TransactionKind, TransactionStatus};
use wager_ledger::money::parse_major_units;
use wager_ledger::testing::TestHarness;
use wager_ledger::LedgerError;

fn assert_invariants(h: &TestHarness, user_id: &str) {
    let account = h.store.account(user_id).unwrap();
    assert!(account.balance >= 0, "{} balance went negative", user_id);
    assert!(account.locked_balance >= 0, "{} locked balance went negative", user_id);
    assert!(account.held_balance >= 0, "{} held balance went negative", user_id);
    assert!(account.balance >= account.held_balance, "{} spent held funds", user_id);

    let report = h.store.reconcile(user_id).unwrap();
    assert!(report.is_consistent(), "delta sum mismatch: {:?}", report);
    assert_eq!(
        report.typed_sum,
        report.balance + report.pending_withdrawals,
        "typed ledger mismatch: {:?}",
        report
    );
}

fn daily(amount: i64) -> ClaimContext {
    ClaimContext {
        amount: Some(amount),
        friend_id: None,
    }
}

fn spin(match_id: &str, round: &str, bet: i64, win: i64) -> ProviderCallback {
    ProviderCallback {
        match_id: match_id.to_string(),
        round_id: round.to_string(),
        bet_amount: bet,
        win_amount: win,
        balance_after: None,
    }
}

#[test]
fn test_deposit_converts_and_credits_exactly_once() {
    let h = TestHarness::new();
    h.user("alice");
    let admin = h.admin();

    let amount = parse_major_units("300.00", 2).unwrap();
    assert_eq!(amount, 30000);

    let request = h.engine.cashier.request_deposit("alice", amount, "bkash", "TRX-300").unwrap();
    h.engine.cashier.approve_deposit(&admin, request.id).unwrap();

    let account = h.store.account("alice").unwrap();
    assert_eq!(account.balance, 30000);
    assert_eq!(account.total_deposited, 30000);

    assert!(matches!(
        h.engine.cashier.approve_deposit(&admin, request.id),
        Err(LedgerError::InvalidRequestState(_))
    ));
    let after = h.store.account("alice").unwrap();
    assert_eq!(after.balance, 30000);
    assert_eq!(after.total_deposited, 30000);
    assert_eq!(h.store.transactions("alice", 10).unwrap().len(), 1);
    assert_invariants(&h, "alice");
}

#[test]
fn test_overdrawn_withdrawal_leaves_no_trace() {
    let h = TestHarness::new();
    h.user("bob");
    h.deposit("bob", 600_00);
    let admin = h.admin();

    let err = h
        .engine
        .cashier
        .request_withdraw("bob", 600_01, "nagad", "01700000000")
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds { .. }));

    assert!(h.engine.cashier.pending_withdrawals(&admin).unwrap().is_empty());
    assert_eq!(h.store.transactions("bob", 10).unwrap().len(), 1);
    assert_eq!(h.store.account("bob").unwrap().balance, 600_00);
}

#[test]
fn test_withdraw_approval_is_not_repeatable() {
    let h = TestHarness::new();
    h.user("carol");
    h.deposit("carol", 1_000_00);
    let admin = h.admin();

    let request = h
        .engine
        .cashier
        .request_withdraw("carol", 700_00, "nagad", "01700000001")
        .unwrap();
    assert_eq!(h.store.account("carol").unwrap().balance, 300_00);
    assert_invariants(&h, "carol");

    h.engine.cashier.approve_withdraw(&admin, request.id).unwrap();
    let history = h.store.transactions("carol", 1).unwrap();
    assert_eq!(history[0].kind, TransactionKind::Withdraw);
    assert_eq!(history[0].status, TransactionStatus::Completed);

    assert!(matches!(
        h.engine.cashier.approve_withdraw(&admin, request.id),
        Err(LedgerError::InvalidRequestState(_))
    ));
    let account = h.store.account("carol").unwrap();
    assert_eq!(account.balance, 300_00);
    assert_eq!(account.total_withdrawn, 700_00);
    assert_invariants(&h, "carol");
}

#[test]
fn test_losing_stake_completes_bonus_at_its_requirement() {
    let h = TestHarness::new();
    h.funded_user("dave", 1_000_00);

    let grant = h.engine.bonus.claim("dave", BonusKind::Daily, &daily(50_00)).unwrap();
    assert_eq!(grant.turnover_required, 500_00);
    h.engine.bonus.apply_wager("dave", 450_00).unwrap();

    let effective = h.engine.bonus.effective_turnover(100_00, 0);
    assert_eq!(effective, 100_00);
    let allocation = h.engine.bonus.apply_wager("dave", effective).unwrap();
    assert_eq!(allocation.allocations, vec![(grant.bonus_id, 50_00)]);
    assert!(allocation.lock_released);

    let summary = h.engine.bonus.summary("dave").unwrap();
    let bonus = &summary.bonuses[0];
    assert_eq!(bonus.current_turnover, 500_00);
    assert!(bonus.is_withdrawable);
    assert_eq!(bonus.status, BonusStatus::Completed);
    assert_eq!(summary.locked_balance, 0);
    assert_invariants(&h, "dave");
}

#[test]
fn test_turnover_never_exceeds_requirement() {
    let h = TestHarness::new();
    h.funded_user("erin", 1_000_00);

    let first = h.engine.bonus.claim("erin", BonusKind::Daily, &daily(5_00)).unwrap();
    h.clock.advance(Duration::minutes(1));
    let second = h.engine.bonus.claim("erin", BonusKind::Daily, &daily(20_00)).unwrap();

    let allocation = h.engine.bonus.apply_wager("erin", 10_000_00).unwrap();
    assert_eq!(allocation.allocations, vec![(first.bonus_id, 50_00), (second.bonus_id, 200_00)]);

    for bonus in h.engine.bonus.summary("erin").unwrap().bonuses {
        assert!(bonus.current_turnover <= bonus.turnover_amount);
        assert_eq!(bonus.current_turnover, bonus.turnover_amount);
    }
    assert_eq!(h.store.account("erin").unwrap().total_turnover, 10_000_00);
}

#[tokio::test]
async fn test_batch_settlement_twice_changes_nothing_more() {
    let h = TestHarness::new();
    h.funded_user("frank", 1_000_00);

    let ticket = h
        .engine
        .casino
        .launch(&LaunchRequest {
            user_id: "frank".to_string(),
            game_uid: "slots-7".to_string(),
            mode: Some(SettlementMode::Batch),
        })
        .await
        .unwrap();

    h.engine.casino.record_spin(&spin(&ticket.match_id, "r1", 10_00, 0)).unwrap();
    h.engine.casino.record_spin(&spin(&ticket.match_id, "r2", 10_00, 25_00)).unwrap();
    let duplicate = h.engine.casino.record_spin(&spin(&ticket.match_id, "r2", 10_00, 25_00)).unwrap();
    assert!(duplicate.duplicate);

    let first = h.engine.casino.settle(&ticket.match_id, None).unwrap();
    assert_eq!(first.spins_settled, 2);
    assert_eq!(first.net_result, 5_00);
    assert_eq!(h.store.account("frank").unwrap().balance, 1_005_00);

    let second = h.engine.casino.settle(&ticket.match_id, None).unwrap();
    assert_eq!(second.spins_settled, 0);
    assert_eq!(second.net_result, 0);
    assert_eq!(h.store.account("frank").unwrap().balance, 1_005_00);
    assert_invariants(&h, "frank");
}

#[test]
fn test_racing_deposit_approvals_credit_once() {
    let h = TestHarness::new();
    h.user("kate");
    let admin = h.admin();
    let request = h.engine.cashier.request_deposit("kate", 250_00, "bkash", "TRX-RACE").unwrap();

    let approved = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| h.engine.cashier.approve_deposit(&admin, request.id)))
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap())
            .filter(|result| result.is_ok())
            .count()
    });
    assert_eq!(approved, 1);

    let account = h.store.account("kate").unwrap();
    assert_eq!(account.balance, 250_00);
    assert_eq!(account.total_deposited, 250_00);
    assert_eq!(h.store.transactions("kate", 10).unwrap().len(), 1);
    assert_invariants(&h, "kate");
}

#[tokio::test]
async fn test_racing_batch_settlements_apply_once() {
    let h = TestHarness::new();
    h.funded_user("liam", 500_00);
    let ticket = h
        .engine
        .casino
        .launch(&LaunchRequest {
            user_id: "liam".to_string(),
            game_uid: "slots-3".to_string(),
            mode: Some(SettlementMode::Batch),
        })
        .await
        .unwrap();
    h.engine.casino.record_spin(&spin(&ticket.match_id, "r1", 40_00, 0)).unwrap();
    h.engine.casino.record_spin(&spin(&ticket.match_id, "r2", 20_00, 5_00)).unwrap();

    let settled: usize = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..8)
            .map(|_| scope.spawn(|| h.engine.casino.settle_batch(&ticket.match_id)))
            .collect();
        workers
            .into_iter()
            .map(|worker| worker.join().unwrap().unwrap().spins_settled)
            .sum()
    });
    assert_eq!(settled, 2);

    let account = h.store.account("liam").unwrap();
    assert_eq!(account.balance, 500_00 - 55_00);
    assert_eq!(account.held_balance, 0);
    let rows = h.store.transactions("liam", 10).unwrap();
    assert_eq!(rows.iter().filter(|tx| tx.kind == TransactionKind::Loss).count(), 1);
    assert_invariants(&h, "liam");
}

#[tokio::test]
async fn test_immediate_session_settles_to_provider_balance() {
    let h = TestHarness::new();
    h.funded_user("gina", 500_00);

    let ticket = h
        .engine
        .casino
        .launch(&LaunchRequest {
            user_id: "gina".to_string(),
            game_uid: "crash-1".to_string(),
            mode: Some(SettlementMode::Immediate),
        })
        .await
        .unwrap();
    h.engine.casino.record_spin(&spin(&ticket.match_id, "r1", 100_00, 0)).unwrap();
    h.engine.casino.record_spin(&spin(&ticket.match_id, "r2", 50_00, 20_00)).unwrap();

    let outcome = h.engine.casino.settle(&ticket.match_id, None).unwrap();
    assert_eq!(outcome.balance, 370_00);
    assert_eq!(outcome.net_result, -130_00);

    let account = h.store.account("gina").unwrap();
    assert_eq!(account.balance, 370_00);
    assert_eq!(account.stats_for(GameKind::Casino).losses, 1);
    assert_eq!(h.store.transactions("gina", 1).unwrap()[0].kind, TransactionKind::Loss);
    assert_invariants(&h, "gina");
}

#[test]
fn test_match_pot_single_winner() {
    let h = TestHarness::new();
    let created = h.engine.matches.open_match(GameKind::CallBreak, 50).unwrap();
    for player in ["p1", "p2", "p3", "p4"] {
        h.funded_user(player, 1_000);
        h.engine.matches.join_match(created.id, player).unwrap();
    }

    let result = h.engine.matches.settle_match(created.id, &["p3".to_string()]).unwrap();
    assert_eq!(result.pot, 200);
    assert_eq!(result.fee, 5);
    assert_eq!(result.payout_per_winner, 195);

    assert_eq!(h.store.account("p3").unwrap().balance, 1_145);
    assert_eq!(h.store.account("p1").unwrap().balance, 950);
    for player in ["p1", "p2", "p3", "p4"] {
        assert!(h.store.reconcile(player).unwrap().is_consistent());
    }
}

#[test]
fn test_commission_claim_twice_in_a_week() {
    let h = TestHarness::new();
    h.store.register_account("agent", Role::SubAgent, None).unwrap();
    h.store.register_account("referred", Role::User, Some("agent")).unwrap();
    h.deposit("referred", 2_000_00);
    h.deposit("referred", 1_000_00);

    h.engine.commission.claim("agent", 180_00).unwrap();
    let balance = h.store.account("agent").unwrap().balance;
    assert_eq!(balance, 180_00);

    h.clock.advance(Duration::days(6));
    assert!(matches!(
        h.engine.commission.claim("agent", 90_00),
        Err(LedgerError::CooldownActive { .. })
    ));
    assert_eq!(h.store.account("agent").unwrap().balance, balance);

    h.clock.advance(Duration::days(1));
    h.engine.commission.claim("agent", 90_00).unwrap();
    assert_eq!(h.store.account("agent").unwrap().balance, 270_00);
    assert_invariants(&h, "agent");
}

#[test]
fn test_referral_reward_once_per_friend() {
    let h = TestHarness::new();
    h.user("host");
    h.store.register_account("friend", Role::User, Some("host")).unwrap();
    let referral = ClaimContext {
        amount: None,
        friend_id: Some("friend".to_string()),
    };

    h.deposit("friend", 500_00);
    assert!(matches!(
        h.engine.bonus.claim("host", BonusKind::ReferralReward, &referral),
        Err(LedgerError::ThresholdNotMet(_))
    ));

    h.engine.bonus.apply_wager("friend", 1_000_00).unwrap();
    let grant = h.engine.bonus.claim("host", BonusKind::ReferralReward, &referral).unwrap();
    assert_eq!(grant.bonus_amount, 100_00);
    assert!(matches!(
        h.engine.bonus.claim("host", BonusKind::ReferralReward, &referral),
        Err(LedgerError::AlreadyClaimed(_))
    ));
    assert_invariants(&h, "host");
}

#[tokio::test]
async fn test_maintenance_expires_bonuses_and_sweeps_games() {
    let h = TestHarness::new();
    h.funded_user("hank", 1_000_00);
    h.engine.bonus.claim("hank", BonusKind::Daily, &daily(10_00)).unwrap();
    assert_eq!(h.store.account("hank").unwrap().locked_balance, 10_00);

    let ticket = h
        .engine
        .casino
        .launch(&LaunchRequest {
            user_id: "hank".to_string(),
            game_uid: "slots-9".to_string(),
            mode: Some(SettlementMode::Batch),
        })
        .await
        .unwrap();
    h.engine.casino.record_spin(&spin(&ticket.match_id, "r1", 20_00, 0)).unwrap();

    h.clock.advance(Duration::days(8));
    let report = h.engine.run_maintenance().unwrap();
    assert_eq!(report.casino.settled, 1);
    assert_eq!(report.bonuses.expired, 1);
    assert_eq!(report.bonuses.forfeited, 10_00);

    let account = h.store.account("hank").unwrap();
    assert_eq!(account.balance, 1_000_00 + 10_00 - 20_00 - 10_00);
    assert_eq!(account.locked_balance, 0);
    assert_eq!(account.held_balance, 0);
    assert_eq!(account.withdrawable(), 980_00);
    assert_eq!(h.store.transactions("hank", 1).unwrap()[0].kind, TransactionKind::BonusForfeit);
    assert_invariants(&h, "hank");

    let again = h.engine.run_maintenance().unwrap();
    assert_eq!(again.casino.settled + again.casino.closed_idle + again.bonuses.expired, 0);
}

#[test]
fn test_full_player_lifecycle_reconciles() {
    let h = TestHarness::new();
    h.user("ivy");
    let admin = h.admin();

    h.deposit("ivy", 1_000_00);
    let grant = h
        .engine
        .bonus
        .claim("ivy", BonusKind::FirstDeposit, &ClaimContext::default())
        .unwrap();
    assert_eq!(grant.bonus_amount, 500_00);
    assert!(matches!(
        h.engine.bonus.claim("ivy", BonusKind::FirstDeposit, &ClaimContext::default()),
        Err(LedgerError::AlreadyClaimed(_))
    ));

    let account = h.store.account("ivy").unwrap();
    assert_eq!(account.balance, 1_500_00);
    assert_eq!(account.withdrawable(), 1_000_00);
    assert!(matches!(
        h.engine.cashier.request_withdraw("ivy", 1_000_01, "bkash", "017"),
        Err(LedgerError::InsufficientFunds { .. })
    ));

    h.engine.bonus.apply_wager("ivy", 5_000_00).unwrap();
    let withdraw = h
        .engine
        .cashier
        .request_withdraw("ivy", 1_500_00, "bkash", "017")
        .unwrap();
    assert_invariants(&h, "ivy");

    let bonuses = h.engine.bonus.summary("ivy").unwrap().bonuses;
    assert_eq!(bonuses[0].status, BonusStatus::Used);

    h.engine.cashier.approve_withdraw(&admin, withdraw.id).unwrap();
    let account = h.store.account("ivy").unwrap();
    assert_eq!(account.balance, 0);
    assert_eq!(account.total_withdrawn, 1_500_00);
    assert_invariants(&h, "ivy");
}
