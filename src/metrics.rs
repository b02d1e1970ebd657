//! Ledger counters exported in Prometheus text format

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// Prometheus-compatible metrics registry
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pub units_committed: AtomicU64,
    pub units_aborted: AtomicU64,

    pub deposits_requested: AtomicU64,
    pub deposits_approved: AtomicU64,
    pub withdrawals_requested: AtomicU64,
    pub withdrawals_approved: AtomicU64,

    pub bonuses_granted: AtomicU64,
    pub bonuses_completed: AtomicU64,
    pub bonuses_expired: AtomicU64,

    pub casino_launches: AtomicU64,
    pub casino_launch_failures: AtomicU64,
    pub casino_spins_recorded: AtomicU64,
    pub casino_spins_settled: AtomicU64,
    pub casino_sessions_swept: AtomicU64,

    pub commission_payouts: AtomicU64,
    pub matches_settled: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn to_prometheus_format(&self) -> String {
        let counters: [(&str, &str, &AtomicU64); 16] = [
            ("ledger_units_committed_total", "Committed units of work", &self.units_committed),
            ("ledger_units_aborted_total", "Units of work rolled back", &self.units_aborted),
            ("ledger_deposits_requested_total", "Deposit requests created", &self.deposits_requested),
            ("ledger_deposits_approved_total", "Deposit requests approved", &self.deposits_approved),
            ("ledger_withdrawals_requested_total", "Withdraw requests created", &self.withdrawals_requested),
            ("ledger_withdrawals_approved_total", "Withdraw requests approved", &self.withdrawals_approved),
            ("ledger_bonuses_granted_total", "Bonuses granted", &self.bonuses_granted),
            ("ledger_bonuses_completed_total", "Bonuses whose turnover was met", &self.bonuses_completed),
            ("ledger_bonuses_expired_total", "Bonuses forfeited at expiry", &self.bonuses_expired),
            ("ledger_casino_launches_total", "Casino sessions launched", &self.casino_launches),
            ("ledger_casino_launch_failures_total", "Casino launches rolled back", &self.casino_launch_failures),
            ("ledger_casino_spins_recorded_total", "Provider spins recorded", &self.casino_spins_recorded),
            ("ledger_casino_spins_settled_total", "Provider spins settled", &self.casino_spins_settled),
            ("ledger_casino_sessions_swept_total", "Abandoned sessions force-settled", &self.casino_sessions_swept),
            ("ledger_commission_payouts_total", "Commission payouts", &self.commission_payouts),
            ("ledger_matches_settled_total", "Peer matches settled", &self.matches_settled),
        ];

        let mut out = String::new();
        for (name, help, counter) in counters {
            let _ = writeln!(out, "# HELP {} {}", name, help);
            let _ = writeln!(out, "# TYPE {} counter", name);
            let _ = writeln!(out, "{} {}", name, counter.load(Ordering::Relaxed));
        }
        out
    }
}
