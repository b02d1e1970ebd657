//! Ledger inspection tool
//!
//! Prints one account, its recent transactions, bonuses and the
//! reconciliation of its transaction log. Run it while the node is stopped.

use clap::Parser;
use wager_ledger::money::format_minor_units;
use wager_ledger::{ConfigLoader, LedgerEngine};

#[derive(Parser)]
#[command(name = "inspect_ledger")]
struct Args {
    /// Account to inspect
    user_id: String,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Data directory override
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Transactions to show
    #[arg(short, long, default_value = "20")]
    limit: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    if let Some(dir) = args.data_dir {
        config.storage.data_directory = dir;
    }
    config.storage.clear_on_start = false;
    let digits = config.cashier.minor_unit_digits;

    let engine = LedgerEngine::open(config)?;
    let account = engine.store.account(&args.user_id)?;

    println!("Account {}", account.user_id);
    println!("   Role: {:?}  Banned: {}", account.role, account.is_banned);
    println!("   Balance: {}", format_minor_units(account.balance, digits));
    println!("   Locked: {}", format_minor_units(account.locked_balance, digits));
    println!("   Held by casino games: {}", format_minor_units(account.held_balance, digits));
    println!("   Withdrawable: {}", format_minor_units(account.withdrawable(), digits));
    println!(
        "   Deposited: {}  Withdrawn: {}",
        format_minor_units(account.total_deposited, digits),
        format_minor_units(account.total_withdrawn, digits)
    );
    println!(
        "   Wagered: {}  Turnover: {}",
        format_minor_units(account.total_wagered, digits),
        format_minor_units(account.total_turnover, digits)
    );
    println!("   Games: {} (W{} / L{})", account.games_played, account.wins, account.losses);

    println!();
    println!("Recent transactions:");
    for tx in engine.store.transactions(&args.user_id, args.limit)? {
        println!(
            "   #{:<8} {:<18} {:>12} delta {:>12}  {:?}  {}",
            tx.id,
            format!("{:?}", tx.kind),
            format_minor_units(tx.amount, digits),
            format_minor_units(tx.balance_delta, digits),
            tx.status,
            tx.reference
        );
    }

    let bonuses = engine.bonus.summary(&args.user_id)?;
    println!();
    println!("Bonuses:");
    println!("{}", serde_json::to_string_pretty(&bonuses)?);

    let report = engine.store.reconcile(&args.user_id)?;
    println!();
    println!(
        "Reconciliation: {} transactions, delta sum {}, balance {} -> {}",
        report.transaction_count,
        format_minor_units(report.delta_sum, digits),
        format_minor_units(report.balance, digits),
        if report.is_consistent() { "consistent" } else { "MISMATCH" }
    );

    Ok(())
}
