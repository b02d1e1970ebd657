//! Wiring of the ledger components over one store

use crate::bonus::{BonusEngine, ExpiryReport};
use crate::casino::{CasinoReconciler, HttpProviderGateway, ProviderGateway, SweepReport};
use crate::clock::{Clock, SystemClock};
use crate::commission::CommissionLedger;
use crate::config::LedgerConfig;
use crate::errors::{LedgerError, LedgerResult, StorageError};
use crate::ledger::LedgerStore;
use crate::matches::MatchSettlement;
use crate::metrics::MetricsRegistry;
use crate::storage::OptimizedStorage;
use crate::workflow::CashierWorkflow;
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct MaintenanceReport {
    pub casino: SweepReport,
    pub bonuses: ExpiryReport,
}

pub struct LedgerEngine {
    config: LedgerConfig,
    pub store: Arc<LedgerStore>,
    pub cashier: CashierWorkflow,
    pub bonus: BonusEngine,
    pub casino: CasinoReconciler,
    pub commission: CommissionLedger,
    pub matches: MatchSettlement,
}

impl LedgerEngine {
    /// Open the configured database and talk to the configured provider over HTTP
    pub fn open(config: LedgerConfig) -> LedgerResult<Self> {
        config.validate()?;
        let storage = OptimizedStorage::new_with_config(&config.storage)
            .map_err(|e| StorageError::DatabaseOpenFailed(e.to_string()))?;
        let gateway = HttpProviderGateway::new(&config.casino)
            .map_err(|e| LedgerError::ExternalProviderError(e.to_string()))?;

        tracing::info!(path = %config.storage.data_directory, "Ledger database opened");
        Ok(Self::with_components(
            config,
            Arc::new(storage),
            Arc::new(gateway),
            Arc::new(SystemClock),
        ))
    }

    pub fn with_components(
        config: LedgerConfig,
        storage: Arc<OptimizedStorage>,
        gateway: Arc<dyn ProviderGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = Arc::new(LedgerStore::new(storage, clock, Arc::new(MetricsRegistry::new())));
        let win_bps = config.bonus.win_turnover_bps;

        Self {
            cashier: CashierWorkflow::new(store.clone(), config.cashier.clone()),
            bonus: BonusEngine::new(store.clone(), config.bonus.clone()),
            casino: CasinoReconciler::new(store.clone(), gateway, config.casino.clone(), win_bps),
            commission: CommissionLedger::new(store.clone(), config.commission.clone()),
            matches: MatchSettlement::new(store.clone(), config.matches.clone(), win_bps),
            store,
            config,
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        self.store.metrics()
    }

    /// One pass of the periodic sweeper
    pub fn run_maintenance(&self) -> LedgerResult<MaintenanceReport> {
        Ok(MaintenanceReport {
            casino: self.casino.sweep_abandoned()?,
            bonuses: self.bonus.expire_bonuses()?,
        })
    }
}
