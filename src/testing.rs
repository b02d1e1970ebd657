//! Test harness: an engine over a temporary database, a manual clock and a
//! scripted provider gateway. Setup failures panic.

use crate::casino::{GatewayError, LaunchPayload, ProviderGateway};
use crate::clock::ManualClock;
use crate::config::LedgerConfig;
use crate::engine::LedgerEngine;
use crate::ledger::{LedgerStore, Mutation, NewTransaction, Role, TransactionKind};
use crate::money::Amount;
use crate::storage::OptimizedStorage;
use crate::workflow::DepositRequest;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const ADMIN_ID: &str = "admin";

enum Scripted {
    Fail(String),
    Hang(Duration),
}

/// Provider stand-in: succeeds unless a failure or a hang was queued
#[derive(Default)]
pub struct ScriptedGateway {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<LaunchPayload>>,
}

impl ScriptedGateway {
    pub fn push_failure(&self, message: &str) {
        self.script.lock().unwrap().push_back(Scripted::Fail(message.to_string()));
    }

    /// The next launch answers only after `delay`
    pub fn push_hang(&self, delay: Duration) {
        self.script.lock().unwrap().push_back(Scripted::Hang(delay));
    }

    pub fn calls(&self) -> Vec<LaunchPayload> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProviderGateway for ScriptedGateway {
    async fn launch(&self, payload: &LaunchPayload) -> Result<String, GatewayError> {
        self.calls.lock().unwrap().push(payload.clone());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Scripted::Fail(message)) => Err(GatewayError::UnexpectedResponse(message)),
            Some(Scripted::Hang(delay)) => {
                tokio::time::sleep(delay).await;
                Ok(format!("https://provider.test/play/{}", payload.match_id))
            }
            None => Ok(format!("https://provider.test/play/{}", payload.match_id)),
        }
    }
}

pub struct TestHarness {
    pub engine: Arc<LedgerEngine>,
    pub store: Arc<LedgerStore>,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<ScriptedGateway>,
    _dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    pub fn with_config(mut config: LedgerConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        config.storage.data_directory = dir.path().to_string_lossy().to_string();
        config.storage.sync_writes = false;
        config.validate().expect("valid test config");

        let storage = OptimizedStorage::new_with_config(&config.storage).expect("open storage");
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).single().expect("valid start time"),
        ));
        let gateway = Arc::new(ScriptedGateway::default());

        let engine = Arc::new(LedgerEngine::with_components(
            config,
            Arc::new(storage),
            gateway.clone(),
            clock.clone(),
        ));
        Self {
            store: engine.store.clone(),
            engine,
            clock,
            gateway,
            _dir: dir,
        }
    }

    pub fn user(&self, user_id: &str) {
        self.store.register_account(user_id, Role::User, None).expect("register user");
    }

    /// Registered user holding `amount` of already-credited deposits
    pub fn funded_user(&self, user_id: &str, amount: Amount) {
        self.user(user_id);
        self.store
            .apply_mutation(
                user_id,
                Mutation::credit(amount).deposited(amount),
                NewTransaction::completed(TransactionKind::Deposit, amount, "test:funding"),
            )
            .expect("fund user");
    }

    /// Registers the administrator on first use
    pub fn admin(&self) -> String {
        if self.store.account(ADMIN_ID).is_err() {
            self.store.register_account(ADMIN_ID, Role::Admin, None).expect("register admin");
        }
        ADMIN_ID.to_string()
    }

    /// Deposit through the approval workflow
    pub fn deposit(&self, user_id: &str, amount: Amount) -> DepositRequest {
        let admin = self.admin();
        let trx_id = format!("TRX{}", uuid::Uuid::new_v4().simple());
        let request = self
            .engine
            .cashier
            .request_deposit(user_id, amount, "bkash", &trx_id)
            .expect("request deposit");
        self.engine
            .cashier
            .approve_deposit(&admin, request.id)
            .expect("approve deposit")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
