//! Error types for the wager ledger
//!
//! One root error carries the business-rule taxonomy; storage and configuration
//! failures are nested so callers can tell a rejected request from a broken node.

use crate::money::Amount;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Root error type for all ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Amount, available: Amount },

    #[error("Invalid request state: {0}")]
    InvalidRequestState(String),

    #[error("Already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("Threshold not met: {0}")]
    ThresholdNotMet(String),

    #[error("Daily limit reached: {limit} grants per day")]
    DailyLimitReached { limit: u32 },

    #[error("Cooldown active until {retry_after}")]
    CooldownActive { retry_after: DateTime<Utc> },

    #[error("Insufficient commission: requested {requested}, available {available}")]
    InsufficientCommission { requested: Amount, available: Amount },

    #[error("Invalid match state: {0}")]
    InvalidMatchState(String),

    #[error("External provider error: {0}")]
    ExternalProviderError(String),

    #[error("Game not found: {0}")]
    GameNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Request not found: {0}")]
    RequestNotFound(String),

    #[error("Match not found: {0}")]
    MatchNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Account banned: {0}")]
    AccountBanned(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
}

/// Storage system errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    #[error("Write lock poisoned")]
    LockPoisoned,
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

impl LedgerError {
    /// Stable machine-readable code used by the HTTP layer
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::InvalidRequestState(_) => "INVALID_REQUEST_STATE",
            LedgerError::AlreadyClaimed(_) => "ALREADY_CLAIMED",
            LedgerError::ThresholdNotMet(_) => "THRESHOLD_NOT_MET",
            LedgerError::DailyLimitReached { .. } => "DAILY_LIMIT_REACHED",
            LedgerError::CooldownActive { .. } => "COOLDOWN_ACTIVE",
            LedgerError::InsufficientCommission { .. } => "INSUFFICIENT_COMMISSION",
            LedgerError::InvalidMatchState(_) => "INVALID_MATCH_STATE",
            LedgerError::ExternalProviderError(_) => "EXTERNAL_PROVIDER_ERROR",
            LedgerError::GameNotFound(_) => "GAME_NOT_FOUND",
            LedgerError::UserNotFound(_) => "USER_NOT_FOUND",
            LedgerError::RequestNotFound(_) => "REQUEST_NOT_FOUND",
            LedgerError::MatchNotFound(_) => "MATCH_NOT_FOUND",
            LedgerError::PermissionDenied(_) => "PERMISSION_DENIED",
            LedgerError::AccountBanned(_) => "ACCOUNT_BANNED",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidInput(_) => "INVALID_INPUT",
            LedgerError::Storage(_) => "STORAGE_ERROR",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
        }
    }

    /// Provider failures leave no local state behind and may be retried as-is
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ExternalProviderError(_))
    }

    /// Failures of the node itself rather than of the request
    pub fn is_internal(&self) -> bool {
        matches!(self, LedgerError::Storage(_) | LedgerError::Configuration(_))
    }
}

// External error conversions
impl From<rocksdb::Error> for LedgerError {
    fn from(e: rocksdb::Error) -> Self {
        LedgerError::Storage(StorageError::WriteFailed(e.to_string()))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Storage(StorageError::CorruptedData(e.to_string()))
    }
}

// Convenience type alias for Results
pub type LedgerResult<T> = Result<T, LedgerError>;
