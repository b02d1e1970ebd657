//! Third-party casino sessions: launch, provider callbacks and settlement

pub mod gateway;
pub mod reconciler;
pub mod types;

pub use gateway::{GatewayError, HttpProviderGateway, LaunchPayload, ProviderGateway};
pub use reconciler::CasinoReconciler;
pub use types::*;
