//! Wager Ledger HTTP API
//!
//! Player, back-office, casino provider and match-engine endpoints over the
//! ledger engine. Authentication happens upstream; the caller arrives in the
//! `x-user-id` header.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use server::ApiServer;
