//! Opaque casino provider gateway

use crate::config::CasinoConfig;
use crate::ledger::UserId;
use crate::money::Amount;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("provider did not answer within {0:?}")]
    Timeout(Duration),
    #[error("unexpected provider response: {0}")]
    UnexpectedResponse(String),
}

/// Launch parameters handed to the provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchPayload {
    pub user_id: UserId,
    pub balance: Amount,
    pub game_uid: String,
    pub match_id: String,
    pub token: String,
    pub return_url: String,
    pub callback_url: String,
    pub currency_code: String,
}

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Open a provider session and return the URL the player is sent to
    async fn launch(&self, payload: &LaunchPayload) -> Result<String, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct LaunchResponse {
    #[serde(alias = "url", alias = "game_url")]
    launch_url: String,
}

/// JSON-over-HTTP provider client
pub struct HttpProviderGateway {
    client: reqwest::Client,
    launch_url: String,
}

impl HttpProviderGateway {
    pub fn new(config: &CasinoConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.launch_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            launch_url: config.provider_url.clone(),
        })
    }
}

#[async_trait]
impl ProviderGateway for HttpProviderGateway {
    async fn launch(&self, payload: &LaunchPayload) -> Result<String, GatewayError> {
        let response = self.client.post(&self.launch_url).json(payload).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Rejected { status, body });
        }

        let parsed: LaunchResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::UnexpectedResponse(e.to_string()))?;
        if parsed.launch_url.is_empty() {
            return Err(GatewayError::UnexpectedResponse("empty launch url".to_string()));
        }
        Ok(parsed.launch_url)
    }
}
