use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

use super::traits::*;
use crate::config::EscrowRelayerConfig;
use crate::error::{RailError, RailResult};

/// Escrow contract reached through an HTTP signing relayer.
///
/// The relayer holds the bridge key and submits contract calls; this client
/// only speaks its JSON API.
pub struct EscrowRelayerClient {
    base_url: String,
    api_token: String,
    token_symbol: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreateEscrowBody<'a> {
    reference: String,
    payer: &'a str,
    payee: &'a str,
    amount: String,
    token: &'a str,
    deadline: i64,
}

#[derive(Debug, Serialize)]
struct DisputeBody<'a> {
    reason: &'a str,
}

#[derive(Debug, Serialize)]
struct ResolveBody {
    release_to_payee: bool,
}

#[derive(Debug, Deserialize)]
struct CreatedEscrow {
    escrow_id: String,
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct TxOnly {
    tx_hash: String,
}

#[derive(Debug, Deserialize)]
struct EscrowState {
    status: OnchainCustodyState,
}

impl EscrowRelayerClient {
    pub fn new(config: &EscrowRelayerConfig) -> RailResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RailError::Network(e.to_string()))?;

        Ok(Self {
            base_url: config.relayer_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            token_symbol: config.token_symbol.clone(),
            client,
        })
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> RailResult<T> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> RailResult<T> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> RailResult<T> {
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RailError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl EscrowContract for EscrowRelayerClient {
    async fn create_custody(&self, request: &CustodyRequest) -> RailResult<CustodyReceipt> {
        let created: CreatedEscrow = self
            .post(
                "/v1/escrows",
                &CreateEscrowBody {
                    reference: request.payment_id.to_string(),
                    payer: &request.payer,
                    payee: &request.payee,
                    amount: request.amount.to_string(),
                    token: &self.token_symbol,
                    deadline: request.deadline.timestamp(),
                },
            )
            .await?;

        info!(
            "🔐 Custody {} created on-chain (tx: {})",
            created.escrow_id, created.tx_hash
        );
        Ok(CustodyReceipt {
            escrow_id: created.escrow_id,
            tx_hash: created.tx_hash,
        })
    }

    async fn release_custody(&self, escrow_id: &str) -> RailResult<String> {
        let tx: TxOnly = self
            .post(&format!("/v1/escrows/{}/release", escrow_id), &serde_json::json!({}))
            .await?;
        Ok(tx.tx_hash)
    }

    async fn raise_dispute(&self, escrow_id: &str, reason: &str) -> RailResult<String> {
        let tx: TxOnly = self
            .post(
                &format!("/v1/escrows/{}/dispute", escrow_id),
                &DisputeBody { reason },
            )
            .await?;
        Ok(tx.tx_hash)
    }

    async fn resolve_dispute(&self, escrow_id: &str, release_to_payee: bool) -> RailResult<String> {
        let tx: TxOnly = self
            .post(
                &format!("/v1/escrows/{}/resolve", escrow_id),
                &ResolveBody { release_to_payee },
            )
            .await?;
        Ok(tx.tx_hash)
    }

    async fn cancel_custody(&self, escrow_id: &str) -> RailResult<String> {
        let tx: TxOnly = self
            .post(&format!("/v1/escrows/{}/cancel", escrow_id), &serde_json::json!({}))
            .await?;
        Ok(tx.tx_hash)
    }

    async fn custody_state(&self, escrow_id: &str) -> RailResult<OnchainCustodyState> {
        let state: EscrowState = self.get(&format!("/v1/escrows/{}", escrow_id)).await?;
        Ok(state.status)
    }
}
