// Juno (Bitso) banking rail client
//
// Every request is signed with the Bitso HMAC scheme:
//   Authorization: Bitso {key}:{nonce}:{hex(HMAC_SHA256(secret, nonce + method + path + body))}

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::Sha256;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::traits::*;
use crate::config::JunoConfig;
use crate::error::{RailError, RailResult};

type HmacSha256 = Hmac<Sha256>;

const DEPOSITS_PATH: &str = "/spei/v1/deposits";
const BANK_ACCOUNTS_PATH: &str = "/mint_platform/v1/accounts/banks";
const REDEMPTIONS_PATH: &str = "/mint_platform/v1/redemptions";
const TRANSACTIONS_PATH: &str = "/mint_platform/v1/transactions";
const WITHDRAWALS_PATH: &str = "/mint_platform/v1/withdrawals";

pub struct JunoClient {
    base_url: String,
    api_key: String,
    api_secret: String,
    client: reqwest::Client,
    last_nonce: AtomicI64,
}

/// Standard response envelope
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    payload: Option<T>,
}

#[derive(Debug, Deserialize)]
struct DepositPage {
    #[serde(default)]
    response: Vec<JunoDeposit>,
}

#[derive(Debug, Deserialize)]
struct JunoDeposit {
    fid: String,
    amount: serde_json::Value,
    receiver_clabe: Option<String>,
    sender_name: Option<String>,
    status: String,
    created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct JunoBankAccount {
    id: String,
    clabe: String,
    #[serde(default)]
    recipient_legal_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateBankAccountBody<'a> {
    clabe: &'a str,
    recipient_legal_name: &'a str,
    currency: &'a str,
    ownership: &'a str,
}

#[derive(Debug, Serialize)]
struct RedemptionBody<'a> {
    amount: Decimal,
    destination_bank_account_id: &'a str,
    asset: &'a str,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TransactionPage {
    #[serde(default)]
    content: Vec<JunoTransaction>,
}

#[derive(Debug, Deserialize)]
struct JunoTransaction {
    id: String,
    #[serde(default)]
    transaction_type: Option<String>,
    summary_status: String,
    #[serde(default)]
    amount: Option<serde_json::Value>,
    #[serde(default)]
    tx_hash: Option<String>,
}

#[derive(Debug, Serialize)]
struct WithdrawalBody<'a> {
    currency: &'a str,
    protocol: &'a str,
    amount: String,
    beneficiary: &'a str,
    clabe: &'a str,
    notes_ref: &'a str,
    numeric_ref: &'a str,
    origin_id: &'a str,
}

fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => Decimal::from_str(s).ok(),
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

impl JunoClient {
    pub fn new(config: &JunoConfig) -> RailResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RailError::Network(e.to_string()))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            client,
            last_nonce: AtomicI64::new(0),
        })
    }

    /// Millisecond timestamp, bumped so concurrent requests never reuse a nonce
    fn next_nonce(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut current = self.last_nonce.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_nonce.compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    fn sign(&self, nonce: i64, method: &Method, path: &str, body: &str) -> RailResult<String> {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .map_err(|e| RailError::Decode(format!("invalid api secret: {}", e)))?;
        mac.update(format!("{}{}{}{}", nonce, method.as_str(), path, body).as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());
        Ok(format!("Bitso {}:{}:{}", self.api_key, nonce, signature))
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: Option<String>,
        idempotency_key: Option<&str>,
    ) -> RailResult<T> {
        let body = body.unwrap_or_default();
        let signed_path = match query {
            Some(q) => format!("{}?{}", path, q),
            None => path.to_string(),
        };
        let authorization = self.sign(self.next_nonce(), &method, &signed_path, &body)?;

        let mut request = self
            .client
            .request(method.clone(), format!("{}{}", self.base_url, signed_path))
            .header("Authorization", authorization)
            .header("Content-Type", "application/json");
        if let Some(key) = idempotency_key {
            request = request.header("X-Idempotency-Key", key);
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!("⚠️  Juno {} {} rejected with {}", method, path, status);
            return Err(RailError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let envelope: Envelope<T> = response.json().await?;
        if !envelope.success {
            return Err(RailError::Rejected {
                status: status.as_u16(),
                message: "success=false".to_string(),
            });
        }
        envelope
            .payload
            .ok_or_else(|| RailError::Decode(format!("{} returned no payload", path)))
    }

    fn encode<B: Serialize>(body: &B) -> RailResult<String> {
        serde_json::to_string(body).map_err(|e| RailError::Decode(e.to_string()))
    }
}

#[async_trait]
impl DepositFeed for JunoClient {
    async fn recent_deposits(&self) -> RailResult<Vec<Deposit>> {
        let page: DepositPage = self
            .request(Method::GET, DEPOSITS_PATH, None, None, None)
            .await?;

        let deposits: Vec<Deposit> = page
            .response
            .into_iter()
            .filter_map(|d| {
                let amount = decimal_from_json(&d.amount)?;
                let status = match d.status.to_ascii_lowercase().as_str() {
                    "complete" | "completed" => DepositStatus::Complete,
                    "pending" => DepositStatus::Pending,
                    _ => DepositStatus::Other,
                };
                Some(Deposit {
                    id: d.fid,
                    amount,
                    receiver_clabe: d.receiver_clabe.unwrap_or_default(),
                    sender_name: d.sender_name,
                    status,
                    received_at: d.created_at,
                })
            })
            .collect();

        debug!("📥 Juno returned {} deposits", deposits.len());
        Ok(deposits)
    }
}

#[async_trait]
impl StablecoinRail for JunoClient {
    async fn lookup_destination_by_routing_id(
        &self,
        clabe: &str,
    ) -> RailResult<Option<BankDestination>> {
        let accounts: Vec<JunoBankAccount> = self
            .request(Method::GET, BANK_ACCOUNTS_PATH, None, None, None)
            .await?;

        Ok(accounts
            .into_iter()
            .find(|a| a.clabe == clabe)
            .map(|a| BankDestination {
                id: a.id,
                clabe: a.clabe,
                holder_name: a.recipient_legal_name.unwrap_or_default(),
            }))
    }

    async fn create_bank_destination(
        &self,
        clabe: &str,
        holder_name: &str,
    ) -> RailResult<BankDestination> {
        let body = Self::encode(&CreateBankAccountBody {
            clabe,
            recipient_legal_name: holder_name,
            currency: "MXN",
            ownership: "INDIVIDUAL_OWNED",
        })?;
        let created: IdOnly = self
            .request(Method::POST, BANK_ACCOUNTS_PATH, None, Some(body), None)
            .await?;

        info!("🏦 Registered bank destination {}", created.id);
        Ok(BankDestination {
            id: created.id,
            clabe: clabe.to_string(),
            holder_name: holder_name.to_string(),
        })
    }

    async fn submit_redemption(&self, request: &RedemptionRequest) -> RailResult<RedemptionReceipt> {
        let body = Self::encode(&RedemptionBody {
            amount: request.amount,
            destination_bank_account_id: &request.destination_id,
            asset: "mxn",
        })?;
        let created: IdOnly = self
            .request(
                Method::POST,
                REDEMPTIONS_PATH,
                None,
                Some(body),
                Some(&request.idempotency_key),
            )
            .await?;

        Ok(RedemptionReceipt { id: created.id })
    }

    async fn list_transactions(&self, filter: TransactionFilter) -> RailResult<Vec<RailTransaction>> {
        let kind = match filter.kind {
            RailTransactionKind::Redemption => "REDEMPTION",
            RailTransactionKind::Deposit => "DEPOSIT",
            RailTransactionKind::Withdrawal => "WITHDRAWAL",
            RailTransactionKind::Other => "ISSUANCE",
        };
        let query = format!("type={}&sort=createdAt,DESC&size={}", kind, filter.limit);
        let page: TransactionPage = self
            .request(Method::GET, TRANSACTIONS_PATH, Some(&query), None, None)
            .await?;

        Ok(page
            .content
            .into_iter()
            .map(|tx| RailTransaction {
                kind: match tx.transaction_type.as_deref() {
                    Some("REDEMPTION") => RailTransactionKind::Redemption,
                    Some("DEPOSIT") => RailTransactionKind::Deposit,
                    Some("WITHDRAWAL") => RailTransactionKind::Withdrawal,
                    _ => filter.kind,
                },
                status: match tx.summary_status.as_str() {
                    "SUCCEEDED" => RailTxStatus::Succeeded,
                    "FAILED" | "CANCELLED" | "REJECTED" => RailTxStatus::Failed,
                    _ => RailTxStatus::Pending,
                },
                amount: tx.amount.as_ref().and_then(decimal_from_json),
                tx_hash: tx.tx_hash,
                id: tx.id,
            })
            .collect())
    }

    async fn submit_payout(&self, request: &PayoutRequest) -> RailResult<PayoutReceipt> {
        let body = Self::encode(&WithdrawalBody {
            currency: "mxn",
            protocol: "clabe",
            amount: request.amount.to_string(),
            beneficiary: &request.beneficiary,
            clabe: &request.clabe,
            notes_ref: &request.notes_ref,
            numeric_ref: &request.numeric_ref,
            origin_id: &request.origin_id,
        })?;
        let created: IdOnly = self
            .request(
                Method::POST,
                WITHDRAWALS_PATH,
                None,
                Some(body),
                Some(&request.idempotency_key),
            )
            .await?;

        info!("💸 Juno payout accepted: {}", created.id);
        Ok(PayoutReceipt { id: created.id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> JunoClient {
        JunoClient::new(&JunoConfig {
            base_url: "https://stage.example.test/".to_string(),
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    #[test]
    fn signature_header_follows_bitso_scheme() {
        let juno = client();
        let header = juno
            .sign(1700000000000, &Method::GET, "/spei/v1/deposits", "")
            .unwrap();

        let parts: Vec<&str> = header.trim_start_matches("Bitso ").split(':').collect();
        assert_eq!(parts[0], "key");
        assert_eq!(parts[1], "1700000000000");

        let mut mac = HmacSha256::new_from_slice(b"secret").unwrap();
        mac.update(b"1700000000000GET/spei/v1/deposits");
        assert_eq!(parts[2], hex::encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn nonces_strictly_increase() {
        let juno = client();
        let first = juno.next_nonce();
        let second = juno.next_nonce();
        let third = juno.next_nonce();
        assert!(second > first && third > second);
    }

    #[test]
    fn amounts_parse_from_strings_and_numbers() {
        assert_eq!(
            decimal_from_json(&serde_json::json!("1000.50")),
            Some(Decimal::from_str("1000.50").unwrap())
        );
        assert_eq!(
            decimal_from_json(&serde_json::json!(200)),
            Some(Decimal::from(200))
        );
        assert_eq!(decimal_from_json(&serde_json::json!(null)), None);
    }
}
