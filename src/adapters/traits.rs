use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::RailResult;

// ========== BANKING / STABLECOIN RAIL ==========

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DepositStatus {
    Complete,
    Pending,
    Other,
}

/// Incoming bank transfer notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    /// Provider id of the deposit (fid)
    pub id: String,
    pub amount: Decimal,
    pub receiver_clabe: String,
    pub sender_name: Option<String>,
    pub status: DepositStatus,
    pub received_at: Option<DateTime<Utc>>,
}

/// Registered bank account on the rail
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BankDestination {
    pub id: String,
    pub clabe: String,
    pub holder_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionRequest {
    pub amount: Decimal,
    pub destination_id: String,
    /// Stable across retries of the same ledger record
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionReceipt {
    pub id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RailTransactionKind {
    Redemption,
    Deposit,
    Withdrawal,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RailTxStatus {
    Pending,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailTransaction {
    pub id: String,
    pub kind: RailTransactionKind,
    pub status: RailTxStatus,
    pub amount: Option<Decimal>,
    pub tx_hash: Option<String>,
}

/// Most recent first, bounded by `limit`
#[derive(Debug, Clone, Copy)]
pub struct TransactionFilter {
    pub kind: RailTransactionKind,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub amount: Decimal,
    pub clabe: String,
    pub beneficiary: String,
    pub notes_ref: String,
    pub numeric_ref: String,
    /// Alphanumeric reference tying the transfer back to the escrow slice
    pub origin_id: String,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub id: String,
}

/// Source of completed deposit notifications
#[async_trait]
pub trait DepositFeed: Send + Sync {
    async fn recent_deposits(&self) -> RailResult<Vec<Deposit>>;
}

/// Stablecoin redemption and fiat payout rail
#[async_trait]
pub trait StablecoinRail: Send + Sync {
    async fn lookup_destination_by_routing_id(&self, clabe: &str)
        -> RailResult<Option<BankDestination>>;

    async fn create_bank_destination(&self, clabe: &str, holder_name: &str)
        -> RailResult<BankDestination>;

    async fn submit_redemption(&self, request: &RedemptionRequest) -> RailResult<RedemptionReceipt>;

    async fn list_transactions(&self, filter: TransactionFilter) -> RailResult<Vec<RailTransaction>>;

    async fn submit_payout(&self, request: &PayoutRequest) -> RailResult<PayoutReceipt>;
}

// ========== ESCROW CONTRACT ==========

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyRequest {
    /// Off-chain payment id, doubles as the relayer idempotency key
    pub payment_id: Uuid,
    pub payer: String,
    pub payee: String,
    pub amount: Decimal,
    pub currency: String,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustodyReceipt {
    pub escrow_id: String,
    pub tx_hash: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OnchainCustodyState {
    Active,
    Released,
    Disputed,
    Refunded,
    Unknown,
}

/// On-chain custody contract, reached through a signing relayer
#[async_trait]
pub trait EscrowContract: Send + Sync {
    async fn create_custody(&self, request: &CustodyRequest) -> RailResult<CustodyReceipt>;

    /// Returns the release transaction hash
    async fn release_custody(&self, escrow_id: &str) -> RailResult<String>;

    async fn raise_dispute(&self, escrow_id: &str, reason: &str) -> RailResult<String>;

    /// `release_to_payee = false` refunds the payer
    async fn resolve_dispute(&self, escrow_id: &str, release_to_payee: bool) -> RailResult<String>;

    async fn cancel_custody(&self, escrow_id: &str) -> RailResult<String>;

    async fn custody_state(&self, escrow_id: &str) -> RailResult<OnchainCustodyState>;
}
