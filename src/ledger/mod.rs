// Ledger - the system of record for payments, escrows, events and settlements
pub mod memory;
pub mod models;
pub mod repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use models::*;

pub use memory::InMemoryLedger;
pub use repository::LedgerRepository;

/// Storage port shared by the Postgres repository and the in-process ledger.
///
/// Every method that moves a status is a single conditional write on the
/// expected prior value. `Ok(false)` means another worker got there first and
/// the caller must skip; an `Err` is reserved for invalid edges and storage
/// failures.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ========== PAYMENT OPERATIONS ==========

    async fn insert_payment(&self, payment: &Payment) -> AppResult<()>;

    async fn get_payment(&self, id: Uuid) -> AppResult<Option<Payment>>;

    /// Oldest first
    async fn list_payments_by_status(&self, status: PaymentStatus) -> AppResult<Vec<Payment>>;

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> AppResult<bool>;

    /// Re-takes a `processing` claim whose holder stopped touching it before `stale_before`.
    async fn renew_processing_lease(&self, id: Uuid, stale_before: DateTime<Utc>) -> AppResult<bool>;

    /// `pending -> processing`, storing the matched deposit. A deposit already
    /// bound to another payment loses the claim.
    async fn claim_deposit(&self, id: Uuid, deposit_reference: &str) -> AppResult<bool>;

    /// `processing -> pending`, clearing the deposit so it can match again.
    async fn revert_deposit_claim(&self, id: Uuid) -> AppResult<bool>;

    /// Sets the party's approval flag; only the first `false -> true` flip succeeds.
    async fn set_approval(&self, id: Uuid, party: Party, tx_hash: Option<String>) -> AppResult<bool>;

    // ========== ESCROW OPERATIONS ==========

    /// Returns the stored escrow, which is the existing row when one is already bound to the payment.
    async fn insert_escrow(&self, escrow: &Escrow) -> AppResult<Escrow>;

    async fn get_escrow_by_payment(&self, payment_id: Uuid) -> AppResult<Option<Escrow>>;

    async fn record_custody_created(
        &self,
        escrow_id: Uuid,
        onchain_escrow_id: &str,
        tx_hash: &str,
    ) -> AppResult<()>;

    async fn record_release_tx(&self, escrow_id: Uuid, tx_hash: &str) -> AppResult<()>;

    async fn transition_escrow(
        &self,
        escrow_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
    ) -> AppResult<bool>;

    async fn record_dispute(
        &self,
        escrow_id: Uuid,
        reason: &str,
        disputed_from: PaymentStatus,
    ) -> AppResult<()>;

    async fn record_dispute_resolution(
        &self,
        escrow_id: Uuid,
        resolution: DisputeResolution,
    ) -> AppResult<()>;

    /// Active escrows whose custody deadline is at or before `now`.
    async fn list_due_escrows(&self, now: DateTime<Utc>) -> AppResult<Vec<Escrow>>;

    // ========== EVENT LOG ==========

    async fn append_event(&self, event: &PaymentEvent) -> AppResult<()>;

    async fn record_event(
        &self,
        payment_id: Uuid,
        event_type: EventType,
        description: String,
    ) -> AppResult<()> {
        self.append_event(&PaymentEvent::new(payment_id, event_type, description))
            .await
    }

    /// In append order
    async fn list_events(&self, payment_id: Uuid) -> AppResult<Vec<PaymentEvent>>;

    // ========== SETTLEMENT RECORDS ==========

    async fn insert_ledger_tx(&self, tx: &LedgerTransaction) -> AppResult<()>;

    /// Inserts a payout record unless one is already pending, submitted or
    /// succeeded for the same payment and purpose, or the payment holds payouts
    /// (disputed, cancelled, failed). Serialized with `dispute_before_payout`.
    async fn claim_payout(&self, tx: &LedgerTransaction) -> AppResult<bool>;

    /// `from -> disputed`, refused when a payout for `purpose` is already claimed.
    async fn dispute_before_payout(
        &self,
        id: Uuid,
        from: PaymentStatus,
        purpose: SettlementPurpose,
    ) -> AppResult<bool>;

    async fn update_ledger_tx(&self, id: Uuid, update: LedgerTxUpdate) -> AppResult<()>;

    /// Oldest first
    async fn find_ledger_txs(
        &self,
        payment_id: Uuid,
        purpose: SettlementPurpose,
        kind: LedgerTxKind,
    ) -> AppResult<Vec<LedgerTransaction>>;

    // ========== RECOVERY CASES ==========

    async fn get_recovery_case(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
    ) -> AppResult<Option<RecoveryCase>>;

    /// Upserts the case, bumping `attempts`. A resolved case is reopened with a fresh count.
    async fn record_recovery_attempt(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<RecoveryCase>;

    /// Only the first caller flips `alerted_at`.
    async fn mark_alerted(&self, payment_id: Uuid, kind: StuckKind, at: DateTime<Utc>) -> AppResult<bool>;

    async fn resolve_recovery_case(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
        at: DateTime<Utc>,
    ) -> AppResult<()>;
}
