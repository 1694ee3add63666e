use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use super::reference::SettlementReferences;
use crate::adapters::traits::{
    BankDestination, PayoutRequest, RailTransactionKind, RailTxStatus, RedemptionRequest,
    StablecoinRail, TransactionFilter,
};
use crate::config::PayoutConfig;
use crate::error::{AppError, AppResult, RailError};
use crate::ledger::models::*;
use crate::ledger::LedgerStore;

/// Redeems stablecoin to fiat and pays it out to the payee's bank account.
///
/// Every external call is preceded by a ledger record and followed by an
/// update carrying the outcome, so a crashed or timed-out settlement can be
/// resumed instead of repeated.
pub struct PayoutClient {
    rail: Arc<dyn StablecoinRail>,
    ledger: Arc<dyn LedgerStore>,
    config: PayoutConfig,
}

impl PayoutClient {
    pub fn new(
        rail: Arc<dyn StablecoinRail>,
        ledger: Arc<dyn LedgerStore>,
        config: PayoutConfig,
    ) -> Self {
        Self {
            rail,
            ledger,
            config,
        }
    }

    /// Redemption followed by payout for one slice of the payment
    pub async fn settle(
        &self,
        payment: &Payment,
        purpose: SettlementPurpose,
        amount: Decimal,
    ) -> AppResult<LedgerTransaction> {
        self.redeem(payment, purpose, amount).await?;
        self.payout(payment, purpose, amount).await
    }

    // ========== REDEMPTION ==========

    #[instrument(skip(self, payment), fields(payment_id = %payment.id, ?purpose))]
    pub async fn redeem(
        &self,
        payment: &Payment,
        purpose: SettlementPurpose,
        amount: Decimal,
    ) -> AppResult<LedgerTransaction> {
        let references = self.references(payment, purpose).await?;

        let existing = self
            .ledger
            .find_ledger_txs(payment.id, purpose, LedgerTxKind::Redemption)
            .await?;

        if let Some(done) = existing.iter().find(|t| t.status == LedgerTxStatus::Succeeded) {
            debug!("Redemption {} already confirmed", done.id);
            return Ok(done.clone());
        }

        // accepted by the rail earlier: poll it again rather than redeem twice
        if let Some(inflight) = existing.iter().rev().find(|t| {
            matches!(t.status, LedgerTxStatus::Submitted | LedgerTxStatus::TimedOut)
                && t.external_ref.is_some()
        }) {
            info!("🔁 Re-polling redemption {} for payment {}", inflight.id, payment.id);
            return self.confirm_redemption(inflight.clone()).await;
        }

        let destination = match self.resolve_destination(payment.id, &references).await {
            Ok(destination) => destination,
            Err(e) => {
                self.record(
                    payment.id,
                    EventType::RedemptionFailed,
                    format!("Bank destination unavailable: {}", e.summary()),
                )
                .await;
                return Err(e.into());
            }
        };

        // a pending record means we crashed around submission; its id is the idempotency key
        let mut record = match existing.iter().rev().find(|t| t.status == LedgerTxStatus::Pending) {
            Some(pending) => pending.clone(),
            None => {
                let record = LedgerTransaction::pending(
                    payment.id,
                    LedgerTxKind::Redemption,
                    purpose,
                    amount,
                );
                self.ledger.insert_ledger_tx(&record).await?;
                record
            }
        };

        let request = RedemptionRequest {
            amount,
            destination_id: destination.id,
            idempotency_key: record.id.to_string(),
        };

        match self.rail.submit_redemption(&request).await {
            Ok(receipt) => {
                self.ledger
                    .update_ledger_tx(
                        record.id,
                        LedgerTxUpdate {
                            status: Some(LedgerTxStatus::Submitted),
                            external_ref: Some(receipt.id.clone()),
                            tx_hash: None,
                        },
                    )
                    .await?;
                record.status = LedgerTxStatus::Submitted;
                record.external_ref = Some(receipt.id.clone());

                info!("🔄 Redemption {} submitted for {} {}", receipt.id, amount, payment.currency);
                self.record(
                    payment.id,
                    EventType::RedemptionInitiated,
                    format!("Redemption {} submitted for {} ({:?})", receipt.id, amount, purpose),
                )
                .await;
            }
            Err(e) => {
                error!("❌ Redemption submission failed for {}: {}", payment.id, e.summary());
                self.mark(record.id, LedgerTxStatus::Failed).await?;
                self.record(
                    payment.id,
                    EventType::RedemptionFailed,
                    format!("Redemption submission failed: {}", e.summary()),
                )
                .await;
                return Err(e.into());
            }
        }

        self.confirm_redemption(record).await
    }

    /// Bounded polling; only a `succeeded` status for our own reference counts.
    async fn confirm_redemption(&self, mut record: LedgerTransaction) -> AppResult<LedgerTransaction> {
        let external_ref = record.external_ref.clone().ok_or_else(|| {
            AppError::Internal(format!("Redemption {} has no external reference", record.id))
        })?;
        let filter = TransactionFilter {
            kind: RailTransactionKind::Redemption,
            limit: self.config.poll_page_size,
        };
        let attempts = self.config.poll_attempts;

        for attempt in 1..=attempts {
            match self.rail.list_transactions(filter).await {
                Ok(transactions) => {
                    match transactions.into_iter().find(|tx| tx.id == external_ref) {
                        Some(tx) if tx.status == RailTxStatus::Succeeded => {
                            self.ledger
                                .update_ledger_tx(
                                    record.id,
                                    LedgerTxUpdate {
                                        status: Some(LedgerTxStatus::Succeeded),
                                        external_ref: None,
                                        tx_hash: tx.tx_hash.clone(),
                                    },
                                )
                                .await?;
                            record.status = LedgerTxStatus::Succeeded;
                            record.tx_hash = tx.tx_hash;

                            info!("✅ Redemption {} confirmed after {} poll(s)", external_ref, attempt);
                            self.record(
                                record.payment_id,
                                EventType::RedemptionSucceeded,
                                format!("Redemption {} confirmed", external_ref),
                            )
                            .await;
                            return Ok(record);
                        }
                        Some(tx) if tx.status == RailTxStatus::Failed => {
                            self.mark(record.id, LedgerTxStatus::Failed).await?;
                            self.record(
                                record.payment_id,
                                EventType::RedemptionFailed,
                                format!("Redemption {} settled as failed", external_ref),
                            )
                            .await;
                            return Err(RailError::SettledFailed(external_ref).into());
                        }
                        _ => debug!("⏳ Redemption {} not confirmed yet ({}/{})", external_ref, attempt, attempts),
                    }
                }
                Err(e) => warn!(
                    "⚠️  Redemption poll {}/{} failed: {}",
                    attempt,
                    attempts,
                    e.summary()
                ),
            }

            if attempt < attempts {
                time::sleep(self.config.poll_interval()).await;
            }
        }

        warn!("⏰ Redemption {} unconfirmed after {} polls", external_ref, attempts);
        self.mark(record.id, LedgerTxStatus::TimedOut).await?;
        self.record(
            record.payment_id,
            EventType::RedemptionTimeout,
            format!("Redemption {} unconfirmed after {} polls", external_ref, attempts),
        )
        .await;
        Err(AppError::ConfirmationTimeout(format!(
            "redemption {} unconfirmed",
            external_ref
        )))
    }

    // ========== PAYOUT ==========

    /// Requires a confirmed redemption for the same slice. A failed payout never
    /// rolls the redemption back.
    #[instrument(skip(self, payment), fields(payment_id = %payment.id, ?purpose))]
    pub async fn payout(
        &self,
        payment: &Payment,
        purpose: SettlementPurpose,
        amount: Decimal,
    ) -> AppResult<LedgerTransaction> {
        let references = self.references(payment, purpose).await?;

        let payouts = self
            .ledger
            .find_ledger_txs(payment.id, purpose, LedgerTxKind::Payout)
            .await?;
        if let Some(done) = payouts.iter().find(|t| t.status == LedgerTxStatus::Succeeded) {
            return Ok(done.clone());
        }

        let redeemed = self
            .ledger
            .find_ledger_txs(payment.id, purpose, LedgerTxKind::Redemption)
            .await?
            .iter()
            .any(|t| t.status == LedgerTxStatus::Succeeded);
        if !redeemed {
            return Err(AppError::InvalidTransition {
                current: "redemption unconfirmed".to_string(),
                expected: "redemption succeeded".to_string(),
            });
        }

        let mut record = LedgerTransaction::pending(payment.id, LedgerTxKind::Payout, purpose, amount);
        if !self.ledger.claim_payout(&record).await? {
            return Err(AppError::ConcurrencyConflict(format!(
                "payout for payment {} already in flight or held by a dispute",
                payment.id
            )));
        }

        let request = PayoutRequest {
            amount,
            clabe: references.clabe,
            beneficiary: references.beneficiary,
            notes_ref: references.memo,
            numeric_ref: references.numeric_reference,
            origin_id: references.reference,
            idempotency_key: record.id.to_string(),
        };

        match self.rail.submit_payout(&request).await {
            Ok(receipt) => {
                self.ledger
                    .update_ledger_tx(
                        record.id,
                        LedgerTxUpdate {
                            status: Some(LedgerTxStatus::Succeeded),
                            external_ref: Some(receipt.id.clone()),
                            tx_hash: None,
                        },
                    )
                    .await?;
                record.status = LedgerTxStatus::Succeeded;
                record.external_ref = Some(receipt.id.clone());

                info!("💸 Payout {} sent: {} {}", receipt.id, amount, payment.currency);
                self.record(
                    payment.id,
                    EventType::PayoutSucceeded,
                    format!("Payout {} sent for {} ({:?})", receipt.id, amount, purpose),
                )
                .await;
                Ok(record)
            }
            Err(e) => {
                error!("❌ Payout failed for {}: {}", payment.id, e.summary());
                self.mark(record.id, LedgerTxStatus::Failed).await?;
                self.record(
                    payment.id,
                    EventType::PayoutFailed,
                    format!("Payout failed: {}", e.summary()),
                )
                .await;
                Err(e.into())
            }
        }
    }

    // ========== HELPERS ==========

    async fn references(
        &self,
        payment: &Payment,
        purpose: SettlementPurpose,
    ) -> AppResult<SettlementReferences> {
        match SettlementReferences::for_payment(payment, purpose) {
            Ok(references) => Ok(references),
            Err(e) => {
                warn!("⚠️  Settlement blocked for {}: {}", payment.id, e);
                self.record(payment.id, EventType::ValidationFailed, e.kind()).await;
                Err(e)
            }
        }
    }

    async fn resolve_destination(
        &self,
        payment_id: uuid::Uuid,
        references: &SettlementReferences,
    ) -> Result<BankDestination, RailError> {
        if let Some(found) = self
            .rail
            .lookup_destination_by_routing_id(&references.clabe)
            .await?
        {
            return Ok(found);
        }

        info!("🏦 Registering payout destination for payment {}", payment_id);
        self.rail
            .create_bank_destination(&references.clabe, &references.beneficiary)
            .await
    }

    async fn mark(&self, id: uuid::Uuid, status: LedgerTxStatus) -> AppResult<()> {
        self.ledger
            .update_ledger_tx(
                id,
                LedgerTxUpdate {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await
    }

    /// Event writes are best-effort here; the ledger record already holds the outcome.
    async fn record(&self, payment_id: uuid::Uuid, event_type: EventType, description: String) {
        if let Err(e) = self.ledger.record_event(payment_id, event_type, description).await {
            error!("❌ Failed to append {:?} for {}: {:?}", event_type, payment_id, e);
        }
    }
}
