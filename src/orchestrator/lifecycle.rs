use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::traits::{CustodyRequest, EscrowContract};
use crate::config::LifecycleConfig;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::LedgerStore;
use crate::payout::PayoutClient;

/// Payment plus its escrow, as exposed by the status endpoint
#[derive(Debug, Clone, Serialize)]
pub struct PaymentView {
    pub payment: Payment,
    pub escrow: Option<Escrow>,
}

/// Payment lifecycle orchestrator
///
/// Every step starts by taking a claim, a conditional write on the expected
/// prior status. Losing a claim means another worker owns the step. External
/// failures revert the claim and leave a typed error event behind.
pub struct PaymentOrchestrator {
    ledger: Arc<dyn LedgerStore>,
    escrow: Arc<dyn EscrowContract>,
    payout: Arc<PayoutClient>,
    config: LifecycleConfig,
}

impl PaymentOrchestrator {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        escrow: Arc<dyn EscrowContract>,
        payout: Arc<PayoutClient>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            ledger,
            escrow,
            payout,
            config,
        }
    }

    // ========== CREATION & QUERIES ==========

    #[instrument(skip(self, new), fields(payer = %new.payer_id, amount = %new.amount))]
    pub async fn create_payment(&self, new: NewPayment) -> AppResult<Payment> {
        new.validate_terms()?;
        // custody and fee must fit inside the amount
        AmountSplit::compute(new.amount, new.custody_percent, self.config.platform_fee_bps)?;

        let payment = Payment::from_new(new, Utc::now());
        self.ledger.insert_payment(&payment).await?;
        self.ledger
            .record_event(
                payment.id,
                EventType::PaymentCreated,
                format!("Payment created for {} {}", payment.amount, payment.currency),
            )
            .await?;

        info!("📝 Payment {} created ({:?})", payment.id, payment.payment_type);
        Ok(payment)
    }

    pub async fn status(&self, payment_id: Uuid) -> AppResult<PaymentView> {
        let payment = self.load(payment_id).await?;
        let escrow = self.ledger.get_escrow_by_payment(payment_id).await?;
        Ok(PaymentView { payment, escrow })
    }

    pub async fn events(&self, payment_id: Uuid) -> AppResult<Vec<PaymentEvent>> {
        self.load(payment_id).await?;
        self.ledger.list_events(payment_id).await
    }

    // ========== DRIVER ==========

    /// Idempotent: pushes the payment one step further when that step is due.
    pub async fn advance(&self, payment_id: Uuid) -> AppResult<Payment> {
        self.advance_at(payment_id, Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn advance_at(&self, payment_id: Uuid, now: DateTime<Utc>) -> AppResult<Payment> {
        let payment = self.load(payment_id).await?;

        match payment.status {
            PaymentStatus::Processing => {
                let stale_before = now - self.config.processing_lease();
                if self
                    .ledger
                    .renew_processing_lease(payment_id, stale_before)
                    .await?
                {
                    info!("🔁 Re-taking stale funding claim for {}", payment_id);
                    self.fund(payment_id).await?;
                } else {
                    debug!("Funding of {} is held by a live claim", payment_id);
                }
            }
            PaymentStatus::Funded => {
                let escrow = self.escrow_for(payment_id).await?;
                if escrow.status == EscrowStatus::Released {
                    // a previous release stopped after claiming the escrow
                    self.release_custody(payment_id).await?;
                } else if escrow.status == EscrowStatus::Active
                    && Self::release_due(&payment, &escrow, now)
                    && self
                        .ledger
                        .transition_escrow(escrow.id, EscrowStatus::Active, EscrowStatus::Released)
                        .await?
                {
                    self.release_custody(payment_id).await?;
                }
            }
            PaymentStatus::Released => self.payout_custody(payment_id).await?,
            _ => {}
        }

        self.load(payment_id).await
    }

    fn release_due(payment: &Payment, escrow: &Escrow, now: DateTime<Utc>) -> bool {
        match payment.payment_type {
            PaymentType::Standard => escrow.custody_due(now),
            PaymentType::DualApproval => payment.both_approved(),
        }
    }

    // ========== FUNDING ==========

    /// Caller holds the `processing` claim.
    #[instrument(skip(self))]
    pub async fn fund(&self, payment_id: Uuid) -> AppResult<()> {
        let payment = self.load(payment_id).await?;
        if payment.status != PaymentStatus::Processing {
            return Err(AppError::InvalidTransition {
                current: payment.status.to_string(),
                expected: PaymentStatus::Processing.to_string(),
            });
        }

        match self.try_fund(&payment).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_permanent() => {
                error!("❌ Funding of {} failed permanently: {}", payment_id, e);
                if self
                    .ledger
                    .transition_payment(payment_id, PaymentStatus::Processing, PaymentStatus::Failed)
                    .await?
                {
                    self.ledger
                        .record_event(payment_id, EventType::Failed, e.kind())
                        .await?;
                    self.refund_orphaned_custody(payment_id).await;
                }
                Err(e)
            }
            Err(e) => {
                warn!("⚠️  Funding of {} failed: {}", payment_id, e);
                self.note(payment_id, EventType::FundingError, format!("Funding failed: {}", e.kind()))
                    .await;
                Err(e)
            }
        }
    }

    async fn try_fund(&self, payment: &Payment) -> AppResult<()> {
        let mut escrow = match self.ledger.get_escrow_by_payment(payment.id).await? {
            Some(existing) => existing,
            None => {
                let escrow = Escrow::for_payment(payment, self.config.platform_fee_bps, Utc::now())?;
                self.ledger.insert_escrow(&escrow).await?
            }
        };

        if escrow.onchain_escrow_id.is_none() {
            let receipt = self
                .escrow
                .create_custody(&CustodyRequest {
                    payment_id: payment.id,
                    payer: payment.payer_id.clone(),
                    payee: payment.payee_id.clone(),
                    amount: escrow.custody_amount,
                    currency: payment.currency.clone(),
                    deadline: escrow.custody_end,
                })
                .await?;
            self.ledger
                .record_custody_created(escrow.id, &receipt.escrow_id, &receipt.tx_hash)
                .await?;
            self.ledger
                .record_event(
                    payment.id,
                    EventType::EscrowCreated,
                    format!(
                        "Custody {} holds {} until {}",
                        receipt.escrow_id, escrow.custody_amount, escrow.custody_end
                    ),
                )
                .await?;
            escrow.onchain_escrow_id = Some(receipt.escrow_id);
        }

        if escrow.release_amount > Decimal::ZERO {
            self.payout
                .settle(payment, SettlementPurpose::Upfront, escrow.release_amount)
                .await?;
        }
        if escrow.fee_amount > Decimal::ZERO
            && payment.destination_for(SettlementPurpose::Commission).is_some()
        {
            self.payout
                .settle(payment, SettlementPurpose::Commission, escrow.fee_amount)
                .await?;
        }

        if !self
            .ledger
            .transition_payment(payment.id, PaymentStatus::Processing, PaymentStatus::Funded)
            .await?
        {
            return Err(AppError::ConcurrencyConflict(format!(
                "payment {} left processing while funding",
                payment.id
            )));
        }

        self.ledger
            .record_event(
                payment.id,
                EventType::Funded,
                format!(
                    "Funded: {} in custody, {} released, {} fee",
                    escrow.custody_amount, escrow.release_amount, escrow.fee_amount
                ),
            )
            .await?;
        info!("✅ Payment {} funded", payment.id);
        Ok(())
    }

    /// A failed payment must not leave custody locked on-chain.
    async fn refund_orphaned_custody(&self, payment_id: Uuid) {
        let escrow = match self.ledger.get_escrow_by_payment(payment_id).await {
            Ok(Some(escrow)) => escrow,
            Ok(None) => return,
            Err(e) => {
                error!("❌ Could not load escrow of failed payment {}: {:?}", payment_id, e);
                return;
            }
        };
        let Some(onchain_id) = escrow.onchain_escrow_id.as_deref() else {
            return;
        };

        match self
            .ledger
            .transition_escrow(escrow.id, EscrowStatus::Active, EscrowStatus::Cancelled)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!("❌ Could not claim escrow {}: {:?}", escrow.id, e);
                return;
            }
        }

        match self.escrow.cancel_custody(onchain_id).await {
            Ok(tx_hash) => info!("↩️  Custody {} refunded (tx: {})", onchain_id, tx_hash),
            Err(e) => {
                error!("❌ Custody refund failed for {}: {}", payment_id, e.summary());
                self.note(
                    payment_id,
                    EventType::ReleaseError,
                    format!("Custody refund failed: {}", e.summary()),
                )
                .await;
            }
        }
    }

    // ========== RELEASE & PAYOUT ==========

    /// Caller holds the escrow claim (`active -> released`).
    #[instrument(skip(self))]
    pub async fn release_custody(&self, payment_id: Uuid) -> AppResult<()> {
        let payment = self.load(payment_id).await?;
        let escrow = self.escrow_for(payment_id).await?;

        if !self
            .ledger
            .transition_payment(payment_id, PaymentStatus::Funded, PaymentStatus::Released)
            .await?
        {
            debug!("Release of {} already claimed", payment_id);
            let current = self.load(payment_id).await?;
            // the escrow claim is ours; give it back unless the payment moved on
            if !matches!(current.status, PaymentStatus::Released | PaymentStatus::Paid) {
                self.ledger
                    .transition_escrow(escrow.id, EscrowStatus::Released, EscrowStatus::Active)
                    .await?;
            }
            return Err(AppError::ConcurrencyConflict(format!(
                "release of payment {} claimed elsewhere (now {})",
                payment_id, current.status
            )));
        }

        if let Err(e) = self.try_release(&payment, &escrow).await {
            error!("❌ Custody release failed for {}: {}", payment_id, e);
            if let Err(revert) = self
                .ledger
                .transition_payment(payment_id, PaymentStatus::Released, PaymentStatus::Funded)
                .await
            {
                error!("❌ Could not revert release claim for {}: {:?}", payment_id, revert);
            }
            self.note(payment_id, EventType::ReleaseError, format!("Custody release failed: {}", e.kind()))
                .await;
            return Err(e);
        }

        self.ledger
            .record_event(
                payment_id,
                EventType::CustodyReleased,
                format!("Custody of {} released and redeemed", escrow.custody_amount),
            )
            .await?;
        info!("🔓 Custody released for {}", payment_id);

        self.payout_custody(payment_id).await
    }

    async fn try_release(&self, payment: &Payment, escrow: &Escrow) -> AppResult<()> {
        if let Err(e) = self.release_onchain(escrow).await {
            // nothing moved on-chain, hand the escrow back to the monitors
            self.ledger
                .transition_escrow(escrow.id, EscrowStatus::Released, EscrowStatus::Active)
                .await?;
            return Err(e);
        }

        self.payout
            .redeem(payment, SettlementPurpose::Custody, escrow.custody_amount)
            .await?;
        Ok(())
    }

    async fn release_onchain(&self, escrow: &Escrow) -> AppResult<()> {
        if escrow.release_tx_hash.is_some() {
            return Ok(());
        }
        let onchain_id = escrow.onchain_escrow_id.as_deref().ok_or_else(|| {
            AppError::Internal(format!("escrow {} has no on-chain custody", escrow.id))
        })?;

        let tx_hash = self.escrow.release_custody(onchain_id).await?;
        self.ledger.record_release_tx(escrow.id, &tx_hash).await?;
        info!("🔐 On-chain custody {} released (tx: {})", onchain_id, tx_hash);
        Ok(())
    }

    /// Pays the custodied share; a failure leaves the payment `released`.
    #[instrument(skip(self))]
    pub async fn payout_custody(&self, payment_id: Uuid) -> AppResult<()> {
        let payment = self.load(payment_id).await?;
        if payment.status != PaymentStatus::Released {
            return Err(AppError::InvalidTransition {
                current: payment.status.to_string(),
                expected: PaymentStatus::Released.to_string(),
            });
        }
        let escrow = self.escrow_for(payment_id).await?;

        self.release_onchain(&escrow).await?;
        self.payout
            .settle(&payment, SettlementPurpose::Custody, escrow.custody_amount)
            .await?;

        if !self
            .ledger
            .transition_payment(payment_id, PaymentStatus::Released, PaymentStatus::Paid)
            .await?
        {
            return Err(AppError::ConcurrencyConflict(format!(
                "payment {} left released during payout",
                payment_id
            )));
        }
        self.ledger
            .record_event(
                payment_id,
                EventType::PayoutCompleted,
                format!("Paid {} {} to payee", escrow.custody_amount, payment.currency),
            )
            .await?;
        info!("🎉 Payment {} paid out", payment_id);
        Ok(())
    }

    // ========== DISPUTES ==========

    #[instrument(skip(self, reason))]
    pub async fn raise_dispute(&self, payment_id: Uuid, reason: &str) -> AppResult<()> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::Validation("dispute reason is required".to_string()));
        }

        let payment = self.load(payment_id).await?;
        if !matches!(payment.status, PaymentStatus::Funded | PaymentStatus::Released) {
            return Err(AppError::InvalidTransition {
                current: payment.status.to_string(),
                expected: "funded or released".to_string(),
            });
        }
        let escrow = self.escrow_for(payment_id).await?;

        // from released the custody has left the contract; only the payout is held back
        let (escrow_from, onchain) = if payment.status == PaymentStatus::Funded {
            (EscrowStatus::Active, escrow.onchain_escrow_id.as_deref())
        } else {
            self.ensure_custody_redeemed(payment_id).await?;
            (EscrowStatus::Released, None)
        };

        let claimed = if payment.status == PaymentStatus::Released {
            self.ledger
                .dispute_before_payout(payment_id, payment.status, SettlementPurpose::Custody)
                .await?
        } else {
            self.ledger
                .transition_payment(payment_id, payment.status, PaymentStatus::Disputed)
                .await?
        };
        if !claimed {
            return Err(AppError::ConcurrencyConflict(format!(
                "payment {} changed or custody payout already submitted",
                payment_id
            )));
        }

        if !self
            .ledger
            .transition_escrow(escrow.id, escrow_from, EscrowStatus::Disputed)
            .await?
        {
            self.ledger
                .transition_payment(payment_id, PaymentStatus::Disputed, payment.status)
                .await?;
            return Err(AppError::ConcurrencyConflict(
                "custody release in flight".to_string(),
            ));
        }

        if let Some(onchain_id) = onchain {
            if let Err(e) = self.escrow.raise_dispute(onchain_id, reason).await {
                error!("❌ On-chain dispute failed for {}: {}", payment_id, e.summary());
                self.ledger
                    .transition_escrow(escrow.id, EscrowStatus::Disputed, escrow_from)
                    .await?;
                self.ledger
                    .transition_payment(payment_id, PaymentStatus::Disputed, payment.status)
                    .await?;
                self.note(
                    payment_id,
                    EventType::DisputeError,
                    format!("Dispute could not be raised: {}", e.summary()),
                )
                .await;
                return Err(e.into());
            }
        }

        self.ledger
            .record_dispute(escrow.id, reason, payment.status)
            .await?;
        self.ledger
            .record_event(
                payment_id,
                EventType::DisputeRaised,
                format!("Dispute raised while {}", payment.status),
            )
            .await?;
        warn!("⚖️  Dispute raised on {} (was {})", payment_id, payment.status);
        Ok(())
    }

    /// Only a released payment whose custody is already redeemed can still be
    /// disputed; the payout check happens inside the dispute claim.
    async fn ensure_custody_redeemed(&self, payment_id: Uuid) -> AppResult<()> {
        let redeemed = self
            .ledger
            .find_ledger_txs(payment_id, SettlementPurpose::Custody, LedgerTxKind::Redemption)
            .await?
            .iter()
            .any(|t| t.status == LedgerTxStatus::Succeeded);
        if !redeemed {
            return Err(AppError::InvalidTransition {
                current: "released, redemption unconfirmed".to_string(),
                expected: "released with custody redeemed".to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn resolve_dispute(
        &self,
        payment_id: Uuid,
        resolution: DisputeResolution,
    ) -> AppResult<()> {
        let payment = self.load(payment_id).await?;
        if payment.status != PaymentStatus::Disputed {
            return Err(AppError::InvalidTransition {
                current: payment.status.to_string(),
                expected: PaymentStatus::Disputed.to_string(),
            });
        }
        let escrow = self.escrow_for(payment_id).await?;
        let disputed_from = escrow.disputed_from.unwrap_or(PaymentStatus::Funded);

        match (resolution, disputed_from) {
            (DisputeResolution::ReleaseToPayee, PaymentStatus::Released) => {
                self.claim_resolution(&escrow, EscrowStatus::Released).await?;
                self.ledger
                    .record_dispute_resolution(escrow.id, resolution)
                    .await?;
                self.finish_resolution(
                    payment_id,
                    PaymentStatus::Released,
                    EventType::DisputeResolvedReleased,
                )
                .await?;
                self.payout_custody(payment_id).await
            }
            (DisputeResolution::ReleaseToPayee, _) => {
                self.claim_resolution(&escrow, EscrowStatus::Released).await?;
                if let Some(onchain_id) = escrow.onchain_escrow_id.as_deref() {
                    match self.escrow.resolve_dispute(onchain_id, true).await {
                        Ok(tx_hash) => self.ledger.record_release_tx(escrow.id, &tx_hash).await?,
                        Err(e) => {
                            return Err(self
                                .revert_resolution(&escrow, EscrowStatus::Released, e.into())
                                .await)
                        }
                    }
                }
                self.ledger
                    .record_dispute_resolution(escrow.id, resolution)
                    .await?;
                self.finish_resolution(
                    payment_id,
                    PaymentStatus::Funded,
                    EventType::DisputeResolvedFunded,
                )
                .await?;
                self.release_custody(payment_id).await
            }
            (DisputeResolution::RefundPayer, PaymentStatus::Released) => Err(AppError::Validation(
                "custody is already redeemed; a refund needs manual handling".to_string(),
            )),
            (DisputeResolution::RefundPayer, _) => {
                self.claim_resolution(&escrow, EscrowStatus::Cancelled).await?;
                if let Some(onchain_id) = escrow.onchain_escrow_id.as_deref() {
                    if let Err(e) = self.escrow.resolve_dispute(onchain_id, false).await {
                        return Err(self
                            .revert_resolution(&escrow, EscrowStatus::Cancelled, e.into())
                            .await);
                    }
                }
                self.ledger
                    .record_dispute_resolution(escrow.id, resolution)
                    .await?;
                self.finish_resolution(
                    payment_id,
                    PaymentStatus::Cancelled,
                    EventType::DisputeRefunded,
                )
                .await
            }
        }
    }

    async fn claim_resolution(&self, escrow: &Escrow, to: EscrowStatus) -> AppResult<()> {
        if !self
            .ledger
            .transition_escrow(escrow.id, EscrowStatus::Disputed, to)
            .await?
        {
            return Err(AppError::ConcurrencyConflict(
                "dispute is already being resolved".to_string(),
            ));
        }
        Ok(())
    }

    async fn revert_resolution(&self, escrow: &Escrow, claimed: EscrowStatus, e: AppError) -> AppError {
        error!("❌ Dispute resolution failed for {}: {}", escrow.payment_id, e);
        if let Err(revert) = self
            .ledger
            .transition_escrow(escrow.id, claimed, EscrowStatus::Disputed)
            .await
        {
            error!("❌ Could not revert escrow {}: {:?}", escrow.id, revert);
        }
        self.note(
            escrow.payment_id,
            EventType::DisputeError,
            format!("Dispute resolution failed: {}", e.kind()),
        )
        .await;
        e
    }

    async fn finish_resolution(
        &self,
        payment_id: Uuid,
        to: PaymentStatus,
        event_type: EventType,
    ) -> AppResult<()> {
        if !self
            .ledger
            .transition_payment(payment_id, PaymentStatus::Disputed, to)
            .await?
        {
            return Err(AppError::ConcurrencyConflict(format!(
                "payment {} left disputed during resolution",
                payment_id
            )));
        }
        self.ledger
            .record_event(payment_id, event_type, format!("Dispute resolved, payment {}", to))
            .await?;
        info!("⚖️  Dispute on {} resolved -> {}", payment_id, to);
        Ok(())
    }

    // ========== CANCELLATION ==========

    /// Pending payments cancel outright. Funded payments refund the custody
    /// on-chain; an upfront share already paid out stays paid.
    #[instrument(skip(self))]
    pub async fn cancel(&self, payment_id: Uuid) -> AppResult<()> {
        let payment = self.load(payment_id).await?;

        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Funded => {
                let escrow = self.escrow_for(payment_id).await?;
                if !self
                    .ledger
                    .transition_escrow(escrow.id, EscrowStatus::Active, EscrowStatus::Cancelled)
                    .await?
                {
                    return Err(AppError::ConcurrencyConflict(
                        "custody release in flight".to_string(),
                    ));
                }

                if let Some(onchain_id) = escrow.onchain_escrow_id.as_deref() {
                    if let Err(e) = self.escrow.cancel_custody(onchain_id).await {
                        error!("❌ Custody refund failed for {}: {}", payment_id, e.summary());
                        self.ledger
                            .transition_escrow(escrow.id, EscrowStatus::Cancelled, EscrowStatus::Active)
                            .await?;
                        self.note(
                            payment_id,
                            EventType::ReleaseError,
                            format!("Custody refund failed: {}", e.summary()),
                        )
                        .await;
                        return Err(e.into());
                    }
                }
            }
            other => {
                return Err(AppError::InvalidTransition {
                    current: other.to_string(),
                    expected: "pending or funded".to_string(),
                })
            }
        }

        if !self
            .ledger
            .transition_payment(payment_id, payment.status, PaymentStatus::Cancelled)
            .await?
        {
            return Err(AppError::ConcurrencyConflict(format!(
                "payment {} changed while cancelling",
                payment_id
            )));
        }
        self.ledger
            .record_event(
                payment_id,
                EventType::Cancelled,
                format!("Cancelled while {}", payment.status),
            )
            .await?;
        info!("🚫 Payment {} cancelled", payment_id);
        Ok(())
    }

    // ========== HELPERS ==========

    async fn load(&self, payment_id: Uuid) -> AppResult<Payment> {
        self.ledger
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))
    }

    async fn escrow_for(&self, payment_id: Uuid) -> AppResult<Escrow> {
        self.ledger
            .get_escrow_by_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("escrow for payment {}", payment_id)))
    }

    /// Error events are best-effort; the failure itself is returned to the caller.
    async fn note(&self, payment_id: Uuid, event_type: EventType, description: String) {
        if let Err(e) = self.ledger.record_event(payment_id, event_type, description).await {
            error!("❌ Failed to append {:?} for {}: {:?}", event_type, payment_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sandbox::{CallCounters, EscrowBehavior, RailBehavior};
    use crate::adapters::traits::OnchainCustodyState;
    use crate::error::RailError;
    use crate::orchestrator::testing::{new_payment, Harness};
    use rust_decimal_macros::dec;

    fn onchain_id(payment_id: Uuid) -> String {
        format!("esc-{}", payment_id.simple())
    }

    #[tokio::test]
    async fn standard_payment_pays_upfront_then_custody() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        assert_eq!(payment.status, PaymentStatus::Funded);
        assert_eq!(h.rail.payouts().len(), 1);
        assert_eq!(h.rail.payouts()[0].amount, dec!(800));

        let payment = h.orchestrator.advance(payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);

        let amounts: Vec<_> = h.rail.payouts().iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![dec!(800), dec!(200)]);
        assert_eq!(
            h.escrow.state_of(&onchain_id(payment.id)),
            Some(OnchainCustodyState::Released)
        );
        h.assert_replay_consistent(payment.id).await;
    }

    #[tokio::test]
    async fn advance_on_paid_is_silent() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.orchestrator.advance(payment.id).await.unwrap();

        let events_before = h.event_types(payment.id).await.len();
        let calls_before = h.external_calls();

        let payment = h.orchestrator.advance(payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(h.event_types(payment.id).await.len(), events_before);
        assert_eq!(h.external_calls(), calls_before);
    }

    #[tokio::test]
    async fn redemption_network_failure_keeps_payment_funded() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.rail.set_behavior(RailBehavior {
            redemption_failure: Some(RailError::Network("timeout".into())),
            ..Default::default()
        });

        let err = h.orchestrator.advance(payment.id).await.unwrap_err();
        assert!(matches!(err, AppError::ExternalCall(_)));

        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Funded);
        assert_eq!(h.rail.payouts().len(), 1);
        assert_eq!(h.count_events(payment.id, EventType::RedemptionFailed).await, 1);
        assert_eq!(h.count_events(payment.id, EventType::ReleaseError).await, 1);

        // the on-chain release stays recorded; the retry only redeems
        h.rail.set_behavior(RailBehavior::default());
        let payment = h.orchestrator.advance(payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(CallCounters::get(&h.escrow.calls.custody_released), 1);
        h.assert_replay_consistent(payment.id).await;
    }

    #[tokio::test]
    async fn unconfirmed_redemption_times_out_without_payout() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.rail.set_behavior(RailBehavior {
            confirm_after_polls: None,
            ..Default::default()
        });

        let err = h.orchestrator.advance(payment.id).await.unwrap_err();
        assert!(matches!(err, AppError::ConfirmationTimeout(_)));
        assert_eq!(h.count_events(payment.id, EventType::RedemptionTimeout).await, 1);
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Funded);
        assert_eq!(h.rail.payouts().len(), 1);
    }

    #[tokio::test]
    async fn failed_onchain_release_hands_escrow_back() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.escrow.set_behavior(EscrowBehavior {
            release_failure: Some(RailError::Rejected {
                status: 503,
                message: "relayer busy".into(),
            }),
            ..Default::default()
        });

        assert!(h.orchestrator.advance(payment.id).await.is_err());
        let escrow = h.ledger.get_escrow_by_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Active);
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Funded);
        assert_eq!(CallCounters::get(&h.rail.calls.redemptions), 1);
    }

    #[tokio::test]
    async fn custody_waits_for_deadline() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 24)).await;

        let calls = h.external_calls();
        let payment = h.orchestrator.advance(payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Funded);
        assert_eq!(h.external_calls(), calls);

        let later = Utc::now() + chrono::Duration::hours(25);
        let payment = h.orchestrator.advance_at(payment.id, later).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn dispute_then_refund_cancels_custody() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 24)).await;

        h.orchestrator.raise_dispute(payment.id, "item never arrived").await.unwrap();
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Disputed);
        assert_eq!(
            h.escrow.state_of(&onchain_id(payment.id)),
            Some(OnchainCustodyState::Disputed)
        );

        h.orchestrator
            .resolve_dispute(payment.id, DisputeResolution::RefundPayer)
            .await
            .unwrap();
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Cancelled);
        assert_eq!(
            h.escrow.state_of(&onchain_id(payment.id)),
            Some(OnchainCustodyState::Refunded)
        );
        assert_eq!(h.rail.payouts().len(), 1);
        h.assert_replay_consistent(payment.id).await;
    }

    #[tokio::test]
    async fn dispute_release_to_payee_pays_custody() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 24)).await;

        h.orchestrator.raise_dispute(payment.id, "late delivery").await.unwrap();
        h.orchestrator
            .resolve_dispute(payment.id, DisputeResolution::ReleaseToPayee)
            .await
            .unwrap();

        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Paid);
        let amounts: Vec<_> = h.rail.payouts().iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![dec!(800), dec!(200)]);
        // resolve released the custody; no second release call
        assert_eq!(CallCounters::get(&h.escrow.calls.custody_released), 0);
        h.assert_replay_consistent(payment.id).await;
    }

    /// Custody released and redeemed, payout rejected by the bank
    async fn released_unpaid(h: &Harness) -> Payment {
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.rail.set_behavior(RailBehavior {
            payout_failure: Some(RailError::Rejected {
                status: 500,
                message: "bank offline".into(),
            }),
            ..Default::default()
        });
        assert!(h.orchestrator.advance(payment.id).await.is_err());
        h.rail.set_behavior(RailBehavior::default());

        let payment = h.payment(payment.id).await;
        assert_eq!(payment.status, PaymentStatus::Released);
        payment
    }

    #[tokio::test]
    async fn dispute_from_released_holds_payout_until_release_to_payee() {
        let h = Harness::new();
        let payment = released_unpaid(&h).await;

        h.orchestrator.raise_dispute(payment.id, "wrong item").await.unwrap();
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Disputed);
        let escrow = h.ledger.get_escrow_by_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Disputed);
        assert_eq!(escrow.disputed_from, Some(PaymentStatus::Released));

        // nothing drives a disputed payment
        h.orchestrator.advance(payment.id).await.unwrap();
        assert_eq!(h.rail.payouts().len(), 1);
        let held = LedgerTransaction::pending(
            payment.id,
            LedgerTxKind::Payout,
            SettlementPurpose::Custody,
            dec!(200),
        );
        assert!(!h.ledger.claim_payout(&held).await.unwrap());

        h.orchestrator
            .resolve_dispute(payment.id, DisputeResolution::ReleaseToPayee)
            .await
            .unwrap();
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Paid);
        let amounts: Vec<_> = h.rail.payouts().iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![dec!(800), dec!(200)]);
        assert_eq!(CallCounters::get(&h.escrow.calls.custody_released), 1);
        h.assert_replay_consistent(payment.id).await;
    }

    #[tokio::test]
    async fn refund_after_redemption_needs_manual_handling() {
        let h = Harness::new();
        let payment = released_unpaid(&h).await;
        h.orchestrator.raise_dispute(payment.id, "wrong item").await.unwrap();

        let err = h
            .orchestrator
            .resolve_dispute(payment.id, DisputeResolution::RefundPayer)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Disputed);
        assert_eq!(CallCounters::get(&h.escrow.calls.cancellations), 0);
    }

    #[tokio::test]
    async fn dispute_after_payout_submitted_is_refused() {
        let h = Harness::new();
        let payment = released_unpaid(&h).await;
        let submitted = LedgerTransaction::pending(
            payment.id,
            LedgerTxKind::Payout,
            SettlementPurpose::Custody,
            dec!(200),
        );
        assert!(h.ledger.claim_payout(&submitted).await.unwrap());

        let err = h.orchestrator.raise_dispute(payment.id, "too late").await.unwrap_err();
        assert!(matches!(err, AppError::ConcurrencyConflict(_)));
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Released);
        let escrow = h.ledger.get_escrow_by_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
        assert_eq!(h.count_events(payment.id, EventType::DisputeRaised).await, 0);
    }

    #[tokio::test]
    async fn lost_release_claim_hands_the_escrow_back() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        let escrow = h.ledger.get_escrow_by_payment(payment.id).await.unwrap().unwrap();
        assert!(h
            .ledger
            .transition_escrow(escrow.id, EscrowStatus::Active, EscrowStatus::Released)
            .await
            .unwrap());
        // the payment moved on between the escrow claim and the payment claim
        assert!(h
            .ledger
            .transition_payment(payment.id, PaymentStatus::Funded, PaymentStatus::Disputed)
            .await
            .unwrap());

        let err = h.orchestrator.release_custody(payment.id).await.unwrap_err();
        assert!(matches!(err, AppError::ConcurrencyConflict(_)));

        let escrow = h.ledger.get_escrow_by_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Active);
        assert_eq!(CallCounters::get(&h.escrow.calls.custody_released), 0);
        assert_eq!(h.count_events(payment.id, EventType::CustodyReleased).await, 0);
    }

    #[tokio::test]
    async fn release_claimed_by_another_worker_keeps_its_escrow() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        let escrow = h.ledger.get_escrow_by_payment(payment.id).await.unwrap().unwrap();
        assert!(h
            .ledger
            .transition_escrow(escrow.id, EscrowStatus::Active, EscrowStatus::Released)
            .await
            .unwrap());
        assert!(h
            .ledger
            .transition_payment(payment.id, PaymentStatus::Funded, PaymentStatus::Released)
            .await
            .unwrap());

        let err = h.orchestrator.release_custody(payment.id).await.unwrap_err();
        assert!(matches!(err, AppError::ConcurrencyConflict(_)));
        let escrow = h.ledger.get_escrow_by_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(escrow.status, EscrowStatus::Released);
    }

    #[tokio::test]
    async fn commission_is_paid_to_the_beneficiary_on_funding() {
        let h = Harness::with_lifecycle(LifecycleConfig {
            platform_fee_bps: 250,
            ..Default::default()
        });
        let mut new = new_payment(PaymentType::Standard, 0);
        new.commission_clabe = Some("646180157000000011".into());
        new.commission_holder_name = Some("Plataforma SA".into());
        let payment = h.funded(new).await;

        // 1000 at 20% custody and 2.5% fee
        let sent: Vec<_> = h
            .rail
            .payouts()
            .iter()
            .map(|p| (p.amount, p.clabe.clone(), p.beneficiary.clone()))
            .collect();
        assert_eq!(
            sent,
            vec![
                (dec!(775), "646180157000000004".to_string(), "Ana Lopez".to_string()),
                (dec!(25), "646180157000000011".to_string(), "Plataforma SA".to_string()),
            ]
        );

        let payment = h.orchestrator.advance(payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(h.rail.payouts().len(), 3);
        h.assert_replay_consistent(payment.id).await;
    }

    #[tokio::test]
    async fn fee_without_beneficiary_stays_with_the_platform() {
        let h = Harness::with_lifecycle(LifecycleConfig {
            platform_fee_bps: 250,
            ..Default::default()
        });
        h.funded(new_payment(PaymentType::Standard, 24)).await;

        let amounts: Vec<_> = h.rail.payouts().iter().map(|p| p.amount).collect();
        assert_eq!(amounts, vec![dec!(775)]);
    }

    #[tokio::test]
    async fn dispute_requires_a_reason_and_a_disputable_state() {
        let h = Harness::new();
        let payment = h.orchestrator
            .create_payment(new_payment(PaymentType::Standard, 24))
            .await
            .unwrap();

        assert!(matches!(
            h.orchestrator.raise_dispute(payment.id, "   ").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.orchestrator.raise_dispute(payment.id, "why").await,
            Err(AppError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn cancel_refunds_funded_custody() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 24)).await;

        h.orchestrator.cancel(payment.id).await.unwrap();
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Cancelled);
        assert_eq!(
            h.escrow.state_of(&onchain_id(payment.id)),
            Some(OnchainCustodyState::Refunded)
        );
        h.assert_replay_consistent(payment.id).await;

        // terminal: nothing more happens
        assert!(h.orchestrator.cancel(payment.id).await.is_err());
    }

    #[tokio::test]
    async fn cancel_is_refused_while_release_in_flight() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 24)).await;
        let escrow = h.ledger.get_escrow_by_payment(payment.id).await.unwrap().unwrap();
        assert!(h
            .ledger
            .transition_escrow(escrow.id, EscrowStatus::Active, EscrowStatus::Released)
            .await
            .unwrap());

        let err = h.orchestrator.cancel(payment.id).await.unwrap_err();
        assert!(matches!(err, AppError::ConcurrencyConflict(_)));
        assert_eq!(CallCounters::get(&h.escrow.calls.cancellations), 0);
    }

    #[tokio::test]
    async fn cancel_is_refused_once_funding_or_release_started() {
        let h = Harness::new();
        let processing = h.claimed(new_payment(PaymentType::Standard, 24)).await;
        let released = released_unpaid(&h).await;

        for id in [processing.id, released.id] {
            let err = h.orchestrator.cancel(id).await.unwrap_err();
            assert!(matches!(err, AppError::InvalidTransition { .. }));
        }
        assert_eq!(h.payment(processing.id).await.status, PaymentStatus::Processing);
        assert_eq!(h.payment(released.id).await.status, PaymentStatus::Released);
        assert_eq!(CallCounters::get(&h.escrow.calls.cancellations), 0);
    }

    #[tokio::test]
    async fn pending_payment_cancels_without_external_calls() {
        let h = Harness::new();
        let payment = h.orchestrator
            .create_payment(new_payment(PaymentType::Standard, 24))
            .await
            .unwrap();

        h.orchestrator.cancel(payment.id).await.unwrap();
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Cancelled);
        assert_eq!(h.external_calls(), 0);
        h.assert_replay_consistent(payment.id).await;
    }

    #[tokio::test]
    async fn unsendable_memo_fails_funding_permanently() {
        let h = Harness::new();
        let mut new = new_payment(PaymentType::Standard, 24);
        new.description = Some("***".into());
        let payment = h.claimed(new).await;

        let err = h.orchestrator.fund(payment.id).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Failed);
        assert_eq!(CallCounters::get(&h.rail.calls.redemptions), 0);
        assert_eq!(h.count_events(payment.id, EventType::ValidationFailed).await, 1);
        assert_eq!(
            h.escrow.state_of(&onchain_id(payment.id)),
            Some(OnchainCustodyState::Refunded)
        );
        h.assert_replay_consistent(payment.id).await;
    }

    #[tokio::test]
    async fn fresh_processing_claim_is_left_alone() {
        let h = Harness::new();
        let payment = h.claimed(new_payment(PaymentType::Standard, 24)).await;

        let payment = h.orchestrator.advance(payment.id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Processing);
        assert_eq!(h.external_calls(), 0);

        // past the lease the claim is re-taken and funding completes
        let later = Utc::now() + chrono::Duration::minutes(11);
        let payment = h.orchestrator.advance_at(payment.id, later).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Funded);
    }

    #[tokio::test]
    async fn create_rejects_bad_terms() {
        let h = Harness::new();
        let mut new = new_payment(PaymentType::Standard, 24);
        new.custody_percent = dec!(0);
        assert!(matches!(
            h.orchestrator.create_payment(new).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.orchestrator.advance(Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}
