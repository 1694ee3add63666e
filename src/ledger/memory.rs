use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::models::*;
use super::LedgerStore;
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct LedgerState {
    payments: HashMap<Uuid, Payment>,
    escrows: HashMap<Uuid, Escrow>,
    escrow_by_payment: HashMap<Uuid, Uuid>,
    events: Vec<PaymentEvent>,
    ledger_txs: Vec<LedgerTransaction>,
    recovery_cases: HashMap<(Uuid, StuckKind), RecoveryCase>,
}

/// In-process ledger used by sandbox mode and the test suite.
///
/// Each operation holds the write lock for its whole read-compare-write, which
/// gives the same conditional-update semantics as the Postgres repository.
pub struct InMemoryLedger {
    state: tokio::sync::RwLock<LedgerState>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::RwLock::new(LedgerState::default()),
        }
    }
}

#[cfg(test)]
impl InMemoryLedger {
    pub async fn set_custody_end(&self, payment_id: Uuid, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if let Some(id) = state.escrow_by_payment.get(&payment_id).copied() {
            if let Some(escrow) = state.escrows.get_mut(&id) {
                escrow.custody_end = at;
            }
        }
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn escrow_mut<'a>(state: &'a mut LedgerState, escrow_id: Uuid) -> AppResult<&'a mut Escrow> {
    state
        .escrows
        .get_mut(&escrow_id)
        .ok_or_else(|| AppError::NotFound(format!("Escrow {} not found", escrow_id)))
}

fn payout_claimed(state: &LedgerState, payment_id: Uuid, purpose: SettlementPurpose) -> bool {
    state.ledger_txs.iter().any(|t| {
        t.payment_id == payment_id
            && t.purpose == purpose
            && t.kind == LedgerTxKind::Payout
            && t.status.is_claimed()
    })
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    // ========== PAYMENT OPERATIONS ==========

    async fn insert_payment(&self, payment: &Payment) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> AppResult<Option<Payment>> {
        let state = self.state.read().await;
        Ok(state.payments.get(&id).cloned())
    }

    async fn list_payments_by_status(&self, status: PaymentStatus) -> AppResult<Vec<Payment>> {
        let state = self.state.read().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        payments.sort_by_key(|p| p.created_at);
        Ok(payments)
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> AppResult<bool> {
        PaymentStatus::validate_transition(from, to)?;

        let mut state = self.state.write().await;
        match state.payments.get_mut(&id) {
            Some(payment) if payment.status == from => {
                payment.status = to;
                payment.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew_processing_lease(&self, id: Uuid, stale_before: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(&id) {
            Some(payment)
                if payment.status == PaymentStatus::Processing
                    && payment.updated_at < stale_before =>
            {
                payment.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_deposit(&self, id: Uuid, deposit_reference: &str) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let already_bound = state
            .payments
            .values()
            .any(|p| p.deposit_reference.as_deref() == Some(deposit_reference));
        if already_bound {
            return Ok(false);
        }

        match state.payments.get_mut(&id) {
            Some(payment) if payment.status == PaymentStatus::Pending => {
                payment.status = PaymentStatus::Processing;
                payment.deposit_reference = Some(deposit_reference.to_string());
                payment.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revert_deposit_claim(&self, id: Uuid) -> AppResult<bool> {
        let mut state = self.state.write().await;
        match state.payments.get_mut(&id) {
            Some(payment) if payment.status == PaymentStatus::Processing => {
                payment.status = PaymentStatus::Pending;
                payment.deposit_reference = None;
                payment.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_approval(&self, id: Uuid, party: Party, tx_hash: Option<String>) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let payment = state
            .payments
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", id)))?;

        let now = Utc::now();
        let flipped = match party {
            Party::Payer if !payment.payer_approved => {
                payment.payer_approved = true;
                payment.payer_approved_at = Some(now);
                payment.payer_approval_tx = tx_hash;
                true
            }
            Party::Payee if !payment.payee_approved => {
                payment.payee_approved = true;
                payment.payee_approved_at = Some(now);
                payment.payee_approval_tx = tx_hash;
                true
            }
            _ => false,
        };
        if flipped {
            payment.updated_at = now;
        }
        Ok(flipped)
    }

    // ========== ESCROW OPERATIONS ==========

    async fn insert_escrow(&self, escrow: &Escrow) -> AppResult<Escrow> {
        let mut state = self.state.write().await;
        if let Some(existing) = state.escrow_by_payment.get(&escrow.payment_id).copied() {
            if let Some(stored) = state.escrows.get(&existing) {
                return Ok(stored.clone());
            }
        }
        state.escrow_by_payment.insert(escrow.payment_id, escrow.id);
        state.escrows.insert(escrow.id, escrow.clone());
        Ok(escrow.clone())
    }

    async fn get_escrow_by_payment(&self, payment_id: Uuid) -> AppResult<Option<Escrow>> {
        let state = self.state.read().await;
        Ok(state
            .escrow_by_payment
            .get(&payment_id)
            .and_then(|id| state.escrows.get(id))
            .cloned())
    }

    async fn record_custody_created(
        &self,
        escrow_id: Uuid,
        onchain_escrow_id: &str,
        tx_hash: &str,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        let escrow = escrow_mut(&mut state, escrow_id)?;
        escrow.onchain_escrow_id = Some(onchain_escrow_id.to_string());
        escrow.create_tx_hash = Some(tx_hash.to_string());
        escrow.updated_at = Utc::now();
        Ok(())
    }

    async fn record_release_tx(&self, escrow_id: Uuid, tx_hash: &str) -> AppResult<()> {
        let mut state = self.state.write().await;
        let escrow = escrow_mut(&mut state, escrow_id)?;
        escrow.release_tx_hash = Some(tx_hash.to_string());
        escrow.updated_at = Utc::now();
        Ok(())
    }

    async fn transition_escrow(
        &self,
        escrow_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
    ) -> AppResult<bool> {
        EscrowStatus::validate_transition(from, to)?;

        let mut state = self.state.write().await;
        match state.escrows.get_mut(&escrow_id) {
            Some(escrow) if escrow.status == from => {
                escrow.status = to;
                escrow.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_dispute(
        &self,
        escrow_id: Uuid,
        reason: &str,
        disputed_from: PaymentStatus,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        let escrow = escrow_mut(&mut state, escrow_id)?;
        let now = Utc::now();
        escrow.dispute_reason = Some(reason.to_string());
        escrow.disputed_from = Some(disputed_from);
        escrow.dispute_raised_at = Some(now);
        escrow.dispute_resolution = None;
        escrow.resolved_at = None;
        escrow.updated_at = now;
        Ok(())
    }

    async fn record_dispute_resolution(
        &self,
        escrow_id: Uuid,
        resolution: DisputeResolution,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        let escrow = escrow_mut(&mut state, escrow_id)?;
        let now = Utc::now();
        escrow.dispute_resolution = Some(resolution);
        escrow.resolved_at = Some(now);
        escrow.updated_at = now;
        Ok(())
    }

    async fn list_due_escrows(&self, now: DateTime<Utc>) -> AppResult<Vec<Escrow>> {
        let state = self.state.read().await;
        let mut due: Vec<Escrow> = state
            .escrows
            .values()
            .filter(|e| e.status == EscrowStatus::Active && e.custody_end <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.custody_end);
        Ok(due)
    }

    // ========== EVENT LOG ==========

    async fn append_event(&self, event: &PaymentEvent) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.events.push(event.clone());
        Ok(())
    }

    async fn list_events(&self, payment_id: Uuid) -> AppResult<Vec<PaymentEvent>> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.payment_id == payment_id)
            .cloned()
            .collect())
    }

    // ========== SETTLEMENT RECORDS ==========

    async fn insert_ledger_tx(&self, tx: &LedgerTransaction) -> AppResult<()> {
        let mut state = self.state.write().await;
        state.ledger_txs.push(tx.clone());
        Ok(())
    }

    async fn claim_payout(&self, tx: &LedgerTransaction) -> AppResult<bool> {
        let mut state = self.state.write().await;
        let held = state
            .payments
            .get(&tx.payment_id)
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", tx.payment_id)))?
            .status
            .holds_payouts();
        if held || payout_claimed(&state, tx.payment_id, tx.purpose) {
            return Ok(false);
        }
        state.ledger_txs.push(tx.clone());
        Ok(true)
    }

    async fn dispute_before_payout(
        &self,
        id: Uuid,
        from: PaymentStatus,
        purpose: SettlementPurpose,
    ) -> AppResult<bool> {
        PaymentStatus::validate_transition(from, PaymentStatus::Disputed)?;

        let mut state = self.state.write().await;
        if payout_claimed(&state, id, purpose) {
            return Ok(false);
        }
        match state.payments.get_mut(&id) {
            Some(payment) if payment.status == from => {
                payment.status = PaymentStatus::Disputed;
                payment.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_ledger_tx(&self, id: Uuid, update: LedgerTxUpdate) -> AppResult<()> {
        let mut state = self.state.write().await;
        let tx = state
            .ledger_txs
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Ledger transaction {} not found", id)))?;

        if let Some(status) = update.status {
            tx.status = status;
        }
        if let Some(external_ref) = update.external_ref {
            tx.external_ref = Some(external_ref);
        }
        if let Some(tx_hash) = update.tx_hash {
            tx.tx_hash = Some(tx_hash);
        }
        tx.updated_at = Utc::now();
        Ok(())
    }

    async fn find_ledger_txs(
        &self,
        payment_id: Uuid,
        purpose: SettlementPurpose,
        kind: LedgerTxKind,
    ) -> AppResult<Vec<LedgerTransaction>> {
        let state = self.state.read().await;
        Ok(state
            .ledger_txs
            .iter()
            .filter(|t| t.payment_id == payment_id && t.purpose == purpose && t.kind == kind)
            .cloned()
            .collect())
    }

    // ========== RECOVERY CASES ==========

    async fn get_recovery_case(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
    ) -> AppResult<Option<RecoveryCase>> {
        let state = self.state.read().await;
        Ok(state.recovery_cases.get(&(payment_id, kind)).cloned())
    }

    async fn record_recovery_attempt(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<RecoveryCase> {
        let mut state = self.state.write().await;
        let case = state
            .recovery_cases
            .entry((payment_id, kind))
            .or_insert_with(|| RecoveryCase {
                payment_id,
                kind,
                attempts: 0,
                last_error: None,
                last_attempt_at: None,
                alerted_at: None,
                resolved_at: None,
                created_at: at,
            });

        if case.resolved_at.is_some() {
            case.attempts = 0;
            case.alerted_at = None;
            case.resolved_at = None;
        }
        case.attempts += 1;
        case.last_error = error;
        case.last_attempt_at = Some(at);
        Ok(case.clone())
    }

    async fn mark_alerted(&self, payment_id: Uuid, kind: StuckKind, at: DateTime<Utc>) -> AppResult<bool> {
        let mut state = self.state.write().await;
        match state.recovery_cases.get_mut(&(payment_id, kind)) {
            Some(case) if case.alerted_at.is_none() => {
                case.alerted_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn resolve_recovery_case(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(case) = state.recovery_cases.get_mut(&(payment_id, kind)) {
            case.resolved_at = Some(at);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn sample_payment() -> Payment {
        Payment::from_new(
            NewPayment {
                amount: dec!(1000),
                currency: "MXN".to_string(),
                payer_id: "payer-1".to_string(),
                payee_id: "payee-1".to_string(),
                payout_clabe: "646180157000000004".to_string(),
                payout_holder_name: "Ana Lopez".to_string(),
                deposit_clabe: "710969000000000001".to_string(),
                commission_clabe: None,
                commission_holder_name: None,
                description: Some("Laptop".to_string()),
                payment_type: PaymentType::Standard,
                custody_percent: dec!(20),
                custody_period_hours: 24,
            },
            Utc::now(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deposit_claims_have_one_winner() {
        let ledger = Arc::new(InMemoryLedger::new());
        let payment = sample_payment();
        ledger.insert_payment(&payment).await.unwrap();

        let payment_id = payment.id;
        let claims = (0..16).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.claim_deposit(payment_id, "fid-1").await.unwrap() })
        });
        let results: Vec<bool> = join_all(claims)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|won| **won).count(), 1);
        let stored = ledger.get_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Processing);
        assert_eq!(stored.deposit_reference.as_deref(), Some("fid-1"));
    }

    #[tokio::test]
    async fn one_deposit_cannot_fund_two_payments() {
        let ledger = InMemoryLedger::new();
        let first = sample_payment();
        let second = sample_payment();
        ledger.insert_payment(&first).await.unwrap();
        ledger.insert_payment(&second).await.unwrap();

        assert!(ledger.claim_deposit(first.id, "fid-9").await.unwrap());
        assert!(!ledger.claim_deposit(second.id, "fid-9").await.unwrap());
    }

    #[tokio::test]
    async fn transition_rejects_invalid_edges_and_stale_expectations() {
        let ledger = InMemoryLedger::new();
        let payment = sample_payment();
        ledger.insert_payment(&payment).await.unwrap();

        assert!(ledger
            .transition_payment(payment.id, PaymentStatus::Pending, PaymentStatus::Paid)
            .await
            .is_err());
        assert!(!ledger
            .transition_payment(payment.id, PaymentStatus::Funded, PaymentStatus::Released)
            .await
            .unwrap());
        assert!(ledger
            .transition_payment(payment.id, PaymentStatus::Pending, PaymentStatus::Cancelled)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn payout_claim_is_exclusive_until_failed() {
        let ledger = InMemoryLedger::new();
        let payment = sample_payment();
        ledger.insert_payment(&payment).await.unwrap();
        let payment_id = payment.id;
        let first = LedgerTransaction::pending(
            payment_id,
            LedgerTxKind::Payout,
            SettlementPurpose::Custody,
            dec!(200),
        );
        let second = LedgerTransaction::pending(
            payment_id,
            LedgerTxKind::Payout,
            SettlementPurpose::Custody,
            dec!(200),
        );

        assert!(ledger.claim_payout(&first).await.unwrap());
        assert!(!ledger.claim_payout(&second).await.unwrap());

        ledger
            .update_ledger_tx(
                first.id,
                LedgerTxUpdate {
                    status: Some(LedgerTxStatus::Failed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(ledger.claim_payout(&second).await.unwrap());
    }

    #[tokio::test]
    async fn approval_flag_flips_once() {
        let ledger = InMemoryLedger::new();
        let mut payment = sample_payment();
        payment.updated_at = Utc::now() - chrono::Duration::hours(1);
        ledger.insert_payment(&payment).await.unwrap();

        assert!(ledger
            .set_approval(payment.id, Party::Payer, Some("0xabc".into()))
            .await
            .unwrap());
        let approved = ledger.get_payment(payment.id).await.unwrap().unwrap();
        assert!(approved.updated_at > payment.updated_at);
        assert_eq!(approved.payer_approved_at, Some(approved.updated_at));

        assert!(!ledger.set_approval(payment.id, Party::Payer, None).await.unwrap());

        let stored = ledger.get_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.payer_approval_tx.as_deref(), Some("0xabc"));
        assert_eq!(stored.updated_at, approved.updated_at);
        assert!(!stored.payee_approved);
    }

    async fn released_payment(ledger: &InMemoryLedger) -> Payment {
        let payment = sample_payment();
        ledger.insert_payment(&payment).await.unwrap();
        ledger.claim_deposit(payment.id, &payment.id.to_string()).await.unwrap();
        for (from, to) in [
            (PaymentStatus::Processing, PaymentStatus::Funded),
            (PaymentStatus::Funded, PaymentStatus::Released),
        ] {
            assert!(ledger.transition_payment(payment.id, from, to).await.unwrap());
        }
        payment
    }

    fn custody_payout(payment_id: Uuid) -> LedgerTransaction {
        LedgerTransaction::pending(
            payment_id,
            LedgerTxKind::Payout,
            SettlementPurpose::Custody,
            dec!(200),
        )
    }

    #[tokio::test]
    async fn disputed_payment_refuses_payout_claims() {
        let ledger = InMemoryLedger::new();
        let payment = released_payment(&ledger).await;

        assert!(ledger
            .dispute_before_payout(payment.id, PaymentStatus::Released, SettlementPurpose::Custody)
            .await
            .unwrap());
        assert!(!ledger.claim_payout(&custody_payout(payment.id)).await.unwrap());
        assert!(ledger
            .find_ledger_txs(payment.id, SettlementPurpose::Custody, LedgerTxKind::Payout)
            .await
            .unwrap()
            .is_empty());

        let missing = custody_payout(Uuid::new_v4());
        assert!(matches!(
            ledger.claim_payout(&missing).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn claimed_payout_refuses_dispute() {
        let ledger = InMemoryLedger::new();
        let payment = released_payment(&ledger).await;

        assert!(ledger.claim_payout(&custody_payout(payment.id)).await.unwrap());
        assert!(!ledger
            .dispute_before_payout(payment.id, PaymentStatus::Released, SettlementPurpose::Custody)
            .await
            .unwrap());
        let stored = ledger.get_payment(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PaymentStatus::Released);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn payout_claim_and_dispute_race_has_one_winner() {
        for _ in 0..20 {
            let ledger = Arc::new(InMemoryLedger::new());
            let payment = released_payment(&ledger).await;
            let id = payment.id;

            let claim = {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.claim_payout(&custody_payout(id)).await.unwrap() })
            };
            let dispute = {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .dispute_before_payout(id, PaymentStatus::Released, SettlementPurpose::Custody)
                        .await
                        .unwrap()
                })
            };
            let (claimed, disputed) = (claim.await.unwrap(), dispute.await.unwrap());
            assert!(claimed != disputed, "claimed={} disputed={}", claimed, disputed);
        }
    }

    #[tokio::test]
    async fn stale_lease_is_renewed_once() {
        let ledger = InMemoryLedger::new();
        let payment = sample_payment();
        ledger.insert_payment(&payment).await.unwrap();
        ledger.claim_deposit(payment.id, "fid-2").await.unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        assert!(ledger.renew_processing_lease(payment.id, cutoff).await.unwrap());
        // freshly renewed: no longer older than a past cutoff
        let past = Utc::now() - chrono::Duration::minutes(5);
        assert!(!ledger.renew_processing_lease(payment.id, past).await.unwrap());
    }
}
