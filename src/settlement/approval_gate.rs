use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::LedgerStore;
use crate::orchestrator::PaymentOrchestrator;

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    /// This call flipped the party's flag
    pub recorded: bool,
    /// This call won the release claim
    pub released: bool,
    pub payment: Payment,
}

/// Mutual-consent release for dual-approval payments.
///
/// Approvals are one-way: a flag only ever flips from false to true, and the
/// release is triggered by whichever approval completes the pair.
pub struct ApprovalGate {
    ledger: Arc<dyn LedgerStore>,
    orchestrator: Arc<PaymentOrchestrator>,
}

impl ApprovalGate {
    pub fn new(ledger: Arc<dyn LedgerStore>, orchestrator: Arc<PaymentOrchestrator>) -> Self {
        Self {
            ledger,
            orchestrator,
        }
    }

    pub async fn approve(
        &self,
        payment_id: Uuid,
        party: Party,
        actor_id: &str,
        approved: bool,
        tx_hash: Option<String>,
    ) -> AppResult<ApprovalOutcome> {
        let payment = self
            .ledger
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;

        if payment.owner_of(party) != actor_id {
            return Err(AppError::Forbidden(format!(
                "only the {} may approve as {}",
                party, party
            )));
        }
        if payment.payment_type != PaymentType::DualApproval {
            return Err(AppError::Validation(
                "payment does not use dual approval".to_string(),
            ));
        }
        if payment.status != PaymentStatus::Funded {
            return Err(AppError::InvalidTransition {
                current: payment.status.to_string(),
                expected: PaymentStatus::Funded.to_string(),
            });
        }

        if !approved {
            // approvals cannot be withdrawn
            return Ok(ApprovalOutcome {
                recorded: false,
                released: false,
                payment,
            });
        }

        let recorded = self.ledger.set_approval(payment_id, party, tx_hash).await?;
        if recorded {
            let event_type = match party {
                Party::Payer => EventType::PayerApproved,
                Party::Payee => EventType::PayeeApproved,
            };
            self.ledger
                .record_event(payment_id, event_type, format!("Release approved by {}", party))
                .await?;
            info!("✍️  {} approved release of {}", party, payment_id);
        } else {
            debug!("{} already approved {}", party, payment_id);
        }

        let released = self.release_if_agreed(payment_id).await?;
        let payment = self
            .ledger
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("payment {}", payment_id)))?;

        Ok(ApprovalOutcome {
            recorded,
            released,
            payment,
        })
    }

    async fn release_if_agreed(&self, payment_id: Uuid) -> AppResult<bool> {
        let Some(payment) = self.ledger.get_payment(payment_id).await? else {
            return Ok(false);
        };
        if !payment.both_approved() {
            return Ok(false);
        }
        let Some(escrow) = self.ledger.get_escrow_by_payment(payment_id).await? else {
            return Ok(false);
        };

        if !self
            .ledger
            .transition_escrow(escrow.id, EscrowStatus::Active, EscrowStatus::Released)
            .await?
        {
            debug!("Release of {} already triggered", payment_id);
            return Ok(false);
        }

        info!("🤝 Both parties approved {}, releasing custody", payment_id);
        match self.orchestrator.release_custody(payment_id).await {
            Ok(()) => Ok(true),
            Err(AppError::ConcurrencyConflict(reason)) => {
                debug!("Release of {} lost: {}", payment_id, reason);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sandbox::CallCounters;
    use crate::orchestrator::testing::{new_payment, Harness};

    fn gate(h: &Harness) -> Arc<ApprovalGate> {
        Arc::new(ApprovalGate::new(h.ledger.clone(), h.orchestrator.clone()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn simultaneous_approvals_release_exactly_once() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::DualApproval, 0)).await;

        let payer = {
            let g = gate(&h);
            let id = payment.id;
            tokio::spawn(async move { g.approve(id, Party::Payer, "payer-1", true, None).await })
        };
        let payee = {
            let g = gate(&h);
            let id = payment.id;
            tokio::spawn(async move {
                g.approve(id, Party::Payee, "payee-1", true, Some("0xabc".into()))
                    .await
            })
        };
        let payer = payer.await.unwrap().unwrap();
        let payee = payee.await.unwrap().unwrap();

        assert!(payer.recorded && payee.recorded);
        assert_eq!(u8::from(payer.released) + u8::from(payee.released), 1);
        assert_eq!(h.count_events(payment.id, EventType::CustodyReleased).await, 1);
        assert_eq!(CallCounters::get(&h.escrow.calls.custody_released), 1);
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Paid);
        h.assert_replay_consistent(payment.id).await;
    }

    #[tokio::test]
    async fn repeated_approval_is_a_noop() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::DualApproval, 0)).await;
        let g = gate(&h);

        let first = g.approve(payment.id, Party::Payer, "payer-1", true, None).await.unwrap();
        let second = g.approve(payment.id, Party::Payer, "payer-1", true, None).await.unwrap();
        assert!(first.recorded);
        assert!(!second.recorded && !second.released);
        assert_eq!(h.count_events(payment.id, EventType::PayerApproved).await, 1);
        assert_eq!(second.payment.status, PaymentStatus::Funded);
    }

    #[tokio::test]
    async fn approvals_are_not_revocable() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::DualApproval, 0)).await;
        let g = gate(&h);

        g.approve(payment.id, Party::Payee, "payee-1", true, None).await.unwrap();
        let revoke = g.approve(payment.id, Party::Payee, "payee-1", false, None).await.unwrap();
        assert!(!revoke.recorded);
        assert!(h.payment(payment.id).await.payee_approved);
    }

    #[tokio::test]
    async fn only_the_owning_party_may_approve() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::DualApproval, 0)).await;

        let err = gate(&h)
            .approve(payment.id, Party::Payer, "payee-1", true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
        assert!(!h.payment(payment.id).await.payer_approved);
    }

    #[tokio::test]
    async fn standard_payments_reject_approvals() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 24)).await;

        let err = gate(&h)
            .approve(payment.id, Party::Payer, "payer-1", true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
