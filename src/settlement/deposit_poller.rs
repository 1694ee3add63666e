// Deposit Poller - matches incoming bank deposits to pending payments
//
// Flow per cycle:
// 1. Fetch recent deposits from the rail
// 2. Match complete deposits to the oldest pending payment on the same
//    deposit routing id with the same amount
// 3. Claim the payment (pending -> processing, storing the deposit reference)
// 4. Fund it; on failure hand the claim back for the next cycle, unless
//    custody already exists on-chain (the safety monitor re-drives those)

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::scheduler::PeriodicTask;
use crate::adapters::traits::{Deposit, DepositFeed, DepositStatus};
use crate::error::AppResult;
use crate::ledger::models::*;
use crate::ledger::LedgerStore;
use crate::orchestrator::PaymentOrchestrator;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PollReport {
    pub deposits_seen: usize,
    pub matched: usize,
    pub claimed: usize,
    /// Matched, but another poller won the claim
    pub skipped: usize,
    pub failed: usize,
}

pub struct DepositPoller {
    deposits: Arc<dyn DepositFeed>,
    ledger: Arc<dyn LedgerStore>,
    orchestrator: Arc<PaymentOrchestrator>,
    interval: Duration,
}

impl DepositPoller {
    pub fn new(
        deposits: Arc<dyn DepositFeed>,
        ledger: Arc<dyn LedgerStore>,
        orchestrator: Arc<PaymentOrchestrator>,
        interval: Duration,
    ) -> Self {
        Self {
            deposits,
            ledger,
            orchestrator,
            interval,
        }
    }

    pub async fn poll_once(&self) -> AppResult<PollReport> {
        let deposits = self.deposits.recent_deposits().await?;
        let pending = self.ledger.list_payments_by_status(PaymentStatus::Pending).await?;

        let mut report = PollReport {
            deposits_seen: deposits.len(),
            ..Default::default()
        };
        let mut used: HashSet<Uuid> = HashSet::new();

        for deposit in deposits.iter().filter(|d| d.status == DepositStatus::Complete) {
            let Some(payment) = Self::match_deposit(deposit, &pending, &used) else {
                continue;
            };
            used.insert(payment.id);
            report.matched += 1;

            if !self.ledger.claim_deposit(payment.id, &deposit.id).await? {
                debug!("Deposit {} claimed elsewhere", deposit.id);
                report.skipped += 1;
                continue;
            }
            report.claimed += 1;

            if self.fund_claimed(payment.id, deposit).await.is_err() {
                report.failed += 1;
            }
        }

        if report.matched > 0 {
            info!(
                "💰 Deposit poll: {} seen, {} matched, {} claimed, {} skipped, {} failed",
                report.deposits_seen, report.matched, report.claimed, report.skipped, report.failed
            );
        }
        Ok(report)
    }

    fn match_deposit<'a>(
        deposit: &Deposit,
        pending: &'a [Payment],
        used: &HashSet<Uuid>,
    ) -> Option<&'a Payment> {
        pending.iter().find(|p| {
            !used.contains(&p.id)
                && p.deposit_reference.is_none()
                && p.deposit_clabe == deposit.receiver_clabe
                && p.amount == deposit.amount
        })
    }

    async fn fund_claimed(&self, payment_id: Uuid, deposit: &Deposit) -> AppResult<()> {
        self.ledger
            .record_event(
                payment_id,
                EventType::DepositDetected,
                format!("Deposit {} of {} received", deposit.id, deposit.amount),
            )
            .await?;
        info!("📥 Deposit {} matched payment {}", deposit.id, payment_id);

        let Err(e) = self.orchestrator.fund(payment_id).await else {
            return Ok(());
        };

        let custody_onchain = self
            .ledger
            .get_escrow_by_payment(payment_id)
            .await?
            .is_some_and(|escrow| escrow.onchain_escrow_id.is_some());
        if custody_onchain {
            warn!(
                "⚠️  Funding of {} failed after custody was created ({}), keeping the claim",
                payment_id,
                e.kind()
            );
            return Err(e);
        }

        // permanent failures already moved the payment to failed; the revert is then a no-op
        if self.ledger.revert_deposit_claim(payment_id).await? {
            warn!("↩️  Claim on {} reverted after {}", payment_id, e.kind());
            self.ledger
                .record_event(
                    payment_id,
                    EventType::ClaimReverted,
                    format!("Funding failed ({}), deposit released for retry", e.kind()),
                )
                .await?;
        }
        Err(e)
    }
}

#[async_trait]
impl PeriodicTask for DepositPoller {
    fn name(&self) -> &'static str {
        "deposit-poller"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.poll_once().await?;
        Ok(())
    }
}
