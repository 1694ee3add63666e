// Custody Monitor - releases escrows whose custody period has ended
//
// Dual-approval payments are never released here; they wait for both parties.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, error, info};

use super::scheduler::PeriodicTask;
use crate::error::{AppError, AppResult};
use crate::ledger::models::*;
use crate::ledger::LedgerStore;
use crate::orchestrator::PaymentOrchestrator;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CustodyReport {
    pub expired: usize,
    pub released: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct CustodyMonitor {
    ledger: Arc<dyn LedgerStore>,
    orchestrator: Arc<PaymentOrchestrator>,
    interval: Duration,
}

impl CustodyMonitor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        orchestrator: Arc<PaymentOrchestrator>,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            orchestrator,
            interval,
        }
    }

    pub async fn scan_at(&self, now: DateTime<Utc>) -> AppResult<CustodyReport> {
        let due = self.ledger.list_due_escrows(now).await?;
        let mut report = CustodyReport {
            expired: due.len(),
            ..Default::default()
        };

        for escrow in due {
            let releasable = match self.ledger.get_payment(escrow.payment_id).await? {
                Some(payment) => {
                    payment.payment_type == PaymentType::Standard
                        && payment.status == PaymentStatus::Funded
                }
                None => false,
            };
            if !releasable {
                report.skipped += 1;
                continue;
            }

            // the escrow claim comes before any on-chain call
            if !self
                .ledger
                .transition_escrow(escrow.id, EscrowStatus::Active, EscrowStatus::Released)
                .await?
            {
                debug!("Escrow {} claimed elsewhere", escrow.id);
                report.skipped += 1;
                continue;
            }

            match self.orchestrator.release_custody(escrow.payment_id).await {
                Ok(()) => report.released += 1,
                Err(AppError::ConcurrencyConflict(reason)) => {
                    debug!("Release of {} lost: {}", escrow.payment_id, reason);
                    report.skipped += 1;
                }
                Err(e) => {
                    error!("❌ Custody release for {} failed: {}", escrow.payment_id, e);
                    report.failed += 1;
                }
            }
        }

        if report.expired > 0 {
            info!(
                "⏳ Custody scan: {} expired, {} released, {} skipped, {} failed",
                report.expired, report.released, report.skipped, report.failed
            );
        }
        Ok(report)
    }
}

#[async_trait]
impl PeriodicTask for CustodyMonitor {
    fn name(&self) -> &'static str {
        "custody-monitor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.scan_at(Utc::now()).await?;
        Ok(())
    }
}
