// Safety Monitor - finds payments stuck mid-lifecycle and re-drives them
//
// Stuck kinds:
// - funding stalled: processing longer than the stuck age since custody was set up
// - release stalled: funded while custody is released or due, past the stuck age
//   since the release became due
// - payout unconfirmed: released longer than the stuck age since redemption
//
// Ages run from stable anchors, never from `updated_at`, which every retry bumps.
// Each case gets one recovery attempt per scan up to the attempt budget,
// then a single operator alert. Alerted cases wait for manual handling.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::scheduler::PeriodicTask;
use crate::adapters::traits::EscrowContract;
use crate::config::SafetyConfig;
use crate::error::AppResult;
use crate::ledger::models::*;
use crate::ledger::LedgerStore;
use crate::notifications::OperatorNotifier;
use crate::orchestrator::PaymentOrchestrator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseOutcome {
    Recovered,
    Failed,
    Alerted,
    AwaitingManual,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckCaseReport {
    pub payment_id: Uuid,
    pub kind: StuckKind,
    pub attempts: i32,
    pub detail: String,
    pub outcome: CaseOutcome,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SafetyReport {
    pub detected: usize,
    pub recovered: usize,
    pub failed: usize,
    pub alerted: usize,
    pub awaiting_manual: usize,
    pub cases: Vec<StuckCaseReport>,
}

struct StuckPayment {
    payment_id: Uuid,
    kind: StuckKind,
    detail: String,
}

pub struct SafetyMonitor {
    ledger: Arc<dyn LedgerStore>,
    orchestrator: Arc<PaymentOrchestrator>,
    escrow: Arc<dyn EscrowContract>,
    notifier: Arc<dyn OperatorNotifier>,
    config: SafetyConfig,
    interval: Duration,
}

impl SafetyMonitor {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        orchestrator: Arc<PaymentOrchestrator>,
        escrow: Arc<dyn EscrowContract>,
        notifier: Arc<dyn OperatorNotifier>,
        config: SafetyConfig,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            orchestrator,
            escrow,
            notifier,
            config,
            interval,
        }
    }

    pub async fn scan_at(&self, now: DateTime<Utc>) -> AppResult<SafetyReport> {
        let stuck = self.detect(now).await?;
        let mut report = SafetyReport {
            detected: stuck.len(),
            ..Default::default()
        };

        for case in stuck {
            let (outcome, attempts) = self.handle(&case, now).await?;
            match outcome {
                CaseOutcome::Recovered => report.recovered += 1,
                CaseOutcome::Failed => report.failed += 1,
                CaseOutcome::Alerted => report.alerted += 1,
                CaseOutcome::AwaitingManual => report.awaiting_manual += 1,
            }
            report.cases.push(StuckCaseReport {
                payment_id: case.payment_id,
                kind: case.kind,
                attempts,
                detail: case.detail,
                outcome,
            });
        }

        if report.detected > 0 {
            info!(
                "🛡️  Safety scan: {} stuck, {} recovered, {} failed, {} alerted, {} awaiting manual",
                report.detected, report.recovered, report.failed, report.alerted, report.awaiting_manual
            );
        }
        if report.detected > report.awaiting_manual || report.alerted > 0 {
            self.send_summary(&report).await;
        }
        Ok(report)
    }

    // ========== DETECTION ==========

    async fn detect(&self, now: DateTime<Utc>) -> AppResult<Vec<StuckPayment>> {
        let cutoff = now - self.config.stuck_age();
        let mut stuck = Vec::new();

        for payment in self.ledger.list_payments_by_status(PaymentStatus::Processing).await? {
            let escrow = self.ledger.get_escrow_by_payment(payment.id).await?;
            let since = escrow.as_ref().map_or(payment.updated_at, |e| e.created_at);
            if since >= cutoff {
                continue;
            }
            let detail = match escrow.and_then(|e| e.onchain_escrow_id) {
                Some(onchain_id) => match self.escrow.custody_state(&onchain_id).await {
                    Ok(state) => format!("custody {} is {:?} on-chain", onchain_id, state),
                    Err(e) => format!("custody {} state unavailable ({})", onchain_id, e.summary()),
                },
                None => "no on-chain custody yet".to_string(),
            };
            stuck.push(StuckPayment {
                payment_id: payment.id,
                kind: StuckKind::FundingStalled,
                detail,
            });
        }

        for payment in self.ledger.list_payments_by_status(PaymentStatus::Funded).await? {
            let Some(escrow) = self.ledger.get_escrow_by_payment(payment.id).await? else {
                continue;
            };
            let detail = match (escrow.status, payment.payment_type) {
                (EscrowStatus::Released, _) => "custody released, payout pending",
                (EscrowStatus::Active, PaymentType::Standard) if escrow.custody_due(now) => {
                    "custody deadline passed"
                }
                (EscrowStatus::Active, PaymentType::DualApproval) if payment.both_approved() => {
                    "both parties approved"
                }
                _ => continue,
            };
            if !Self::release_due_since(&payment, &escrow).is_some_and(|since| since < cutoff) {
                continue;
            }
            stuck.push(StuckPayment {
                payment_id: payment.id,
                kind: StuckKind::ReleaseStalled,
                detail: detail.to_string(),
            });
        }

        for payment in self.ledger.list_payments_by_status(PaymentStatus::Released).await? {
            if self.redeemed_since(&payment).await? >= cutoff {
                continue;
            }
            stuck.push(StuckPayment {
                payment_id: payment.id,
                kind: StuckKind::PayoutUnconfirmed,
                detail: "custody redeemed, payout unconfirmed".to_string(),
            });
        }

        Ok(stuck)
    }

    /// When the custody release became due
    fn release_due_since(payment: &Payment, escrow: &Escrow) -> Option<DateTime<Utc>> {
        if let Some(resolved) = escrow.resolved_at {
            return Some(resolved);
        }
        match payment.payment_type {
            PaymentType::Standard => Some(escrow.custody_end),
            PaymentType::DualApproval if payment.both_approved() => {
                payment.payer_approved_at.max(payment.payee_approved_at)
            }
            PaymentType::DualApproval => None,
        }
    }

    /// When the custodied share was confirmed redeemed (or handed back by a dispute)
    async fn redeemed_since(&self, payment: &Payment) -> AppResult<DateTime<Utc>> {
        let confirmed = self
            .ledger
            .find_ledger_txs(payment.id, SettlementPurpose::Custody, LedgerTxKind::Redemption)
            .await?
            .into_iter()
            .find(|t| t.status == LedgerTxStatus::Succeeded)
            .map(|t| t.updated_at);
        let resolved = self
            .ledger
            .get_escrow_by_payment(payment.id)
            .await?
            .and_then(|e| e.resolved_at);

        Ok(confirmed.max(resolved).unwrap_or(payment.updated_at))
    }

    // ========== RECOVERY ==========

    async fn handle(&self, case: &StuckPayment, now: DateTime<Utc>) -> AppResult<(CaseOutcome, i32)> {
        let max = i32::try_from(self.config.max_recovery_attempts).unwrap_or(i32::MAX);

        if let Some(existing) = self.ledger.get_recovery_case(case.payment_id, case.kind).await? {
            if existing.is_open() && existing.alerted_at.is_some() {
                return Ok((CaseOutcome::AwaitingManual, existing.attempts));
            }
            if existing.is_open() && existing.attempts >= max {
                return self.alert(case, existing.attempts, now).await;
            }
        }

        let result = self.orchestrator.advance_at(case.payment_id, now).await;
        let error = result.as_ref().err().map(|e| e.kind());
        let recorded = self
            .ledger
            .record_recovery_attempt(case.payment_id, case.kind, error.clone(), now)
            .await?;

        self.ledger
            .record_event(
                case.payment_id,
                EventType::RecoveryAttempt,
                format!(
                    "Recovery attempt {}/{} for {:?}: {}",
                    recorded.attempts,
                    max,
                    case.kind,
                    error.as_deref().unwrap_or("ok")
                ),
            )
            .await?;

        let status = match result {
            Ok(payment) => payment.status,
            Err(_) => match self.ledger.get_payment(case.payment_id).await? {
                Some(payment) => payment.status,
                None => case.kind.stuck_status(),
            },
        };

        if status != case.kind.stuck_status() {
            self.ledger
                .resolve_recovery_case(case.payment_id, case.kind, now)
                .await?;
            info!("✅ Recovered {} ({:?}), now {}", case.payment_id, case.kind, status);
            return Ok((CaseOutcome::Recovered, recorded.attempts));
        }

        warn!(
            "⚠️  Recovery attempt {}/{} for {} ({:?}) did not unstick it",
            recorded.attempts, max, case.payment_id, case.kind
        );
        if recorded.attempts >= max {
            return self.alert(case, recorded.attempts, now).await;
        }
        Ok((CaseOutcome::Failed, recorded.attempts))
    }

    async fn alert(&self, case: &StuckPayment, attempts: i32, now: DateTime<Utc>) -> AppResult<(CaseOutcome, i32)> {
        if !self
            .ledger
            .mark_alerted(case.payment_id, case.kind, now)
            .await?
        {
            return Ok((CaseOutcome::AwaitingManual, attempts));
        }

        error!(
            "🚨 {} stuck ({:?}) after {} recovery attempts, manual action required",
            case.payment_id, case.kind, attempts
        );
        self.ledger
            .record_event(
                case.payment_id,
                EventType::RecoveryAlert,
                format!(
                    "{:?} unresolved after {} attempts, escalated to operators",
                    case.kind, attempts
                ),
            )
            .await?;
        Ok((CaseOutcome::Alerted, attempts))
    }

    async fn send_summary(&self, report: &SafetyReport) {
        let subject = format!(
            "[escrow] {} stuck payment(s), {} new alert(s)",
            report.detected - report.awaiting_manual,
            report.alerted
        );
        let body = report
            .cases
            .iter()
            .filter(|c| c.outcome != CaseOutcome::AwaitingManual)
            .map(|c| {
                format!(
                    "{} {:?} attempts={} outcome={:?}: {}",
                    c.payment_id, c.kind, c.attempts, c.outcome, c.detail
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        if let Err(e) = self.notifier.notify(&subject, &body).await {
            error!("❌ Safety summary notification failed: {}", e.kind());
        }
    }
}

#[async_trait]
impl PeriodicTask for SafetyMonitor {
    fn name(&self) -> &'static str {
        "safety-monitor"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        self.scan_at(Utc::now()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sandbox::{CallCounters, RailBehavior};
    use crate::adapters::traits::{Deposit, DepositStatus};
    use crate::error::RailError;
    use crate::notifications::testing::RecordingNotifier;
    use crate::orchestrator::testing::{new_payment, Harness};
    use crate::settlement::DepositPoller;

    fn monitor(h: &Harness, notifier: Arc<RecordingNotifier>) -> SafetyMonitor {
        SafetyMonitor::new(
            h.ledger.clone(),
            h.orchestrator.clone(),
            h.escrow.clone(),
            notifier,
            SafetyConfig {
                stuck_age_secs: 30 * 60,
                max_recovery_attempts: 3,
            },
            Duration::from_secs(1800),
        )
    }

    fn scan_time(k: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(31 * k)
    }

    #[tokio::test]
    async fn persistent_failure_is_retried_then_alerted_once() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.rail.set_behavior(RailBehavior {
            redemption_failure: Some(RailError::Network("bank offline".into())),
            ..Default::default()
        });
        // the first release attempt happens outside the monitor and fails
        assert!(h.orchestrator.advance(payment.id).await.is_err());

        let notifier = Arc::new(RecordingNotifier::default());
        let m = monitor(&h, notifier.clone());

        let mut outcomes = Vec::new();
        for k in 1..=6 {
            let report = m.scan_at(scan_time(k)).await.unwrap();
            assert_eq!(report.detected, 1);
            outcomes.push(report.cases[0].outcome);
        }

        assert_eq!(
            outcomes,
            vec![
                CaseOutcome::Failed,
                CaseOutcome::Failed,
                CaseOutcome::Alerted,
                CaseOutcome::AwaitingManual,
                CaseOutcome::AwaitingManual,
                CaseOutcome::AwaitingManual,
            ]
        );
        assert_eq!(h.count_events(payment.id, EventType::RecoveryAttempt).await, 3);
        assert_eq!(h.count_events(payment.id, EventType::RecoveryAlert).await, 1);
        // one direct attempt plus three recovery attempts after the upfront redemption
        assert_eq!(CallCounters::get(&h.rail.calls.redemptions), 5);
        assert_eq!(notifier.count(), 3);
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Funded);
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_next_scan() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.rail.set_behavior(RailBehavior {
            redemption_failure: Some(RailError::Network("blip".into())),
            ..Default::default()
        });
        assert!(h.orchestrator.advance(payment.id).await.is_err());
        h.rail.set_behavior(RailBehavior::default());

        let notifier = Arc::new(RecordingNotifier::default());
        let report = monitor(&h, notifier.clone()).scan_at(scan_time(1)).await.unwrap();

        assert_eq!((report.detected, report.recovered), (1, 1));
        assert_eq!(report.cases[0].kind, StuckKind::ReleaseStalled);
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Paid);
        let case = h
            .ledger
            .get_recovery_case(payment.id, StuckKind::ReleaseStalled)
            .await
            .unwrap()
            .unwrap();
        assert!(!case.is_open());
        assert_eq!(notifier.count(), 1);
    }

    #[tokio::test]
    async fn stalled_funding_reads_onchain_state() {
        let h = Harness::new();
        let payment = h.claimed(new_payment(PaymentType::Standard, 24)).await;
        h.rail.set_behavior(RailBehavior {
            redemption_failure: Some(RailError::Network("bank offline".into())),
            ..Default::default()
        });
        // custody exists on-chain, the upfront payout did not go through
        assert!(h.orchestrator.fund(payment.id).await.is_err());
        h.rail.set_behavior(RailBehavior::default());

        let notifier = Arc::new(RecordingNotifier::default());
        let report = monitor(&h, notifier).scan_at(scan_time(1)).await.unwrap();

        assert_eq!(report.cases[0].kind, StuckKind::FundingStalled);
        assert!(report.cases[0].detail.contains("Active"));
        assert_eq!(report.cases[0].outcome, CaseOutcome::Recovered);
        assert_eq!(CallCounters::get(&h.escrow.calls.state_reads), 1);
        assert_eq!(CallCounters::get(&h.escrow.calls.custody_created), 1);
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Funded);
    }

    fn bank_offline() -> RailBehavior {
        RailBehavior {
            redemption_failure: Some(RailError::Network("bank offline".into())),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn custody_funded_by_a_failing_deposit_is_escalated() {
        let h = Harness::new();
        let payment = h
            .orchestrator
            .create_payment(new_payment(PaymentType::Standard, 24))
            .await
            .unwrap();
        h.rail.push_deposit(Deposit {
            id: "fid-1".into(),
            amount: payment.amount,
            receiver_clabe: payment.deposit_clabe.clone(),
            sender_name: None,
            status: DepositStatus::Complete,
            received_at: Some(Utc::now()),
        });
        h.rail.set_behavior(bank_offline());

        let poller = DepositPoller::new(
            h.rail.clone(),
            h.ledger.clone(),
            h.orchestrator.clone(),
            Duration::from_secs(60),
        );
        for _ in 0..5 {
            poller.poll_once().await.unwrap();
        }

        let notifier = Arc::new(RecordingNotifier::default());
        let m = monitor(&h, notifier.clone());
        let start = Utc::now();
        let mut outcomes = Vec::new();
        for k in 1..=6 {
            let report = m.scan_at(start + chrono::Duration::minutes(40 * k)).await.unwrap();
            assert_eq!(report.detected, 1);
            assert_eq!(report.cases[0].kind, StuckKind::FundingStalled);
            outcomes.push(report.cases[0].outcome);
        }

        assert_eq!(
            outcomes,
            vec![
                CaseOutcome::Failed,
                CaseOutcome::Failed,
                CaseOutcome::Alerted,
                CaseOutcome::AwaitingManual,
                CaseOutcome::AwaitingManual,
                CaseOutcome::AwaitingManual,
            ]
        );
        assert_eq!(CallCounters::get(&h.escrow.calls.custody_created), 1);
        assert_eq!(h.count_events(payment.id, EventType::RecoveryAlert).await, 1);
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Processing);
    }

    #[tokio::test]
    async fn retried_release_still_ages_from_the_deadline() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.ledger
            .set_custody_end(payment.id, Utc::now() - chrono::Duration::hours(2))
            .await;
        h.rail.set_behavior(bank_offline());
        // every retry moves updated_at forward
        for _ in 0..3 {
            assert!(h.orchestrator.advance(payment.id).await.is_err());
        }

        let notifier = Arc::new(RecordingNotifier::default());
        let report = monitor(&h, notifier).scan_at(Utc::now()).await.unwrap();

        assert_eq!(report.detected, 1);
        assert_eq!(report.cases[0].kind, StuckKind::ReleaseStalled);
        assert_eq!(report.cases[0].outcome, CaseOutcome::Failed);
    }

    #[tokio::test]
    async fn unconfirmed_payout_ages_from_the_redemption() {
        let h = Harness::new();
        let payment = h.funded(new_payment(PaymentType::Standard, 0)).await;
        h.rail.set_behavior(RailBehavior {
            payout_failure: Some(RailError::Rejected {
                status: 500,
                message: "bank offline".into(),
            }),
            ..Default::default()
        });
        assert!(h.orchestrator.advance(payment.id).await.is_err());
        assert_eq!(h.payment(payment.id).await.status, PaymentStatus::Released);

        let notifier = Arc::new(RecordingNotifier::default());
        let m = monitor(&h, notifier);
        assert_eq!(m.scan_at(Utc::now()).await.unwrap().detected, 0);

        let report = m.scan_at(scan_time(1)).await.unwrap();
        assert_eq!(report.detected, 1);
        assert_eq!(report.cases[0].kind, StuckKind::PayoutUnconfirmed);
    }

    #[tokio::test]
    async fn healthy_payments_are_not_flagged() {
        let h = Harness::new();
        h.funded(new_payment(PaymentType::Standard, 24)).await;
        h.funded(new_payment(PaymentType::DualApproval, 0)).await;

        let notifier = Arc::new(RecordingNotifier::default());
        let report = monitor(&h, notifier.clone()).scan_at(scan_time(1)).await.unwrap();
        assert_eq!(report.detected, 0);
        assert_eq!(notifier.count(), 0);
    }
}
