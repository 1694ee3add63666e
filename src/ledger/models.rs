use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Payment lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Funded,
    Released,
    Paid,
    Disputed,
    Cancelled,
    Failed,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Funded => "funded",
            PaymentStatus::Released => "released",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Disputed => "disputed",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Paid | PaymentStatus::Cancelled | PaymentStatus::Failed
        )
    }

    /// A payment in one of these statuses must not start a new payout.
    pub fn holds_payouts(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Disputed | PaymentStatus::Cancelled | PaymentStatus::Failed
        )
    }

    /// Valid transitions:
    /// - Pending → Processing (deposit claim), Cancelled
    /// - Processing → Funded, Pending (claim revert), Failed
    /// - Funded → Released (release claim), Disputed, Cancelled
    /// - Released → Paid, Funded (release revert), Disputed
    /// - Disputed → Funded, Released, Cancelled
    /// - Terminal states (Paid, Cancelled, Failed) → NO TRANSITIONS ALLOWED
    pub fn allowed_targets(&self) -> &'static [PaymentStatus] {
        match self {
            PaymentStatus::Pending => &[PaymentStatus::Processing, PaymentStatus::Cancelled],
            PaymentStatus::Processing => &[
                PaymentStatus::Funded,
                PaymentStatus::Pending,
                PaymentStatus::Failed,
            ],
            PaymentStatus::Funded => &[
                PaymentStatus::Released,
                PaymentStatus::Disputed,
                PaymentStatus::Cancelled,
            ],
            PaymentStatus::Released => &[
                PaymentStatus::Paid,
                PaymentStatus::Funded,
                PaymentStatus::Disputed,
            ],
            PaymentStatus::Disputed => &[
                PaymentStatus::Funded,
                PaymentStatus::Released,
                PaymentStatus::Cancelled,
            ],
            PaymentStatus::Paid | PaymentStatus::Cancelled | PaymentStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, to: PaymentStatus) -> bool {
        self.allowed_targets().contains(&to)
    }

    /// Rejects an edge that is not part of the lifecycle graph.
    pub fn validate_transition(from: PaymentStatus, to: PaymentStatus) -> AppResult<()> {
        if from.is_terminal() {
            return Err(AppError::InvalidTransition {
                current: from.to_string(),
                expected: "No transitions from terminal states".to_string(),
            });
        }

        if !from.can_transition_to(to) {
            return Err(AppError::InvalidTransition {
                current: from.to_string(),
                expected: format!("{:?}", from.allowed_targets()),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    /// Custody releases when the deadline passes
    Standard,
    /// Custody releases only on mutual payer + payee consent
    DualApproval,
}

/// Escrow custody status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "escrow_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EscrowStatus {
    Active,
    Released,
    Disputed,
    Cancelled,
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscrowStatus::Active => "active",
            EscrowStatus::Released => "released",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

impl EscrowStatus {
    /// Forward claims plus the reverts used when the claimed on-chain call fails.
    pub fn can_transition_to(&self, to: EscrowStatus) -> bool {
        use EscrowStatus::*;
        matches!(
            (self, to),
            (Active, Released)
                | (Active, Disputed)
                | (Active, Cancelled)
                | (Released, Active)
                | (Released, Disputed)
                | (Disputed, Active)
                | (Disputed, Released)
                | (Disputed, Cancelled)
                | (Cancelled, Active)
                | (Cancelled, Disputed)
        )
    }

    pub fn validate_transition(from: EscrowStatus, to: EscrowStatus) -> AppResult<()> {
        if !from.can_transition_to(to) {
            return Err(AppError::InvalidTransition {
                current: format!("escrow {}", from),
                expected: format!("transition to {}", to),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Party {
    Payer,
    Payee,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Payer => write!(f, "payer"),
            Party::Payee => write!(f, "payee"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "dispute_resolution", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    ReleaseToPayee,
    RefundPayer,
}

/// Append-only audit event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "payment_event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // transitions
    PaymentCreated,
    DepositDetected,
    ClaimReverted,
    Funded,
    CustodyReleased,
    PayoutCompleted,
    DisputeRaised,
    DisputeResolvedFunded,
    DisputeResolvedReleased,
    DisputeRefunded,
    Cancelled,
    Failed,
    // informational
    EscrowCreated,
    PayerApproved,
    PayeeApproved,
    RedemptionInitiated,
    RedemptionSucceeded,
    PayoutSucceeded,
    // errors
    FundingError,
    ReleaseError,
    RedemptionFailed,
    RedemptionTimeout,
    PayoutFailed,
    ValidationFailed,
    DisputeError,
    RecoveryAttempt,
    RecoveryAlert,
}

impl EventType {
    /// Status a payment enters when this event is appended, if any.
    pub fn transition_target(&self) -> Option<PaymentStatus> {
        match self {
            EventType::PaymentCreated | EventType::ClaimReverted => Some(PaymentStatus::Pending),
            EventType::DepositDetected => Some(PaymentStatus::Processing),
            EventType::Funded | EventType::DisputeResolvedFunded => Some(PaymentStatus::Funded),
            EventType::CustodyReleased | EventType::DisputeResolvedReleased => {
                Some(PaymentStatus::Released)
            }
            EventType::PayoutCompleted => Some(PaymentStatus::Paid),
            EventType::DisputeRaised => Some(PaymentStatus::Disputed),
            EventType::DisputeRefunded | EventType::Cancelled => Some(PaymentStatus::Cancelled),
            EventType::Failed => Some(PaymentStatus::Failed),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            EventType::FundingError
                | EventType::ReleaseError
                | EventType::RedemptionFailed
                | EventType::RedemptionTimeout
                | EventType::PayoutFailed
                | EventType::ValidationFailed
                | EventType::DisputeError
                | EventType::RecoveryAlert
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_tx_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum LedgerTxKind {
    Redemption,
    Payout,
}

/// Which slice of the payment a settlement moves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "settlement_purpose", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SettlementPurpose {
    /// Non-custodied share paid when the payment is funded
    Upfront,
    /// Custodied share paid when custody is released
    Custody,
    /// Platform fee paid to the commission beneficiary when the payment is funded
    Commission,
}

impl SettlementPurpose {
    pub fn code(&self) -> char {
        match self {
            SettlementPurpose::Upfront => 'u',
            SettlementPurpose::Custody => 'c',
            SettlementPurpose::Commission => 'f',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "ledger_tx_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerTxStatus {
    Pending,
    Submitted,
    Succeeded,
    Failed,
    TimedOut,
}

impl LedgerTxStatus {
    /// Statuses that block a second payout for the same slice.
    pub fn is_claimed(&self) -> bool {
        matches!(
            self,
            LedgerTxStatus::Pending | LedgerTxStatus::Submitted | LedgerTxStatus::Succeeded
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "stuck_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StuckKind {
    FundingStalled,
    ReleaseStalled,
    PayoutUnconfirmed,
}

impl StuckKind {
    /// Status the payment sits in while stuck in this way.
    pub fn stuck_status(&self) -> PaymentStatus {
        match self {
            StuckKind::FundingStalled => PaymentStatus::Processing,
            StuckKind::ReleaseStalled => PaymentStatus::Funded,
            StuckKind::PayoutUnconfirmed => PaymentStatus::Released,
        }
    }
}

/// Payment entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub currency: String,
    pub payer_id: String,
    pub payee_id: String,
    /// Bank routing id (CLABE) the payee is paid out to
    pub payout_clabe: String,
    pub payout_holder_name: String,
    /// Routing id the payer deposits to
    pub deposit_clabe: String,
    /// Commission beneficiary account, paid the platform fee when set
    pub commission_clabe: Option<String>,
    pub commission_holder_name: Option<String>,
    pub description: Option<String>,
    pub status: PaymentStatus,
    pub payment_type: PaymentType,
    #[serde(with = "rust_decimal::serde::str")]
    pub custody_percent: Decimal,
    pub custody_period_hours: i32,
    pub deposit_reference: Option<String>,
    pub payer_approved: bool,
    pub payer_approved_at: Option<DateTime<Utc>>,
    pub payer_approval_tx: Option<String>,
    pub payee_approved: bool,
    pub payee_approved_at: Option<DateTime<Utc>>,
    pub payee_approval_tx: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn from_new(new: NewPayment, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            amount: new.amount,
            currency: new.currency,
            payer_id: new.payer_id,
            payee_id: new.payee_id,
            payout_clabe: new.payout_clabe,
            payout_holder_name: new.payout_holder_name,
            deposit_clabe: new.deposit_clabe,
            commission_clabe: new.commission_clabe.filter(|v| !v.trim().is_empty()),
            commission_holder_name: new.commission_holder_name.filter(|v| !v.trim().is_empty()),
            description: new.description,
            status: PaymentStatus::Pending,
            payment_type: new.payment_type,
            custody_percent: new.custody_percent,
            custody_period_hours: new.custody_period_hours,
            deposit_reference: None,
            payer_approved: false,
            payer_approved_at: None,
            payer_approval_tx: None,
            payee_approved: false,
            payee_approved_at: None,
            payee_approval_tx: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn owner_of(&self, party: Party) -> &str {
        match party {
            Party::Payer => &self.payer_id,
            Party::Payee => &self.payee_id,
        }
    }

    pub fn both_approved(&self) -> bool {
        self.payer_approved && self.payee_approved
    }

    /// Routing id and holder a settlement slice is paid to
    pub fn destination_for(&self, purpose: SettlementPurpose) -> Option<(&str, &str)> {
        match purpose {
            SettlementPurpose::Upfront | SettlementPurpose::Custody => {
                Some((&self.payout_clabe, &self.payout_holder_name))
            }
            SettlementPurpose::Commission => self
                .commission_clabe
                .as_deref()
                .zip(self.commission_holder_name.as_deref()),
        }
    }
}

/// Input for a new payment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub amount: Decimal,
    pub currency: String,
    pub payer_id: String,
    pub payee_id: String,
    pub payout_clabe: String,
    pub payout_holder_name: String,
    pub deposit_clabe: String,
    #[serde(default)]
    pub commission_clabe: Option<String>,
    #[serde(default)]
    pub commission_holder_name: Option<String>,
    pub description: Option<String>,
    pub payment_type: PaymentType,
    pub custody_percent: Decimal,
    pub custody_period_hours: i32,
}

impl NewPayment {
    pub fn validate_terms(&self) -> AppResult<()> {
        if self.amount <= Decimal::ZERO {
            return Err(AppError::Validation("amount must be positive".to_string()));
        }
        if self.custody_percent <= Decimal::ZERO || self.custody_percent > Decimal::ONE_HUNDRED {
            return Err(AppError::Validation(
                "custody_percent must be within (0, 100]".to_string(),
            ));
        }
        if self.custody_period_hours < 0 {
            return Err(AppError::Validation(
                "custody_period_hours cannot be negative".to_string(),
            ));
        }
        if self.payout_clabe.trim().is_empty() || self.deposit_clabe.trim().is_empty() {
            return Err(AppError::Validation("routing ids are required".to_string()));
        }
        let present = |v: &Option<String>| v.as_deref().is_some_and(|v| !v.trim().is_empty());
        if present(&self.commission_clabe) != present(&self.commission_holder_name) {
            return Err(AppError::Validation(
                "commission beneficiary needs both a routing id and a holder name".to_string(),
            ));
        }
        Ok(())
    }
}

/// How a payment amount is divided between custody, upfront release and fee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AmountSplit {
    pub custody_amount: Decimal,
    pub release_amount: Decimal,
    pub fee_amount: Decimal,
}

impl AmountSplit {
    /// Custody and fee are rounded to cents; the upfront share absorbs the remainder,
    /// so the three parts always sum to `amount`.
    pub fn compute(amount: Decimal, custody_percent: Decimal, fee_bps: u32) -> AppResult<Self> {
        if amount <= Decimal::ZERO {
            return Err(AppError::Validation("amount must be positive".to_string()));
        }
        if custody_percent <= Decimal::ZERO || custody_percent > Decimal::ONE_HUNDRED {
            return Err(AppError::Validation(
                "custody_percent must be within (0, 100]".to_string(),
            ));
        }

        let fee_amount = (amount * Decimal::from(fee_bps) / Decimal::from(10_000))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let custody_amount = (amount * custody_percent / Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let release_amount = amount - custody_amount - fee_amount;

        if release_amount < Decimal::ZERO {
            return Err(AppError::Validation(
                "custody plus fee exceed the payment amount".to_string(),
            ));
        }

        let split = Self {
            custody_amount,
            release_amount,
            fee_amount,
        };
        split.check(amount)?;
        Ok(split)
    }

    pub fn check(&self, amount: Decimal) -> AppResult<()> {
        if self.custody_amount + self.release_amount + self.fee_amount != amount {
            return Err(AppError::Internal(format!(
                "split does not sum to {}",
                amount
            )));
        }
        Ok(())
    }
}

/// Escrow entity, one per funded payment
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Escrow {
    pub id: Uuid,
    pub payment_id: Uuid,
    #[serde(with = "rust_decimal::serde::str")]
    pub custody_percent: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub custody_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub release_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub fee_amount: Decimal,
    pub onchain_escrow_id: Option<String>,
    pub create_tx_hash: Option<String>,
    pub release_tx_hash: Option<String>,
    pub custody_end: DateTime<Utc>,
    pub status: EscrowStatus,
    pub dispute_reason: Option<String>,
    pub disputed_from: Option<PaymentStatus>,
    pub dispute_raised_at: Option<DateTime<Utc>>,
    pub dispute_resolution: Option<DisputeResolution>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Escrow {
    pub fn for_payment(payment: &Payment, fee_bps: u32, now: DateTime<Utc>) -> AppResult<Self> {
        let split = AmountSplit::compute(payment.amount, payment.custody_percent, fee_bps)?;
        Ok(Self {
            id: Uuid::new_v4(),
            payment_id: payment.id,
            custody_percent: payment.custody_percent,
            custody_amount: split.custody_amount,
            release_amount: split.release_amount,
            fee_amount: split.fee_amount,
            onchain_escrow_id: None,
            create_tx_hash: None,
            release_tx_hash: None,
            custody_end: now + Duration::hours(i64::from(payment.custody_period_hours)),
            status: EscrowStatus::Active,
            dispute_reason: None,
            disputed_from: None,
            dispute_raised_at: None,
            dispute_resolution: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn split(&self) -> AmountSplit {
        AmountSplit {
            custody_amount: self.custody_amount,
            release_amount: self.release_amount,
            fee_amount: self.fee_amount,
        }
    }

    pub fn custody_due(&self, now: DateTime<Utc>) -> bool {
        self.custody_end <= now
    }
}

/// Append-only audit record
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentEvent {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub event_type: EventType,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl PaymentEvent {
    pub fn new(payment_id: Uuid, event_type: EventType, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payment_id,
            event_type,
            description: description.into(),
            created_at: Utc::now(),
        }
    }
}

/// Redemption or payout record, written before the external call
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub kind: LedgerTxKind,
    pub purpose: SettlementPurpose,
    pub external_ref: Option<String>,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub status: LedgerTxStatus,
    pub tx_hash: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn pending(
        payment_id: Uuid,
        kind: LedgerTxKind,
        purpose: SettlementPurpose,
        amount: Decimal,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            payment_id,
            kind,
            purpose,
            external_ref: None,
            amount,
            status: LedgerTxStatus::Pending,
            tx_hash: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome written back onto a ledger transaction
#[derive(Debug, Clone, Default)]
pub struct LedgerTxUpdate {
    pub status: Option<LedgerTxStatus>,
    pub external_ref: Option<String>,
    pub tx_hash: Option<String>,
}

/// Safety monitor bookkeeping for one stuck payment
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecoveryCase {
    pub payment_id: Uuid,
    pub kind: StuckKind,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub alerted_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RecoveryCase {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
