use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::ledger::models::{Payment, SettlementPurpose};

/// Longest reference the SPEI rail accepts
pub const MAX_REFERENCE_LEN: usize = 40;

const DEFAULT_MEMO: &str = "Pago custodia";

/// Keeps `[A-Za-z0-9 ]`, truncates to 40 characters, trims. Idempotent.
pub fn sanitize_reference(raw: &str) -> String {
    let kept: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ')
        .take(MAX_REFERENCE_LEN)
        .collect();
    kept.trim().to_string()
}

pub fn is_valid_reference(value: &str) -> bool {
    !value.is_empty() && sanitize_reference(value) == value
}

/// Outbound destination and reference fields for one settlement slice, already sanitized
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReferences {
    /// Routing id (CLABE) the slice is paid to
    pub clabe: String,
    pub beneficiary: String,
    /// Free-text memo shown to the beneficiary
    pub memo: String,
    /// Alphanumeric reference tying the transfer back to the escrow
    pub reference: String,
    /// Seven-digit SPEI numeric reference
    pub numeric_reference: String,
}

impl SettlementReferences {
    /// Fails with `Validation` when the slice has no destination or sanitizing
    /// empties a required field.
    pub fn for_payment(payment: &Payment, purpose: SettlementPurpose) -> AppResult<Self> {
        let (clabe, beneficiary) = payment.destination_for(purpose).ok_or_else(|| {
            AppError::Validation(format!("no {:?} beneficiary on the payment", purpose))
        })?;
        let memo = sanitize_reference(payment.description.as_deref().unwrap_or(DEFAULT_MEMO));
        let reference = sanitize_reference(&format!(
            "esc{}{}",
            purpose.code(),
            payment.id.simple()
        ));
        let numeric_reference = numeric_reference(payment.id);

        for (field, value) in [("memo", &memo), ("reference", &reference)] {
            if !is_valid_reference(value) {
                return Err(AppError::Validation(format!(
                    "{} is empty after sanitization",
                    field
                )));
            }
        }

        Ok(Self {
            clabe: clabe.to_string(),
            beneficiary: beneficiary.to_string(),
            memo,
            reference,
            numeric_reference,
        })
    }
}

fn numeric_reference(id: Uuid) -> String {
    format!("{:07}", id.as_u128() % 10_000_000)
}
