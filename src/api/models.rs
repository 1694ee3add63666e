use crate::ledger::models::*;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

// ========== REQUEST MODELS ==========

/// Request to open a new escrowed payment
#[derive(Debug, Deserialize, Validate)]
pub struct CreatePaymentRequest {
    pub amount: Decimal,

    #[validate(length(min = 3, max = 8))]
    pub currency: String,

    #[validate(length(min = 1, max = 128))]
    pub payer_id: String,

    #[validate(length(min = 1, max = 128))]
    pub payee_id: String,

    /// 18-digit CLABE the payee is paid out to
    #[validate(length(equal = 18))]
    pub payout_clabe: String,

    #[validate(length(min = 1, max = 120))]
    pub payout_holder_name: String,

    /// 18-digit CLABE the payer deposits to
    #[validate(length(equal = 18))]
    pub deposit_clabe: String,

    /// Commission beneficiary, paid the platform fee on funding
    #[validate(length(equal = 18))]
    pub commission_clabe: Option<String>,

    #[validate(length(min = 1, max = 120))]
    pub commission_holder_name: Option<String>,

    #[validate(length(max = 200))]
    pub description: Option<String>,

    #[serde(default = "default_payment_type")]
    pub payment_type: PaymentType,

    pub custody_percent: Decimal,

    #[validate(range(min = 0, max = 8760))]
    pub custody_period_hours: i32,
}

fn default_payment_type() -> PaymentType {
    PaymentType::Standard
}

impl From<CreatePaymentRequest> for NewPayment {
    fn from(request: CreatePaymentRequest) -> Self {
        Self {
            amount: request.amount,
            currency: request.currency,
            payer_id: request.payer_id,
            payee_id: request.payee_id,
            payout_clabe: request.payout_clabe,
            payout_holder_name: request.payout_holder_name,
            deposit_clabe: request.deposit_clabe,
            commission_clabe: request.commission_clabe,
            commission_holder_name: request.commission_holder_name,
            description: request.description,
            payment_type: request.payment_type,
            custody_percent: request.custody_percent,
            custody_period_hours: request.custody_period_hours,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct ApproveRequest {
    pub party: Party,

    #[validate(length(min = 1, max = 128))]
    pub actor_id: String,

    #[serde(default = "default_approved")]
    pub approved: bool,

    #[validate(length(max = 128))]
    pub tx_hash: Option<String>,
}

fn default_approved() -> bool {
    true
}

#[derive(Debug, Deserialize, Validate)]
pub struct DisputeRequest {
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct ResolveDisputeRequest {
    pub resolution: DisputeResolution,
}

// ========== RESPONSE MODELS ==========

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub rail_mode: String,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub payment_id: uuid::Uuid,
    pub events: Vec<PaymentEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_request_defaults_and_validation() {
        let request: CreatePaymentRequest = serde_json::from_value(serde_json::json!({
            "amount": "1000",
            "currency": "MXN",
            "payer_id": "payer-1",
            "payee_id": "payee-1",
            "payout_clabe": "646180157000000004",
            "payout_holder_name": "Ana Lopez",
            "deposit_clabe": "710969000000000001",
            "custody_percent": "20",
            "custody_period_hours": 24
        }))
        .unwrap();
        assert_eq!(request.payment_type, PaymentType::Standard);
        assert!(request.validate().is_ok());

        let bad: CreatePaymentRequest = serde_json::from_value(serde_json::json!({
            "amount": "1000",
            "currency": "MXN",
            "payer_id": "",
            "payee_id": "payee-1",
            "payout_clabe": "6461",
            "payout_holder_name": "Ana Lopez",
            "deposit_clabe": "710969000000000001",
            "custody_percent": "20",
            "custody_period_hours": 24
        }))
        .unwrap();
        let errors = bad.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("payer_id"));
        assert!(errors.field_errors().contains_key("payout_clabe"));
    }

    #[test]
    fn commission_beneficiary_is_carried_into_the_payment() {
        let request: CreatePaymentRequest = serde_json::from_value(serde_json::json!({
            "amount": "1000",
            "currency": "MXN",
            "payer_id": "payer-1",
            "payee_id": "payee-1",
            "payout_clabe": "646180157000000004",
            "payout_holder_name": "Ana Lopez",
            "deposit_clabe": "710969000000000001",
            "commission_clabe": "6461801570",
            "commission_holder_name": "Plataforma SA",
            "custody_percent": "20",
            "custody_period_hours": 24
        }))
        .unwrap();
        let errors = request.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("commission_clabe"));

        let new = NewPayment::from(CreatePaymentRequest {
            commission_clabe: Some("646180157000000011".into()),
            ..request
        });
        assert_eq!(new.commission_holder_name.as_deref(), Some("Plataforma SA"));
        assert!(new.validate_terms().is_ok());
    }

    #[test]
    fn approvals_default_to_approved() {
        let request: ApproveRequest = serde_json::from_value(serde_json::json!({
            "party": "payee",
            "actor_id": "payee-1"
        }))
        .unwrap();
        assert!(request.approved);
        assert_eq!(request.party, Party::Payee);
    }
}
