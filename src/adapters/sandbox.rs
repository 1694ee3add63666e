// Sandbox rails - in-process stand-ins for the banking rail and the escrow contract.
//
// Selected with RAIL_MODE=sandbox. Behavior knobs let tests inject rejections,
// slow confirmations and network failures; call counters let them assert how
// many external calls a code path made.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;
use uuid::Uuid;

use super::traits::*;
use crate::error::{RailError, RailResult};

fn fake_tx_hash() -> String {
    format!("0x{}", hex::encode(rand::random::<[u8; 32]>()))
}

/// Invocation counters, one per external operation
#[derive(Debug, Default)]
pub struct CallCounters {
    pub deposits: AtomicUsize,
    pub lookups: AtomicUsize,
    pub destinations_created: AtomicUsize,
    pub redemptions: AtomicUsize,
    pub transaction_polls: AtomicUsize,
    pub payouts: AtomicUsize,
    pub custody_created: AtomicUsize,
    pub custody_released: AtomicUsize,
    pub disputes: AtomicUsize,
    pub resolutions: AtomicUsize,
    pub cancellations: AtomicUsize,
    pub state_reads: AtomicUsize,
}

impl CallCounters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    /// Calls that move money or change external state
    pub fn mutating_total(&self) -> usize {
        [
            &self.destinations_created,
            &self.redemptions,
            &self.payouts,
            &self.custody_created,
            &self.custody_released,
            &self.disputes,
            &self.resolutions,
            &self.cancellations,
        ]
        .iter()
        .map(|c| Self::get(c))
        .sum()
    }

    pub fn total(&self) -> usize {
        self.mutating_total()
            + Self::get(&self.deposits)
            + Self::get(&self.lookups)
            + Self::get(&self.transaction_polls)
            + Self::get(&self.state_reads)
    }
}

// ========== BANKING RAIL ==========

#[derive(Debug, Clone)]
pub struct RailBehavior {
    pub redemption_failure: Option<RailError>,
    pub payout_failure: Option<RailError>,
    /// Polls that still see a redemption pending; `None` never confirms
    pub confirm_after_polls: Option<u32>,
    /// Redemptions settle as failed instead of succeeded
    pub redemptions_fail_on_rail: bool,
}

impl Default for RailBehavior {
    fn default() -> Self {
        Self {
            redemption_failure: None,
            payout_failure: None,
            confirm_after_polls: Some(0),
            redemptions_fail_on_rail: false,
        }
    }
}

#[derive(Debug, Clone)]
struct SandboxRedemption {
    id: String,
    amount: rust_decimal::Decimal,
    polls_seen: u32,
}

#[derive(Default)]
struct RailState {
    deposits: Vec<Deposit>,
    destinations: HashMap<String, BankDestination>,
    redemptions: Vec<SandboxRedemption>,
    redemption_keys: HashMap<String, String>,
    payouts: Vec<PayoutRequest>,
    payout_keys: HashMap<String, String>,
}

pub struct SandboxRail {
    state: Mutex<RailState>,
    behavior: Mutex<RailBehavior>,
    pub calls: CallCounters,
}

impl SandboxRail {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RailState::default()),
            behavior: Mutex::new(RailBehavior::default()),
            calls: CallCounters::default(),
        }
    }

    pub fn with_behavior(behavior: RailBehavior) -> Self {
        let rail = Self::new();
        rail.set_behavior(behavior);
        rail
    }

    pub fn set_behavior(&self, behavior: RailBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn push_deposit(&self, deposit: Deposit) {
        self.state.lock().deposits.push(deposit);
    }

    /// Executed payouts, one per idempotency key
    pub fn payouts(&self) -> Vec<PayoutRequest> {
        self.state.lock().payouts.clone()
    }

    pub fn redemption_count(&self) -> usize {
        self.state.lock().redemptions.len()
    }
}

impl Default for SandboxRail {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DepositFeed for SandboxRail {
    async fn recent_deposits(&self) -> RailResult<Vec<Deposit>> {
        CallCounters::bump(&self.calls.deposits);
        Ok(self.state.lock().deposits.clone())
    }
}

#[async_trait]
impl StablecoinRail for SandboxRail {
    async fn lookup_destination_by_routing_id(
        &self,
        clabe: &str,
    ) -> RailResult<Option<BankDestination>> {
        CallCounters::bump(&self.calls.lookups);
        Ok(self.state.lock().destinations.get(clabe).cloned())
    }

    async fn create_bank_destination(
        &self,
        clabe: &str,
        holder_name: &str,
    ) -> RailResult<BankDestination> {
        CallCounters::bump(&self.calls.destinations_created);
        let mut state = self.state.lock();
        let destination = state
            .destinations
            .entry(clabe.to_string())
            .or_insert_with(|| BankDestination {
                id: format!("bank-{}", Uuid::new_v4().simple()),
                clabe: clabe.to_string(),
                holder_name: holder_name.to_string(),
            })
            .clone();
        Ok(destination)
    }

    async fn submit_redemption(&self, request: &RedemptionRequest) -> RailResult<RedemptionReceipt> {
        CallCounters::bump(&self.calls.redemptions);
        if let Some(error) = self.behavior.lock().redemption_failure.clone() {
            return Err(error);
        }

        let mut state = self.state.lock();
        if let Some(id) = state.redemption_keys.get(&request.idempotency_key) {
            return Ok(RedemptionReceipt { id: id.clone() });
        }

        let id = format!("red-{}", Uuid::new_v4().simple());
        state
            .redemption_keys
            .insert(request.idempotency_key.clone(), id.clone());
        state.redemptions.push(SandboxRedemption {
            id: id.clone(),
            amount: request.amount,
            polls_seen: 0,
        });
        debug!("🧪 Sandbox redemption {} for {}", id, request.amount);
        Ok(RedemptionReceipt { id })
    }

    async fn list_transactions(&self, filter: TransactionFilter) -> RailResult<Vec<RailTransaction>> {
        CallCounters::bump(&self.calls.transaction_polls);
        if filter.kind != RailTransactionKind::Redemption {
            return Ok(Vec::new());
        }

        let behavior = self.behavior.lock().clone();
        let mut state = self.state.lock();
        let listed = state
            .redemptions
            .iter_mut()
            .rev()
            .take(filter.limit as usize)
            .map(|r| {
                r.polls_seen += 1;
                let confirmed = matches!(behavior.confirm_after_polls, Some(n) if r.polls_seen > n);
                let status = if !confirmed {
                    RailTxStatus::Pending
                } else if behavior.redemptions_fail_on_rail {
                    RailTxStatus::Failed
                } else {
                    RailTxStatus::Succeeded
                };
                RailTransaction {
                    id: r.id.clone(),
                    kind: RailTransactionKind::Redemption,
                    status,
                    amount: Some(r.amount),
                    tx_hash: confirmed.then(fake_tx_hash),
                }
            })
            .collect();
        Ok(listed)
    }

    async fn submit_payout(&self, request: &PayoutRequest) -> RailResult<PayoutReceipt> {
        CallCounters::bump(&self.calls.payouts);
        if let Some(error) = self.behavior.lock().payout_failure.clone() {
            return Err(error);
        }

        let mut state = self.state.lock();
        if let Some(id) = state.payout_keys.get(&request.idempotency_key) {
            return Ok(PayoutReceipt { id: id.clone() });
        }

        let id = format!("wd-{}", Uuid::new_v4().simple());
        state
            .payout_keys
            .insert(request.idempotency_key.clone(), id.clone());
        state.payouts.push(request.clone());
        Ok(PayoutReceipt { id })
    }
}

// ========== ESCROW CONTRACT ==========

#[derive(Debug, Clone, Default)]
pub struct EscrowBehavior {
    pub create_failure: Option<RailError>,
    pub release_failure: Option<RailError>,
}

pub struct SandboxEscrow {
    custodies: Mutex<HashMap<String, OnchainCustodyState>>,
    behavior: Mutex<EscrowBehavior>,
    pub calls: CallCounters,
}

impl SandboxEscrow {
    pub fn new() -> Self {
        Self {
            custodies: Mutex::new(HashMap::new()),
            behavior: Mutex::new(EscrowBehavior::default()),
            calls: CallCounters::default(),
        }
    }

    pub fn set_behavior(&self, behavior: EscrowBehavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn state_of(&self, escrow_id: &str) -> Option<OnchainCustodyState> {
        self.custodies.lock().get(escrow_id).copied()
    }

    fn move_state(
        &self,
        escrow_id: &str,
        allowed: &[OnchainCustodyState],
        to: OnchainCustodyState,
    ) -> RailResult<String> {
        let mut custodies = self.custodies.lock();
        let state = custodies.get_mut(escrow_id).ok_or(RailError::Rejected {
            status: 404,
            message: format!("unknown escrow {}", escrow_id),
        })?;
        if !allowed.contains(state) {
            return Err(RailError::Rejected {
                status: 409,
                message: format!("escrow {} is {:?}", escrow_id, state),
            });
        }
        *state = to;
        Ok(fake_tx_hash())
    }
}

impl Default for SandboxEscrow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EscrowContract for SandboxEscrow {
    async fn create_custody(&self, request: &CustodyRequest) -> RailResult<CustodyReceipt> {
        CallCounters::bump(&self.calls.custody_created);
        if let Some(error) = self.behavior.lock().create_failure.clone() {
            return Err(error);
        }

        // keyed by payment so a retried create is idempotent
        let escrow_id = format!("esc-{}", request.payment_id.simple());
        self.custodies
            .lock()
            .entry(escrow_id.clone())
            .or_insert(OnchainCustodyState::Active);
        Ok(CustodyReceipt {
            escrow_id,
            tx_hash: fake_tx_hash(),
        })
    }

    async fn release_custody(&self, escrow_id: &str) -> RailResult<String> {
        CallCounters::bump(&self.calls.custody_released);
        if let Some(error) = self.behavior.lock().release_failure.clone() {
            return Err(error);
        }
        self.move_state(
            escrow_id,
            &[OnchainCustodyState::Active],
            OnchainCustodyState::Released,
        )
    }

    async fn raise_dispute(&self, escrow_id: &str, _reason: &str) -> RailResult<String> {
        CallCounters::bump(&self.calls.disputes);
        self.move_state(
            escrow_id,
            &[OnchainCustodyState::Active],
            OnchainCustodyState::Disputed,
        )
    }

    async fn resolve_dispute(&self, escrow_id: &str, release_to_payee: bool) -> RailResult<String> {
        CallCounters::bump(&self.calls.resolutions);
        let to = if release_to_payee {
            OnchainCustodyState::Released
        } else {
            OnchainCustodyState::Refunded
        };
        self.move_state(escrow_id, &[OnchainCustodyState::Disputed], to)
    }

    async fn cancel_custody(&self, escrow_id: &str) -> RailResult<String> {
        CallCounters::bump(&self.calls.cancellations);
        self.move_state(
            escrow_id,
            &[OnchainCustodyState::Active],
            OnchainCustodyState::Refunded,
        )
    }

    async fn custody_state(&self, escrow_id: &str) -> RailResult<OnchainCustodyState> {
        CallCounters::bump(&self.calls.state_reads);
        Ok(self
            .state_of(escrow_id)
            .unwrap_or(OnchainCustodyState::Unknown))
    }
}
