use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::models::*;
use super::LedgerStore;
use crate::error::{AppError, AppResult};

const PAYMENT_COLUMNS: &str = r#"
    id, amount, currency, payer_id, payee_id, payout_clabe, payout_holder_name,
    deposit_clabe, commission_clabe, commission_holder_name, description, status,
    payment_type, custody_percent, custody_period_hours, deposit_reference,
    payer_approved, payer_approved_at,
    payer_approval_tx, payee_approved, payee_approved_at, payee_approval_tx,
    created_at, updated_at
"#;

const ESCROW_COLUMNS: &str = r#"
    id, payment_id, custody_percent, custody_amount, release_amount, fee_amount,
    onchain_escrow_id, create_tx_hash, release_tx_hash, custody_end, status,
    dispute_reason, disputed_from, dispute_raised_at, dispute_resolution,
    resolved_at, created_at, updated_at
"#;

const LEDGER_TX_COLUMNS: &str = r#"
    id, payment_id, kind, purpose, external_ref, amount, status, tx_hash,
    created_at, updated_at
"#;

const RECOVERY_COLUMNS: &str = r#"
    payment_id, kind, attempts, last_error, last_attempt_at, alerted_at,
    resolved_at, created_at
"#;

/// Ledger repository - THE source of truth for all state
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Reads the payment status under a row lock held until the transaction ends.
async fn lock_payment_status(
    db_tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    id: Uuid,
) -> AppResult<PaymentStatus> {
    let row: Option<(PaymentStatus,)> =
        sqlx::query_as("SELECT status FROM payments WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **db_tx)
            .await?;

    row.map(|(status,)| status)
        .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", id)))
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    // ========== PAYMENT OPERATIONS ==========

    async fn insert_payment(&self, payment: &Payment) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, amount, currency, payer_id, payee_id, payout_clabe, payout_holder_name,
                deposit_clabe, commission_clabe, commission_holder_name, description,
                status, payment_type, custody_percent, custody_period_hours,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(payment.id)
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(&payment.payer_id)
        .bind(&payment.payee_id)
        .bind(&payment.payout_clabe)
        .bind(&payment.payout_holder_name)
        .bind(&payment.deposit_clabe)
        .bind(&payment.commission_clabe)
        .bind(&payment.commission_holder_name)
        .bind(&payment.description)
        .bind(payment.status)
        .bind(payment.payment_type)
        .bind(payment.custody_percent)
        .bind(payment.custody_period_hours)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;

        info!("💾 Payment {} recorded", payment.id);
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> AppResult<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE id = $1",
            PAYMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn list_payments_by_status(&self, status: PaymentStatus) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {} FROM payments WHERE status = $1 ORDER BY created_at ASC",
            PAYMENT_COLUMNS
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
    ) -> AppResult<bool> {
        // SECURITY: Validate state machine transitions
        PaymentStatus::validate_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn renew_processing_lease(&self, id: Uuid, stale_before: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET updated_at = NOW()
            WHERE id = $1 AND status = $2 AND updated_at < $3
            "#,
        )
        .bind(id)
        .bind(PaymentStatus::Processing)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn claim_deposit(&self, id: Uuid, deposit_reference: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $3, deposit_reference = $4, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(PaymentStatus::Pending)
        .bind(PaymentStatus::Processing)
        .bind(deposit_reference)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => Ok(done.rows_affected() == 1),
            // deposit already bound to another payment
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn revert_deposit_claim(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $3, deposit_reference = NULL, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(PaymentStatus::Processing)
        .bind(PaymentStatus::Pending)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_approval(&self, id: Uuid, party: Party, tx_hash: Option<String>) -> AppResult<bool> {
        let sql = match party {
            Party::Payer => {
                r#"
                UPDATE payments
                SET payer_approved = TRUE, payer_approved_at = NOW(),
                    payer_approval_tx = $2, updated_at = NOW()
                WHERE id = $1 AND payer_approved = FALSE
                "#
            }
            Party::Payee => {
                r#"
                UPDATE payments
                SET payee_approved = TRUE, payee_approved_at = NOW(),
                    payee_approval_tx = $2, updated_at = NOW()
                WHERE id = $1 AND payee_approved = FALSE
                "#
            }
        };

        let result = sqlx::query(sql)
            .bind(id)
            .bind(tx_hash)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    // ========== ESCROW OPERATIONS ==========

    async fn insert_escrow(&self, escrow: &Escrow) -> AppResult<Escrow> {
        sqlx::query(
            r#"
            INSERT INTO escrows (
                id, payment_id, custody_percent, custody_amount, release_amount,
                fee_amount, custody_end, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (payment_id) DO NOTHING
            "#,
        )
        .bind(escrow.id)
        .bind(escrow.payment_id)
        .bind(escrow.custody_percent)
        .bind(escrow.custody_amount)
        .bind(escrow.release_amount)
        .bind(escrow.fee_amount)
        .bind(escrow.custody_end)
        .bind(escrow.status)
        .bind(escrow.created_at)
        .bind(escrow.updated_at)
        .execute(&self.pool)
        .await?;

        self.get_escrow_by_payment(escrow.payment_id)
            .await?
            .ok_or_else(|| AppError::Internal(format!("Escrow for {} vanished", escrow.payment_id)))
    }

    async fn get_escrow_by_payment(&self, payment_id: Uuid) -> AppResult<Option<Escrow>> {
        let escrow = sqlx::query_as::<_, Escrow>(&format!(
            "SELECT {} FROM escrows WHERE payment_id = $1",
            ESCROW_COLUMNS
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(escrow)
    }

    async fn record_custody_created(
        &self,
        escrow_id: Uuid,
        onchain_escrow_id: &str,
        tx_hash: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET onchain_escrow_id = $2, create_tx_hash = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(escrow_id)
        .bind(onchain_escrow_id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_release_tx(&self, escrow_id: Uuid, tx_hash: &str) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET release_tx_hash = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(escrow_id)
        .bind(tx_hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition_escrow(
        &self,
        escrow_id: Uuid,
        from: EscrowStatus,
        to: EscrowStatus,
    ) -> AppResult<bool> {
        EscrowStatus::validate_transition(from, to)?;

        let result = sqlx::query(
            r#"
            UPDATE escrows
            SET status = $3, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(escrow_id)
        .bind(from)
        .bind(to)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_dispute(
        &self,
        escrow_id: Uuid,
        reason: &str,
        disputed_from: PaymentStatus,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET dispute_reason = $2, disputed_from = $3, dispute_raised_at = NOW(),
                dispute_resolution = NULL, resolved_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(escrow_id)
        .bind(reason)
        .bind(disputed_from)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_dispute_resolution(
        &self,
        escrow_id: Uuid,
        resolution: DisputeResolution,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE escrows
            SET dispute_resolution = $2, resolved_at = NOW(), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(escrow_id)
        .bind(resolution)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_due_escrows(&self, now: DateTime<Utc>) -> AppResult<Vec<Escrow>> {
        let escrows = sqlx::query_as::<_, Escrow>(&format!(
            "SELECT {} FROM escrows WHERE status = $1 AND custody_end <= $2 ORDER BY custody_end ASC",
            ESCROW_COLUMNS
        ))
        .bind(EscrowStatus::Active)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(escrows)
    }

    // ========== EVENT LOG ==========

    async fn append_event(&self, event: &PaymentEvent) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_events (id, payment_id, event_type, description, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.id)
        .bind(event.payment_id)
        .bind(event.event_type)
        .bind(&event.description)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_events(&self, payment_id: Uuid) -> AppResult<Vec<PaymentEvent>> {
        let events = sqlx::query_as::<_, PaymentEvent>(
            r#"
            SELECT id, payment_id, event_type, description, created_at
            FROM payment_events
            WHERE payment_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    // ========== SETTLEMENT RECORDS ==========

    async fn insert_ledger_tx(&self, tx: &LedgerTransaction) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_transactions (
                id, payment_id, kind, purpose, external_ref, amount, status, tx_hash,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(tx.id)
        .bind(tx.payment_id)
        .bind(tx.kind)
        .bind(tx.purpose)
        .bind(&tx.external_ref)
        .bind(tx.amount)
        .bind(tx.status)
        .bind(&tx.tx_hash)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_payout(&self, tx: &LedgerTransaction) -> AppResult<bool> {
        let mut db_tx = self.pool.begin().await?;

        // row lock serializes the claim against dispute_before_payout
        let status = lock_payment_status(&mut db_tx, tx.payment_id).await?;
        if status.holds_payouts() {
            return Ok(false);
        }

        // partial unique index ledger_payout_claim guards (payment_id, purpose)
        let result = sqlx::query(
            r#"
            INSERT INTO ledger_transactions (
                id, payment_id, kind, purpose, external_ref, amount, status, tx_hash,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(tx.id)
        .bind(tx.payment_id)
        .bind(LedgerTxKind::Payout)
        .bind(tx.purpose)
        .bind(&tx.external_ref)
        .bind(tx.amount)
        .bind(tx.status)
        .bind(&tx.tx_hash)
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn dispute_before_payout(
        &self,
        id: Uuid,
        from: PaymentStatus,
        purpose: SettlementPurpose,
    ) -> AppResult<bool> {
        PaymentStatus::validate_transition(from, PaymentStatus::Disputed)?;

        let mut db_tx = self.pool.begin().await?;
        if lock_payment_status(&mut db_tx, id).await? != from {
            return Ok(false);
        }

        let (claimed,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ledger_transactions
                WHERE payment_id = $1 AND purpose = $2 AND kind = $3
                  AND status IN ('pending', 'submitted', 'succeeded')
            )
            "#,
        )
        .bind(id)
        .bind(purpose)
        .bind(LedgerTxKind::Payout)
        .fetch_one(&mut *db_tx)
        .await?;
        if claimed {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(PaymentStatus::Disputed)
        .execute(&mut *db_tx)
        .await?;

        db_tx.commit().await?;
        Ok(true)
    }

    async fn update_ledger_tx(&self, id: Uuid, update: LedgerTxUpdate) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE ledger_transactions
            SET status = COALESCE($2, status),
                external_ref = COALESCE($3, external_ref),
                tx_hash = COALESCE($4, tx_hash),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status)
        .bind(update.external_ref)
        .bind(update.tx_hash)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Ledger transaction {} not found", id)));
        }
        Ok(())
    }

    async fn find_ledger_txs(
        &self,
        payment_id: Uuid,
        purpose: SettlementPurpose,
        kind: LedgerTxKind,
    ) -> AppResult<Vec<LedgerTransaction>> {
        let txs = sqlx::query_as::<_, LedgerTransaction>(&format!(
            r#"
            SELECT {}
            FROM ledger_transactions
            WHERE payment_id = $1 AND purpose = $2 AND kind = $3
            ORDER BY created_at ASC
            "#,
            LEDGER_TX_COLUMNS
        ))
        .bind(payment_id)
        .bind(purpose)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;

        Ok(txs)
    }

    // ========== RECOVERY CASES ==========

    async fn get_recovery_case(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
    ) -> AppResult<Option<RecoveryCase>> {
        let case = sqlx::query_as::<_, RecoveryCase>(&format!(
            "SELECT {} FROM recovery_cases WHERE payment_id = $1 AND kind = $2",
            RECOVERY_COLUMNS
        ))
        .bind(payment_id)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;

        Ok(case)
    }

    async fn record_recovery_attempt(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> AppResult<RecoveryCase> {
        let case = sqlx::query_as::<_, RecoveryCase>(&format!(
            r#"
            INSERT INTO recovery_cases (payment_id, kind, attempts, last_error, last_attempt_at, created_at)
            VALUES ($1, $2, 1, $3, $4, $4)
            ON CONFLICT (payment_id, kind) DO UPDATE
            SET attempts = CASE WHEN recovery_cases.resolved_at IS NULL
                                THEN recovery_cases.attempts + 1 ELSE 1 END,
                alerted_at = CASE WHEN recovery_cases.resolved_at IS NULL
                                  THEN recovery_cases.alerted_at ELSE NULL END,
                resolved_at = NULL,
                last_error = EXCLUDED.last_error,
                last_attempt_at = EXCLUDED.last_attempt_at
            RETURNING {}
            "#,
            RECOVERY_COLUMNS
        ))
        .bind(payment_id)
        .bind(kind)
        .bind(error)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(case)
    }

    async fn mark_alerted(&self, payment_id: Uuid, kind: StuckKind, at: DateTime<Utc>) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recovery_cases
            SET alerted_at = $3
            WHERE payment_id = $1 AND kind = $2 AND alerted_at IS NULL
            "#,
        )
        .bind(payment_id)
        .bind(kind)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn resolve_recovery_case(
        &self,
        payment_id: Uuid,
        kind: StuckKind,
        at: DateTime<Utc>,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE recovery_cases
            SET resolved_at = $3
            WHERE payment_id = $1 AND kind = $2 AND resolved_at IS NULL
            "#,
        )
        .bind(payment_id)
        .bind(kind)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
