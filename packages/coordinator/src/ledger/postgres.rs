//! Postgres-backed ledger

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use tracing::error;

use super::models::{TransferRow, TRANSFER_COLUMNS};
use super::{check_transition, FieldUpdate, TransferLedger, TransferUpdate};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{TransferId, TransferRecord, TransferStatus};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// Split a nullable-column update into (touch, value) bind parameters
fn field_binds(update: FieldUpdate<String>) -> (bool, Option<String>) {
    match update {
        FieldUpdate::Keep => (false, None),
        FieldUpdate::Set(value) => (true, Some(value)),
        FieldUpdate::Clear => (true, None),
    }
}

#[derive(Debug, Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransferLedger for PgLedger {
    async fn create(&self, record: &TransferRecord) -> BridgeResult<()> {
        // amount is NUMERIC(78,0): bind as text and cast
        let inserted = sqlx::query_scalar::<_, uuid::Uuid>(
            r#"
            INSERT INTO transfers (transfer_id, source_chain, destination_chain, amount, sender,
                recipient, status, protected_metadata, attempts, expires_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (transfer_id) DO NOTHING
            RETURNING transfer_id
            "#,
        )
        .bind(record.transfer_id.0)
        .bind(record.source_chain.as_str())
        .bind(record.destination_chain.as_str())
        .bind(record.amount.to_string())
        .bind(&record.sender)
        .bind(&record.recipient)
        .bind(record.status)
        .bind(record.protected_metadata.clone().map(Json))
        .bind(record.attempts as i32)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_optional(&self.pool)
        .await?;

        match inserted {
            Some(_) => Ok(()),
            None => Err(BridgeError::DuplicateTransferId(record.transfer_id)),
        }
    }

    async fn get(&self, transfer_id: &TransferId) -> BridgeResult<Option<TransferRecord>> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE transfer_id = $1",
            TRANSFER_COLUMNS
        ))
        .bind(transfer_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TransferRecord::try_from).transpose()
    }

    async fn update_status(
        &self,
        transfer_id: &TransferId,
        expected: TransferStatus,
        new: TransferStatus,
        update: TransferUpdate,
    ) -> BridgeResult<TransferRecord> {
        check_transition(expected, new)?;

        let (touch_pending, pending_op_ref) = field_binds(update.pending_op_ref);
        let (touch_reason, failure_reason) = field_binds(update.failure_reason);

        // Reference columns are set-once (COALESCE keeps an existing value)
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            r#"
            UPDATE transfers SET
                status = $3,
                source_lock_ref = COALESCE(source_lock_ref, $4),
                signed_payload_ref = COALESCE(signed_payload_ref, $5),
                destination_op_ref = COALESCE(destination_op_ref, $6),
                refund_op_ref = COALESCE(refund_op_ref, $7),
                protected_metadata = COALESCE(protected_metadata, $8),
                pending_op_ref = CASE WHEN $9 THEN $10 ELSE pending_op_ref END,
                attempts = COALESCE($11, attempts),
                failure_reason = CASE WHEN $12 THEN $13 ELSE failure_reason END,
                settled_at = CASE WHEN $14 THEN COALESCE(settled_at, NOW()) ELSE settled_at END,
                updated_at = NOW()
            WHERE transfer_id = $1 AND status = $2
            RETURNING {}
            "#,
            TRANSFER_COLUMNS
        ))
        .bind(transfer_id.0)
        .bind(expected)
        .bind(new)
        .bind(update.source_lock_ref)
        .bind(update.signed_payload_ref)
        .bind(update.destination_op_ref)
        .bind(update.refund_op_ref)
        .bind(update.protected_metadata.map(Json))
        .bind(touch_pending)
        .bind(pending_op_ref)
        .bind(update.attempts.map(|a| a as i32))
        .bind(touch_reason)
        .bind(failure_reason)
        .bind(update.settled)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!(transfer_id = %transfer_id, "SQL error updating transfer status: {:?}", e);
            e
        })?;

        if let Some(row) = row {
            return TransferRecord::try_from(row);
        }

        // CAS missed: report what is actually stored
        match self.get(transfer_id).await? {
            Some(current) => Err(BridgeError::StaleStatus {
                transfer_id: *transfer_id,
                expected,
                actual: current.status,
            }),
            None => Err(BridgeError::NotFound(*transfer_id)),
        }
    }

    async fn list_by_status(&self, status: TransferStatus) -> BridgeResult<Vec<TransferRecord>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE status = $1 ORDER BY created_at",
            TRANSFER_COLUMNS
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn list_unsettled(&self, status: TransferStatus) -> BridgeResult<Vec<TransferRecord>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "SELECT {} FROM transfers WHERE status = $1 AND settled_at IS NULL ORDER BY created_at",
            TRANSFER_COLUMNS
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TransferRecord::try_from).collect()
    }

    async fn count_by_status(&self) -> BridgeResult<Vec<(TransferStatus, i64)>> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM transfers GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts: Vec<(TransferStatus, i64)> =
            TransferStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for (status, count) in rows {
            let status: TransferStatus = status.parse()?;
            if let Some(slot) = counts.iter_mut().find(|(s, _)| *s == status) {
                slot.1 = count;
            }
        }
        Ok(counts)
    }
}
