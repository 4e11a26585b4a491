use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::codec::ProtectedPayload;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{TransferId, TransferRecord};

// Note: amount is stored as NUMERIC(78,0). Inserts cast the text value
// ($n::NUMERIC) and reads select amount::TEXT, so the row carries a String.

/// Row of the `transfers` table
#[derive(Debug, Clone, FromRow)]
pub struct TransferRow {
    pub transfer_id: Uuid,
    pub source_chain: String,
    pub destination_chain: String,
    pub amount: String,
    pub sender: String,
    pub recipient: String,
    pub status: String,
    pub source_lock_ref: Option<String>,
    pub signed_payload_ref: Option<String>,
    pub destination_op_ref: Option<String>,
    pub refund_op_ref: Option<String>,
    pub pending_op_ref: Option<String>,
    pub protected_metadata: Option<Json<ProtectedPayload>>,
    pub attempts: i32,
    pub failure_reason: Option<String>,
    pub settled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Column list shared by every SELECT
pub(crate) const TRANSFER_COLUMNS: &str = r#"transfer_id, source_chain, destination_chain,
    amount::TEXT AS amount, sender, recipient, status, source_lock_ref, signed_payload_ref,
    destination_op_ref, refund_op_ref, pending_op_ref, protected_metadata, attempts,
    failure_reason, settled_at, expires_at, created_at, updated_at"#;

impl TryFrom<TransferRow> for TransferRecord {
    type Error = BridgeError;

    fn try_from(row: TransferRow) -> BridgeResult<Self> {
        let amount = row
            .amount
            .parse::<u128>()
            .map_err(|e| BridgeError::Storage(format!("bad amount {}: {}", row.amount, e)))?;
        let attempts = u32::try_from(row.attempts)
            .map_err(|_| BridgeError::Storage(format!("negative attempts {}", row.attempts)))?;

        Ok(TransferRecord {
            transfer_id: TransferId(row.transfer_id),
            source_chain: row
                .source_chain
                .parse()
                .map_err(|_| BridgeError::Storage(format!("unknown chain {}", row.source_chain)))?,
            destination_chain: row.destination_chain.parse().map_err(|_| {
                BridgeError::Storage(format!("unknown chain {}", row.destination_chain))
            })?,
            amount,
            sender: row.sender,
            recipient: row.recipient,
            status: row.status.parse()?,
            source_lock_ref: row.source_lock_ref,
            signed_payload_ref: row.signed_payload_ref,
            destination_op_ref: row.destination_op_ref,
            refund_op_ref: row.refund_op_ref,
            pending_op_ref: row.pending_op_ref,
            protected_metadata: row.protected_metadata.map(|json| json.0),
            attempts,
            failure_reason: row.failure_reason,
            settled_at: row.settled_at,
            expires_at: row.expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
