//! Transfer ledger
//!
//! Durable store of transfer records. The ledger owns uniqueness of
//! `transfer_id` and serializes status changes with compare-and-set; the
//! coordinator is its only writer of transitions. Records are never deleted.

pub mod memory;
pub mod models;
pub mod postgres;

use async_trait::async_trait;
use chrono::Utc;

use crate::codec::ProtectedPayload;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{TransferId, TransferRecord, TransferStatus};

pub use memory::MemoryLedger;
pub use postgres::PgLedger;

/// Update applied to a nullable column
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FieldUpdate<T> {
    #[default]
    Keep,
    Set(T),
    Clear,
}

impl<T> FieldUpdate<T> {
    pub fn apply(self, current: &mut Option<T>) {
        match self {
            FieldUpdate::Keep => {}
            FieldUpdate::Set(value) => *current = Some(value),
            FieldUpdate::Clear => *current = None,
        }
    }
}

/// Fields written alongside a status change
///
/// Reference fields are set-once: a value is stored only when the column is
/// still empty. `amount` is not updatable.
#[derive(Debug, Clone, Default)]
pub struct TransferUpdate {
    pub source_lock_ref: Option<String>,
    pub signed_payload_ref: Option<String>,
    pub destination_op_ref: Option<String>,
    pub refund_op_ref: Option<String>,
    pub protected_metadata: Option<ProtectedPayload>,
    pub pending_op_ref: FieldUpdate<String>,
    pub attempts: Option<u32>,
    pub failure_reason: FieldUpdate<String>,
    /// Stamp `settled_at` (set-once)
    pub settled: bool,
}

impl TransferUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source_lock_ref(mut self, op_ref: impl Into<String>) -> Self {
        self.source_lock_ref = Some(op_ref.into());
        self
    }

    pub fn signed_payload_ref(mut self, op_ref: impl Into<String>) -> Self {
        self.signed_payload_ref = Some(op_ref.into());
        self
    }

    pub fn destination_op_ref(mut self, op_ref: impl Into<String>) -> Self {
        self.destination_op_ref = Some(op_ref.into());
        self
    }

    pub fn refund_op_ref(mut self, op_ref: impl Into<String>) -> Self {
        self.refund_op_ref = Some(op_ref.into());
        self
    }

    pub fn protected_metadata(mut self, metadata: ProtectedPayload) -> Self {
        self.protected_metadata = Some(metadata);
        self
    }

    pub fn pending_op_ref(mut self, op_ref: impl Into<String>) -> Self {
        self.pending_op_ref = FieldUpdate::Set(op_ref.into());
        self
    }

    pub fn clear_pending_op(mut self) -> Self {
        self.pending_op_ref = FieldUpdate::Clear;
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = FieldUpdate::Set(reason.into());
        self
    }

    pub fn settled(mut self) -> Self {
        self.settled = true;
        self
    }

    /// Apply to an in-memory record (set-once semantics for refs)
    pub fn apply_to(self, record: &mut TransferRecord) {
        fn set_once<T>(slot: &mut Option<T>, value: Option<T>) {
            if slot.is_none() {
                if let Some(value) = value {
                    *slot = Some(value);
                }
            }
        }

        set_once(&mut record.source_lock_ref, self.source_lock_ref);
        set_once(&mut record.signed_payload_ref, self.signed_payload_ref);
        set_once(&mut record.destination_op_ref, self.destination_op_ref);
        set_once(&mut record.refund_op_ref, self.refund_op_ref);
        set_once(&mut record.protected_metadata, self.protected_metadata);
        self.pending_op_ref.apply(&mut record.pending_op_ref);
        self.failure_reason.apply(&mut record.failure_reason);
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if self.settled && record.settled_at.is_none() {
            record.settled_at = Some(Utc::now());
        }
    }
}

/// Reject updates that are not an edge of the state machine
pub fn check_transition(from: TransferStatus, to: TransferStatus) -> BridgeResult<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(BridgeError::IllegalTransition { from, to })
    }
}

#[async_trait]
pub trait TransferLedger: Send + Sync {
    /// Insert a new record; fails with `DuplicateTransferId` if the id exists
    async fn create(&self, record: &TransferRecord) -> BridgeResult<()>;

    async fn get(&self, transfer_id: &TransferId) -> BridgeResult<Option<TransferRecord>>;

    /// Compare-and-set: applies only while the stored status is `expected`,
    /// otherwise fails with `StaleStatus` and changes nothing
    async fn update_status(
        &self,
        transfer_id: &TransferId,
        expected: TransferStatus,
        new: TransferStatus,
        update: TransferUpdate,
    ) -> BridgeResult<TransferRecord>;

    async fn list_by_status(&self, status: TransferStatus) -> BridgeResult<Vec<TransferRecord>>;

    /// Like `list_by_status`, without records whose `settled_at` is set
    async fn list_unsettled(&self, status: TransferStatus) -> BridgeResult<Vec<TransferRecord>>;

    /// Record counts for every status, zero counts included
    async fn count_by_status(&self) -> BridgeResult<Vec<(TransferStatus, i64)>>;
}
