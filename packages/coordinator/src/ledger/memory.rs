//! Non-durable ledger for tests and local runs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::{check_transition, TransferLedger, TransferUpdate};
use crate::error::{BridgeError, BridgeResult};
use crate::types::{TransferId, TransferRecord, TransferStatus};

#[derive(Debug, Default)]
pub struct MemoryLedger {
    records: RwLock<HashMap<TransferId, TransferRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransferLedger for MemoryLedger {
    async fn create(&self, record: &TransferRecord) -> BridgeResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.transfer_id) {
            return Err(BridgeError::DuplicateTransferId(record.transfer_id));
        }
        records.insert(record.transfer_id, record.clone());
        Ok(())
    }

    async fn get(&self, transfer_id: &TransferId) -> BridgeResult<Option<TransferRecord>> {
        Ok(self.records.read().await.get(transfer_id).cloned())
    }

    async fn update_status(
        &self,
        transfer_id: &TransferId,
        expected: TransferStatus,
        new: TransferStatus,
        update: TransferUpdate,
    ) -> BridgeResult<TransferRecord> {
        check_transition(expected, new)?;

        let mut records = self.records.write().await;
        let record = records
            .get_mut(transfer_id)
            .ok_or(BridgeError::NotFound(*transfer_id))?;

        if record.status != expected {
            return Err(BridgeError::StaleStatus {
                transfer_id: *transfer_id,
                expected,
                actual: record.status,
            });
        }

        update.apply_to(record);
        record.status = new;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn list_by_status(&self, status: TransferStatus) -> BridgeResult<Vec<TransferRecord>> {
        let mut matching: Vec<TransferRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.status == status)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.created_at);
        Ok(matching)
    }

    async fn list_unsettled(&self, status: TransferStatus) -> BridgeResult<Vec<TransferRecord>> {
        let mut matching = self.list_by_status(status).await?;
        matching.retain(|r| r.settled_at.is_none());
        Ok(matching)
    }

    async fn count_by_status(&self) -> BridgeResult<Vec<(TransferStatus, i64)>> {
        let records = self.records.read().await;
        Ok(TransferStatus::ALL
            .into_iter()
            .map(|status| {
                let count = records.values().filter(|r| r.status == status).count() as i64;
                (status, count)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Chain, TransferRequest};

    fn record() -> TransferRecord {
        let request = TransferRequest {
            transfer_id: None,
            source_chain: Chain::Near,
            destination_chain: Chain::Ethereum,
            amount: 1_000,
            sender: "alice.near".to_string(),
            recipient: "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0".to_string(),
        };
        TransferRecord::initiated(TransferId::new(), &request, chrono::Duration::hours(1))
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate() {
        let ledger = MemoryLedger::new();
        let record = record();
        ledger.create(&record).await.unwrap();
        assert_eq!(
            ledger.create(&record).await,
            Err(BridgeError::DuplicateTransferId(record.transfer_id))
        );
    }

    #[tokio::test]
    async fn test_stale_cas_never_mutates() {
        let ledger = MemoryLedger::new();
        let record = record();
        ledger.create(&record).await.unwrap();

        let err = ledger
            .update_status(
                &record.transfer_id,
                TransferStatus::Locked,
                TransferStatus::Signed,
                TransferUpdate::new().signed_payload_ref("0xsig"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::StaleStatus {
                actual: TransferStatus::Initiated,
                ..
            }
        ));

        let stored = ledger.get(&record.transfer_id).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_cas_applies_update() {
        let ledger = MemoryLedger::new();
        let record = record();
        ledger.create(&record).await.unwrap();

        let updated = ledger
            .update_status(
                &record.transfer_id,
                TransferStatus::Initiated,
                TransferStatus::Locked,
                TransferUpdate::new().source_lock_ref("lock-tx").clear_pending_op(),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, TransferStatus::Locked);
        assert_eq!(updated.source_lock_ref.as_deref(), Some("lock-tx"));
        assert_eq!(updated.amount, record.amount);

        let locked = ledger.list_by_status(TransferStatus::Locked).await.unwrap();
        assert_eq!(locked.len(), 1);

        let counts = ledger.count_by_status().await.unwrap();
        assert_eq!(counts.len(), TransferStatus::ALL.len());
        assert!(counts.contains(&(TransferStatus::Locked, 1)));
        assert!(counts.contains(&(TransferStatus::Initiated, 0)));
    }

    #[tokio::test]
    async fn test_settled_records_drop_out_of_unsettled_listing() {
        let ledger = MemoryLedger::new();
        let record = record();
        ledger.create(&record).await.unwrap();
        ledger
            .update_status(
                &record.transfer_id,
                TransferStatus::Initiated,
                TransferStatus::LockFailed,
                TransferUpdate::new().failure_reason("transfer failed: InsufficientFunds"),
            )
            .await
            .unwrap();
        assert_eq!(
            ledger.list_unsettled(TransferStatus::LockFailed).await.unwrap().len(),
            1
        );

        ledger
            .update_status(
                &record.transfer_id,
                TransferStatus::LockFailed,
                TransferStatus::LockFailed,
                TransferUpdate::new().settled(),
            )
            .await
            .unwrap();
        assert!(ledger
            .list_unsettled(TransferStatus::LockFailed)
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            ledger.list_by_status(TransferStatus::LockFailed).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_update_unknown_id_is_not_found() {
        let ledger = MemoryLedger::new();
        let id = TransferId::new();
        assert_eq!(
            ledger
                .update_status(
                    &id,
                    TransferStatus::Initiated,
                    TransferStatus::Locked,
                    TransferUpdate::new()
                )
                .await
                .unwrap_err(),
            BridgeError::NotFound(id)
        );
    }
}
