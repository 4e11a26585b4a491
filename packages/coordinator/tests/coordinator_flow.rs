//! Coordinator lifecycle tests
//!
//! Run with: cargo test --test coordinator_flow
//!
//! Chains and the MPC network are scripted doubles; the ledger is the
//! in-memory implementation. Retry and polling budgets are in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use coordinator::codec::{KeyRing, PayloadCodec, PayloadKey};
use coordinator::coordinator::retry::{FinalityConfig, RetryConfig};
use coordinator::ledger::{MemoryLedger, TransferLedger, TransferUpdate};
use coordinator::types::{Chain, TransferId, TransferRequest, TransferStatus};
use coordinator::{BridgeError, Settings, TransferCoordinator};

use coordinator::chain::{ChainRegistry, Finality, OpKind};

mod helpers {
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use k256::ecdsa::SigningKey;
    use k256::FieldBytes;

    use coordinator::chain::{ChainAdapter, Finality, OpKind, PendingOp, ReleaseAuthorization};
    use coordinator::codec::ProtectedPayload;
    use coordinator::ledger::{MemoryLedger, TransferLedger, TransferUpdate};
    use coordinator::signer::{ForeignAddress, Signature, SignatureService};
    use coordinator::types::{Chain, TransferId, TransferStatus};
    use coordinator::{BridgeError, BridgeResult};

    #[derive(Default)]
    struct ChainState {
        scripts: HashMap<OpKind, VecDeque<BridgeError>>,
        finality: HashMap<OpKind, Finality>,
        op_kinds: HashMap<String, OpKind>,
        landed: HashMap<(OpKind, TransferId), String>,
        submissions: HashMap<OpKind, u32>,
        lookups: HashMap<OpKind, u32>,
        finality_queries: u32,
        next_op: u32,
    }

    /// Chain double: submissions fail with scripted errors first, then land
    pub struct ScriptedChain {
        chain: Chain,
        state: Mutex<ChainState>,
    }

    impl ScriptedChain {
        pub fn new(chain: Chain) -> Self {
            Self {
                chain,
                state: Mutex::new(ChainState::default()),
            }
        }

        /// Queue errors returned by the next submissions of `kind`
        pub fn fail_next(&self, kind: OpKind, errors: Vec<BridgeError>) {
            let mut state = self.state.lock().unwrap();
            state.scripts.entry(kind).or_default().extend(errors);
        }

        /// Finality reported for operations of `kind` (default Confirmed)
        pub fn set_finality(&self, kind: OpKind, finality: Finality) {
            self.state.lock().unwrap().finality.insert(kind, finality);
        }

        /// Record an operation as already landed on chain
        pub fn land(&self, kind: OpKind, transfer_id: TransferId, op_ref: &str) {
            let mut state = self.state.lock().unwrap();
            state.op_kinds.insert(op_ref.to_string(), kind);
            state.landed.insert((kind, transfer_id), op_ref.to_string());
        }

        /// Submission calls made for `kind`, failed ones included
        pub fn submissions(&self, kind: OpKind) -> u32 {
            self.state
                .lock()
                .unwrap()
                .submissions
                .get(&kind)
                .copied()
                .unwrap_or(0)
        }

        /// `find_operation` calls made for `kind`
        pub fn lookups(&self, kind: OpKind) -> u32 {
            self.state
                .lock()
                .unwrap()
                .lookups
                .get(&kind)
                .copied()
                .unwrap_or(0)
        }

        pub fn finality_queries(&self) -> u32 {
            self.state.lock().unwrap().finality_queries
        }

        /// Operations of `kind` that landed on chain
        pub fn landed_count(&self, kind: OpKind) -> usize {
            self.state
                .lock()
                .unwrap()
                .landed
                .keys()
                .filter(|(k, _)| *k == kind)
                .count()
        }

        fn submit(&self, kind: OpKind, transfer_id: &TransferId) -> BridgeResult<PendingOp> {
            let mut state = self.state.lock().unwrap();
            *state.submissions.entry(kind).or_default() += 1;
            if let Some(error) = state.scripts.get_mut(&kind).and_then(|q| q.pop_front()) {
                return Err(error);
            }
            state.next_op += 1;
            let op_ref = format!("{}-{}-{}", self.chain, kind, state.next_op);
            state.op_kinds.insert(op_ref.clone(), kind);
            state.landed.insert((kind, *transfer_id), op_ref.clone());
            Ok(PendingOp::new(op_ref))
        }
    }

    #[async_trait]
    impl ChainAdapter for ScriptedChain {
        fn chain(&self) -> Chain {
            self.chain
        }

        async fn submit_lock(
            &self,
            transfer_id: &TransferId,
            _sender: &str,
            _amount: u128,
            _metadata: &ProtectedPayload,
        ) -> BridgeResult<PendingOp> {
            self.submit(OpKind::Lock, transfer_id)
        }

        async fn submit_release(
            &self,
            transfer_id: &TransferId,
            _amount: u128,
            _recipient: &str,
            _authorization: &ReleaseAuthorization,
        ) -> BridgeResult<PendingOp> {
            self.submit(OpKind::Release, transfer_id)
        }

        async fn submit_refund(
            &self,
            transfer_id: &TransferId,
            _sender: &str,
            _amount: u128,
        ) -> BridgeResult<PendingOp> {
            self.submit(OpKind::Refund, transfer_id)
        }

        async fn query_finality(&self, op_ref: &str) -> BridgeResult<Finality> {
            let mut state = self.state.lock().unwrap();
            state.finality_queries += 1;
            let kind = state
                .op_kinds
                .get(op_ref)
                .ok_or_else(|| BridgeError::ChainUnavailable(format!("unknown op {}", op_ref)))?;
            Ok(state
                .finality
                .get(kind)
                .copied()
                .unwrap_or(Finality::Confirmed))
        }

        async fn find_operation(
            &self,
            kind: OpKind,
            transfer_id: &TransferId,
        ) -> BridgeResult<Option<PendingOp>> {
            let mut state = self.state.lock().unwrap();
            *state.lookups.entry(kind).or_default() += 1;
            Ok(state
                .landed
                .get(&(kind, *transfer_id))
                .map(|op_ref| PendingOp::new(op_ref.clone())))
        }
    }

    /// MPC double signing with a local key
    pub struct ScriptedSigner {
        key: SigningKey,
        failures: Mutex<VecDeque<BridgeError>>,
        calls: AtomicU32,
        refund_while_signing: Mutex<Option<(Arc<MemoryLedger>, TransferId)>>,
    }

    impl ScriptedSigner {
        pub fn new() -> Self {
            Self {
                key: SigningKey::from_bytes(&FieldBytes::from([9u8; 32])).unwrap(),
                failures: Mutex::new(VecDeque::new()),
                calls: AtomicU32::new(0),
                refund_while_signing: Mutex::new(None),
            }
        }

        pub fn fail_next(&self, errors: Vec<BridgeError>) {
            self.failures.lock().unwrap().extend(errors);
        }

        /// While the next signature is in flight, another writer moves the
        /// transfer from LOCKED to REFUND_PENDING
        pub fn refund_while_signing(&self, ledger: Arc<MemoryLedger>, transfer_id: TransferId) {
            *self.refund_while_signing.lock().unwrap() = Some((ledger, transfer_id));
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn sign_now(&self, digest: &[u8; 32]) -> Signature {
            let (signature, recovery_id) = self.key.sign_prehash_recoverable(digest).unwrap();
            let (r, s) = signature.split_bytes();
            let prefix = if recovery_id.is_y_odd() { 0x03 } else { 0x02 };
            let mut big_r = vec![prefix];
            big_r.extend_from_slice(&r);
            Signature {
                big_r: hex::encode(big_r),
                s: hex::encode(s),
                recovery_id: recovery_id.to_byte(),
            }
        }
    }

    #[async_trait]
    impl SignatureService for ScriptedSigner {
        fn derive_foreign_address(
            &self,
            source_account: &str,
            target_chain: Chain,
            derivation_path: &str,
        ) -> BridgeResult<ForeignAddress> {
            Ok(ForeignAddress {
                chain: target_chain,
                address: format!("{}/{}", source_account, derivation_path),
                public_key: String::new(),
            })
        }

        async fn sign(&self, payload: &[u8], _derivation_path: &str) -> BridgeResult<Signature> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let concurrent = self.refund_while_signing.lock().unwrap().take();
            if let Some((ledger, transfer_id)) = concurrent {
                ledger
                    .update_status(
                        &transfer_id,
                        TransferStatus::Locked,
                        TransferStatus::RefundPending,
                        TransferUpdate::new().attempts(0),
                    )
                    .await?;
            }
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }
            let digest: [u8; 32] = payload
                .try_into()
                .map_err(|_| BridgeError::PayloadRejected("not 32 bytes".into()))?;
            Ok(self.sign_now(&digest))
        }
    }
}

use helpers::{ScriptedChain, ScriptedSigner};

const SENDER: &str = "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0";
const RECIPIENT: &str = "alice.near";
const KEY_ID: &str = "k1";

struct Harness {
    coordinator: Arc<TransferCoordinator>,
    ledger: Arc<MemoryLedger>,
    eth: Arc<ScriptedChain>,
    near: Arc<ScriptedChain>,
    signer: Arc<ScriptedSigner>,
    codec: PayloadCodec,
}

fn settings(ttl: chrono::Duration) -> Settings {
    Settings {
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            attempt_timeout: Duration::from_millis(500),
        },
        finality: FinalityConfig {
            poll_interval: Duration::from_millis(1),
            max_polls: 3,
        },
        transfer_ttl: ttl,
        poll_interval: Duration::from_millis(10),
        key_id: KEY_ID.to_string(),
        derivation_path: "bridge-release".to_string(),
    }
}

fn harness_with_ttl(ttl: chrono::Duration) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let eth = Arc::new(ScriptedChain::new(Chain::Ethereum));
    let near = Arc::new(ScriptedChain::new(Chain::Near));
    let signer = Arc::new(ScriptedSigner::new());
    let codec = PayloadCodec::new(KeyRing::new().with_key(KEY_ID, PayloadKey::new([7u8; 32])));

    let chains = ChainRegistry::new().with(eth.clone()).with(near.clone());
    let coordinator = TransferCoordinator::new(
        ledger.clone(),
        chains,
        signer.clone(),
        codec.clone(),
        settings(ttl),
    )
    .unwrap();

    Harness {
        coordinator: Arc::new(coordinator),
        ledger,
        eth,
        near,
        signer,
        codec,
    }
}

fn harness() -> Harness {
    harness_with_ttl(chrono::Duration::hours(1))
}

fn request(amount: u128) -> TransferRequest {
    TransferRequest {
        transfer_id: None,
        source_chain: Chain::Ethereum,
        destination_chain: Chain::Near,
        amount,
        sender: SENDER.to_string(),
        recipient: RECIPIENT.to_string(),
    }
}

// ============================================================================
// Happy path and idempotency
// ============================================================================

#[tokio::test]
async fn test_happy_path_completes_with_all_refs() {
    let h = harness();
    let id = h.coordinator.request_transfer(request(1_000)).await.unwrap();

    let status = h.coordinator.drive(id).await.unwrap();
    assert_eq!(status, TransferStatus::Completed);

    let record = h.coordinator.get_status(&id).await.unwrap();
    assert!(record.source_lock_ref.is_some());
    assert!(record.signed_payload_ref.is_some());
    assert!(record.destination_op_ref.is_some());
    assert!(record.pending_op_ref.is_none());
    assert!(record.protected_metadata.is_some());
    assert_eq!(record.amount, 1_000);

    assert_eq!(h.eth.landed_count(OpKind::Lock), 1);
    assert_eq!(h.near.landed_count(OpKind::Release), 1);
    assert_eq!(h.eth.landed_count(OpKind::Refund), 0);
}

#[tokio::test]
async fn test_reverse_route_completes() {
    let h = harness();
    let id = h
        .coordinator
        .request_transfer(TransferRequest {
            transfer_id: None,
            source_chain: Chain::Near,
            destination_chain: Chain::Ethereum,
            amount: 5,
            sender: "bob.near".to_string(),
            recipient: SENDER.to_string(),
        })
        .await
        .unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::Completed);
    assert_eq!(h.near.landed_count(OpKind::Lock), 1);
    assert_eq!(h.eth.landed_count(OpKind::Release), 1);
}

#[tokio::test]
async fn test_resubmitted_request_locks_once() {
    let h = harness();
    let id = TransferId::new();
    let mut req = request(42);
    req.transfer_id = Some(id);

    assert_eq!(h.coordinator.request_transfer(req.clone()).await.unwrap(), id);
    assert_eq!(h.coordinator.request_transfer(req.clone()).await.unwrap(), id);

    let (a, b) = tokio::join!(h.coordinator.drive(id), h.coordinator.drive(id));
    a.unwrap();
    b.unwrap();
    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::Completed);

    assert_eq!(h.coordinator.request_transfer(req).await.unwrap(), id);
    assert_eq!(h.eth.submissions(OpKind::Lock), 1);
    assert_eq!(h.near.submissions(OpKind::Release), 1);
    assert_eq!(h.ledger.list_by_status(TransferStatus::Completed).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_conflicting_request_with_same_id_is_rejected() {
    let h = harness();
    let id = TransferId::new();
    let mut req = request(42);
    req.transfer_id = Some(id);
    h.coordinator.request_transfer(req.clone()).await.unwrap();

    req.amount = 43;
    assert_eq!(
        h.coordinator.request_transfer(req).await,
        Err(BridgeError::ConflictingRequest(id))
    );
}

#[tokio::test]
async fn test_invalid_requests_create_no_record() {
    let h = harness();

    assert_eq!(
        h.coordinator.request_transfer(request(0)).await,
        Err(BridgeError::InvalidAmount)
    );

    let mut same_chain = request(1);
    same_chain.destination_chain = Chain::Ethereum;
    same_chain.recipient = SENDER.to_string();
    assert!(matches!(
        h.coordinator.request_transfer(same_chain).await,
        Err(BridgeError::UnsupportedRoute(..))
    ));

    let mut bad_recipient = request(1);
    bad_recipient.recipient = "Alice!".to_string();
    assert!(matches!(
        h.coordinator.request_transfer(bad_recipient).await,
        Err(BridgeError::InvalidRecipient(_))
    ));

    let counts = h.ledger.count_by_status().await.unwrap();
    assert!(counts.iter().all(|(_, n)| *n == 0));
}

// ============================================================================
// Lock failures
// ============================================================================

#[tokio::test]
async fn test_insufficient_funds_goes_straight_to_lock_failed() {
    let h = harness();
    h.eth.fail_next(
        OpKind::Lock,
        vec![BridgeError::InsufficientFunds("balance 0".into())],
    );
    let id = h.coordinator.request_transfer(request(1_000)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::LockFailed);
    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("transfer failed: InsufficientFunds")
    );
    assert!(record.source_lock_ref.is_none());
    assert!(record.settled_at.is_some());
    assert_eq!(h.eth.submissions(OpKind::Lock), 1);

    // No funds moved: the sweep leaves it alone
    h.coordinator.sweep_expired().await.unwrap();
    assert_eq!(
        h.coordinator.get_status(&id).await.unwrap().status,
        TransferStatus::LockFailed
    );
    assert_eq!(h.eth.submissions(OpKind::Refund), 0);
    assert_eq!(h.signer.calls(), 0);
}

#[tokio::test]
async fn test_settled_lock_failure_is_not_rescanned() {
    let h = harness();
    h.eth.fail_next(
        OpKind::Lock,
        vec![BridgeError::InsufficientFunds("balance 0".into())],
    );
    let id = h.coordinator.request_transfer(request(1_000)).await.unwrap();
    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::LockFailed);
    let settled = h.coordinator.get_status(&id).await.unwrap();

    for _ in 0..3 {
        assert_eq!(h.coordinator.recover().await.unwrap(), 0);
        assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 0);
    }

    assert_eq!(h.eth.lookups(OpKind::Lock), 0);
    assert_eq!(h.eth.finality_queries(), 0);
    assert_eq!(h.eth.submissions(OpKind::Lock), 1);
    assert_eq!(h.coordinator.get_status(&id).await.unwrap(), settled);
}

#[tokio::test]
async fn test_unsettled_lock_failure_keeps_watching_for_late_lock() {
    let h = harness();
    h.eth.fail_next(
        OpKind::Lock,
        vec![
            BridgeError::ChainUnavailable("down".into()),
            BridgeError::ChainUnavailable("down".into()),
            BridgeError::ChainUnavailable("down".into()),
        ],
    );
    let id = h.coordinator.request_transfer(request(7)).await.unwrap();
    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::LockFailed);
    assert!(h.coordinator.get_status(&id).await.unwrap().settled_at.is_none());

    // A timed-out submission landed after all
    h.eth.land(OpKind::Lock, id, "eth-lock-late");
    assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 1);

    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Refunded);
    assert_eq!(record.source_lock_ref.as_deref(), Some("eth-lock-late"));
}

#[tokio::test]
async fn test_transient_lock_errors_are_retried() {
    let h = harness();
    h.eth.fail_next(
        OpKind::Lock,
        vec![
            BridgeError::ChainUnavailable("503".into()),
            BridgeError::ChainUnavailable("timeout".into()),
        ],
    );
    let id = h.coordinator.request_transfer(request(7)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::Completed);
    assert_eq!(h.eth.submissions(OpKind::Lock), 3);
    assert_eq!(h.eth.landed_count(OpKind::Lock), 1);
}

#[tokio::test]
async fn test_lock_retry_exhaustion_fails_lock() {
    let h = harness();
    h.eth.fail_next(
        OpKind::Lock,
        vec![
            BridgeError::ChainUnavailable("down".into()),
            BridgeError::ChainUnavailable("down".into()),
            BridgeError::ChainUnavailable("down".into()),
        ],
    );
    let id = h.coordinator.request_transfer(request(7)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::LockFailed);
    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(record.attempts, 3);
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("transfer failed: ChainUnavailable")
    );
}

#[tokio::test]
async fn test_reverted_lock_fails_without_refund() {
    let h = harness();
    h.eth.set_finality(OpKind::Lock, Finality::Reverted);
    let id = h.coordinator.request_transfer(request(7)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::LockFailed);
    assert!(h.coordinator.get_status(&id).await.unwrap().settled_at.is_some());
    assert_eq!(h.eth.submissions(OpKind::Refund), 0);
}

#[tokio::test]
async fn test_late_confirmed_lock_is_refunded() {
    let h = harness();
    h.eth.set_finality(OpKind::Lock, Finality::Pending);
    let id = h.coordinator.request_transfer(request(7)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::LockFailed);
    assert!(h.coordinator.get_status(&id).await.unwrap().pending_op_ref.is_some());

    h.eth.set_finality(OpKind::Lock, Finality::Confirmed);
    assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 1);

    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Refunded);
    assert!(record.source_lock_ref.is_some());
    assert!(record.refund_op_ref.is_some());
}

// ============================================================================
// Signing and release failures
// ============================================================================

#[tokio::test]
async fn test_signing_exhaustion_is_refunded_after_expiry() {
    let h = harness_with_ttl(chrono::Duration::milliseconds(300));
    h.signer.fail_next(vec![
        BridgeError::SigningUnavailable("mpc busy".into()),
        BridgeError::SigningUnavailable("mpc busy".into()),
        BridgeError::SigningUnavailable("mpc busy".into()),
    ]);
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::SignFailed);
    assert_eq!(h.signer.calls(), 3);

    // Not refunded before expiry
    assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 0);
    assert_eq!(
        h.coordinator.get_status(&id).await.unwrap().status,
        TransferStatus::SignFailed
    );

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 1);

    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Refunded);
    assert!(record.refund_op_ref.is_some());
    assert!(record.destination_op_ref.is_none());
    assert_eq!(h.eth.landed_count(OpKind::Refund), 1);
    assert_eq!(h.near.submissions(OpKind::Release), 0);
}

#[tokio::test]
async fn test_rejected_authorization_is_refunded() {
    let h = harness();
    h.near.fail_next(
        OpKind::Release,
        vec![BridgeError::AuthorizationInvalid("bad signature".into())],
    );
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::Refunded);
    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(h.near.submissions(OpKind::Release), 1);
    assert!(record.destination_op_ref.is_none());
    assert!(record.refund_op_ref.is_some());
}

#[tokio::test]
async fn test_reverted_release_is_refunded() {
    let h = harness();
    h.near.set_finality(OpKind::Release, Finality::Reverted);
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::Refunded);
    let record = h.coordinator.get_status(&id).await.unwrap();
    assert!(record.destination_op_ref.is_some());
    assert!(record.refund_op_ref.is_some());
}

#[tokio::test]
async fn test_release_that_may_still_land_is_never_refunded() {
    let h = harness();
    h.near.set_finality(OpKind::Release, Finality::Pending);
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::MintFailed);
    h.coordinator.sweep_expired().await.unwrap();
    assert_eq!(
        h.coordinator.get_status(&id).await.unwrap().status,
        TransferStatus::MintFailed
    );

    // Landed after all: reconciliation alert, still no refund
    h.near.set_finality(OpKind::Release, Finality::Confirmed);
    h.coordinator.sweep_expired().await.unwrap();
    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::MintFailed);
    assert!(record.settled_at.is_some());
    assert_eq!(h.eth.submissions(OpKind::Refund), 0);

    // The alert is raised once; later ticks never look at the record again
    let queries = h.near.finality_queries();
    for _ in 0..3 {
        h.coordinator.recover().await.unwrap();
        h.coordinator.sweep_expired().await.unwrap();
    }
    assert_eq!(h.near.finality_queries(), queries);
    assert_eq!(h.near.lookups(OpKind::Release), 0);
    assert_eq!(h.coordinator.get_status(&id).await.unwrap(), record);
}

#[tokio::test]
async fn test_tampered_metadata_aborts_release() {
    let h = harness();
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();
    let record = h.coordinator.get_status(&id).await.unwrap();

    let mut protected = h
        .codec
        .protect(&record.payload().to_bytes(), KEY_ID)
        .unwrap();
    protected.ciphertext[0] ^= 0x01;

    h.ledger
        .update_status(
            &id,
            TransferStatus::Initiated,
            TransferStatus::Locked,
            TransferUpdate::new()
                .source_lock_ref("eth-lock-external")
                .protected_metadata(protected),
        )
        .await
        .unwrap();
    let signature = h.signer.sign_now(&[1u8; 32]);
    h.ledger
        .update_status(
            &id,
            TransferStatus::Locked,
            TransferStatus::Signed,
            TransferUpdate::new().signed_payload_ref(signature.to_ref().unwrap()),
        )
        .await
        .unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::Refunded);
    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(
        record.failure_reason.as_deref(),
        Some("transfer failed: IntegrityError")
    );
    assert_eq!(h.near.submissions(OpKind::Release), 0);
}

// ============================================================================
// Recovery
// ============================================================================

#[tokio::test]
async fn test_recovery_from_locked_never_relocks() {
    let h = harness();
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();
    h.ledger
        .update_status(
            &id,
            TransferStatus::Initiated,
            TransferStatus::Locked,
            TransferUpdate::new().source_lock_ref("eth-lock-before-restart"),
        )
        .await
        .unwrap();

    assert_eq!(h.coordinator.recover().await.unwrap(), 1);

    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(record.source_lock_ref.as_deref(), Some("eth-lock-before-restart"));
    assert_eq!(h.eth.submissions(OpKind::Lock), 0);
}

#[tokio::test]
async fn test_recovery_adopts_lock_that_landed_before_crash() {
    let h = harness();
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();

    // Crash after the write-ahead attempt bump, with the lock already on chain
    h.ledger
        .update_status(
            &id,
            TransferStatus::Initiated,
            TransferStatus::Initiated,
            TransferUpdate::new().attempts(1),
        )
        .await
        .unwrap();
    h.eth.land(OpKind::Lock, id, "eth-lock-landed");

    h.coordinator.recover().await.unwrap();

    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::Completed);
    assert_eq!(record.source_lock_ref.as_deref(), Some("eth-lock-landed"));
    assert_eq!(h.eth.submissions(OpKind::Lock), 0);
}

#[tokio::test]
async fn test_expired_unlocked_transfer_fails_without_refund() {
    let h = harness_with_ttl(chrono::Duration::milliseconds(1));
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.coordinator.recover().await.unwrap();

    let record = h.coordinator.get_status(&id).await.unwrap();
    assert_eq!(record.status, TransferStatus::LockFailed);
    assert_eq!(record.failure_reason.as_deref(), Some("transfer failed: expired"));
    assert!(record.settled_at.is_some());
    assert_eq!(h.eth.submissions(OpKind::Lock), 0);
}

#[tokio::test]
async fn test_concurrent_status_change_is_reread_mid_drive() {
    let h = harness();
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();
    h.signer.refund_while_signing(h.ledger.clone(), id);

    // The SIGNED write misses; the drive re-reads and follows the refund
    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::Refunded);

    let record = h.coordinator.get_status(&id).await.unwrap();
    assert!(record.signed_payload_ref.is_none());
    assert!(record.refund_op_ref.is_some());
    assert_eq!(h.signer.calls(), 1);
    assert_eq!(h.near.submissions(OpKind::Release), 0);
    assert_eq!(h.eth.landed_count(OpKind::Refund), 1);
}

#[tokio::test]
async fn test_transient_refund_errors_leave_refund_pending() {
    let h = harness();
    h.near.fail_next(
        OpKind::Release,
        vec![BridgeError::AuthorizationInvalid("bad signature".into())],
    );
    h.eth.fail_next(
        OpKind::Refund,
        vec![
            BridgeError::ChainUnavailable("down".into()),
            BridgeError::ChainUnavailable("down".into()),
            BridgeError::ChainUnavailable("down".into()),
        ],
    );
    let id = h.coordinator.request_transfer(request(500)).await.unwrap();

    assert_eq!(h.coordinator.drive(id).await.unwrap(), TransferStatus::RefundPending);

    // Next pass submits the refund
    h.coordinator.recover().await.unwrap();
    assert_eq!(
        h.coordinator.get_status(&id).await.unwrap().status,
        TransferStatus::Refunded
    );
    assert_eq!(h.eth.landed_count(OpKind::Refund), 1);
}

#[tokio::test]
async fn test_status_counts_cover_every_status() {
    let h = harness();
    let id = h.coordinator.request_transfer(request(1)).await.unwrap();
    h.coordinator.drive(id).await.unwrap();

    let counts = h.coordinator.status_counts().await.unwrap();
    assert_eq!(counts.len(), TransferStatus::ALL.len());
    assert!(counts.contains(&(TransferStatus::Completed, 1)));
    h.coordinator.refresh_status_gauges().await.unwrap();
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown() {
    let h = harness();
    let id = h.coordinator.request_transfer(request(1)).await.unwrap();

    let (tx, rx) = tokio::sync::mpsc::channel(1);
    let coordinator = h.coordinator.clone();
    let handle = tokio::spawn(async move { coordinator.run(rx).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(()).await.unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(
        h.coordinator.get_status(&id).await.unwrap().status,
        TransferStatus::Completed
    );
}
