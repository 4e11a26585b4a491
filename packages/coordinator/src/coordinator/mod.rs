//! Transfer coordinator
//!
//! Drives each transfer through the lifecycle
//! `INITIATED -> LOCKED -> SIGNED -> MINT_SUBMITTED -> COMPLETED`, routing
//! failures to `*_FAILED` and compensating with `REFUND_PENDING -> REFUNDED`
//! once funds are locked.
//!
//! Every transition is persisted through the ledger CAS before the next
//! external call. Submissions are write-ahead: `attempts` is bumped before
//! a chain call, and a resumed step with `attempts > 0` asks the chain for
//! an operation that may already have landed instead of resubmitting.

pub mod retry;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::chain::{ChainAdapter, ChainRegistry, Finality, OpKind, ReleaseAuthorization};
use crate::codec::{PayloadCodec, ProtectedPayload};
use crate::error::{BridgeError, BridgeResult};
use crate::hash::compute_release_digest;
use crate::ledger::{TransferLedger, TransferUpdate};
use crate::metrics;
use crate::signer::{ForeignAddress, Signature, SignatureService};
use crate::types::{Chain, TransferId, TransferRecord, TransferRequest, TransferStatus};

use retry::{attempt_with_timeout, FinalityConfig, RetryAction, RetryConfig, RetryContext, Step};

/// Consecutive CAS misses tolerated within one drive
const MAX_STALE_RETRIES: u32 = 3;

/// Runtime settings of the coordinator
#[derive(Debug, Clone)]
pub struct Settings {
    pub retry: RetryConfig,
    pub finality: FinalityConfig,
    pub transfer_ttl: chrono::Duration,
    pub poll_interval: Duration,
    /// Key used to protect new payloads
    pub key_id: String,
    /// MPC derivation path of the release signing key
    pub derivation_path: String,
}

/// Outcome of one step of a drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    /// A transition was persisted; re-read and continue
    Advanced,
    /// Nothing more to do until a later sweep
    Parked,
}

/// Membership in the in-flight set, released on drop
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<TransferId>>,
    transfer_id: TransferId,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.in_flight.lock() {
            set.remove(&self.transfer_id);
        }
    }
}

pub struct TransferCoordinator {
    ledger: Arc<dyn TransferLedger>,
    chains: ChainRegistry,
    signer: Arc<dyn SignatureService>,
    codec: PayloadCodec,
    settings: Settings,
    in_flight: Mutex<HashSet<TransferId>>,
}

impl TransferCoordinator {
    pub fn new(
        ledger: Arc<dyn TransferLedger>,
        chains: ChainRegistry,
        signer: Arc<dyn SignatureService>,
        codec: PayloadCodec,
        settings: Settings,
    ) -> BridgeResult<Self> {
        if !codec.has_key(&settings.key_id) {
            return Err(BridgeError::UnknownKey(settings.key_id.clone()));
        }

        Ok(Self {
            ledger,
            chains,
            signer,
            codec,
            settings,
            in_flight: Mutex::new(HashSet::new()),
        })
    }

    // ========================================================================
    // Inbound interface
    // ========================================================================

    /// Validate and record a transfer request. Re-submitting an identical
    /// request returns the existing id without creating a second record.
    pub async fn request_transfer(&self, request: TransferRequest) -> BridgeResult<TransferId> {
        if request.amount == 0 {
            return Err(BridgeError::InvalidAmount);
        }
        if request.source_chain == request.destination_chain {
            return Err(BridgeError::UnsupportedRoute(
                request.source_chain.to_string(),
                request.destination_chain.to_string(),
            ));
        }

        let source = self.chains.get(request.source_chain)?;
        let destination = self.chains.get(request.destination_chain)?;
        source.validate_address(&request.sender)?;
        destination.validate_address(&request.recipient)?;

        let transfer_id = request.transfer_id.unwrap_or_default();
        let record = TransferRecord::initiated(transfer_id, &request, self.settings.transfer_ttl);

        match self.ledger.create(&record).await {
            Ok(()) => {
                metrics::TRANSFERS_REQUESTED.inc();
                info!(
                    transfer_id = %transfer_id,
                    source_chain = %record.source_chain,
                    destination_chain = %record.destination_chain,
                    amount = %record.amount,
                    "Transfer requested"
                );
                Ok(transfer_id)
            }
            Err(BridgeError::DuplicateTransferId(_)) => {
                let existing = self.get_status(&transfer_id).await?;
                if request.matches(&existing) {
                    debug!(transfer_id = %transfer_id, "Duplicate request, returning existing transfer");
                    Ok(transfer_id)
                } else {
                    Err(BridgeError::ConflictingRequest(transfer_id))
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Current snapshot of a transfer
    pub async fn get_status(&self, transfer_id: &TransferId) -> BridgeResult<TransferRecord> {
        self.ledger
            .get(transfer_id)
            .await?
            .ok_or(BridgeError::NotFound(*transfer_id))
    }

    /// Address the MPC network controls on `chain` for `account`
    pub fn derive_address(
        &self,
        account: &str,
        chain: Chain,
        derivation_path: Option<&str>,
    ) -> BridgeResult<ForeignAddress> {
        let path = derivation_path.unwrap_or(&self.settings.derivation_path);
        self.signer.derive_foreign_address(account, chain, path)
    }

    pub async fn status_counts(&self) -> BridgeResult<Vec<(TransferStatus, i64)>> {
        self.ledger.count_by_status().await
    }

    // ========================================================================
    // Driving
    // ========================================================================

    fn try_claim(&self, transfer_id: TransferId) -> Option<Claim<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if set.insert(transfer_id) {
            Some(Claim {
                in_flight: &self.in_flight,
                transfer_id,
            })
        } else {
            None
        }
    }

    /// Advance a transfer as far as it can go now and return the status it
    /// rests in. A transfer already being driven by this process is left
    /// alone.
    pub async fn drive(&self, transfer_id: TransferId) -> BridgeResult<TransferStatus> {
        let Some(_claim) = self.try_claim(transfer_id) else {
            debug!(transfer_id = %transfer_id, "Transfer already in flight");
            return Ok(self.get_status(&transfer_id).await?.status);
        };

        let mut stale = 0;
        loop {
            let record = self.get_status(&transfer_id).await?;

            let result = match record.status {
                TransferStatus::Initiated => self.step_lock(record).await,
                TransferStatus::Locked => self.step_sign(record).await,
                TransferStatus::Signed => self.step_release(record).await,
                TransferStatus::MintSubmitted => self.step_mint_finality(record).await,
                TransferStatus::LockFailed
                | TransferStatus::SignFailed
                | TransferStatus::MintFailed => self.compensate(record).await,
                TransferStatus::RefundPending => self.step_refund(record).await,
                TransferStatus::Completed | TransferStatus::Refunded => {
                    return Ok(record.status);
                }
            };

            match result {
                Ok(Progress::Advanced) => stale = 0,
                Ok(Progress::Parked) => return Ok(self.get_status(&transfer_id).await?.status),
                Err(BridgeError::StaleStatus {
                    expected, actual, ..
                }) if stale < MAX_STALE_RETRIES => {
                    stale += 1;
                    debug!(
                        transfer_id = %transfer_id,
                        expected = %expected,
                        actual = %actual,
                        "Stale status, re-reading record"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Resume every in-progress transfer from its durable state. Failed
    /// transfers are left to `sweep_expired`.
    pub async fn recover(&self) -> BridgeResult<usize> {
        let mut records = Vec::new();
        for status in TransferStatus::in_progress() {
            records.extend(self.ledger.list_by_status(status).await?);
        }

        if records.is_empty() {
            return Ok(0);
        }
        debug!(count = records.len(), "Resuming non-terminal transfers");

        let results = join_all(records.iter().map(|r| self.drive(r.transfer_id))).await;
        for (record, result) in records.iter().zip(&results) {
            if let Err(e) = result {
                warn!(transfer_id = %record.transfer_id, error = %e, "Failed to resume transfer");
            }
        }
        Ok(records.len())
    }

    /// Route unsettled failed transfers onto the refund path (`SIGN_FAILED`
    /// only once expired). Returns the number of transfers that entered
    /// `REFUND_PENDING`.
    pub async fn sweep_expired(&self) -> BridgeResult<usize> {
        let now = Utc::now();
        let mut candidates: Vec<TransferRecord> = self
            .ledger
            .list_unsettled(TransferStatus::SignFailed)
            .await?
            .into_iter()
            .filter(|r| r.is_expired(now))
            .collect();
        for status in [TransferStatus::LockFailed, TransferStatus::MintFailed] {
            candidates.extend(self.ledger.list_unsettled(status).await?);
        }

        let mut refunding = Vec::new();
        for candidate in candidates {
            let Some(_claim) = self.try_claim(candidate.transfer_id) else {
                continue;
            };
            let record = match self.get_status(&candidate.transfer_id).await {
                Ok(record) => record,
                Err(e) => {
                    warn!(transfer_id = %candidate.transfer_id, error = %e, "Sweep read failed");
                    continue;
                }
            };
            if record.status != candidate.status {
                continue;
            }
            match self.compensate(record).await {
                Ok(_) => {
                    let status = self.get_status(&candidate.transfer_id).await?.status;
                    if status == TransferStatus::RefundPending {
                        refunding.push(candidate.transfer_id);
                    }
                }
                Err(BridgeError::StaleStatus { .. }) => {}
                Err(e) => {
                    warn!(transfer_id = %candidate.transfer_id, error = %e, "Sweep failed")
                }
            }
        }

        let moved = refunding.len();
        for result in join_all(refunding.into_iter().map(|id| self.drive(id))).await {
            if let Err(e) = result {
                warn!(error = %e, "Refund drive failed");
            }
        }
        Ok(moved)
    }

    /// Publish the current per-status counts
    pub async fn refresh_status_gauges(&self) -> BridgeResult<()> {
        let counts = self.ledger.count_by_status().await?;
        metrics::set_status_counts(&counts);
        Ok(())
    }

    /// Service loop: recover, sweep and refresh gauges every poll interval
    /// until a shutdown signal arrives
    pub async fn run(&self, mut shutdown: mpsc::Receiver<()>) -> eyre::Result<()> {
        let mut cycle_count = 0u64;

        info!(
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            "Transfer coordinator starting poll loop"
        );

        loop {
            cycle_count += 1;

            tokio::select! {
                _ = self.tick(cycle_count) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping coordinator");
                    return Ok(());
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping coordinator");
                    return Ok(());
                }
            }
        }
    }

    async fn tick(&self, cycle: u64) {
        let resumed = match self.recover().await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Recovery pass failed");
                0
            }
        };
        let refunded = match self.sweep_expired().await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Expiry sweep failed");
                0
            }
        };
        if let Err(e) = self.refresh_status_gauges().await {
            warn!(error = %e, "Failed to refresh status gauges");
        }

        // Log every 12 cycles to show the coordinator is alive
        if cycle % 12 == 1 || refunded > 0 {
            info!(cycle, resumed, refunded, "Coordinator heartbeat");
        }
    }

    // ========================================================================
    // Ledger helpers
    // ========================================================================

    async fn transition(
        &self,
        record: &TransferRecord,
        to: TransferStatus,
        update: TransferUpdate,
    ) -> BridgeResult<TransferRecord> {
        let updated = self
            .ledger
            .update_status(&record.transfer_id, record.status, to, update)
            .await?;

        metrics::record_transition(record.status, to);
        if record.status != to {
            info!(
                transfer_id = %record.transfer_id,
                from = %record.status,
                to = %to,
                "Transfer status changed"
            );
        }
        if to.is_terminal() {
            let elapsed = (Utc::now() - updated.created_at).num_milliseconds().max(0);
            metrics::record_terminal(to, elapsed as f64 / 1000.0);
        }
        if to == TransferStatus::Refunded {
            metrics::REFUNDS.inc();
        }
        Ok(updated)
    }

    async fn fail(
        &self,
        record: &TransferRecord,
        to: TransferStatus,
        error: &BridgeError,
    ) -> BridgeResult<Progress> {
        self.fail_with(record, to, error, TransferUpdate::new()).await
    }

    async fn fail_with(
        &self,
        record: &TransferRecord,
        to: TransferStatus,
        error: &BridgeError,
        update: TransferUpdate,
    ) -> BridgeResult<Progress> {
        warn!(
            transfer_id = %record.transfer_id,
            status = %record.status,
            error = %error,
            "Transfer step failed"
        );
        self.transition(record, to, update.failure_reason(error.failure_reason()))
            .await?;
        Ok(Progress::Advanced)
    }

    /// Mark a failed transfer as needing no further compensation
    async fn settle(&self, record: &TransferRecord, reason: &str) -> BridgeResult<Progress> {
        info!(
            transfer_id = %record.transfer_id,
            status = %record.status,
            reason,
            "Failed transfer settled"
        );
        self.transition(record, record.status, TransferUpdate::new().settled())
            .await?;
        Ok(Progress::Parked)
    }

    fn raise_alert(&self, record: &TransferRecord, message: &str) {
        metrics::INTEGRITY_ALERTS.inc();
        error!(
            transfer_id = %record.transfer_id,
            status = %record.status,
            alert = message,
            "Transfer requires operator attention"
        );
    }

    // ========================================================================
    // External call helpers
    // ========================================================================

    /// Count a failed attempt of `ctx.step`. Sleeps through the backoff and
    /// returns true when the step should go again.
    async fn backoff(
        &self,
        record: &TransferRecord,
        ctx: &mut RetryContext,
        error: &BridgeError,
    ) -> bool {
        ctx.record_failure(error.clone());
        match ctx.next_action() {
            RetryAction::RetryAfter(backoff) => {
                metrics::STEP_RETRIES
                    .with_label_values(&[ctx.step.as_str()])
                    .inc();
                warn!(
                    transfer_id = %record.transfer_id,
                    step = %ctx.step,
                    attempt = ctx.attempt,
                    ?backoff,
                    error = %error,
                    "Step failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                true
            }
            RetryAction::GiveUp => false,
        }
    }

    /// Poll finality until decided or the polling budget is spent, in which
    /// case `Pending` is returned
    async fn await_finality(
        &self,
        adapter: &dyn ChainAdapter,
        op_ref: &str,
    ) -> BridgeResult<Finality> {
        let finality = &self.settings.finality;

        for poll in 0..finality.max_polls {
            if poll > 0 {
                tokio::time::sleep(finality.poll_interval).await;
            }
            match attempt_with_timeout(
                &self.settings.retry,
                Step::Finality,
                adapter.query_finality(op_ref),
            )
            .await
            {
                Ok(Finality::Pending) => {}
                Ok(decided) => return Ok(decided),
                Err(e) if e.is_transient() => {
                    debug!(op_ref, poll, error = %e, "Finality query failed, polling again");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(
            chain = %adapter.chain(),
            op_ref,
            polls = finality.max_polls,
            "Finality polling budget exhausted"
        );
        Ok(Finality::Pending)
    }

    /// Ask the bridge contract for an operation that may already have landed
    async fn lookup(
        &self,
        adapter: &dyn ChainAdapter,
        kind: OpKind,
        transfer_id: &TransferId,
        step: Step,
    ) -> BridgeResult<Option<String>> {
        let found = attempt_with_timeout(
            &self.settings.retry,
            step,
            adapter.find_operation(kind, transfer_id),
        )
        .await?;
        if let Some(op) = &found {
            info!(
                transfer_id = %transfer_id,
                kind = %kind,
                op_ref = %op,
                "Found operation already recorded on chain"
            );
        }
        Ok(found.map(|op| op.op_ref))
    }

    /// Persist `attempts + 1` before a submission
    async fn begin_attempt(
        &self,
        record: &TransferRecord,
        ctx: &RetryContext,
        metadata: Option<&ProtectedPayload>,
    ) -> BridgeResult<TransferRecord> {
        let mut update = TransferUpdate::new().attempts(ctx.attempt + 1);
        if let Some(metadata) = metadata {
            update = update.protected_metadata(metadata.clone());
        }
        self.transition(record, record.status, update).await
    }

    /// Existing protected payload, or a fresh one for this record
    fn protected_metadata(&self, record: &TransferRecord) -> BridgeResult<ProtectedPayload> {
        match &record.protected_metadata {
            Some(metadata) => Ok(metadata.clone()),
            None => self
                .codec
                .protect(&record.payload().to_bytes(), &self.settings.key_id),
        }
    }

    /// Confirm that the protected payload decrypts and matches the record
    fn verify_metadata(&self, record: &TransferRecord) -> BridgeResult<ProtectedPayload> {
        let protected = record
            .protected_metadata
            .clone()
            .ok_or(BridgeError::IntegrityError)?;
        let plaintext = self.codec.unprotect(&protected)?;
        let payload = crate::types::TransferPayload::from_bytes(&plaintext)?;
        if payload != record.payload() {
            return Err(BridgeError::IntegrityError);
        }
        Ok(protected)
    }

    // ========================================================================
    // Steps
    // ========================================================================

    /// INITIATED: lock funds on the source chain
    async fn step_lock(&self, record: TransferRecord) -> BridgeResult<Progress> {
        let source = self.chains.get(record.source_chain)?;

        if let Some(op_ref) = record.pending_op_ref.clone() {
            return self.settle_lock(record, source.as_ref(), op_ref).await;
        }
        if record.is_expired(Utc::now()) {
            return self.compensate(record).await;
        }

        let metadata = match self.protected_metadata(&record) {
            Ok(metadata) => metadata,
            Err(e) => return self.fail(&record, TransferStatus::LockFailed, &e).await,
        };

        let mut record = record;
        let mut ctx = RetryContext::resuming(self.settings.retry.clone(), Step::Lock, record.attempts);

        loop {
            if ctx.attempt > 0 {
                match self
                    .lookup(source.as_ref(), OpKind::Lock, &record.transfer_id, Step::Lock)
                    .await
                {
                    Ok(Some(op_ref)) => {
                        let record = self
                            .transition(
                                &record,
                                TransferStatus::Initiated,
                                TransferUpdate::new().pending_op_ref(op_ref.clone()),
                            )
                            .await?;
                        return self.settle_lock(record, source.as_ref(), op_ref).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Unknown whether an earlier submission landed: never resubmit blind
                        if self.backoff(&record, &mut ctx, &e).await {
                            continue;
                        }
                        return self.fail(&record, TransferStatus::LockFailed, &e).await;
                    }
                }
            }

            if ctx.is_exhausted() {
                let error = ctx.last_error.clone().unwrap_or_else(|| {
                    BridgeError::ChainUnavailable("lock retry budget exhausted".into())
                });
                return self.fail(&record, TransferStatus::LockFailed, &error).await;
            }

            record = self.begin_attempt(&record, &ctx, Some(&metadata)).await?;
            debug!(
                transfer_id = %record.transfer_id,
                attempt = record.attempts,
                "Submitting source lock"
            );

            let submitted = attempt_with_timeout(
                &self.settings.retry,
                Step::Lock,
                source.submit_lock(&record.transfer_id, &record.sender, record.amount, &metadata),
            )
            .await;

            match submitted {
                Ok(op) => {
                    let record = self
                        .transition(
                            &record,
                            TransferStatus::Initiated,
                            TransferUpdate::new().pending_op_ref(op.op_ref.clone()),
                        )
                        .await?;
                    return self.settle_lock(record, source.as_ref(), op.op_ref).await;
                }
                Err(e) => {
                    if self.backoff(&record, &mut ctx, &e).await {
                        continue;
                    }
                    // The only lock ever submitted was rejected outright
                    let update = if record.attempts == 1 && !e.is_transient() {
                        TransferUpdate::new().settled()
                    } else {
                        TransferUpdate::new()
                    };
                    return self
                        .fail_with(&record, TransferStatus::LockFailed, &e, update)
                        .await;
                }
            }
        }
    }

    async fn settle_lock(
        &self,
        record: TransferRecord,
        source: &dyn ChainAdapter,
        op_ref: String,
    ) -> BridgeResult<Progress> {
        match self.await_finality(source, &op_ref).await? {
            Finality::Confirmed => {
                self.transition(
                    &record,
                    TransferStatus::Locked,
                    TransferUpdate::new()
                        .source_lock_ref(op_ref)
                        .clear_pending_op()
                        .attempts(0),
                )
                .await?;
                Ok(Progress::Advanced)
            }
            Finality::Reverted => {
                let error = BridgeError::InsufficientFunds(format!("lock {} reverted", op_ref));
                let update = if record.attempts <= 1 {
                    TransferUpdate::new().settled()
                } else {
                    TransferUpdate::new()
                };
                self.fail_with(&record, TransferStatus::LockFailed, &error, update)
                    .await
            }
            // pending_op_ref stays so a late confirmation is refunded
            Finality::Pending => {
                let error =
                    BridgeError::ChainUnavailable(format!("lock {} not final in time", op_ref));
                self.fail(&record, TransferStatus::LockFailed, &error).await
            }
        }
    }

    /// LOCKED: protect the payload and obtain the MPC release signature
    async fn step_sign(&self, record: TransferRecord) -> BridgeResult<Progress> {
        if record.is_expired(Utc::now()) {
            return self.compensate(record).await;
        }

        let metadata = match self.protected_metadata(&record) {
            Ok(metadata) => metadata,
            Err(e) => return self.fail(&record, TransferStatus::SignFailed, &e).await,
        };
        let digest = compute_release_digest(
            &record.transfer_id,
            record.source_chain,
            record.destination_chain,
            &record.recipient,
            record.amount,
        );

        let mut record = record;
        let mut ctx = RetryContext::resuming(self.settings.retry.clone(), Step::Sign, record.attempts);

        loop {
            if ctx.is_exhausted() {
                let error = ctx.last_error.clone().unwrap_or_else(|| {
                    BridgeError::SigningUnavailable("sign retry budget exhausted".into())
                });
                return self.fail(&record, TransferStatus::SignFailed, &error).await;
            }

            record = self.begin_attempt(&record, &ctx, Some(&metadata)).await?;
            debug!(
                transfer_id = %record.transfer_id,
                attempt = record.attempts,
                "Requesting release signature"
            );

            let signed = attempt_with_timeout(
                &self.settings.retry,
                Step::Sign,
                self.signer.sign(&digest, &self.settings.derivation_path),
            )
            .await
            .and_then(|signature| signature.to_ref());

            match signed {
                Ok(signed_ref) => {
                    self.transition(
                        &record,
                        TransferStatus::Signed,
                        TransferUpdate::new().signed_payload_ref(signed_ref).attempts(0),
                    )
                    .await?;
                    return Ok(Progress::Advanced);
                }
                Err(e) => {
                    if !self.backoff(&record, &mut ctx, &e).await {
                        return self.fail(&record, TransferStatus::SignFailed, &e).await;
                    }
                }
            }
        }
    }

    /// SIGNED: verify the protected payload and submit the release
    async fn step_release(&self, record: TransferRecord) -> BridgeResult<Progress> {
        let destination = self.chains.get(record.destination_chain)?;

        let metadata = match self.verify_metadata(&record) {
            Ok(metadata) => metadata,
            Err(e) => {
                if e == BridgeError::IntegrityError {
                    self.raise_alert(&record, "protected metadata failed verification");
                }
                return self.fail(&record, TransferStatus::MintFailed, &e).await;
            }
        };

        let signature = match record
            .signed_payload_ref
            .as_deref()
            .ok_or_else(|| BridgeError::AuthorizationInvalid("no signature recorded".into()))
            .and_then(Signature::from_ref)
        {
            Ok(signature) => signature,
            Err(e) => return self.fail(&record, TransferStatus::MintFailed, &e).await,
        };

        let authorization = ReleaseAuthorization {
            digest: compute_release_digest(
                &record.transfer_id,
                record.source_chain,
                record.destination_chain,
                &record.recipient,
                record.amount,
            ),
            signature,
            metadata,
        };

        let mut record = record;
        let mut ctx =
            RetryContext::resuming(self.settings.retry.clone(), Step::Release, record.attempts);

        loop {
            if ctx.attempt > 0 {
                match self
                    .lookup(destination.as_ref(), OpKind::Release, &record.transfer_id, Step::Release)
                    .await
                {
                    Ok(Some(op_ref)) => {
                        self.transition(
                            &record,
                            TransferStatus::MintSubmitted,
                            TransferUpdate::new().destination_op_ref(op_ref).attempts(0),
                        )
                        .await?;
                        return Ok(Progress::Advanced);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        if self.backoff(&record, &mut ctx, &e).await {
                            continue;
                        }
                        return self.fail(&record, TransferStatus::MintFailed, &e).await;
                    }
                }
            }

            if ctx.is_exhausted() {
                let error = ctx.last_error.clone().unwrap_or_else(|| {
                    BridgeError::ChainUnavailable("release retry budget exhausted".into())
                });
                return self.fail(&record, TransferStatus::MintFailed, &error).await;
            }

            record = self.begin_attempt(&record, &ctx, None).await?;
            debug!(
                transfer_id = %record.transfer_id,
                attempt = record.attempts,
                "Submitting destination release"
            );

            let submitted = attempt_with_timeout(
                &self.settings.retry,
                Step::Release,
                destination.submit_release(
                    &record.transfer_id,
                    record.amount,
                    &record.recipient,
                    &authorization,
                ),
            )
            .await;

            match submitted {
                Ok(op) => {
                    self.transition(
                        &record,
                        TransferStatus::MintSubmitted,
                        TransferUpdate::new().destination_op_ref(op.op_ref).attempts(0),
                    )
                    .await?;
                    return Ok(Progress::Advanced);
                }
                Err(e) => {
                    if !self.backoff(&record, &mut ctx, &e).await {
                        return self.fail(&record, TransferStatus::MintFailed, &e).await;
                    }
                }
            }
        }
    }

    /// MINT_SUBMITTED: wait for the release to become final
    async fn step_mint_finality(&self, record: TransferRecord) -> BridgeResult<Progress> {
        let destination = self.chains.get(record.destination_chain)?;
        let Some(op_ref) = record.destination_op_ref.clone() else {
            let error = BridgeError::AuthorizationInvalid("no release recorded".into());
            return self.fail(&record, TransferStatus::MintFailed, &error).await;
        };

        match self.await_finality(destination.as_ref(), &op_ref).await? {
            Finality::Confirmed => {
                self.transition(&record, TransferStatus::Completed, TransferUpdate::new())
                    .await?;
                Ok(Progress::Advanced)
            }
            Finality::Reverted => {
                let error = BridgeError::AuthorizationInvalid(format!("release {} reverted", op_ref));
                self.fail(&record, TransferStatus::MintFailed, &error).await
            }
            Finality::Pending => {
                let error =
                    BridgeError::ChainUnavailable(format!("release {} not final in time", op_ref));
                self.fail(&record, TransferStatus::MintFailed, &error).await
            }
        }
    }

    /// Finality of the source lock, if one was ever submitted
    async fn lock_finality(
        &self,
        record: &TransferRecord,
    ) -> BridgeResult<Option<(String, Finality)>> {
        let source = self.chains.get(record.source_chain)?;

        let op_ref = match (&record.source_lock_ref, &record.pending_op_ref) {
            (Some(op_ref), _) => return Ok(Some((op_ref.clone(), Finality::Confirmed))),
            (None, Some(op_ref)) => Some(op_ref.clone()),
            (None, None) if record.attempts > 0 => {
                self.lookup(source.as_ref(), OpKind::Lock, &record.transfer_id, Step::Lock)
                    .await?
            }
            (None, None) => None,
        };

        match op_ref {
            Some(op_ref) => {
                let finality = attempt_with_timeout(
                    &self.settings.retry,
                    Step::Finality,
                    source.query_finality(&op_ref),
                )
                .await?;
                Ok(Some((op_ref, finality)))
            }
            None => Ok(None),
        }
    }

    /// Finality of the destination release, if one may have been submitted
    async fn release_finality(&self, record: &TransferRecord) -> BridgeResult<Option<Finality>> {
        let destination = self.chains.get(record.destination_chain)?;

        let op_ref = match &record.destination_op_ref {
            Some(op_ref) => Some(op_ref.clone()),
            None if record.attempts > 0 => {
                self.lookup(
                    destination.as_ref(),
                    OpKind::Release,
                    &record.transfer_id,
                    Step::Release,
                )
                .await?
            }
            None => None,
        };

        match op_ref {
            Some(op_ref) => Ok(Some(
                attempt_with_timeout(
                    &self.settings.retry,
                    Step::Finality,
                    destination.query_finality(&op_ref),
                )
                .await?,
            )),
            None => Ok(None),
        }
    }

    async fn begin_refund(
        &self,
        record: &TransferRecord,
        lock_ref: Option<String>,
    ) -> BridgeResult<Progress> {
        let mut update = TransferUpdate::new().clear_pending_op().attempts(0);
        if let Some(lock_ref) = lock_ref {
            update = update.source_lock_ref(lock_ref);
        }
        self.transition(record, TransferStatus::RefundPending, update)
            .await?;
        Ok(Progress::Advanced)
    }

    /// Decide whether a failed or expired transfer must be refunded
    async fn compensate(&self, record: TransferRecord) -> BridgeResult<Progress> {
        let now = Utc::now();

        if record.settled_at.is_some() {
            return Ok(Progress::Parked);
        }

        match record.status {
            TransferStatus::Initiated if record.is_expired(now) => {
                match self.lock_finality(&record).await {
                    Ok(Some((op_ref, Finality::Confirmed))) => {
                        self.begin_refund(&record, Some(op_ref)).await
                    }
                    Ok(Some((_, Finality::Pending))) => Ok(Progress::Parked),
                    Ok(outcome) => {
                        let mut update =
                            TransferUpdate::new().failure_reason("transfer failed: expired");
                        if lock_ruled_out(&record, &outcome) {
                            update = update.settled();
                        }
                        self.transition(&record, TransferStatus::LockFailed, update)
                            .await?;
                        Ok(Progress::Advanced)
                    }
                    Err(e) if e.is_transient() => {
                        debug!(transfer_id = %record.transfer_id, error = %e, "Lock state unknown, waiting");
                        Ok(Progress::Parked)
                    }
                    Err(e) => Err(e),
                }
            }
            TransferStatus::Locked | TransferStatus::SignFailed if record.is_expired(now) => {
                info!(
                    transfer_id = %record.transfer_id,
                    status = %record.status,
                    "Transfer expired with funds locked, refunding"
                );
                self.begin_refund(&record, None).await
            }
            TransferStatus::LockFailed => match self.lock_finality(&record).await {
                Ok(Some((op_ref, Finality::Confirmed))) => {
                    warn!(
                        transfer_id = %record.transfer_id,
                        op_ref = %op_ref,
                        "Failed lock confirmed late, refunding"
                    );
                    self.begin_refund(&record, Some(op_ref)).await
                }
                Ok(outcome) if lock_ruled_out(&record, &outcome) => {
                    self.settle(&record, "no lock can land").await
                }
                Ok(_) => Ok(Progress::Parked),
                Err(e) if e.is_transient() => Ok(Progress::Parked),
                Err(e) => Err(e),
            },
            TransferStatus::MintFailed => match self.release_finality(&record).await {
                Ok(None) | Ok(Some(Finality::Reverted)) => self.begin_refund(&record, None).await,
                Ok(Some(Finality::Pending)) => {
                    if record.is_expired(now) {
                        warn!(
                            transfer_id = %record.transfer_id,
                            "Release still pending after expiry, refund withheld"
                        );
                    }
                    Ok(Progress::Parked)
                }
                Ok(Some(Finality::Confirmed)) => {
                    self.raise_alert(&record, "release confirmed for a failed transfer");
                    self.settle(&record, "release confirmed").await
                }
                Err(e) if e.is_transient() => Ok(Progress::Parked),
                Err(e) => Err(e),
            },
            _ => Ok(Progress::Parked),
        }
    }

    /// REFUND_PENDING: return locked funds to the sender. Never fails
    /// terminally; transient errors wait for the next sweep.
    async fn step_refund(&self, record: TransferRecord) -> BridgeResult<Progress> {
        let source = self.chains.get(record.source_chain)?;

        if let Some(op_ref) = record.pending_op_ref.clone() {
            return self.settle_refund(record, source.as_ref(), op_ref).await;
        }

        if record.attempts > 0 {
            match self
                .lookup(source.as_ref(), OpKind::Refund, &record.transfer_id, Step::Refund)
                .await
            {
                Ok(Some(op_ref)) => {
                    let record = self
                        .transition(
                            &record,
                            TransferStatus::RefundPending,
                            TransferUpdate::new().pending_op_ref(op_ref.clone()),
                        )
                        .await?;
                    return self.settle_refund(record, source.as_ref(), op_ref).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(transfer_id = %record.transfer_id, error = %e, "Refund lookup failed");
                    return Ok(Progress::Parked);
                }
            }
        }

        let mut record = record;
        let mut ctx = RetryContext::new(self.settings.retry.clone(), Step::Refund);

        loop {
            let update = TransferUpdate::new().attempts(record.attempts + 1);
            record = self
                .transition(&record, TransferStatus::RefundPending, update)
                .await?;

            let submitted = attempt_with_timeout(
                &self.settings.retry,
                Step::Refund,
                source.submit_refund(&record.transfer_id, &record.sender, record.amount),
            )
            .await;

            match submitted {
                Ok(op) => {
                    let record = self
                        .transition(
                            &record,
                            TransferStatus::RefundPending,
                            TransferUpdate::new().pending_op_ref(op.op_ref.clone()),
                        )
                        .await?;
                    return self.settle_refund(record, source.as_ref(), op.op_ref).await;
                }
                Err(e) => {
                    if !self.backoff(&record, &mut ctx, &e).await {
                        warn!(
                            transfer_id = %record.transfer_id,
                            attempts = record.attempts,
                            error = %e,
                            "Refund not submitted, will retry on next sweep"
                        );
                        return Ok(Progress::Parked);
                    }
                    if let Ok(Some(op_ref)) = self
                        .lookup(source.as_ref(), OpKind::Refund, &record.transfer_id, Step::Refund)
                        .await
                    {
                        let record = self
                            .transition(
                                &record,
                                TransferStatus::RefundPending,
                                TransferUpdate::new().pending_op_ref(op_ref.clone()),
                            )
                            .await?;
                        return self.settle_refund(record, source.as_ref(), op_ref).await;
                    }
                }
            }
        }
    }

    async fn settle_refund(
        &self,
        record: TransferRecord,
        source: &dyn ChainAdapter,
        op_ref: String,
    ) -> BridgeResult<Progress> {
        match self.await_finality(source, &op_ref).await? {
            Finality::Confirmed => {
                self.transition(
                    &record,
                    TransferStatus::Refunded,
                    TransferUpdate::new().refund_op_ref(op_ref).clear_pending_op(),
                )
                .await?;
                Ok(Progress::Advanced)
            }
            Finality::Reverted => {
                warn!(
                    transfer_id = %record.transfer_id,
                    op_ref = %op_ref,
                    "Refund reverted, will resubmit on next sweep"
                );
                self.transition(
                    &record,
                    TransferStatus::RefundPending,
                    TransferUpdate::new().clear_pending_op(),
                )
                .await?;
                Ok(Progress::Parked)
            }
            Finality::Pending => Ok(Progress::Parked),
        }
    }
}

/// Whether a lock outcome rules out funds ever moving: nothing was
/// submitted, or the only submission reverted
fn lock_ruled_out(record: &TransferRecord, outcome: &Option<(String, Finality)>) -> bool {
    match outcome {
        None => record.attempts == 0,
        Some((_, Finality::Reverted)) => record.attempts <= 1,
        Some(_) => false,
    }
}
