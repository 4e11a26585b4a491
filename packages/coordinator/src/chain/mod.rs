//! Chain adapters
//!
//! One adapter per chain family behind the object-safe [`ChainAdapter`]
//! trait. Adapters never synthesize success: every transport failure is
//! mapped onto a named [`BridgeError`] kind.

pub mod evm;
pub mod near;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::ProtectedPayload;
use crate::error::{BridgeError, BridgeResult};
use crate::signer::Signature;
use crate::types::{Chain, ChainFamily, TransferId};

pub use evm::EvmAdapter;
pub use near::NearAdapter;

/// Reference to a submitted chain operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PendingOp {
    pub op_ref: String,
}

impl PendingOp {
    pub fn new(op_ref: impl Into<String>) -> Self {
        Self {
            op_ref: op_ref.into(),
        }
    }
}

impl fmt::Display for PendingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.op_ref)
    }
}

/// Finality of a submitted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Finality {
    Pending,
    Confirmed,
    Reverted,
}

/// Bridge contract operation kinds, each keyed on-chain by transfer id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Lock,
    Release,
    Refund,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Lock => "lock",
            OpKind::Release => "release",
            OpKind::Refund => "refund",
        }
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proof presented to the destination bridge that the MPC network signed
/// this release
#[derive(Debug, Clone)]
pub struct ReleaseAuthorization {
    pub digest: [u8; 32],
    pub signature: Signature,
    pub metadata: ProtectedPayload,
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Chain served by this adapter
    fn chain(&self) -> Chain;

    /// Check an address against this chain family's grammar
    fn validate_address(&self, address: &str) -> BridgeResult<()> {
        validate_address(self.chain().family(), address)
    }

    /// Lock `amount` from `sender` into the bridge under `transfer_id`
    async fn submit_lock(
        &self,
        transfer_id: &TransferId,
        sender: &str,
        amount: u128,
        metadata: &ProtectedPayload,
    ) -> BridgeResult<PendingOp>;

    /// Release (mint) `amount` to `recipient`, authorized by an MPC signature
    async fn submit_release(
        &self,
        transfer_id: &TransferId,
        amount: u128,
        recipient: &str,
        authorization: &ReleaseAuthorization,
    ) -> BridgeResult<PendingOp>;

    /// Return locked funds to `sender`
    async fn submit_refund(
        &self,
        transfer_id: &TransferId,
        sender: &str,
        amount: u128,
    ) -> BridgeResult<PendingOp>;

    async fn query_finality(&self, op_ref: &str) -> BridgeResult<Finality>;

    /// Look up an operation the bridge contract already recorded for
    /// `transfer_id`, if any
    async fn find_operation(
        &self,
        kind: OpKind,
        transfer_id: &TransferId,
    ) -> BridgeResult<Option<PendingOp>>;
}

/// Adapters keyed by chain
#[derive(Clone, Default)]
pub struct ChainRegistry {
    adapters: HashMap<Chain, Arc<dyn ChainAdapter>>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ChainAdapter>) {
        self.adapters.insert(adapter.chain(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ChainAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, chain: Chain) -> BridgeResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(&chain)
            .cloned()
            .ok_or_else(|| BridgeError::UnsupportedChain(chain.to_string()))
    }

    pub fn chains(&self) -> Vec<Chain> {
        let mut chains: Vec<Chain> = self.adapters.keys().copied().collect();
        chains.sort_by_key(|c| c.as_str());
        chains
    }
}

impl fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainRegistry")
            .field("chains", &self.chains())
            .finish()
    }
}

/// Map a submission error message onto the adapter taxonomy
///
/// Contract rejections surface at submission time (gas estimation on EVM,
/// function-call failure on NEAR), so a revert here is a permanent refusal
/// of the call rather than a transport failure. Refunds are never treated
/// as permanent.
pub(crate) fn classify_submit_error(kind: OpKind, message: &str) -> BridgeError {
    let lower = message.to_ascii_lowercase();

    if kind == OpKind::Refund {
        return BridgeError::ChainUnavailable(message.to_string());
    }

    if lower.contains("insufficient funds")
        || lower.contains("insufficient balance")
        || lower.contains("insufficient allowance")
        || lower.contains("exceeds balance")
        || lower.contains("notenoughbalance")
    {
        return BridgeError::InsufficientFunds(message.to_string());
    }

    let rejected = ["revert", "panicked", "executionerror", "functioncallerror"]
        .iter()
        .any(|marker| lower.contains(marker));
    match (kind, rejected) {
        (OpKind::Lock, true) => BridgeError::InsufficientFunds(message.to_string()),
        (OpKind::Release, true) => BridgeError::AuthorizationInvalid(message.to_string()),
        _ => BridgeError::ChainUnavailable(message.to_string()),
    }
}

// ============================================================================
// Address grammar
// ============================================================================

pub fn validate_address(family: ChainFamily, address: &str) -> BridgeResult<()> {
    let valid = match family {
        ChainFamily::Evm => is_valid_evm_address(address),
        ChainFamily::Near => is_valid_near_account(address),
    };
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidRecipient(format!(
            "{:?} address grammar rejects {:?}",
            family, address
        )))
    }
}

/// `0x` followed by 40 hex digits (checksum not enforced)
pub fn is_valid_evm_address(address: &str) -> bool {
    match address.strip_prefix("0x") {
        Some(body) => body.len() == 40 && body.chars().all(|c| c.is_ascii_hexdigit()),
        None => false,
    }
}

/// NEAR account id: 2-64 chars of `[a-z0-9]` parts joined by single
/// `-`, `_` or `.` separators
pub fn is_valid_near_account(account: &str) -> bool {
    if account.len() < 2 || account.len() > 64 {
        return false;
    }

    let mut last_was_separator = true;
    for c in account.chars() {
        match c {
            'a'..='z' | '0'..='9' => last_was_separator = false,
            '-' | '_' | '.' => {
                if last_was_separator {
                    return false;
                }
                last_was_separator = true;
            }
            _ => return false,
        }
    }
    !last_was_separator
}
