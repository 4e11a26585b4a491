//! Common types for cross-chain transfers
//!
//! Chains, transfer identifiers, the transfer status lattice, and the
//! durable `TransferRecord` shape shared by the coordinator and the ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::codec::ProtectedPayload;
use crate::error::BridgeError;

// ============================================================================
// Chains
// ============================================================================

/// Chain family: selects the adapter implementation and address grammar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Near,
}

/// Closed set of chains the coordinator can bridge between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Near,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::Ethereum, Chain::Near];

    pub fn family(&self) -> ChainFamily {
        match self {
            Chain::Ethereum => ChainFamily::Evm,
            Chain::Near => ChainFamily::Near,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Near => "near",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" | "eth" | "evm" => Ok(Chain::Ethereum),
            "near" => Ok(Chain::Near),
            other => Err(BridgeError::UnsupportedChain(other.to_string())),
        }
    }
}

// ============================================================================
// Transfer identity
// ============================================================================

/// Globally unique transfer identifier, the idempotency key for every
/// downstream operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(pub Uuid);

impl TransferId {
    pub fn new() -> Self {
        TransferId(Uuid::new_v4())
    }

    /// 32-byte form used as the on-chain key (uuid left-padded with zeros)
    pub fn to_bytes32(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out[16..].copy_from_slice(self.0.as_bytes());
        out
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(TransferId)
    }
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferStatus {
    Initiated,
    Locked,
    Signed,
    MintSubmitted,
    Completed,
    LockFailed,
    SignFailed,
    MintFailed,
    RefundPending,
    Refunded,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 10] = [
        TransferStatus::Initiated,
        TransferStatus::Locked,
        TransferStatus::Signed,
        TransferStatus::MintSubmitted,
        TransferStatus::Completed,
        TransferStatus::LockFailed,
        TransferStatus::SignFailed,
        TransferStatus::MintFailed,
        TransferStatus::RefundPending,
        TransferStatus::Refunded,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Initiated => "INITIATED",
            TransferStatus::Locked => "LOCKED",
            TransferStatus::Signed => "SIGNED",
            TransferStatus::MintSubmitted => "MINT_SUBMITTED",
            TransferStatus::Completed => "COMPLETED",
            TransferStatus::LockFailed => "LOCK_FAILED",
            TransferStatus::SignFailed => "SIGN_FAILED",
            TransferStatus::MintFailed => "MINT_FAILED",
            TransferStatus::RefundPending => "REFUND_PENDING",
            TransferStatus::Refunded => "REFUNDED",
        }
    }

    /// No transition may leave a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Refunded)
    }

    /// `*_FAILED`: waiting on a compensation decision
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            TransferStatus::LockFailed | TransferStatus::SignFailed | TransferStatus::MintFailed
        )
    }

    /// Statuses a recovery pass resumes; failures belong to the sweep
    pub fn in_progress() -> impl Iterator<Item = TransferStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| !s.is_terminal() && !s.is_failure())
    }

    /// Whether `self -> next` is an edge of the state machine
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Initiated, Initiated | Locked | LockFailed | RefundPending) => true,
            (Locked, Locked | Signed | SignFailed | RefundPending) => true,
            (Signed, Signed | MintSubmitted | MintFailed) => true,
            (MintSubmitted, Completed | MintFailed) => true,
            (LockFailed, LockFailed | RefundPending) => true,
            (SignFailed, RefundPending) => true,
            (MintFailed, MintFailed | RefundPending) => true,
            (RefundPending, RefundPending | Refunded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BridgeError::Storage(format!("unknown transfer status: {}", s)))
    }
}

// ============================================================================
// Records
// ============================================================================

/// Inbound transfer request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Client-chosen id for idempotent re-submission; generated when absent
    #[serde(default)]
    pub transfer_id: Option<TransferId>,
    pub source_chain: Chain,
    pub destination_chain: Chain,
    /// Smallest-unit amount, serialized as a decimal string
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub sender: String,
    pub recipient: String,
}

impl TransferRequest {
    /// True when `record` was created from an identical request
    pub fn matches(&self, record: &TransferRecord) -> bool {
        self.source_chain == record.source_chain
            && self.destination_chain == record.destination_chain
            && self.amount == record.amount
            && self.sender == record.sender
            && self.recipient == record.recipient
    }
}

/// Durable state of one cross-chain transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub transfer_id: TransferId,
    pub source_chain: Chain,
    pub destination_chain: Chain,
    #[serde(with = "amount_string")]
    pub amount: u128,
    pub sender: String,
    pub recipient: String,
    pub status: TransferStatus,
    pub source_lock_ref: Option<String>,
    pub signed_payload_ref: Option<String>,
    pub destination_op_ref: Option<String>,
    pub refund_op_ref: Option<String>,
    /// Submitted source-chain operation (lock or refund) awaiting finality
    pub pending_op_ref: Option<String>,
    pub protected_metadata: Option<ProtectedPayload>,
    /// Submissions issued for the current step, persisted before each call
    pub attempts: u32,
    pub failure_reason: Option<String>,
    /// Set once a failed transfer is known to need no further compensation
    pub settled_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferRecord {
    /// Fresh `INITIATED` record for a validated request
    pub fn initiated(
        transfer_id: TransferId,
        request: &TransferRequest,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            transfer_id,
            source_chain: request.source_chain,
            destination_chain: request.destination_chain,
            amount: request.amount,
            sender: request.sender.clone(),
            recipient: request.recipient.clone(),
            status: TransferStatus::Initiated,
            source_lock_ref: None,
            signed_payload_ref: None,
            destination_op_ref: None,
            refund_op_ref: None,
            pending_op_ref: None,
            protected_metadata: None,
            attempts: 0,
            failure_reason: None,
            settled_at: None,
            expires_at: now + ttl,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Canonical payload carried (protected) alongside the transfer
    pub fn payload(&self) -> TransferPayload {
        TransferPayload {
            transfer_id: self.transfer_id,
            source_chain: self.source_chain,
            destination_chain: self.destination_chain,
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            amount: self.amount,
        }
    }
}

/// Transfer metadata that crosses the chain boundary under protection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPayload {
    pub transfer_id: TransferId,
    pub source_chain: Chain,
    pub destination_chain: Chain,
    pub sender: String,
    pub recipient: String,
    #[serde(with = "amount_string")]
    pub amount: u128,
}

impl TransferPayload {
    pub fn to_bytes(&self) -> Vec<u8> {
        // Struct of strings/ints: serialization cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(bytes).map_err(|_| BridgeError::IntegrityError)
    }
}

/// u128 amounts travel as decimal strings (JSON numbers lose precision)
pub mod amount_string {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
