//! Error taxonomy for the transfer core
//!
//! Transient kinds are retried inside the coordinator and never surface past
//! it; permanent kinds move a record to a named failure state.

use thiserror::Error;

use crate::types::{TransferId, TransferStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    // Chain adapter
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    #[error("authorization invalid: {0}")]
    AuthorizationInvalid(String),

    // Signature service
    #[error("signing unavailable: {0}")]
    SigningUnavailable(String),

    #[error("payload rejected: {0}")]
    PayloadRejected(String),

    // Codec
    #[error("integrity check failed: protected payload was altered")]
    IntegrityError,

    #[error("unknown payload key: {0}")]
    UnknownKey(String),

    // Ledger
    #[error("duplicate transfer id: {0}")]
    DuplicateTransferId(TransferId),

    #[error("stale status for {transfer_id}: expected {expected}, found {actual}")]
    StaleStatus {
        transfer_id: TransferId,
        expected: TransferStatus,
        actual: TransferStatus,
    },

    #[error("transfer not found: {0}")]
    NotFound(TransferId),

    #[error("storage error: {0}")]
    Storage(String),

    // Request validation
    #[error("invalid amount: must be greater than zero")]
    InvalidAmount,

    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),

    #[error("unsupported route: {0} -> {1}")]
    UnsupportedRoute(String, String),

    #[error("invalid transfer id: {0}")]
    InvalidTransferId(String),

    #[error("transfer {0} already exists with different parameters")]
    ConflictingRequest(TransferId),

    #[error("illegal transition {from} -> {to}")]
    IllegalTransition {
        from: TransferStatus,
        to: TransferStatus,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Transient failures are retried with bounded backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BridgeError::ChainUnavailable(_) | BridgeError::SigningUnavailable(_)
        )
    }

    /// Short kind label for metrics and `failure_reason`
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::ChainUnavailable(_) => "ChainUnavailable",
            BridgeError::InsufficientFunds(_) => "InsufficientFunds",
            BridgeError::InvalidRecipient(_) => "InvalidRecipient",
            BridgeError::AuthorizationInvalid(_) => "AuthorizationInvalid",
            BridgeError::SigningUnavailable(_) => "SigningUnavailable",
            BridgeError::PayloadRejected(_) => "PayloadRejected",
            BridgeError::IntegrityError => "IntegrityError",
            BridgeError::UnknownKey(_) => "UnknownKey",
            BridgeError::DuplicateTransferId(_) => "DuplicateTransferId",
            BridgeError::StaleStatus { .. } => "StaleStatus",
            BridgeError::NotFound(_) => "NotFound",
            BridgeError::Storage(_) => "Storage",
            BridgeError::InvalidAmount => "InvalidAmount",
            BridgeError::UnsupportedChain(_) => "UnsupportedChain",
            BridgeError::UnsupportedRoute(..) => "UnsupportedRoute",
            BridgeError::InvalidTransferId(_) => "InvalidTransferId",
            BridgeError::ConflictingRequest(_) => "ConflictingRequest",
            BridgeError::IllegalTransition { .. } => "IllegalTransition",
            BridgeError::Config(_) => "Config",
        }
    }

    /// The only form in which a permanent failure reaches the caller
    pub fn failure_reason(&self) -> String {
        format!("transfer failed: {}", self.kind())
    }
}

impl From<sqlx::Error> for BridgeError {
    fn from(e: sqlx::Error) -> Self {
        BridgeError::Storage(e.to_string())
    }
}

pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
