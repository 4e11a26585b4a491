//! Cross-chain transfer coordinator - Library interface
//!
//! Locks funds on a source chain, obtains an MPC signature for the release,
//! releases on the destination chain and refunds when a transfer cannot
//! complete. Re-exports internal modules for use in integration tests.

pub mod api;
pub mod chain;
pub mod codec;
pub mod config;
pub mod contracts;
pub mod coordinator;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod metrics;
pub mod signer;
pub mod types;

pub use coordinator::{Settings, TransferCoordinator};
pub use error::{BridgeError, BridgeResult};
