//! EVM bridge contract ABI definition
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the bridge
//! contract. Every entry point is keyed by the 32-byte transfer id, and the
//! contract rejects a second lock, release or refund for the same id.

#![allow(clippy::too_many_arguments)]

use alloy::sol;

sol! {
    /// Lock/release bridge with MPC-authorized releases
    #[sol(rpc)]
    contract TransferBridge {
        /// Pull `amount` from `sender` (pre-approved allowance) into custody
        ///
        /// # Arguments
        /// * `transferId` - Coordinator transfer id, left-padded to 32 bytes
        /// * `sender` - Account that owns the locked funds
        /// * `amount` - Amount in the token's smallest unit
        /// * `metadata` - Protected transfer payload (JSON)
        function lock(
            bytes32 transferId,
            address sender,
            uint256 amount,
            bytes metadata
        ) external;

        /// Release funds to `recipient` once the MPC signature over `digest`
        /// recovers to the bridge's derived signer
        function release(
            bytes32 transferId,
            address recipient,
            uint256 amount,
            bytes32 digest,
            bytes signature,
            bytes metadata
        ) external;

        /// Return custody for `transferId` to its original sender
        function refund(
            bytes32 transferId,
            address sender,
            uint256 amount
        ) external;

        /// Events
        event Locked(
            bytes32 indexed transferId,
            address indexed sender,
            uint256 amount
        );

        event Released(
            bytes32 indexed transferId,
            address indexed recipient,
            uint256 amount
        );

        event Refunded(
            bytes32 indexed transferId,
            address indexed sender,
            uint256 amount
        );
    }
}
