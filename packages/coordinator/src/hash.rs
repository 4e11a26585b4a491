//! Hash computation for release authorizations and key derivation
//!
//! The release digest is what the MPC network signs and what the bridge
//! contracts recompute before releasing funds on the destination chain.
//!
//! ```solidity
//! keccak256(abi.encodePacked(transferId, srcChain, destChain, keccak256(recipient), amount))
//! ```

use tiny_keccak::{Hasher, Keccak, Sha3};

use crate::types::{Chain, TransferId};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Compute sha3-256 (FIPS-202) hash of data
pub fn sha3_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// 4-byte chain key: first four bytes of keccak256 of the chain name
pub fn chain_key(chain: Chain) -> [u8; 4] {
    let hash = keccak256(chain.as_str().as_bytes());
    let mut key = [0u8; 4];
    key.copy_from_slice(&hash[..4]);
    key
}

/// Digest of the release instruction for one transfer
pub fn compute_release_digest(
    transfer_id: &TransferId,
    source_chain: Chain,
    destination_chain: Chain,
    recipient: &str,
    amount: u128,
) -> [u8; 32] {
    // abi.encodePacked layout: 32 + 4 + 4 + 32 + 32 = 104 bytes
    let mut data = [0u8; 104];

    data[0..32].copy_from_slice(&transfer_id.to_bytes32());
    data[32..36].copy_from_slice(&chain_key(source_chain));
    data[36..40].copy_from_slice(&chain_key(destination_chain));
    data[40..72].copy_from_slice(&keccak256(recipient.as_bytes()));

    // amount (uint256, big-endian)
    data[72 + 16..104].copy_from_slice(&amount.to_be_bytes());

    keccak256(&data)
}

/// Format bytes as 0x-prefixed hex
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}
