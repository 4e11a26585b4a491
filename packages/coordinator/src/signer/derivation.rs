//! Additive key derivation for NEAR chain signatures
//!
//! The MPC network holds one root secp256k1 key. The key for a
//! `(predecessor account, path)` pair is `root + epsilon * G`, where epsilon
//! is a sha3-256 hash of the pair, so anyone holding the root public key can
//! compute every derived public key without contacting the network.

use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{FieldBytes, ProjectivePoint, PublicKey, Scalar, U256};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::hash::{keccak256, sha3_256};
use crate::types::Chain;

const EPSILON_DERIVATION_PREFIX: &str = "near-mpc-recovery v0.1.0 epsilon derivation:";

/// Address on a foreign chain controlled by the MPC network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignAddress {
    pub chain: Chain,
    pub address: String,
    /// Uncompressed SEC1 public key, hex
    pub public_key: String,
}

/// Parse a NEAR-formatted root key: `secp256k1:<base58 of 64-byte x||y>`
pub fn parse_root_public_key(encoded: &str) -> BridgeResult<PublicKey> {
    let body = encoded
        .strip_prefix("secp256k1:")
        .ok_or_else(|| BridgeError::Config("MPC root key must start with secp256k1:".into()))?;
    let raw = bs58::decode(body)
        .into_vec()
        .map_err(|e| BridgeError::Config(format!("MPC root key is not base58: {}", e)))?;
    if raw.len() != 64 {
        return Err(BridgeError::Config(format!(
            "MPC root key must be 64 bytes, got {}",
            raw.len()
        )));
    }

    let mut sec1 = Vec::with_capacity(65);
    sec1.push(0x04);
    sec1.extend_from_slice(&raw);
    PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| BridgeError::Config("MPC root key is not a curve point".into()))
}

pub fn derive_epsilon(predecessor: &str, path: &str) -> Scalar {
    let input = format!("{}{},{}", EPSILON_DERIVATION_PREFIX, predecessor, path);
    let hash = sha3_256(input.as_bytes());
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(hash))
}

pub fn derive_public_key(root: &PublicKey, predecessor: &str, path: &str) -> BridgeResult<PublicKey> {
    let epsilon = derive_epsilon(predecessor, path);
    let point = root.to_projective() + ProjectivePoint::GENERATOR * epsilon;
    PublicKey::from_affine(point.to_affine())
        .map_err(|_| BridgeError::Config("derived key is the identity point".into()))
}

/// 20-byte EVM address of a public key
pub fn evm_address_bytes(public_key: &PublicKey) -> [u8; 20] {
    let encoded = public_key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    address
}

/// Render the derived key as an address on `chain`
pub fn foreign_address(public_key: &PublicKey, chain: Chain) -> ForeignAddress {
    let raw = evm_address_bytes(public_key);
    let address = match chain {
        Chain::Ethereum => alloy::primitives::Address::from(raw).to_checksum(None),
        // eth-implicit NEAR account for the same key
        Chain::Near => format!("0x{}", hex::encode(raw)),
    };
    ForeignAddress {
        chain,
        address,
        public_key: hex::encode(public_key.to_encoded_point(false).as_bytes()),
    }
}
