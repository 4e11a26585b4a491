//! Signature service
//!
//! Release instructions are signed by an external MPC network; this module
//! treats it as an opaque remote capability. Foreign-address derivation is
//! deterministic and local.

pub mod derivation;
pub mod mpc;

use async_trait::async_trait;
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, VerifyingKey};
use k256::{FieldBytes, PublicKey};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};
use crate::types::Chain;

pub use derivation::ForeignAddress;
pub use mpc::NearMpcSigner;

/// secp256k1 signature as returned by the MPC network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Compressed R point, hex (33 bytes)
    pub big_r: String,
    /// s scalar, hex (32 bytes)
    pub s: String,
    pub recovery_id: u8,
}

impl Signature {
    fn r_bytes(&self) -> BridgeResult<[u8; 32]> {
        let big_r = hex::decode(self.big_r.trim_start_matches("0x"))
            .map_err(|e| BridgeError::AuthorizationInvalid(format!("big_r is not hex: {}", e)))?;
        if big_r.len() != 33 {
            return Err(BridgeError::AuthorizationInvalid(format!(
                "big_r must be 33 bytes, got {}",
                big_r.len()
            )));
        }
        let mut r = [0u8; 32];
        r.copy_from_slice(&big_r[1..]);
        Ok(r)
    }

    fn s_bytes(&self) -> BridgeResult<[u8; 32]> {
        let s = hex::decode(self.s.trim_start_matches("0x"))
            .map_err(|e| BridgeError::AuthorizationInvalid(format!("s is not hex: {}", e)))?;
        s.as_slice()
            .try_into()
            .map_err(|_| BridgeError::AuthorizationInvalid(format!("s must be 32 bytes, got {}", s.len())))
    }

    /// 65-byte `r || s || v` form checked by EVM `ecrecover`
    pub fn to_rsv(&self) -> BridgeResult<[u8; 65]> {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(&self.r_bytes()?);
        out[32..64].copy_from_slice(&self.s_bytes()?);
        out[64] = 27 + self.recovery_id;
        Ok(out)
    }

    /// Hex reference stored as `signed_payload_ref`
    pub fn to_ref(&self) -> BridgeResult<String> {
        Ok(format!("0x{}", hex::encode(self.to_rsv()?)))
    }

    /// Parse a stored `signed_payload_ref` back into a signature
    pub fn from_ref(signed_ref: &str) -> BridgeResult<Self> {
        let rsv = hex::decode(signed_ref.trim_start_matches("0x"))
            .map_err(|e| BridgeError::AuthorizationInvalid(format!("signature ref is not hex: {}", e)))?;
        if rsv.len() != 65 || rsv[64] < 27 {
            return Err(BridgeError::AuthorizationInvalid(format!(
                "signature ref must be 65 bytes r||s||v, got {}",
                rsv.len()
            )));
        }
        let recovery_id = rsv[64] - 27;
        // Low bit of the recovery id is the parity of R.y
        let prefix = if recovery_id & 1 == 1 { 0x03 } else { 0x02 };
        let mut big_r = vec![prefix];
        big_r.extend_from_slice(&rsv[..32]);
        Ok(Self {
            big_r: hex::encode(big_r),
            s: hex::encode(&rsv[32..64]),
            recovery_id,
        })
    }

    /// Recover the public key that produced this signature over `digest`
    pub fn recover(&self, digest: &[u8; 32]) -> BridgeResult<PublicKey> {
        let signature = EcdsaSignature::from_scalars(
            FieldBytes::from(self.r_bytes()?),
            FieldBytes::from(self.s_bytes()?),
        )
        .map_err(|e| BridgeError::AuthorizationInvalid(format!("bad signature scalars: {}", e)))?;
        let recovery_id = RecoveryId::from_byte(self.recovery_id)
            .ok_or_else(|| BridgeError::AuthorizationInvalid("bad recovery id".into()))?;

        let key = VerifyingKey::recover_from_prehash(digest, &signature, recovery_id)
            .map_err(|e| BridgeError::AuthorizationInvalid(format!("recovery failed: {}", e)))?;
        Ok(PublicKey::from(&key))
    }
}

#[async_trait]
pub trait SignatureService: Send + Sync {
    /// Deterministic address controlled by the MPC network on `target_chain`
    /// for `(source_account, derivation_path)`
    fn derive_foreign_address(
        &self,
        source_account: &str,
        target_chain: Chain,
        derivation_path: &str,
    ) -> BridgeResult<ForeignAddress>;

    /// Sign a 32-byte payload under the key at `derivation_path`
    async fn sign(&self, payload: &[u8], derivation_path: &str) -> BridgeResult<Signature>;
}
