//! NEAR chain-signatures MPC client
//!
//! Signing calls the MPC contract's `sign` method through the NEAR relayer,
//! which signs the outer transaction as `signer_account`. The MPC network
//! derives the signing key from that predecessor account and the requested
//! path, so returned signatures are checked against the locally derived key.

use async_trait::async_trait;
use k256::PublicKey;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::derivation::{derive_public_key, foreign_address, parse_root_public_key, ForeignAddress};
use super::{Signature, SignatureService};
use crate::chain::near::{decode_success_value, FunctionCall, RelayError, RelayerClient};
use crate::config::MpcConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::types::Chain;

/// 250 TGas: the sign call yields until the network responds
const SIGN_CALL_GAS: u64 = 250_000_000_000_000;

#[derive(Debug, Deserialize)]
struct AffinePointResponse {
    affine_point: String,
}

#[derive(Debug, Deserialize)]
struct ScalarResponse {
    scalar: String,
}

/// `sign` return value of the MPC contract
#[derive(Debug, Deserialize)]
struct SignResponse {
    big_r: AffinePointResponse,
    s: ScalarResponse,
    recovery_id: u8,
}

impl From<SignResponse> for Signature {
    fn from(response: SignResponse) -> Self {
        Signature {
            big_r: response.big_r.affine_point.to_lowercase(),
            s: response.s.scalar.to_lowercase(),
            recovery_id: response.recovery_id,
        }
    }
}

pub struct NearMpcSigner {
    contract_id: String,
    signer_account: String,
    key_version: u32,
    root_public_key: PublicKey,
    relayer: RelayerClient,
}

impl NearMpcSigner {
    pub fn new(config: &MpcConfig, relayer_url: &str, signer_account: &str) -> BridgeResult<Self> {
        let root_public_key = parse_root_public_key(&config.root_public_key)?;
        // MPC responses can take several blocks
        let relayer = RelayerClient::new(relayer_url, std::time::Duration::from_secs(120))?;

        info!(
            contract = %config.contract_id,
            signer = %signer_account,
            key_version = config.key_version,
            "MPC signer initialized"
        );

        Ok(Self {
            contract_id: config.contract_id.clone(),
            signer_account: signer_account.to_string(),
            key_version: config.key_version,
            root_public_key,
            relayer,
        })
    }

    /// Public key the network signs with for `path` on our behalf
    pub fn signing_key(&self, path: &str) -> BridgeResult<PublicKey> {
        derive_public_key(&self.root_public_key, &self.signer_account, path)
    }
}

#[async_trait]
impl SignatureService for NearMpcSigner {
    fn derive_foreign_address(
        &self,
        source_account: &str,
        target_chain: Chain,
        derivation_path: &str,
    ) -> BridgeResult<ForeignAddress> {
        let key = derive_public_key(&self.root_public_key, source_account, derivation_path)?;
        Ok(foreign_address(&key, target_chain))
    }

    async fn sign(&self, payload: &[u8], derivation_path: &str) -> BridgeResult<Signature> {
        let digest: [u8; 32] = payload.try_into().map_err(|_| {
            BridgeError::PayloadRejected(format!("payload must be 32 bytes, got {}", payload.len()))
        })?;

        let call = FunctionCall {
            receiver_id: self.contract_id.clone(),
            method_name: "sign".to_string(),
            args: serde_json::json!({
                "request": {
                    "payload": digest.to_vec(),
                    "path": derivation_path,
                    "key_version": self.key_version,
                }
            }),
            gas: SIGN_CALL_GAS,
            deposit: "1".to_string(),
            wait_until: "EXECUTED_OPTIMISTIC".to_string(),
        };

        debug!(contract = %self.contract_id, path = derivation_path, "Requesting MPC signature");

        let response = match self.relayer.function_call(&call).await {
            Ok(response) => response,
            Err(RelayError::Rejected(msg)) if msg.to_ascii_lowercase().contains("payload") => {
                return Err(BridgeError::PayloadRejected(msg));
            }
            Err(e) => return Err(BridgeError::SigningUnavailable(e.to_string())),
        };

        let outcome = response.outcome.ok_or_else(|| {
            BridgeError::SigningUnavailable(format!(
                "no execution outcome for {}",
                response.transaction_hash
            ))
        })?;
        let raw = decode_success_value(&outcome).ok_or_else(|| {
            BridgeError::SigningUnavailable(format!(
                "sign did not succeed in {}",
                response.transaction_hash
            ))
        })?;
        let parsed: SignResponse = serde_json::from_slice(&raw)
            .map_err(|e| BridgeError::SigningUnavailable(format!("malformed sign response: {}", e)))?;
        let signature = Signature::from(parsed);

        // Must recover to the key the destination bridge verifies against
        let expected = self.signing_key(derivation_path)?;
        match signature.recover(&digest) {
            Ok(recovered) if recovered == expected => Ok(signature),
            Ok(_) => {
                warn!(tx_hash = %response.transaction_hash, "MPC signature recovered to an unexpected key");
                Err(BridgeError::SigningUnavailable(
                    "signature does not match derived key".into(),
                ))
            }
            Err(e) => Err(BridgeError::SigningUnavailable(e.to_string())),
        }
    }
}
