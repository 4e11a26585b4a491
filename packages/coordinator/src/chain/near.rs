//! NEAR chain adapter
//!
//! Reads go straight to NEAR JSON-RPC. Function calls are submitted through
//! a relayer service that holds the signer account's access key, so the
//! coordinator never handles NEAR key material.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{classify_submit_error, ChainAdapter, Finality, OpKind, PendingOp, ReleaseAuthorization};
use crate::codec::ProtectedPayload;
use crate::config::NearConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{Chain, TransferId};

/// 100 TGas per bridge call
const BRIDGE_CALL_GAS: u64 = 100_000_000_000_000;

/// Prefix of op refs resolved from contract state instead of a tx hash
const STATE_REF_PREFIX: &str = "state:";

// ============================================================================
// JSON-RPC client
// ============================================================================

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    cause: Option<RpcErrorCause>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorCause {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CallFunctionResult {
    result: Vec<u8>,
}

/// Outcome of a NEAR RPC request, keeping "unknown transaction" distinct
/// from transport failure
enum RpcOutcome {
    Ok(Value),
    UnknownTransaction,
}

/// Minimal NEAR JSON-RPC client
#[derive(Debug, Clone)]
pub struct NearRpcClient {
    rpc_url: String,
    client: Client,
}

impl NearRpcClient {
    pub fn new(rpc_url: &str) -> BridgeResult<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            rpc_url: rpc_url.to_string(),
            client,
        })
    }

    async fn request(&self, method: &str, params: Value) -> BridgeResult<RpcOutcome> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": "dontcare",
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::ChainUnavailable(format!("{} request failed: {}", method, e)))?
            .json::<RpcResponse>()
            .await
            .map_err(|e| BridgeError::ChainUnavailable(format!("{} bad response: {}", method, e)))?;

        if let Some(error) = response.error {
            let cause = error.cause.map(|c| c.name).unwrap_or_default();
            if cause == "UNKNOWN_TRANSACTION" {
                return Ok(RpcOutcome::UnknownTransaction);
            }
            return Err(BridgeError::ChainUnavailable(format!(
                "RPC error {}: {} {}",
                cause,
                error.message,
                error.data.map(|d| d.to_string()).unwrap_or_default()
            )));
        }

        response
            .result
            .map(RpcOutcome::Ok)
            .ok_or_else(|| BridgeError::ChainUnavailable(format!("{} returned no result", method)))
    }

    /// View call against final state, decoding the JSON return value
    pub async fn view<T: for<'de> Deserialize<'de>>(
        &self,
        account_id: &str,
        method_name: &str,
        args: &Value,
    ) -> BridgeResult<T> {
        let args_base64 = base64::engine::general_purpose::STANDARD.encode(args.to_string());
        let params = serde_json::json!({
            "request_type": "call_function",
            "finality": "final",
            "account_id": account_id,
            "method_name": method_name,
            "args_base64": args_base64,
        });

        let RpcOutcome::Ok(result) = self.request("query", params).await? else {
            return Err(BridgeError::ChainUnavailable("query: unknown transaction".into()));
        };

        let call: CallFunctionResult = serde_json::from_value(result)
            .map_err(|e| BridgeError::ChainUnavailable(format!("malformed view result: {}", e)))?;
        serde_json::from_slice(&call.result)
            .map_err(|e| BridgeError::ChainUnavailable(format!("malformed view return: {}", e)))
    }

    /// Execution status of a transaction, without waiting
    pub async fn tx_status(&self, tx_hash: &str, sender_id: &str) -> BridgeResult<Finality> {
        let params = serde_json::json!({
            "tx_hash": tx_hash,
            "sender_account_id": sender_id,
            "wait_until": "NONE",
        });

        match self.request("EXPERIMENTAL_tx_status", params).await? {
            RpcOutcome::UnknownTransaction => Ok(Finality::Pending),
            RpcOutcome::Ok(result) => Ok(finality_from_outcome(&result)),
        }
    }
}

/// Map a NEAR execution outcome onto [`Finality`]
pub(crate) fn finality_from_outcome(outcome: &Value) -> Finality {
    if outcome
        .get("status")
        .and_then(|s| s.get("Failure"))
        .is_some()
    {
        return Finality::Reverted;
    }

    let final_status = outcome
        .get("final_execution_status")
        .and_then(Value::as_str)
        .unwrap_or("NONE");
    let succeeded = outcome
        .get("status")
        .map(|s| s.get("SuccessValue").is_some() || s.get("SuccessReceiptId").is_some())
        .unwrap_or(false);

    match final_status {
        "FINAL" if succeeded => Finality::Confirmed,
        _ => Finality::Pending,
    }
}

/// Decode the base64 `SuccessValue` of an execution outcome
pub(crate) fn decode_success_value(outcome: &Value) -> Option<Vec<u8>> {
    let encoded = outcome.get("status")?.get("SuccessValue")?.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

// ============================================================================
// Relayer client
// ============================================================================

/// Function call forwarded to the relayer for signing and broadcast
#[derive(Debug, Clone, Serialize)]
pub struct FunctionCall {
    pub receiver_id: String,
    pub method_name: String,
    pub args: Value,
    pub gas: u64,
    /// Attached deposit in yoctoNEAR
    pub deposit: String,
    /// NEAR `TxExecutionStatus` the relayer waits for before answering
    pub wait_until: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerResponse {
    pub transaction_hash: String,
    /// Execution outcome when the relayer waited for execution
    #[serde(default)]
    pub outcome: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RelayerClient {
    relayer_url: String,
    client: Client,
}

impl RelayerClient {
    pub fn new(relayer_url: &str, timeout: std::time::Duration) -> BridgeResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            relayer_url: relayer_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    /// Submit a function call. Returns the raw rejection text on a 4xx so
    /// callers can classify it.
    pub async fn function_call(&self, call: &FunctionCall) -> Result<RelayerResponse, RelayError> {
        let url = format!("{}/relay/function-call", self.relayer_url);

        let response = self
            .client
            .post(&url)
            .json(call)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::Rejected(body));
        }
        if !status.is_success() {
            return Err(RelayError::Transport(format!("relayer returned {}", status)));
        }

        response
            .json::<RelayerResponse>()
            .await
            .map_err(|e| RelayError::Transport(format!("malformed relayer response: {}", e)))
    }
}

/// Relayer failure: the call was refused, or it never got an answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    Rejected(String),
    Transport(String),
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Rejected(msg) => write!(f, "rejected: {}", msg),
            RelayError::Transport(msg) => write!(f, "transport: {}", msg),
        }
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Bridge operation recorded in NEAR contract state
#[derive(Debug, Deserialize)]
struct RecordedOperation {
    #[allow(dead_code)]
    transfer_id: String,
}

pub struct NearAdapter {
    name: String,
    bridge_account: String,
    signer_account: String,
    rpc: NearRpcClient,
    relayer: RelayerClient,
}

impl NearAdapter {
    pub fn new(config: &NearConfig) -> BridgeResult<Self> {
        let rpc = NearRpcClient::new(&config.rpc_url)?;
        let relayer = RelayerClient::new(&config.relayer_url, std::time::Duration::from_secs(30))?;

        info!(
            chain = %config.name,
            bridge = %config.bridge_account,
            signer = %config.signer_account,
            "NEAR adapter initialized"
        );

        Ok(Self {
            name: config.name.clone(),
            bridge_account: config.bridge_account.clone(),
            signer_account: config.signer_account.clone(),
            rpc,
            relayer,
        })
    }

    fn transfer_key(transfer_id: &TransferId) -> String {
        hex::encode(transfer_id.to_bytes32())
    }

    async fn submit(&self, kind: OpKind, method_name: &str, args: Value) -> BridgeResult<PendingOp> {
        let call = FunctionCall {
            receiver_id: self.bridge_account.clone(),
            method_name: method_name.to_string(),
            args,
            gas: BRIDGE_CALL_GAS,
            deposit: "0".to_string(),
            wait_until: "INCLUDED".to_string(),
        };

        debug!(chain = %self.name, method = method_name, "Submitting function call");

        match self.relayer.function_call(&call).await {
            Ok(response) => {
                info!(
                    chain = %self.name,
                    method = method_name,
                    tx_hash = %response.transaction_hash,
                    "Function call sent"
                );
                Ok(PendingOp::new(response.transaction_hash))
            }
            Err(RelayError::Rejected(msg)) => {
                warn!(chain = %self.name, method = method_name, error = %msg, "Relayer rejected call");
                Err(classify_submit_error(kind, &msg))
            }
            Err(RelayError::Transport(msg)) => Err(BridgeError::ChainUnavailable(msg)),
        }
    }
}

#[async_trait]
impl ChainAdapter for NearAdapter {
    fn chain(&self) -> Chain {
        Chain::Near
    }

    async fn submit_lock(
        &self,
        transfer_id: &TransferId,
        sender: &str,
        amount: u128,
        metadata: &ProtectedPayload,
    ) -> BridgeResult<PendingOp> {
        self.validate_address(sender)?;
        let args = serde_json::json!({
            "transfer_id": Self::transfer_key(transfer_id),
            "sender": sender,
            "amount": amount.to_string(),
            "metadata": metadata,
        });
        self.submit(OpKind::Lock, "lock_tokens", args).await
    }

    async fn submit_release(
        &self,
        transfer_id: &TransferId,
        amount: u128,
        recipient: &str,
        authorization: &ReleaseAuthorization,
    ) -> BridgeResult<PendingOp> {
        self.validate_address(recipient)?;
        let args = serde_json::json!({
            "transfer_id": Self::transfer_key(transfer_id),
            "recipient": recipient,
            "amount": amount.to_string(),
            "digest": hex::encode(authorization.digest),
            "signature": authorization.signature,
            "metadata": authorization.metadata,
        });
        self.submit(OpKind::Release, "mint_tokens", args).await
    }

    async fn submit_refund(
        &self,
        transfer_id: &TransferId,
        sender: &str,
        amount: u128,
    ) -> BridgeResult<PendingOp> {
        let args = serde_json::json!({
            "transfer_id": Self::transfer_key(transfer_id),
            "recipient": sender,
            "amount": amount.to_string(),
        });
        self.submit(OpKind::Refund, "unlock_tokens", args).await
    }

    async fn query_finality(&self, op_ref: &str) -> BridgeResult<Finality> {
        // Operation found in contract state rather than by tx hash
        if let Some(rest) = op_ref.strip_prefix(STATE_REF_PREFIX) {
            let (kind, transfer_key) = rest
                .split_once(':')
                .ok_or_else(|| BridgeError::ChainUnavailable(format!("malformed op ref {}", op_ref)))?;
            let found: Option<RecordedOperation> = self
                .rpc
                .view(
                    &self.bridge_account,
                    "get_operation",
                    &serde_json::json!({ "kind": kind, "transfer_id": transfer_key }),
                )
                .await?;
            return Ok(if found.is_some() {
                Finality::Confirmed
            } else {
                Finality::Pending
            });
        }

        self.rpc.tx_status(op_ref, &self.signer_account).await
    }

    async fn find_operation(
        &self,
        kind: OpKind,
        transfer_id: &TransferId,
    ) -> BridgeResult<Option<PendingOp>> {
        let transfer_key = Self::transfer_key(transfer_id);
        let found: Option<RecordedOperation> = self
            .rpc
            .view(
                &self.bridge_account,
                "get_operation",
                &serde_json::json!({ "kind": kind.as_str(), "transfer_id": transfer_key }),
            )
            .await?;

        Ok(found.map(|_| {
            PendingOp::new(format!("{}{}:{}", STATE_REF_PREFIX, kind.as_str(), transfer_key))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finality_from_outcome() {
        let confirmed = serde_json::json!({
            "final_execution_status": "FINAL",
            "status": { "SuccessValue": "" }
        });
        assert_eq!(finality_from_outcome(&confirmed), Finality::Confirmed);

        let optimistic = serde_json::json!({
            "final_execution_status": "EXECUTED_OPTIMISTIC",
            "status": { "SuccessValue": "" }
        });
        assert_eq!(finality_from_outcome(&optimistic), Finality::Pending);

        let failed = serde_json::json!({
            "final_execution_status": "EXECUTED_OPTIMISTIC",
            "status": { "Failure": { "ActionError": {} } }
        });
        assert_eq!(finality_from_outcome(&failed), Finality::Reverted);

        let started = serde_json::json!({
            "final_execution_status": "INCLUDED",
            "status": "Started"
        });
        assert_eq!(finality_from_outcome(&started), Finality::Pending);
    }

    #[test]
    fn test_decode_success_value() {
        let outcome = serde_json::json!({
            "status": { "SuccessValue": base64::engine::general_purpose::STANDARD.encode(b"{\"ok\":true}") }
        });
        assert_eq!(decode_success_value(&outcome).unwrap(), b"{\"ok\":true}");
        assert!(decode_success_value(&serde_json::json!({ "status": "Started" })).is_none());
    }

    #[test]
    fn test_relay_error_display() {
        assert_eq!(
            RelayError::Rejected("NotEnoughBalance".into()).to_string(),
            "rejected: NotEnoughBalance"
        );
    }
}
