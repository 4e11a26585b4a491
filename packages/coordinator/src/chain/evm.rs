//! EVM chain adapter
//!
//! Submits bridge calls through an alloy provider with a local signer and
//! polls receipts over plain JSON-RPC for finality. Submission returns as
//! soon as the transaction is accepted by the node; finality is the
//! coordinator's concern.

use std::str::FromStr;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, Bytes, FixedBytes, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{classify_submit_error, ChainAdapter, Finality, OpKind, PendingOp, ReleaseAuthorization};
use crate::codec::ProtectedPayload;
use crate::config::EvmConfig;
use crate::contracts::evm_bridge::TransferBridge;
use crate::error::{BridgeError, BridgeResult};
use crate::types::{Chain, TransferId};

/// EVM transaction receipt from RPC
#[derive(Debug, Deserialize)]
struct TransactionReceipt {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
    status: Option<String>,
}

/// EVM RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i32,
    message: String,
}

pub struct EvmAdapter {
    name: String,
    rpc_url: String,
    bridge_address: Address,
    signer: PrivateKeySigner,
    finality_blocks: u64,
    start_block: u64,
    client: Client,
}

impl EvmAdapter {
    pub fn new(config: &EvmConfig) -> BridgeResult<Self> {
        let bridge_address = Address::from_str(&config.bridge_address)
            .map_err(|e| BridgeError::Config(format!("invalid EVM bridge address: {}", e)))?;
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .map_err(|_| BridgeError::Config("invalid EVM private key".into()))?;
        let signer = signer.with_chain_id(Some(config.chain_id));

        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| BridgeError::Config(format!("failed to build HTTP client: {}", e)))?;

        info!(
            chain = %config.name,
            chain_id = config.chain_id,
            bridge = %bridge_address,
            signer = %signer.address(),
            finality_blocks = config.finality_blocks,
            "EVM adapter initialized"
        );

        Ok(Self {
            name: config.name.clone(),
            rpc_url: config.rpc_url.clone(),
            bridge_address,
            signer,
            finality_blocks: config.finality_blocks,
            start_block: config.start_block,
            client,
        })
    }

    fn rpc_url(&self) -> BridgeResult<reqwest::Url> {
        self.rpc_url
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid EVM RPC URL: {}", e)))
    }

    fn parse_account(address: &str) -> BridgeResult<Address> {
        Address::from_str(address)
            .map_err(|_| BridgeError::InvalidRecipient(format!("not an EVM address: {}", address)))
    }

    async fn rpc_call<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BridgeResult<Option<T>> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BridgeError::ChainUnavailable(format!("{} request failed: {}", method, e)))?
            .json::<RpcResponse<T>>()
            .await
            .map_err(|e| BridgeError::ChainUnavailable(format!("{} bad response: {}", method, e)))?;

        if let Some(error) = response.error {
            return Err(BridgeError::ChainUnavailable(format!(
                "RPC error: {} - {}",
                error.code, error.message
            )));
        }

        Ok(response.result)
    }

    async fn block_number(&self) -> BridgeResult<u64> {
        let hex = self
            .rpc_call::<String>("eth_blockNumber", serde_json::json!([]))
            .await?
            .ok_or_else(|| BridgeError::ChainUnavailable("no block number returned".into()))?;
        parse_hex_u64(&hex)
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    fn chain(&self) -> Chain {
        Chain::Ethereum
    }

    async fn submit_lock(
        &self,
        transfer_id: &TransferId,
        sender: &str,
        amount: u128,
        metadata: &ProtectedPayload,
    ) -> BridgeResult<PendingOp> {
        let sender = Self::parse_account(sender)?;
        let metadata = serde_json::to_vec(metadata)
            .map_err(|e| BridgeError::PayloadRejected(format!("metadata encoding: {}", e)))?;

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url()?);
        let contract = TransferBridge::new(self.bridge_address, &provider);

        debug!(
            chain = %self.name,
            transfer_id = %transfer_id,
            sender = %sender,
            amount = amount,
            "Submitting lock"
        );

        let pending_tx = contract
            .lock(
                FixedBytes::from(transfer_id.to_bytes32()),
                sender,
                U256::from(amount),
                Bytes::from(metadata),
            )
            .send()
            .await
            .map_err(|e| classify_submit_error(OpKind::Lock, &e.to_string()))?;

        let tx_hash = format!("0x{:x}", pending_tx.tx_hash());
        info!(chain = %self.name, transfer_id = %transfer_id, tx_hash = %tx_hash, "Lock transaction sent");
        Ok(PendingOp::new(tx_hash))
    }

    async fn submit_release(
        &self,
        transfer_id: &TransferId,
        amount: u128,
        recipient: &str,
        authorization: &ReleaseAuthorization,
    ) -> BridgeResult<PendingOp> {
        let recipient = Self::parse_account(recipient)?;
        let signature = authorization.signature.to_rsv()?;
        let metadata = serde_json::to_vec(&authorization.metadata)
            .map_err(|e| BridgeError::PayloadRejected(format!("metadata encoding: {}", e)))?;

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url()?);
        let contract = TransferBridge::new(self.bridge_address, &provider);

        debug!(
            chain = %self.name,
            transfer_id = %transfer_id,
            recipient = %recipient,
            amount = amount,
            "Submitting release"
        );

        let pending_tx = contract
            .release(
                FixedBytes::from(transfer_id.to_bytes32()),
                recipient,
                U256::from(amount),
                FixedBytes::from(authorization.digest),
                Bytes::from(signature.to_vec()),
                Bytes::from(metadata),
            )
            .send()
            .await
            .map_err(|e| classify_submit_error(OpKind::Release, &e.to_string()))?;

        let tx_hash = format!("0x{:x}", pending_tx.tx_hash());
        info!(chain = %self.name, transfer_id = %transfer_id, tx_hash = %tx_hash, "Release transaction sent");
        Ok(PendingOp::new(tx_hash))
    }

    async fn submit_refund(
        &self,
        transfer_id: &TransferId,
        sender: &str,
        amount: u128,
    ) -> BridgeResult<PendingOp> {
        let sender = Self::parse_account(sender)?;

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new()
            .with_recommended_fillers()
            .wallet(wallet)
            .on_http(self.rpc_url()?);
        let contract = TransferBridge::new(self.bridge_address, &provider);

        let pending_tx = contract
            .refund(
                FixedBytes::from(transfer_id.to_bytes32()),
                sender,
                U256::from(amount),
            )
            .send()
            .await
            .map_err(|e| classify_submit_error(OpKind::Refund, &e.to_string()))?;

        let tx_hash = format!("0x{:x}", pending_tx.tx_hash());
        info!(chain = %self.name, transfer_id = %transfer_id, tx_hash = %tx_hash, "Refund transaction sent");
        Ok(PendingOp::new(tx_hash))
    }

    async fn query_finality(&self, op_ref: &str) -> BridgeResult<Finality> {
        let receipt = self
            .rpc_call::<TransactionReceipt>("eth_getTransactionReceipt", serde_json::json!([op_ref]))
            .await?;

        // No receipt yet: still in the mempool
        let Some(receipt) = receipt else {
            return Ok(Finality::Pending);
        };

        if receipt.status.as_deref() == Some("0x0") {
            warn!(chain = %self.name, tx_hash = %op_ref, "Transaction reverted");
            return Ok(Finality::Reverted);
        }

        let Some(tx_block) = receipt.block_number.as_deref() else {
            return Ok(Finality::Pending);
        };
        let tx_block = parse_hex_u64(tx_block)?;
        let current_block = self.block_number().await?;
        let confirmations = current_block.saturating_sub(tx_block);

        if confirmations >= self.finality_blocks {
            Ok(Finality::Confirmed)
        } else {
            debug!(
                chain = %self.name,
                tx_hash = %op_ref,
                confirmations = confirmations,
                required = self.finality_blocks,
                "Waiting for confirmations"
            );
            Ok(Finality::Pending)
        }
    }

    async fn find_operation(
        &self,
        kind: OpKind,
        transfer_id: &TransferId,
    ) -> BridgeResult<Option<PendingOp>> {
        let provider = ProviderBuilder::new().on_http(self.rpc_url()?);

        let signature = match kind {
            OpKind::Lock => TransferBridge::Locked::SIGNATURE_HASH,
            OpKind::Release => TransferBridge::Released::SIGNATURE_HASH,
            OpKind::Refund => TransferBridge::Refunded::SIGNATURE_HASH,
        };
        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(signature)
            .topic1(FixedBytes::from(transfer_id.to_bytes32()))
            .from_block(self.start_block);

        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| BridgeError::ChainUnavailable(format!("eth_getLogs failed: {}", e)))?;

        Ok(logs
            .into_iter()
            .find_map(|log| log.transaction_hash)
            .map(|hash| PendingOp::new(format!("0x{:x}", hash))))
    }
}

fn parse_hex_u64(hex: &str) -> BridgeResult<u64> {
    u64::from_str_radix(hex.trim_start_matches("0x"), 16)
        .map_err(|e| BridgeError::ChainUnavailable(format!("bad hex quantity {}: {}", hex, e)))
}
