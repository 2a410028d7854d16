//! HTTP collaborators: a JSON-RPC [`LedgerGateway`] and a plan descriptor source.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy::{
    consensus::{SignableTransaction, TxEnvelope, TxLegacy},
    eips::eip2718::Encodable2718,
};
use alloy_primitives::{Address, B256, Bytes, TxHash, TxKind, U64, U256};
use mech_core::{
    descriptor::{DescriptorError, PlanDescriptor, PlanDescriptorSource},
    errors::LedgerError,
    ledger::{
        ContractCall, KeySigner, LedgerGateway, LogEntry, LogQuery, Receipt, ReceiptStatus,
        TxParams,
    },
    types::Did,
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use url::Url;

/// Gas for a plain native transfer.
pub const TRANSFER_GAS: u64 = 21_000;

/// Upper bound on a single HTTP round trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorObject>,
}

impl RpcResponse {
    fn into_result<T: DeserializeOwned>(self) -> Result<T, LedgerError> {
        if let Some(error) = self.error {
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        serde_json::from_value(self.result).map_err(|e| LedgerError::decode(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
    block_number: Option<U64>,
    transaction_hash: Option<TxHash>,
}

impl From<RpcLog> for LogEntry {
    fn from(log: RpcLog) -> Self {
        LogEntry {
            address: log.address,
            topics: log.topics,
            data: log.data,
            block_number: log.block_number.map(|n| n.to()),
            tx_hash: log.transaction_hash,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: TxHash,
    block_number: Option<U64>,
    /// `0x1` on success, `0x0` on revert. Absent on pre-Byzantium chains.
    status: Option<U64>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

impl From<RpcReceipt> for ReceiptStatus {
    fn from(receipt: RpcReceipt) -> Self {
        if receipt.status.is_some_and(|s| s.is_zero()) {
            return ReceiptStatus::Reverted { reason: None };
        }
        ReceiptStatus::Success(Receipt {
            tx_hash: receipt.transaction_hash,
            block_number: receipt.block_number.map(|n| n.to()),
            logs: receipt.logs.into_iter().map(LogEntry::from).collect(),
        })
    }
}

fn call_object(from: Option<Address>, call: &ContractCall) -> Value {
    let mut object = json!({
        "to": call.to,
        "data": call.data,
    });
    if let Some(from) = from {
        object["from"] = json!(from);
    }
    if !call.value.is_zero() {
        object["value"] = json!(call.value);
    }
    object
}

/// A [`LedgerGateway`] speaking Ethereum JSON-RPC over HTTP.
///
/// Transactions are signed locally as EIP-155 legacy transactions. Submissions from the same
/// sender are serialized: the sender's lock is held from nonce allocation until the node
/// acknowledges the raw transaction.
#[derive(Debug, Clone)]
pub struct JsonRpcLedger {
    pub url: Url,
    pub client: reqwest::Client,
    pub chain_id: u64,
    pub request_timeout: Duration,
    next_id: Arc<AtomicU64>,
    senders: Arc<Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>>,
}

impl JsonRpcLedger {
    pub fn new(url: Url, chain_id: u64) -> Self {
        Self::with_client(reqwest::Client::new(), url, chain_id)
    }

    pub fn with_client(client: reqwest::Client, url: Url, chain_id: u64) -> Self {
        JsonRpcLedger {
            url,
            client,
            chain_id,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            next_id: Arc::new(AtomicU64::new(1)),
            senders: Arc::default(),
        }
    }

    /// Send one JSON-RPC request and decode its result.
    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, LedgerError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(self.url.clone())
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::transport(e.to_string()))?
            .error_for_status()
            .map_err(|e| LedgerError::transport(e.to_string()))?
            .json::<RpcResponse>()
            .await
            .map_err(|e| LedgerError::decode(e.to_string()))?;

        response.into_result()
    }

    fn sender_lock(&self, sender: Address) -> Arc<tokio::sync::Mutex<()>> {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(sender)
            .or_default()
            .clone()
    }

    async fn gas_price(&self, params: &TxParams) -> Result<u128, LedgerError> {
        match params.gas_price {
            Some(price) => Ok(price),
            None => {
                let price: U256 = self.request("eth_gasPrice", json!([])).await?;
                Ok(price.saturating_to())
            }
        }
    }

    async fn gas_limit(
        &self,
        from: Address,
        call: &ContractCall,
        params: &TxParams,
    ) -> Result<u64, LedgerError> {
        match params.gas_limit {
            Some(limit) => Ok(limit),
            None => {
                let estimate: U64 = self
                    .request("eth_estimateGas", json!([call_object(Some(from), call)]))
                    .await?;
                // 20% headroom over the estimate.
                Ok(estimate.to::<u64>().saturating_mul(6) / 5)
            }
        }
    }

    async fn sign_and_send<S: KeySigner>(
        &self,
        signer: &S,
        call: &ContractCall,
        params: &TxParams,
    ) -> Result<TxHash, LedgerError> {
        let from = signer.address();
        let lock = self.sender_lock(from);
        let _guard = lock.lock().await;

        let nonce: U64 = self
            .request("eth_getTransactionCount", json!([from, "pending"]))
            .await?;
        let gas_price = self.gas_price(params).await?;
        let gas_limit = self.gas_limit(from, call, params).await?;

        let tx = TxLegacy {
            chain_id: Some(self.chain_id),
            nonce: nonce.to(),
            gas_price,
            gas_limit,
            to: TxKind::Call(call.to),
            value: call.value,
            input: call.data.clone(),
        };
        let signature = signer
            .sign_hash(&tx.signature_hash())
            .await
            .map_err(|e| LedgerError::signing(e.to_string()))?;
        let raw = TxEnvelope::from(tx.into_signed(signature)).encoded_2718();

        let tx_hash = self
            .request::<TxHash>("eth_sendRawTransaction", json!([Bytes::from(raw)]))
            .await
            .map_err(|e| match e {
                LedgerError::Rpc { message, .. } => LedgerError::rejected(message),
                other => other,
            })?;

        #[cfg(feature = "tracing")]
        tracing::debug!(%from, to = %call.to, nonce = nonce.to::<u64>(), %tx_hash, "Transaction sent");

        Ok(tx_hash)
    }
}

impl LedgerGateway for JsonRpcLedger {
    async fn read(&self, call: &ContractCall) -> Result<Bytes, LedgerError> {
        self.request("eth_call", json!([call_object(None, call), "latest"]))
            .await
    }

    async fn native_balance(&self, account: Address) -> Result<U256, LedgerError> {
        self.request("eth_getBalance", json!([account, "latest"]))
            .await
    }

    async fn call<S: KeySigner>(
        &self,
        signer: &S,
        call: &ContractCall,
        params: &TxParams,
    ) -> Result<TxHash, LedgerError> {
        self.sign_and_send(signer, call, params).await
    }

    async fn transfer<S: KeySigner>(
        &self,
        signer: &S,
        to: Address,
        amount: U256,
        gas: Option<u64>,
    ) -> Result<TxHash, LedgerError> {
        let call = ContractCall::new(to, Bytes::new()).with_value(amount);
        let params = TxParams::builder()
            .gas_limit(gas.unwrap_or(TRANSFER_GAS))
            .build();
        self.sign_and_send(signer, &call, &params).await
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<ReceiptStatus, LedgerError> {
        let receipt: Option<RpcReceipt> = self
            .request("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        Ok(receipt.map_or(ReceiptStatus::Pending, ReceiptStatus::from))
    }

    async fn logs(&self, query: &LogQuery) -> Result<Vec<LogEntry>, LedgerError> {
        let mut filter = json!({ "address": query.address });
        if let Some(topic0) = query.topic0 {
            filter["topics"] = json!([topic0]);
        }
        filter["fromBlock"] = match query.from_block {
            Some(block) => json!(format!("{block:#x}")),
            None => json!("earliest"),
        };

        let logs: Vec<RpcLog> = self.request("eth_getLogs", json!([filter])).await?;
        Ok(logs.into_iter().map(LogEntry::from).collect())
    }
}

/// Fetches plan descriptors as JSON from `{base_url}/{did}`.
#[derive(Debug, Clone)]
pub struct HttpDescriptorSource {
    pub base_url: Url,
    pub client: reqwest::Client,
    pub request_timeout: Duration,
}

impl HttpDescriptorSource {
    pub fn new(base_url: Url) -> Self {
        HttpDescriptorSource {
            base_url,
            client: reqwest::Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn descriptor_url(&self, did: &Did) -> Result<Url, DescriptorError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DescriptorError::invalid("descriptor base url cannot hold a path"))?
            .pop_if_empty()
            .push(&did.to_string());
        Ok(url)
    }
}

impl PlanDescriptorSource for HttpDescriptorSource {
    async fn fetch_descriptor(&self, did: &Did) -> Result<PlanDescriptor, DescriptorError> {
        let response = self
            .client
            .get(self.descriptor_url(did)?)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| DescriptorError::transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DescriptorError::NotFound(*did));
        }
        if status.is_server_error() {
            return Err(DescriptorError::transport(format!("descriptor service answered {status}")));
        }
        if !status.is_success() {
            return Err(DescriptorError::invalid(format!("descriptor service answered {status}")));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| DescriptorError::transport(e.to_string()))?;
        serde_json::from_slice(&body).map_err(|e| DescriptorError::invalid(e.to_string()))
    }
}
