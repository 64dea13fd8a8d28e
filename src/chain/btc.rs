//! bitcoind JSON-RPC client
//!
//! Implements the currency capability set against a bitcoind wallet.
//! Deposit history is recovered with `listsinceblock`.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    CurrencyClient, EntryCategory, HistoryMode, NodeStatus, SendReceipt, SinceBlock,
    TransactionInfo, TransferEntry,
};
use crate::config::BtcRpcConfig;
use crate::error::ChainError;
use crate::ledger::types::TxStatus;

/// bitcoind RPC error codes that guarantee nothing was broadcast
const NOT_SENT_CODES: [i64; 6] = [
    -3,  // RPC_TYPE_ERROR
    -4,  // RPC_WALLET_ERROR
    -5,  // RPC_INVALID_ADDRESS_OR_KEY
    -6,  // RPC_WALLET_INSUFFICIENT_FUNDS
    -13, // RPC_WALLET_UNLOCK_NEEDED
    -14, // RPC_WALLET_PASSPHRASE_INCORRECT
];

/// RPC_IN_WARMUP
const WARMUP_CODE: i64 = -28;

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct BlockchainInfo {
    blocks: u64,
    bestblockhash: String,
}

#[derive(Deserialize)]
struct WalletEntry {
    #[serde(default)]
    address: Option<String>,
    category: String,
    amount: serde_json::Number,
    #[serde(default)]
    confirmations: Option<i64>,
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    time: Option<i64>,
}

#[derive(Deserialize)]
struct WalletTransaction {
    txid: String,
    confirmations: i64,
    time: i64,
    #[serde(default)]
    details: Vec<WalletEntry>,
}

#[derive(Deserialize)]
struct ListSinceBlock {
    transactions: Vec<WalletEntry>,
    lastblock: String,
}

/// Convert a JSON amount to a positive decimal
fn parse_amount(n: &serde_json::Number) -> Result<Decimal, ChainError> {
    Decimal::from_str(&n.to_string())
        .or_else(|_| Decimal::from_scientific(&n.to_string()))
        .map(|d| d.abs())
        .map_err(|e| ChainError::Parse(format!("amount {}: {}", n, e)))
}

/// Negative confirmation counts mark conflicted transactions
fn parse_confirmations(c: i64) -> u32 {
    u32::try_from(c).unwrap_or(0)
}

fn parse_category(c: &str) -> EntryCategory {
    match c {
        "receive" => EntryCategory::Receive,
        "send" => EntryCategory::Send,
        _ => EntryCategory::Other,
    }
}

fn to_entry(raw: WalletEntry, txid: Option<&str>, time: i64) -> Result<TransferEntry, ChainError> {
    let txid = raw
        .txid
        .as_deref()
        .or(txid)
        .ok_or_else(|| ChainError::Parse("wallet entry without txid".to_string()))?
        .to_string();
    Ok(TransferEntry {
        txid,
        account: raw.address.unwrap_or_default(),
        category: parse_category(&raw.category),
        amount: parse_amount(&raw.amount)?,
        confirmations: raw.confirmations.map(parse_confirmations),
        // bitcoind reports seconds
        time: raw.time.unwrap_or(time) * 1000,
    })
}

/// Classify an RPC-level error returned for a send call
fn classify_send_error(code: i64, message: String) -> ChainError {
    if NOT_SENT_CODES.contains(&code) {
        ChainError::DefinitelyNotSent(format!("{} ({})", message, code))
    } else if code == WARMUP_CODE {
        ChainError::NodeUnreachable(message)
    } else {
        ChainError::Rpc { code, message }
    }
}

fn classify_query_error(code: i64, message: String) -> ChainError {
    if code == WARMUP_CODE {
        ChainError::NodeUnreachable(message)
    } else {
        ChainError::Rpc { code, message }
    }
}

pub struct BitcoindClient {
    config: BtcRpcConfig,
    http: reqwest::Client,
    next_id: AtomicU64,
    required_confirmations: u32,
}

impl BitcoindClient {
    pub fn new(config: BtcRpcConfig, required_confirmations: u32) -> Result<Self, ChainError> {
        info!("Initializing bitcoind client at {}", config.url);

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ChainError::NodeUnreachable(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            config,
            http,
            next_id: AtomicU64::new(1),
            required_confirmations,
        })
    }

    /// Make a JSON-RPC call.
    ///
    /// `sending` switches error classification: a timeout on a send is
    /// ambiguous, a timeout on a query just means the node is unreachable.
    async fn rpc_call<R>(&self, method: &str, params: Value, sending: bool) -> Result<R, ChainError>
    where
        R: DeserializeOwned,
    {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.config.url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ChainError::NodeUnreachable(format!("{}: {}", method, e))
                } else if sending {
                    ChainError::Ambiguous(format!("{}: {}", method, e))
                } else {
                    ChainError::NodeUnreachable(format!("{}: {}", method, e))
                }
            })?;

        // bitcoind answers RPC errors with HTTP 500 and a JSON body
        let status = response.status();
        let rpc_response: RpcResponse<R> = response.json().await.map_err(|e| {
            if sending {
                ChainError::Ambiguous(format!("{} (HTTP {}): {}", method, status, e))
            } else {
                ChainError::Parse(format!("{} (HTTP {}): {}", method, status, e))
            }
        })?;

        if let Some(error) = rpc_response.error {
            debug!(method, code = error.code, "bitcoind RPC error: {}", error.message);
            return Err(if sending {
                classify_send_error(error.code, error.message)
            } else {
                classify_query_error(error.code, error.message)
            });
        }

        rpc_response
            .result
            .ok_or_else(|| ChainError::Parse(format!("{}: no result in RPC response", method)))
    }

    /// Fetch confirmations and time for a txid we just broadcast
    async fn receipt_for(&self, txid: String) -> Result<SendReceipt, ChainError> {
        match self.transaction_info(&txid).await {
            Ok(info) => Ok(SendReceipt {
                status: if info.confirmations.unwrap_or(0) >= self.required_confirmations {
                    TxStatus::Confirmed
                } else {
                    TxStatus::Pending
                },
                confirmations: info.confirmations,
                timestamp: info.time,
                txid,
            }),
            Err(e) => {
                // Broadcast already happened; only the follow-up query failed
                warn!(txid = %txid, "Could not fetch sent transaction details: {}", e);
                Ok(SendReceipt {
                    txid,
                    confirmations: Some(0),
                    status: TxStatus::Pending,
                    timestamp: chrono::Utc::now().timestamp_millis(),
                })
            }
        }
    }
}

#[async_trait]
impl CurrencyClient for BitcoindClient {
    fn currency(&self) -> &str {
        "BTC"
    }

    async fn ping(&self) -> Result<NodeStatus, ChainError> {
        let info: BlockchainInfo = self.rpc_call("getblockchaininfo", json!([]), false).await?;
        Ok(NodeStatus {
            height: info.blocks,
            best_block: info.bestblockhash,
        })
    }

    async fn create_account(&self) -> Result<String, ChainError> {
        self.rpc_call("getnewaddress", json!([]), false).await
    }

    async fn send_one(&self, account: &str, amount: Decimal) -> Result<SendReceipt, ChainError> {
        let txid: String = self
            .rpc_call(
                "sendtoaddress",
                json!([account, amount.to_string()]),
                true,
            )
            .await?;
        info!(txid = %txid, "sendtoaddress {} -> {}", amount, account);
        self.receipt_for(txid).await
    }

    fn supports_send_many(&self) -> bool {
        true
    }

    async fn send_many(
        &self,
        outputs: &BTreeMap<String, Decimal>,
    ) -> Result<SendReceipt, ChainError> {
        let amounts: serde_json::Map<String, Value> = outputs
            .iter()
            .map(|(addr, amount)| (addr.clone(), Value::String(amount.to_string())))
            .collect();
        let txid: String = self
            .rpc_call("sendmany", json!(["", amounts]), true)
            .await?;
        info!(txid = %txid, outputs = outputs.len(), "sendmany");
        self.receipt_for(txid).await
    }

    async fn transaction_info(&self, txid: &str) -> Result<TransactionInfo, ChainError> {
        let raw: WalletTransaction = self.rpc_call("gettransaction", json!([txid]), false).await?;
        let time = raw.time;
        let entries = raw
            .details
            .into_iter()
            .map(|d| {
                let mut entry = to_entry(d, Some(&raw.txid), time)?;
                entry.confirmations = Some(parse_confirmations(raw.confirmations));
                Ok(entry)
            })
            .collect::<Result<Vec<_>, ChainError>>()?;
        Ok(TransactionInfo {
            txid: raw.txid,
            confirmations: Some(parse_confirmations(raw.confirmations)),
            time: time * 1000,
            entries,
        })
    }

    fn history_mode(&self) -> HistoryMode {
        HistoryMode::SinceBlock
    }

    async fn list_since_block(
        &self,
        block: Option<&str>,
        target_confirmations: u32,
    ) -> Result<SinceBlock, ChainError> {
        let params = match block {
            Some(hash) => json!([hash, target_confirmations.max(1)]),
            None => json!(["", target_confirmations.max(1)]),
        };
        let raw: ListSinceBlock = self.rpc_call("listsinceblock", params, false).await?;
        let entries = raw
            .transactions
            .into_iter()
            .map(|e| to_entry(e, None, 0))
            .collect::<Result<Vec<_>, ChainError>>()?;
        Ok(SinceBlock {
            entries,
            last_block: raw.lastblock,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_funds_is_definitely_not_sent() {
        let err = classify_send_error(-6, "Insufficient funds".to_string());
        assert!(matches!(err, ChainError::DefinitelyNotSent(_)));
        let err = classify_send_error(-5, "Invalid address".to_string());
        assert!(matches!(err, ChainError::DefinitelyNotSent(_)));
    }

    #[test]
    fn test_warmup_is_node_unreachable() {
        assert!(classify_send_error(-28, "Loading wallet".into()).is_retryable());
        assert!(classify_query_error(-28, "Loading wallet".into()).is_retryable());
    }

    #[test]
    fn test_unknown_send_code_is_unclassified() {
        let err = classify_send_error(-1, "boom".to_string());
        assert_eq!(
            err,
            ChainError::Rpc {
                code: -1,
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn test_parse_listsinceblock() {
        let body = r#"{
            "transactions": [
                {"address": "bcrt1qa", "category": "receive", "amount": 0.1,
                 "confirmations": 2, "txid": "aa", "time": 1700000000},
                {"address": "bcrt1qb", "category": "send", "amount": -1.25,
                 "confirmations": 0, "txid": "bb", "time": 1700000100},
                {"address": "bcrt1qc", "category": "immature", "amount": 50,
                 "confirmations": 1, "txid": "cc", "time": 1700000200}
            ],
            "lastblock": "0000abc"
        }"#;
        let raw: ListSinceBlock = serde_json::from_str(body).unwrap();
        assert_eq!(raw.lastblock, "0000abc");

        let entries: Vec<TransferEntry> = raw
            .transactions
            .into_iter()
            .map(|e| to_entry(e, None, 0).unwrap())
            .collect();
        assert_eq!(entries[0].category, EntryCategory::Receive);
        assert_eq!(entries[0].amount, Decimal::from_str("0.1").unwrap());
        assert_eq!(entries[0].time, 1_700_000_000_000);
        assert_eq!(entries[1].category, EntryCategory::Send);
        assert_eq!(entries[1].amount, Decimal::from_str("1.25").unwrap());
        assert_eq!(entries[2].category, EntryCategory::Other);
    }

    #[test]
    fn test_parse_gettransaction_details_inherit_txid() {
        let body = r#"{
            "txid": "dd", "confirmations": 4, "time": 1700000000,
            "details": [
                {"address": "bcrt1qa", "category": "receive", "amount": 2},
                {"address": "bcrt1qb", "category": "receive", "amount": 3}
            ]
        }"#;
        let raw: WalletTransaction = serde_json::from_str(body).unwrap();
        let entry = to_entry(
            WalletEntry {
                address: raw.details[1].address.clone(),
                category: raw.details[1].category.clone(),
                amount: raw.details[1].amount.clone(),
                confirmations: None,
                txid: None,
                time: None,
            },
            Some(&raw.txid),
            raw.time,
        )
        .unwrap();
        assert_eq!(entry.txid, "dd");
        assert_eq!(entry.account, "bcrt1qb");
        assert_eq!(entry.amount, Decimal::new(3, 0));
    }

    #[test]
    fn test_conflicted_confirmations_clamp_to_zero() {
        assert_eq!(parse_confirmations(-1), 0);
        assert_eq!(parse_confirmations(6), 6);
    }
}
