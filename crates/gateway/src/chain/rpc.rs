//! JSON-RPC implementation of the chain and wallet collaborators.
//!
//! Targets a wallet-enabled node: `invokescript` returns the assembled and
//! signed transaction when the node has an open wallet, `sendrawtransaction`
//! broadcasts it. Contract events are pulled from a notifications endpoint
//! (the notification REST plugin) when one is configured. All node wire
//! details stay inside this module.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{
    Address, AssetBalance, ChainClient, ChainError, ContractMeta, DryRunOutcome,
    NotificationEvent, PreparedTx, ScriptHash, SharedWallet, StackValue, SubmittedTx,
    TransferOutput, WalletHandle, WalletProvider,
};
use crate::config::Config;

const NOTIFICATION_POLL_PERIOD: Duration = Duration::from_secs(5);

/// Assets the node-side wallet is queried for: canonical name as reported in
/// balances, and the short name the RPC verbs expect.
const WALLET_ASSETS: [(&str, &str); 2] = [("NEO", "neo"), ("NEOGas", "gas")];

pub struct NodeRpcClient {
    http: reqwest::Client,
    url: String,
    contract: ScriptHash,
    notifications_url: Option<String>,
    next_id: AtomicU64,
}

impl NodeRpcClient {
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.node_rpc_url.clone(),
            config.contract,
            config.notifications_url.clone(),
        )
    }

    pub fn new(url: String, contract: ScriptHash, notifications_url: Option<String>) -> Self {
        NodeRpcClient {
            http: reqwest::Client::new(),
            url,
            contract,
            notifications_url,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        let envelope: Value = response
            .json()
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;
        if let Some(error) = envelope.get("error") {
            return Err(ChainError::Rpc(error.to_string()));
        }
        Ok(envelope.get("result").cloned().unwrap_or(Value::Null))
    }

    /// Treats "Unknown ..." node errors as absence instead of failure.
    async fn call_optional(&self, method: &str, params: Value) -> Result<Option<Value>, ChainError> {
        match self.call(method, params).await {
            Ok(Value::Null) => Ok(None),
            Ok(value) => Ok(Some(value)),
            Err(ChainError::Rpc(message)) if message.contains("Unknown") => Ok(None),
            Err(error) => Err(error),
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn decode_hex(hex: &str) -> Result<Vec<u8>, ChainError> {
    if hex.len() % 2 != 0 {
        return Err(ChainError::Rpc(format!("odd-length hex payload: {hex}")));
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|p| u8::from_str_radix(p, 16).ok())
                .ok_or_else(|| ChainError::Rpc(format!("invalid hex payload: {hex}")))
        })
        .collect()
}

fn parse_stack_item(item: &Value) -> Option<StackValue> {
    let kind = item.get("type")?.as_str()?;
    let value = item.get("value")?;
    match kind {
        "ByteArray" | "ByteString" => Some(StackValue::Bytes(decode_hex(value.as_str()?).ok()?)),
        "Integer" => {
            let parsed = match value {
                Value::String(s) => s.parse::<i64>().ok()?,
                Value::Number(n) => n.as_i64()?,
                _ => return None,
            };
            Some(StackValue::Integer(parsed))
        }
        "Boolean" => Some(StackValue::Bytes(vec![u8::from(value.as_bool()?)])),
        "Array" => {
            let items = value
                .as_array()?
                .iter()
                .map(parse_stack_item)
                .collect::<Option<Vec<_>>>()?;
            Some(StackValue::Array(items))
        }
        _ => None,
    }
}

/// Contract notifications arrive as a state array whose first element names
/// the event kind; the remainder is the opaque payload.
fn parse_notification(notification: &Value, dry_run: bool) -> Option<NotificationEvent> {
    let state = notification.get("state")?.get("value")?.as_array()?;
    let mut items = state.iter().map(parse_stack_item);
    let kind = match items.next()?? {
        StackValue::Bytes(bytes) => String::from_utf8(bytes).ok()?,
        _ => return None,
    };
    let payload = items
        .map(|item| match item {
            Some(StackValue::Bytes(bytes)) => Some(bytes),
            Some(StackValue::Integer(n)) => Some(n.to_le_bytes().to_vec()),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some(NotificationEvent {
        kind,
        payload,
        dry_run,
    })
}

/// Fee strings come in whole-asset decimal notation; fees are tracked as
/// fixed-8 units internally.
fn parse_fixed8(value: &Value) -> u64 {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    };
    (parsed * 1e8).round().max(0.0) as u64
}

/// Forwards the events of one notifications page that sit past the block
/// cursor, returning the advanced cursor. The cursor only moves once the
/// whole page is drained, so several events committed in the same block all
/// relay.
fn relay_notifications_page(
    page: &Value,
    last_block: u64,
    events: &mpsc::UnboundedSender<NotificationEvent>,
) -> u64 {
    let Some(results) = page.get("results").and_then(Value::as_array) else {
        return last_block;
    };
    let mut cursor = last_block;
    for entry in results {
        let block = entry.get("block").and_then(Value::as_u64).unwrap_or(0);
        if block <= last_block {
            continue;
        }
        cursor = cursor.max(block);
        if let Some(event) = parse_notification(entry, false) {
            if events.send(event).is_err() {
                return cursor;
            }
        }
    }
    cursor
}

impl ChainClient for NodeRpcClient {
    fn height(&self) -> BoxFuture<'_, Result<u64, ChainError>> {
        async move {
            let result = self.call("getblockcount", json!([])).await?;
            Ok(result.as_u64().unwrap_or(0))
        }
        .boxed()
    }

    fn header_height(&self) -> BoxFuture<'_, Result<u64, ChainError>> {
        async move {
            let result = self.call("getblockheadercount", json!([])).await?;
            Ok(result.as_u64().unwrap_or(0))
        }
        .boxed()
    }

    fn transaction_height<'a>(
        &'a self,
        tx_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<u64>, ChainError>> {
        async move {
            let result = self
                .call_optional("getrawtransaction", json!([tx_hash, 1]))
                .await?;
            Ok(result
                .as_ref()
                .and_then(|tx| tx.get("height"))
                .and_then(Value::as_i64)
                .and_then(|height| (height >= 0).then_some(height as u64)))
        }
        .boxed()
    }

    fn contract<'a>(
        &'a self,
        hash: &'a ScriptHash,
    ) -> BoxFuture<'a, Result<Option<ContractMeta>, ChainError>> {
        async move {
            let result = self
                .call_optional("getcontractstate", json!([hash.to_string()]))
                .await?;
            match result {
                Some(_) => Ok(Some(ContractMeta { hash: *hash })),
                None => Ok(None),
            }
        }
        .boxed()
    }

    fn dry_run<'a>(
        &'a self,
        script: &'a [u8],
        _wallet: &'a SharedWallet,
        outputs: &'a [TransferOutput],
    ) -> BoxFuture<'a, Result<Option<DryRunOutcome>, ChainError>> {
        async move {
            let attached: Vec<Value> = outputs
                .iter()
                .map(|output| {
                    json!({
                        "asset": output.asset,
                        "address": output.to.as_str(),
                        "value": output.amount,
                    })
                })
                .collect();
            let result = self
                .call("invokescript", json!([encode_hex(script), attached]))
                .await?;

            let state = result.get("state").and_then(Value::as_str).unwrap_or("");
            if state.contains("FAULT") {
                tracing::debug!(state, "dry run reported an execution fault");
                return Ok(None);
            }
            // the node only returns an assembled tx when its wallet is open
            let (Some(raw), Some(hash)) = (
                result.get("tx").and_then(Value::as_str),
                result.get("txid").and_then(Value::as_str),
            ) else {
                return Ok(None);
            };

            let stack = result
                .get("stack")
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(parse_stack_item).collect())
                .unwrap_or_default();
            let events = result
                .get("notifications")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|n| parse_notification(n, true))
                        .collect()
                })
                .unwrap_or_default();

            Ok(Some(DryRunOutcome {
                tx: PreparedTx {
                    raw: decode_hex(raw)?,
                    hash: hash.to_owned(),
                },
                fee: parse_fixed8(result.get("gas_consumed").unwrap_or(&Value::Null)),
                stack,
                ops_count: result
                    .get("num_ops")
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
                events,
            }))
        }
        .boxed()
    }

    fn submit<'a>(
        &'a self,
        _wallet: &'a SharedWallet,
        tx: &'a PreparedTx,
        fee: u64,
    ) -> BoxFuture<'a, Result<Option<SubmittedTx>, ChainError>> {
        async move {
            tracing::debug!(tx = %tx.hash, fee, "relaying transaction");
            let result = self
                .call("sendrawtransaction", json!([encode_hex(&tx.raw)]))
                .await?;
            if result.as_bool().unwrap_or(false) {
                Ok(Some(SubmittedTx {
                    hash: tx.hash.clone(),
                }))
            } else {
                Ok(None)
            }
        }
        .boxed()
    }

    fn send_funds<'a>(
        &'a self,
        _wallet: &'a SharedWallet,
        asset: &'a str,
        to: &'a Address,
        amount: u64,
    ) -> BoxFuture<'a, Result<Option<SubmittedTx>, ChainError>> {
        async move {
            let result = self
                .call("sendtoaddress", json!([asset, to.as_str(), amount]))
                .await?;
            Ok(result
                .get("txid")
                .and_then(Value::as_str)
                .map(|hash| SubmittedTx {
                    hash: hash.to_owned(),
                }))
        }
        .boxed()
    }

    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<NotificationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let Some(base) = self.notifications_url.clone() else {
            tracing::warn!("no notifications endpoint configured, contract events will not relay");
            return rx;
        };
        let url = format!("{base}/v1/notifications/contract/{}", self.contract);
        let http = self.http.clone();
        tokio::spawn(async move {
            let mut last_block = 0u64;
            let mut interval = tokio::time::interval(NOTIFICATION_POLL_PERIOD);
            interval.tick().await;
            loop {
                interval.tick().await;
                let page = match http.get(&url).send().await {
                    Ok(response) => match response.json::<Value>().await {
                        Ok(page) => page,
                        Err(error) => {
                            tracing::warn!(%error, "malformed notifications page");
                            continue;
                        }
                    },
                    Err(error) => {
                        tracing::warn!(%error, "notifications endpoint unreachable");
                        continue;
                    }
                };
                last_block = relay_notifications_page(&page, last_block, &tx);
                if tx.is_closed() {
                    return;
                }
            }
        });
        rx
    }
}

impl WalletProvider for NodeRpcClient {
    fn open<'a>(
        &'a self,
        path: &'a Path,
        passphrase: &'a str,
    ) -> BoxFuture<'a, Result<SharedWallet, ChainError>> {
        async move {
            let result = self
                .call(
                    "openwallet",
                    json!([path.to_string_lossy().as_ref(), passphrase]),
                )
                .await
                .map_err(|e| ChainError::Wallet(e.to_string()))?;
            if !result.as_bool().unwrap_or(false) {
                return Err(ChainError::Wallet(format!(
                    "node refused to open wallet at {}",
                    path.display()
                )));
            }
            let wallet: SharedWallet = Arc::new(RpcWallet {
                client: NodeRpcClient {
                    http: self.http.clone(),
                    url: self.url.clone(),
                    contract: self.contract,
                    notifications_url: None,
                    next_id: AtomicU64::new(1),
                },
            });
            Ok(wallet)
        }
        .boxed()
    }
}

/// Node-side wallet opened via the RPC wallet plugin.
struct RpcWallet {
    client: NodeRpcClient,
}

impl WalletHandle for RpcWallet {
    fn process_blocks(&self) -> BoxFuture<'_, Result<(), ChainError>> {
        // the node-side wallet replays blocks on its own; querying the height
        // keeps the session alive and surfaces backend failures early
        async move {
            self.client
                .call("getwalletheight", json!([]))
                .await
                .map_err(|e| ChainError::Wallet(e.to_string()))?;
            Ok(())
        }
        .boxed()
    }

    fn synced_height(&self) -> BoxFuture<'_, Result<u64, ChainError>> {
        async move {
            let result = self
                .client
                .call("getwalletheight", json!([]))
                .await
                .map_err(|e| ChainError::Wallet(e.to_string()))?;
            Ok(result.as_u64().unwrap_or(0))
        }
        .boxed()
    }

    fn balances(&self) -> BoxFuture<'_, Result<Vec<AssetBalance>, ChainError>> {
        async move {
            let mut balances = Vec::with_capacity(WALLET_ASSETS.len());
            for (canonical, rpc_name) in WALLET_ASSETS {
                let result = self
                    .client
                    .call("getbalance", json!([rpc_name]))
                    .await
                    .map_err(|e| ChainError::Wallet(e.to_string()))?;
                let confirmed = result
                    .get("confirmed")
                    .or_else(|| result.get("balance"))
                    .unwrap_or(&Value::Null);
                balances.push(AssetBalance {
                    asset: canonical.to_owned(),
                    amount: parse_fixed8(confirmed),
                });
            }
            Ok(balances)
        }
        .boxed()
    }
}
