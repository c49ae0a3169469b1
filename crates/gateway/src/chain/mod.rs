//! Interfaces for the external collaborators: the chain node and the wallet
//! subsystem. The orchestration core only ever talks to these traits; the
//! production implementation over the node's JSON-RPC endpoint lives in
//! [`rpc`], and mock implementations for tests live in `test_utils`.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

pub mod rpc;

/// Version byte prepended to script hashes when encoding base58check addresses.
const ADDRESS_VERSION: u8 = 0x17;

/// 20-byte chain-native identifier for accounts and contracts.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptHash([u8; 20]);

impl ScriptHash {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| ChainError::InvalidValue {
            what: "script hash",
            value: format!("{} bytes", bytes.len()),
        })?;
        Ok(ScriptHash(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_address(&self) -> Address {
        Address(
            bs58::encode(&self.0)
                .with_check_version(ADDRESS_VERSION)
                .into_string(),
        )
    }
}

impl fmt::Display for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ScriptHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptHash({self})")
    }
}

impl FromStr for ScriptHash {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s.strip_prefix("0x").unwrap_or(s);
        if hex.len() != 40 {
            return Err(ChainError::InvalidValue {
                what: "script hash",
                value: s.to_owned(),
            });
        }
        let mut bytes = [0u8; 20];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|_| ChainError::InvalidValue {
                what: "script hash",
                value: s.to_owned(),
            })?;
            bytes[i] = u8::from_str_radix(pair, 16).map_err(|_| ChainError::InvalidValue {
                what: "script hash",
                value: s.to_owned(),
            })?;
        }
        Ok(ScriptHash(bytes))
    }
}

/// Base58check-encoded account address, interconvertible with a script hash.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Decodes the raw 20-byte script hash emitted by contract events into an
    /// address string.
    pub fn from_script_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        Ok(ScriptHash::from_bytes(bytes)?.to_address())
    }

    pub fn script_hash(&self) -> Result<ScriptHash, ChainError> {
        let decoded = bs58::decode(&self.0)
            .with_check(Some(ADDRESS_VERSION))
            .into_vec()
            .map_err(|_| ChainError::InvalidValue {
                what: "address",
                value: self.0.clone(),
            })?;
        // with_check keeps the version byte at the front
        ScriptHash::from_bytes(&decoded[1..])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl FromStr for Address {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_owned());
        // round-trip through the checksum to validate
        address.script_hash()?;
        Ok(address)
    }
}

/// Opaque value returned on the VM result stack by a contract execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackValue {
    Bytes(Vec<u8>),
    Integer(i64),
    Array(Vec<StackValue>),
}

impl StackValue {
    /// The canonical "false" the contract returns when its own preconditions
    /// reject an invocation: a single zero byte.
    pub fn is_false_sentinel(&self) -> bool {
        matches!(self, StackValue::Bytes(bytes) if bytes.as_slice() == [0u8])
    }

    /// Projection used by the API layer: byte strings become UTF-8 text when
    /// valid, hex otherwise.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            StackValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(text) => serde_json::Value::String(text.to_owned()),
                Err(_) => {
                    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
                    serde_json::Value::String(hex)
                }
            },
            StackValue::Integer(value) => serde_json::Value::from(*value),
            StackValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(StackValue::to_json).collect())
            }
        }
    }
}

/// Metadata of a deployed contract, resolved by hash.
#[derive(Debug, Clone)]
pub struct ContractMeta {
    pub hash: ScriptHash,
}

impl ContractMeta {
    pub fn address(&self) -> Address {
        self.hash.to_address()
    }
}

/// A transaction output attached to an invocation (pay-to-invoke patterns).
#[derive(Debug, Clone, PartialEq)]
pub struct TransferOutput {
    pub asset: String,
    pub amount: u64,
    pub to: Address,
}

/// An event emitted by the contract, either during a dry run or during
/// committed execution on-chain. Consumed once by the notification relay.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: String,
    pub payload: Vec<Vec<u8>>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssetBalance {
    pub asset: String,
    /// Fixed-8 units of the asset.
    pub amount: u64,
}

/// Transaction assembled (and signed by the node-side wallet) during a dry
/// run. Opaque to the orchestrator; only [`ChainClient::submit`] consumes it.
#[derive(Debug, Clone)]
pub struct PreparedTx {
    pub raw: Vec<u8>,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct SubmittedTx {
    pub hash: String,
}

/// Everything a dry run yields: the assembled transaction, a fee estimate,
/// the result stack, the executed-operation count and any emitted events.
#[derive(Debug, Clone)]
pub struct DryRunOutcome {
    pub tx: PreparedTx,
    pub fee: u64,
    pub stack: Vec<StackValue>,
    pub ops_count: u64,
    pub events: Vec<NotificationEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("node rpc failure: {0}")]
    Rpc(String),
    #[error("wallet backend failure: {0}")]
    Wallet(String),
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },
}

pub type SharedChain = Arc<dyn ChainClient>;
pub type SharedWallet = Arc<dyn WalletHandle>;

/// The blockchain node, as consumed by the orchestration core.
///
/// Trait methods return boxed futures so implementations stay object-safe and
/// can be shared as `Arc<dyn ChainClient>` across background tasks.
pub trait ChainClient: Send + Sync {
    fn height(&self) -> BoxFuture<'_, Result<u64, ChainError>>;

    fn header_height(&self) -> BoxFuture<'_, Result<u64, ChainError>>;

    /// Block height a transaction was included at, `None` while unconfirmed
    /// or unknown.
    fn transaction_height<'a>(
        &'a self,
        tx_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<u64>, ChainError>>;

    fn contract<'a>(
        &'a self,
        hash: &'a ScriptHash,
    ) -> BoxFuture<'a, Result<Option<ContractMeta>, ChainError>>;

    /// Test-executes a script against current chain state without
    /// broadcasting. `Ok(None)` means the virtual machine reported an
    /// execution fault.
    fn dry_run<'a>(
        &'a self,
        script: &'a [u8],
        wallet: &'a SharedWallet,
        outputs: &'a [TransferOutput],
    ) -> BoxFuture<'a, Result<Option<DryRunOutcome>, ChainError>>;

    /// Broadcasts a prepared transaction. `Ok(None)` means the node rejected
    /// the relay.
    fn submit<'a>(
        &'a self,
        wallet: &'a SharedWallet,
        tx: &'a PreparedTx,
        fee: u64,
    ) -> BoxFuture<'a, Result<Option<SubmittedTx>, ChainError>>;

    /// Constructs and broadcasts a raw asset transfer funded by the wallet.
    fn send_funds<'a>(
        &'a self,
        wallet: &'a SharedWallet,
        asset: &'a str,
        to: &'a Address,
        amount: u64,
    ) -> BoxFuture<'a, Result<Option<SubmittedTx>, ChainError>>;

    /// Stream of committed-execution contract events. The service composition
    /// root owns the receiver and its lifecycle.
    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<NotificationEvent>;
}

/// Opens wallet files; the cryptographic and storage internals stay behind
/// this boundary.
pub trait WalletProvider: Send + Sync {
    fn open<'a>(
        &'a self,
        path: &'a Path,
        passphrase: &'a str,
    ) -> BoxFuture<'a, Result<SharedWallet, ChainError>>;
}

/// An open wallet. All chain-mutating work goes through exactly one of these
/// at a time, enforced by the wallet session lock.
pub trait WalletHandle: Send + Sync {
    /// Replays new blocks into wallet-local state (UTXO/balance bookkeeping).
    fn process_blocks(&self) -> BoxFuture<'_, Result<(), ChainError>>;

    fn synced_height(&self) -> BoxFuture<'_, Result<u64, ChainError>>;

    fn balances(&self) -> BoxFuture<'_, Result<Vec<AssetBalance>, ChainError>>;
}
