//! The invocation orchestration core: wallet session serialization,
//! dry-run/commit execution flow, confirmation tracking and reactive event
//! relay. This is where all chain-mutating work is coordinated.

use crate::chain::{ChainError, ScriptHash, StackValue};

pub(crate) mod orchestrator;
pub(crate) mod relay;
pub(crate) mod script;
pub(crate) mod session;
pub(crate) mod tracker;

pub use orchestrator::{AttachedAsset, InvokeOptions, Orchestrator};
pub use relay::{NotificationRelay, RelayPolicy, TransferDirective};
pub use session::WalletSession;
pub use tracker::{ConfirmationTracker, TrackerSnapshot};

/// One contract call inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationRequest {
    pub method: String,
    pub args: Vec<InvokeArg>,
}

impl InvocationRequest {
    pub fn new(method: impl Into<String>, args: Vec<InvokeArg>) -> Self {
        InvocationRequest {
            method: method.into(),
            args,
        }
    }
}

/// Argument value passed through to the contract, opaque to the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeArg {
    String(String),
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<InvokeArg>),
}

/// What an invocation hands back to the caller. `committed_tx` is present iff
/// a committing transaction was requested and submission succeeded.
#[derive(Debug, Clone, Default)]
pub struct InvocationResult {
    /// Result stack, one value per batched request, in request order.
    pub returned: Vec<StackValue>,
    /// Transactions broadcast but not yet seen in a block.
    pub unconfirmed: Vec<String>,
    /// Transactions evicted after the confirmation age ceiling.
    pub failed: Vec<String>,
    pub committed_tx: Option<String>,
}

/// Failure taxonomy of the invocation flow. Callers pattern-match variants
/// rather than inspecting message strings.
#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("could not open wallet: {0}")]
    WalletOpen(String),
    #[error("wallet is not synced yet ({percent_synced}/100), try again later")]
    WalletSyncTimeout { percent_synced: u8 },
    #[error("contract {0} not found")]
    ContractNotFound(ScriptHash),
    #[error("contract execution failed: {0}")]
    Execution(String),
    #[error("wallet has no gas")]
    InsufficientGas,
    #[error("transaction submission failed")]
    Submission,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl InvokeError {
    /// Errors the caller can retry unchanged once the wallet caught up or was
    /// refuelled.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InvokeError::WalletSyncTimeout { .. } | InvokeError::InsufficientGas
        )
    }
}
