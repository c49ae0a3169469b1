//! REST gateway orchestrating smart-contract invocations against a chain
//! node and its single operator wallet.
//!
//! The crate is organized around four cooperating pieces:
//! - [`invoke::WalletSession`]: exclusive, sync-gated access to the wallet;
//! - [`invoke::Orchestrator`]: the dry-run/commit invocation flow;
//! - [`invoke::ConfirmationTracker`]: post-submission confirmation polling;
//! - [`invoke::NotificationRelay`]: contract transfer events settled with
//!   operator-funded transfers.
//!
//! [`service::Service`] wires them together; [`server`] exposes them over an
//! authenticated REST API.

pub mod chain;
pub mod config;
pub mod server;
pub mod service;
pub mod test_utils;

mod invoke;

pub use invoke::{
    AttachedAsset, ConfirmationTracker, InvocationRequest, InvocationResult, InvokeArg,
    InvokeError, InvokeOptions, NotificationRelay, Orchestrator, RelayPolicy, TrackerSnapshot,
    TransferDirective, WalletSession,
};
