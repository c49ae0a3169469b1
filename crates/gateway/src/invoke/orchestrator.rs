//! The invocation flow itself: wallet acquisition, sync gating, dry run,
//! sentinel check, event relay and the optional commit.

use std::sync::Arc;

use crate::chain::{ScriptHash, SharedChain, TransferOutput};

use super::script::build_batch_script;
use super::session::{OpenSession, WalletSession};
use super::tracker::ConfirmationTracker;
use super::{InvocationRequest, InvocationResult, InvokeError, NotificationRelay};

/// Sync attempts before a plain invocation gives up.
const INVOKE_SYNC_ATTEMPTS: usize = 5;
/// Raw transfers tolerate a longer catch-up; they are operator-initiated and
/// not latency-sensitive.
const TRANSFER_SYNC_ATTEMPTS: usize = 10;
/// Asset and amount handed out per gas claim.
const CLAIM_ASSET: &str = "gas";
const CLAIM_AMOUNT: u64 = 100;

/// Native-asset output attached to a committing invocation, paid to the
/// contract's own address.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedAsset {
    pub asset: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Broadcast the transaction after a successful dry run. Off means the
    /// dry run is the whole invocation (reads).
    pub commit: bool,
    pub attach: Option<AttachedAsset>,
}

impl InvokeOptions {
    pub fn read_only() -> Self {
        InvokeOptions::default()
    }

    pub fn committing() -> Self {
        InvokeOptions {
            commit: true,
            attach: None,
        }
    }
}

/// Coordinates every chain-mutating operation of the gateway against one
/// contract and one operator wallet.
pub struct Orchestrator {
    chain: SharedChain,
    session: Arc<WalletSession>,
    tracker: Arc<ConfirmationTracker>,
    relay: NotificationRelay,
    contract: ScriptHash,
}

impl Orchestrator {
    pub fn new(
        chain: SharedChain,
        session: Arc<WalletSession>,
        tracker: Arc<ConfirmationTracker>,
        relay: NotificationRelay,
        contract: ScriptHash,
    ) -> Self {
        Orchestrator {
            chain,
            session,
            tracker,
            relay,
            contract,
        }
    }

    pub fn tracker(&self) -> &Arc<ConfirmationTracker> {
        &self.tracker
    }

    pub fn contract_hash(&self) -> &ScriptHash {
        &self.contract
    }

    pub async fn invoke_single(
        &self,
        request: InvocationRequest,
        options: InvokeOptions,
    ) -> Result<InvocationResult, InvokeError> {
        self.invoke_batch(vec![request], options).await
    }

    /// Runs a batch of contract calls as one transaction. The wallet session
    /// is held for the whole flow and released on every exit path.
    pub async fn invoke_batch(
        &self,
        requests: Vec<InvocationRequest>,
        options: InvokeOptions,
    ) -> Result<InvocationResult, InvokeError> {
        let mut open = self.session.acquire().await?;
        let result = self.invoke_locked(&mut open, requests, options).await;
        drop(open);
        result
    }

    async fn invoke_locked(
        &self,
        open: &mut OpenSession,
        requests: Vec<InvocationRequest>,
        options: InvokeOptions,
    ) -> Result<InvocationResult, InvokeError> {
        self.session
            .wait_until_synced(open, &self.chain, INVOKE_SYNC_ATTEMPTS)
            .await?;

        let contract = self
            .chain
            .contract(&self.contract)
            .await?
            .ok_or(InvokeError::ContractNotFound(self.contract))?;

        let outputs: Vec<TransferOutput> = options
            .attach
            .iter()
            .map(|attached| TransferOutput {
                asset: attached.asset.clone(),
                amount: attached.amount,
                to: contract.address(),
            })
            .collect();

        let script = build_batch_script(&self.contract, &requests);
        tracing::debug!(
            methods = ?requests.iter().map(|r| r.method.as_str()).collect::<Vec<_>>(),
            script_len = script.len(),
            commit = options.commit,
            "invoking contract"
        );

        let outcome = self
            .chain
            .dry_run(&script, open.wallet(), &outputs)
            .await?
            .ok_or_else(|| InvokeError::Execution("virtual machine faulted".to_owned()))?;
        tracing::debug!(
            fee = outcome.fee,
            ops = outcome.ops_count,
            stack_len = outcome.stack.len(),
            "dry run succeeded"
        );

        // a single zero byte on a single-element stack is the contract
        // refusing the call, not a VM fault
        if let [only] = outcome.stack.as_slice() {
            if only.is_false_sentinel() {
                return Err(InvokeError::Execution(
                    "contract rejected the invocation".to_owned(),
                ));
            }
        }

        for event in &outcome.events {
            self.relay.handle(event);
        }

        if !options.commit {
            let snapshot = self.tracker.snapshot();
            return Ok(InvocationResult {
                returned: outcome.stack,
                unconfirmed: snapshot.pending,
                failed: snapshot.failed,
                committed_tx: None,
            });
        }

        if !self.session.has_sufficient_gas(open).await? {
            return Err(InvokeError::InsufficientGas);
        }

        let submitted = self
            .chain
            .submit(open.wallet(), &outcome.tx, outcome.fee)
            .await?
            .ok_or(InvokeError::Submission)?;
        tracing::info!(tx_hash = %submitted.hash, fee = outcome.fee, "transaction relayed");

        self.tracker.track(&submitted.hash);
        let snapshot = self.tracker.snapshot();
        Ok(InvocationResult {
            returned: outcome.stack,
            unconfirmed: snapshot.pending,
            failed: snapshot.failed,
            committed_tx: Some(submitted.hash),
        })
    }

    /// Sends a raw wallet-funded asset transfer. `Ok(None)` means the node
    /// declined to relay it.
    pub async fn transfer(
        &self,
        asset: &str,
        to: &crate::chain::Address,
        amount: u64,
    ) -> Result<Option<String>, InvokeError> {
        let mut open = self.session.acquire().await?;
        let result = self.transfer_locked(&mut open, asset, to, amount).await;
        drop(open);
        result
    }

    async fn transfer_locked(
        &self,
        open: &mut OpenSession,
        asset: &str,
        to: &crate::chain::Address,
        amount: u64,
    ) -> Result<Option<String>, InvokeError> {
        self.session
            .wait_until_synced(open, &self.chain, TRANSFER_SYNC_ATTEMPTS)
            .await?;
        let Some(submitted) = self
            .chain
            .send_funds(open.wallet(), asset, to, amount)
            .await?
        else {
            tracing::warn!(asset, %to, amount, "node declined to relay transfer");
            return Ok(None);
        };
        tracing::info!(asset, %to, amount, tx_hash = %submitted.hash, "transfer relayed");
        self.tracker.track(&submitted.hash);
        Ok(Some(submitted.hash))
    }

    /// Sends the fixed gas-claim stipend to an address.
    pub async fn claim_gas(
        &self,
        to: &crate::chain::Address,
    ) -> Result<Option<String>, InvokeError> {
        self.transfer(CLAIM_ASSET, to, CLAIM_AMOUNT).await
    }

    /// Block height a transaction was confirmed at, `None` while pending.
    /// Read-only, so it does not touch the wallet session.
    pub async fn find_transaction(&self, tx_hash: &str) -> Result<Option<u64>, InvokeError> {
        Ok(self.chain.transaction_height(tx_hash).await?)
    }
}
