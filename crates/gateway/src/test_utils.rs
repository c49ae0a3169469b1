//! Scripted in-memory chain and wallet doubles, shared by unit and
//! integration tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::chain::{
    AssetBalance, ChainClient, ChainError, ContractMeta, DryRunOutcome, NotificationEvent,
    PreparedTx, ScriptHash, SharedWallet, StackValue, SubmittedTx, TransferOutput, WalletHandle,
    WalletProvider,
};

/// Scripted chain node. Cloning shares the underlying state, so a test can
/// keep a handle while the orchestrator owns another.
#[derive(Clone)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
}

struct ChainState {
    height: u64,
    contract_missing: bool,
    stack: Vec<StackValue>,
    events: Vec<NotificationEvent>,
    fee: u64,
    dry_run_faults: bool,
    submit_rejects: bool,
    send_rejects: bool,
    fail_tx_height: bool,
    execute_scripts: bool,
    tx_heights: HashMap<String, u64>,
    scripts: Vec<Vec<u8>>,
    outputs: Vec<Vec<TransferOutput>>,
    submitted: Vec<String>,
    sent_funds: Vec<(String, String, u64)>,
    next_tx: u64,
    busy: bool,
    overlap: bool,
    event_tx: Option<mpsc::UnboundedSender<NotificationEvent>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

impl MockChain {
    pub fn new() -> Self {
        MockChain {
            state: Arc::new(Mutex::new(ChainState {
                height: 1,
                contract_missing: false,
                stack: vec![StackValue::Integer(1)],
                events: Vec::new(),
                fee: 0,
                dry_run_faults: false,
                submit_rejects: false,
                send_rejects: false,
                fail_tx_height: false,
                execute_scripts: false,
                tx_heights: HashMap::new(),
                scripts: Vec::new(),
                outputs: Vec::new(),
                submitted: Vec::new(),
                sent_funds: Vec::new(),
                next_tx: 1,
                busy: false,
                overlap: false,
                event_tx: None,
            })),
        }
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().height = height;
    }

    pub fn set_contract_missing(&self, missing: bool) {
        self.state.lock().contract_missing = missing;
    }

    pub fn set_stack(&self, stack: Vec<StackValue>) {
        self.state.lock().stack = stack;
    }

    pub fn set_events(&self, events: Vec<NotificationEvent>) {
        self.state.lock().events = events;
    }

    pub fn set_fee(&self, fee: u64) {
        self.state.lock().fee = fee;
    }

    pub fn set_dry_run_faults(&self, faults: bool) {
        self.state.lock().dry_run_faults = faults;
    }

    pub fn set_submit_rejects(&self, rejects: bool) {
        self.state.lock().submit_rejects = rejects;
    }

    pub fn set_send_rejects(&self, rejects: bool) {
        self.state.lock().send_rejects = rejects;
    }

    pub fn fail_tx_height(&self, fail: bool) {
        self.state.lock().fail_tx_height = fail;
    }

    /// When set, dry runs behave like the chain VM: the batch script is
    /// walked call frame by call frame and the result stack carries one value
    /// per call, in script order (each call returns its own method name).
    pub fn set_execute_scripts(&self, execute: bool) {
        self.state.lock().execute_scripts = execute;
    }

    pub fn confirm_tx(&self, tx_hash: &str, height: u64) {
        self.state.lock().tx_heights.insert(tx_hash.to_owned(), height);
    }

    /// Emits a committed-execution contract event to the subscriber.
    pub fn push_event(&self, event: NotificationEvent) {
        let state = self.state.lock();
        if let Some(tx) = &state.event_tx {
            let _ = tx.send(event);
        }
    }

    pub fn scripts(&self) -> Vec<Vec<u8>> {
        self.state.lock().scripts.clone()
    }

    pub fn outputs(&self) -> Vec<Vec<TransferOutput>> {
        self.state.lock().outputs.clone()
    }

    pub fn submitted(&self) -> Vec<String> {
        self.state.lock().submitted.clone()
    }

    pub fn sent_funds(&self) -> Vec<(String, String, u64)> {
        self.state.lock().sent_funds.clone()
    }

    /// True if two dry runs ever ran concurrently.
    pub fn saw_overlap(&self) -> bool {
        self.state.lock().overlap
    }
}

impl ChainClient for MockChain {
    fn height(&self) -> BoxFuture<'_, Result<u64, ChainError>> {
        let height = self.state.lock().height;
        async move { Ok(height) }.boxed()
    }

    fn header_height(&self) -> BoxFuture<'_, Result<u64, ChainError>> {
        let height = self.state.lock().height;
        async move { Ok(height) }.boxed()
    }

    fn transaction_height<'a>(
        &'a self,
        tx_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<u64>, ChainError>> {
        async move {
            let state = self.state.lock();
            if state.fail_tx_height {
                return Err(ChainError::Rpc("node unreachable".to_owned()));
            }
            Ok(state.tx_heights.get(tx_hash).copied())
        }
        .boxed()
    }

    fn contract<'a>(
        &'a self,
        hash: &'a ScriptHash,
    ) -> BoxFuture<'a, Result<Option<ContractMeta>, ChainError>> {
        async move {
            let state = self.state.lock();
            if state.contract_missing {
                Ok(None)
            } else {
                Ok(Some(ContractMeta { hash: *hash }))
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
            {
                let mut state = self.state.lock();
                if state.busy {
                    state.overlap = true;
                }
                state.busy = true;
                state.scripts.push(script.to_vec());
                state.outputs.push(outputs.to_vec());
            }
            // widen the window so overlapping callers would be caught
            tokio::task::yield_now().await;
            let mut state = self.state.lock();
            state.busy = false;
            if state.dry_run_faults {
                return Ok(None);
            }
            let stack = if state.execute_scripts {
                match script_methods(script) {
                    Some(methods) => methods.into_iter().map(StackValue::Bytes).collect(),
                    None => return Ok(None),
                }
            } else {
                state.stack.clone()
            };
            let n = state.next_tx;
            state.next_tx += 1;
            Ok(Some(DryRunOutcome {
                tx: PreparedTx {
                    raw: script.to_vec(),
                    hash: format!("tx{n}"),
                },
                fee: state.fee,
                stack,
                ops_count: 100,
                events: state.events.clone(),
            }))
        }
        .boxed()
    }

    fn submit<'a>(
        &'a self,
        _wallet: &'a SharedWallet,
        tx: &'a PreparedTx,
        _fee: u64,
    ) -> BoxFuture<'a, Result<Option<SubmittedTx>, ChainError>> {
        async move {
            let mut state = self.state.lock();
            if state.submit_rejects {
                return Ok(None);
            }
            state.submitted.push(tx.hash.clone());
            Ok(Some(SubmittedTx {
                hash: tx.hash.clone(),
            }))
        }
        .boxed()
    }

    fn send_funds<'a>(
        &'a self,
        _wallet: &'a SharedWallet,
        asset: &'a str,
        to: &'a crate::chain::Address,
        amount: u64,
    ) -> BoxFuture<'a, Result<Option<SubmittedTx>, ChainError>> {
        async move {
            let mut state = self.state.lock();
            if state.send_rejects {
                return Ok(None);
            }
            let n = state.next_tx;
            state.next_tx += 1;
            state
                .sent_funds
                .push((asset.to_owned(), to.to_string(), amount));
            Ok(Some(SubmittedTx {
                hash: format!("tx{n}"),
            }))
        }
        .boxed()
    }

    fn subscribe_events(&self) -> mpsc::UnboundedReceiver<NotificationEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().event_tx = Some(tx);
        rx
    }
}

/// Walks a batch invocation script and extracts the called method names in
/// script order, mirroring the call-frame wire format (app-call opcode,
/// 20-byte hash, length-prefixed method, tagged arguments). `None` on any
/// framing violation.
fn script_methods(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    fn read_len(buf: &[u8], i: &mut usize) -> Option<usize> {
        let width = *buf.get(*i)? as usize;
        *i += 1;
        if !matches!(width, 1 | 2 | 4) {
            return None;
        }
        let bytes = buf.get(*i..*i + width)?;
        *i += width;
        let mut len = 0usize;
        for (k, byte) in bytes.iter().enumerate() {
            len |= (*byte as usize) << (8 * k);
        }
        Some(len)
    }

    fn skip_args(buf: &[u8], i: &mut usize) -> Option<()> {
        let count = read_len(buf, i)?;
        for _ in 0..count {
            match *buf.get(*i)? {
                // byte string
                0x00 => {
                    *i += 1;
                    let len = read_len(buf, i)?;
                    *i = i.checked_add(len)?;
                }
                // 8-byte integer
                0x01 => *i += 9,
                // nested list
                0x02 => {
                    *i += 1;
                    skip_args(buf, i)?;
                }
                _ => return None,
            }
            if *i > buf.len() {
                return None;
            }
        }
        Some(())
    }

    let mut methods = Vec::new();
    let mut i = 0;
    while i < script.len() {
        if script[i] != 0x67 {
            return None;
        }
        i += 1 + 20;
        let len = read_len(script, &mut i)?;
        methods.push(script.get(i..i + len)?.to_vec());
        i += len;
        skip_args(script, &mut i)?;
    }
    Some(methods)
}

/// Wallet provider double. The provider and every wallet it opens share one
/// state cell, so tests tweak heights and balances mid-flight.
#[derive(Clone)]
pub struct MockWalletProvider {
    state: Arc<Mutex<WalletState>>,
}

struct WalletState {
    height: u64,
    balances: Vec<AssetBalance>,
    fail_open: bool,
    opens: usize,
    process_calls: usize,
}

impl Default for MockWalletProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockWalletProvider {
    pub fn new() -> Self {
        MockWalletProvider {
            state: Arc::new(Mutex::new(WalletState {
                height: 1,
                balances: vec![AssetBalance {
                    asset: "NEOGas".to_owned(),
                    amount: 1,
                }],
                fail_open: false,
                opens: 0,
                process_calls: 0,
            })),
        }
    }

    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().height = height;
    }

    pub fn set_balances(&self, balances: Vec<(&str, u64)>) {
        self.state.lock().balances = balances
            .into_iter()
            .map(|(asset, amount)| AssetBalance {
                asset: asset.to_owned(),
                amount,
            })
            .collect();
    }

    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    pub fn process_calls(&self) -> usize {
        self.state.lock().process_calls
    }
}

impl WalletProvider for MockWalletProvider {
    fn open<'a>(
        &'a self,
        _path: &'a Path,
        _passphrase: &'a str,
    ) -> BoxFuture<'a, Result<SharedWallet, ChainError>> {
        async move {
            let mut state = self.state.lock();
            if state.fail_open {
                return Err(ChainError::Wallet("bad passphrase".to_owned()));
            }
            state.opens += 1;
            Ok(Arc::new(MockWallet {
                state: self.state.clone(),
            }) as SharedWallet)
        }
        .boxed()
    }
}

pub struct MockWallet {
    state: Arc<Mutex<WalletState>>,
}

impl WalletHandle for MockWallet {
    fn process_blocks(&self) -> BoxFuture<'_, Result<(), ChainError>> {
        self.state.lock().process_calls += 1;
        async move { Ok(()) }.boxed()
    }

    fn synced_height(&self) -> BoxFuture<'_, Result<u64, ChainError>> {
        let height = self.state.lock().height;
        async move { Ok(height) }.boxed()
    }

    fn balances(&self) -> BoxFuture<'_, Result<Vec<AssetBalance>, ChainError>> {
        let balances = self.state.lock().balances.clone();
        async move { Ok(balances) }.boxed()
    }
}
