//! Exclusive access to the single signing wallet.
//!
//! Every chain-mutating invocation opens the wallet behind one mutex held for
//! the full invocation lifecycle (open, sync, dry run, optional commit,
//! close). Without that grain, concurrent signs could double-spend unspent
//! outputs or corrupt wallet-local bookkeeping, and a stale wallet view
//! during the dry run could disagree with the eventually-signed transaction.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::chain::{SharedChain, SharedWallet, WalletProvider};

use super::InvokeError;

/// Period of the block catch-up task while a session is open.
const CATCHUP_PERIOD: Duration = Duration::from_secs(1);
/// Pause between sync attempts; the wallet handle is re-opened after each
/// unsynced round because the underlying wallet does not reliably advance
/// otherwise.
const SYNC_BACKOFF: Duration = Duration::from_secs(5);
/// Local height must reach this share of chain height to count as synced.
const SYNCED_PERCENT: u8 = 99;

/// The single wallet all invocations sign with. Constructed once at startup
/// and shared; never a hidden global.
pub struct WalletSession {
    provider: Arc<dyn WalletProvider>,
    path: PathBuf,
    passphrase: String,
    gas_asset: String,
    lock: Arc<Mutex<()>>,
}

/// An open, locked wallet. Dropping it stops the catch-up task and releases
/// the session lock, so every exit path of the caller releases both.
pub struct OpenSession {
    wallet: SharedWallet,
    catchup: JoinHandle<()>,
    _permit: OwnedMutexGuard<()>,
}

impl OpenSession {
    pub fn wallet(&self) -> &SharedWallet {
        &self.wallet
    }
}

impl Drop for OpenSession {
    fn drop(&mut self) {
        self.catchup.abort();
    }
}

impl WalletSession {
    pub fn new(
        provider: Arc<dyn WalletProvider>,
        path: PathBuf,
        passphrase: String,
        gas_asset: String,
    ) -> Self {
        WalletSession {
            provider,
            path,
            passphrase,
            gas_asset,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Blocks until the wallet lock is free, then opens the wallet and starts
    /// the periodic catch-up task.
    pub async fn acquire(&self) -> Result<OpenSession, InvokeError> {
        let permit = self.lock.clone().lock_owned().await;
        let wallet = self.open_wallet().await?;
        let catchup = Self::spawn_catchup(wallet.clone());
        Ok(OpenSession {
            wallet,
            catchup,
            _permit: permit,
        })
    }

    async fn open_wallet(&self) -> Result<SharedWallet, InvokeError> {
        self.provider
            .open(&self.path, &self.passphrase)
            .await
            .map_err(|error| InvokeError::WalletOpen(error.to_string()))
    }

    fn spawn_catchup(wallet: SharedWallet) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CATCHUP_PERIOD);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(error) = wallet.process_blocks().await {
                    tracing::warn!(%error, "wallet catch-up cycle failed");
                }
            }
        })
    }

    /// Replaces the wallet handle with a freshly opened one, restarting the
    /// catch-up task.
    pub async fn reopen(&self, session: &mut OpenSession) -> Result<(), InvokeError> {
        session.catchup.abort();
        session.wallet = self.open_wallet().await?;
        session.catchup = Self::spawn_catchup(session.wallet.clone());
        Ok(())
    }

    /// Waits until the wallet's locally processed height reaches the synced
    /// threshold, re-opening the wallet between attempts. Fails with
    /// [`InvokeError::WalletSyncTimeout`] reporting the last observed percent
    /// after `max_attempts` unsuccessful rounds.
    pub async fn wait_until_synced(
        &self,
        session: &mut OpenSession,
        chain: &SharedChain,
        max_attempts: usize,
    ) -> Result<(), InvokeError> {
        let mut percent_synced = 0u8;
        for attempt in 0..max_attempts {
            let wallet_height = session.wallet.synced_height().await?;
            let chain_height = chain.height().await?;
            percent_synced = if chain_height == 0 {
                0
            } else {
                (wallet_height.saturating_mul(100) / chain_height).min(100) as u8
            };
            if percent_synced > SYNCED_PERCENT {
                return Ok(());
            }
            tracing::info!(
                wallet_height,
                chain_height,
                percent_synced,
                attempt,
                "waiting for wallet sync"
            );
            tokio::time::sleep(SYNC_BACKOFF).await;
            self.reopen(session).await?;
        }
        Err(InvokeError::WalletSyncTimeout { percent_synced })
    }

    /// True iff the designated gas asset has a strictly positive balance.
    pub async fn has_sufficient_gas(&self, session: &OpenSession) -> Result<bool, InvokeError> {
        let balances = session.wallet.balances().await?;
        for balance in &balances {
            tracing::info!(asset = %balance.asset, amount = balance.amount, "wallet balance");
            if balance.asset == self.gas_asset && balance.amount > 0 {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockChain, MockWalletProvider};

    fn session(provider: &MockWalletProvider) -> WalletSession {
        WalletSession::new(
            Arc::new(provider.clone()),
            PathBuf::from("/tmp/test-wallet.db3"),
            "passphrase".into(),
            "NEOGas".into(),
        )
    }

    #[tokio::test]
    async fn acquire_serializes_sessions() {
        let provider = MockWalletProvider::new();
        let session = Arc::new(session(&provider));

        let first = session.acquire().await.unwrap();

        let contender = {
            let session = session.clone();
            tokio::spawn(async move {
                let open = session.acquire().await.unwrap();
                drop(open);
            })
        };
        // the contender cannot make progress while the first session is open
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn open_failure_surfaces_and_releases_lock() {
        let provider = MockWalletProvider::new();
        provider.fail_open(true);
        let session = session(&provider);

        let Err(error) = session.acquire().await else {
            panic!("opening the wallet should have failed");
        };
        assert!(matches!(error, InvokeError::WalletOpen(_)));

        // the lock must be free again
        provider.fail_open(false);
        let open = session.acquire().await.unwrap();
        drop(open);
    }

    #[tokio::test(start_paused = true)]
    async fn catchup_task_replays_blocks_while_open() {
        let provider = MockWalletProvider::new();
        let session = session(&provider);

        let open = session.acquire().await.unwrap();
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(provider.process_calls() >= 3);

        drop(open);
        let after_close = provider.process_calls();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(provider.process_calls(), after_close);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_timeout_reports_percent_after_exhausting_attempts() {
        let provider = MockWalletProvider::new();
        provider.set_height(50);
        let chain = MockChain::new();
        chain.set_height(100);
        let shared: SharedChain = Arc::new(chain);

        let session = session(&provider);
        let mut open = session.acquire().await.unwrap();
        let opens_before = provider.opens();

        let error = session
            .wait_until_synced(&mut open, &shared, 3)
            .await
            .unwrap_err();
        match error {
            InvokeError::WalletSyncTimeout { percent_synced } => assert_eq!(percent_synced, 50),
            other => panic!("unexpected error: {other}"),
        }
        // the wallet was re-opened once per failed attempt
        assert_eq!(provider.opens() - opens_before, 3);
    }

    #[tokio::test]
    async fn synced_wallet_passes_immediately() {
        let provider = MockWalletProvider::new();
        provider.set_height(100);
        let chain = MockChain::new();
        chain.set_height(100);
        let shared: SharedChain = Arc::new(chain);

        let session = session(&provider);
        let mut open = session.acquire().await.unwrap();
        session
            .wait_until_synced(&mut open, &shared, 1)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gas_predicate_matches_designated_asset_only() {
        let provider = MockWalletProvider::new();
        let session = session(&provider);
        let open = session.acquire().await.unwrap();

        provider.set_balances(vec![("NEO", 500), ("NEOGas", 0)]);
        assert!(!session.has_sufficient_gas(&open).await.unwrap());

        provider.set_balances(vec![("NEOGas", 1)]);
        assert!(session.has_sufficient_gas(&open).await.unwrap());
    }
}
