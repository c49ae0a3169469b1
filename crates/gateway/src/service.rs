//! Composition root: wires the orchestrator, its background loops and the
//! HTTP server together from a resolved [`Config`].

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::chain::{SharedChain, WalletProvider};
use crate::config::Config;
use crate::invoke::{ConfirmationTracker, NotificationRelay, Orchestrator, WalletSession};
use crate::server::{self, AppState};

/// How often the chain heights are logged.
const HEIGHT_LOG_PERIOD: Duration = Duration::from_secs(60);

pub struct Service {
    socket: std::net::SocketAddr,
    auth_token: String,
    transfer_asset: String,
    chain: SharedChain,
    orchestrator: Arc<Orchestrator>,
    background: Vec<JoinHandle<()>>,
}

impl Service {
    /// Builds the orchestration core and starts its background loops. The
    /// HTTP server itself starts in [`Service::run`].
    pub fn build(
        config: &Config,
        chain: SharedChain,
        wallets: Arc<dyn WalletProvider>,
    ) -> Self {
        let session = Arc::new(WalletSession::new(
            wallets,
            config.wallet_path.clone(),
            config.wallet_passphrase.clone(),
            config.gas_asset.clone(),
        ));
        let tracker = Arc::new(ConfirmationTracker::with_limits(
            config.confirm_poll_period,
            config.confirm_max_age,
            config.failed_history_limit,
        ));
        let (relay, mut directives) =
            NotificationRelay::channel(config.relay_policy(), config.transfer_asset.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            chain.clone(),
            session,
            tracker.clone(),
            relay.clone(),
            config.contract,
        ));

        let mut background = Vec::new();

        background.push(tokio::spawn(tracker.run(chain.clone())));

        // settle queued transfer directives with real wallet transfers
        background.push(tokio::spawn({
            let orchestrator = orchestrator.clone();
            async move {
                while let Some(directive) = directives.recv().await {
                    match orchestrator
                        .transfer(&directive.asset, &directive.to, directive.amount)
                        .await
                    {
                        Ok(Some(tx_hash)) => {
                            tracing::info!(to = %directive.to, %tx_hash, "settled transfer directive");
                        }
                        Ok(None) => {
                            tracing::warn!(to = %directive.to, "transfer directive declined by node");
                        }
                        Err(error) => {
                            tracing::error!(to = %directive.to, %error, "transfer directive failed");
                        }
                    }
                }
            }
        }));

        // feed committed contract events into the relay
        background.push(tokio::spawn({
            let mut events = chain.subscribe_events();
            async move {
                while let Some(event) = events.recv().await {
                    relay.handle(&event);
                }
            }
        }));

        background.push(tokio::spawn({
            let chain = chain.clone();
            async move {
                let mut interval = tokio::time::interval(HEIGHT_LOG_PERIOD);
                loop {
                    interval.tick().await;
                    match (chain.height().await, chain.header_height().await) {
                        (Ok(height), Ok(header_height)) => {
                            tracing::info!(height, header_height, "chain progress");
                        }
                        (Err(error), _) | (_, Err(error)) => {
                            tracing::warn!(%error, "could not query chain heights");
                        }
                    }
                }
            }
        }));

        Service {
            socket: config.socket,
            auth_token: config.auth_token.clone(),
            transfer_asset: config.transfer_asset.clone(),
            chain,
            orchestrator,
            background,
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Serves the REST API until the process is stopped.
    pub async fn run(&self) -> anyhow::Result<()> {
        let router = server::router(AppState {
            orchestrator: self.orchestrator.clone(),
            chain: self.chain.clone(),
            auth_token: self.auth_token.clone(),
            transfer_asset: self.transfer_asset.clone(),
        });
        server::serve(self.socket, router).await
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        for task in &self.background {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::path::PathBuf;

    use super::*;
    use crate::chain::{NotificationEvent, ScriptHash};
    use crate::test_utils::{MockChain, MockWalletProvider};

    fn test_config(relay_dry_runs: bool) -> Config {
        Config {
            contract: "d63a0b437a16579288361ccb593570e5c5f71149"
                .parse::<ScriptHash>()
                .unwrap(),
            wallet_path: PathBuf::from("/tmp/wallet.db3"),
            wallet_passphrase: "pwd".into(),
            node_rpc_url: "http://localhost:10332".into(),
            notifications_url: None,
            socket: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            auth_token: "token".into(),
            gas_asset: "NEOGas".into(),
            transfer_asset: "neo".into(),
            relay_dry_runs,
            confirm_poll_period: Duration::from_secs(5),
            confirm_max_age: Duration::from_secs(120),
            failed_history_limit: 64,
            log_level: None,
        }
    }

    #[tokio::test]
    async fn committed_transfer_event_is_settled_by_the_operator_wallet() {
        let chain = MockChain::new();
        chain.set_height(100);
        let provider = MockWalletProvider::new();
        provider.set_height(100);

        let service = Service::build(
            &test_config(false),
            Arc::new(chain.clone()),
            Arc::new(provider),
        );

        chain.push_event(NotificationEvent {
            kind: "transfer".into(),
            payload: vec![vec![1; 20], vec![2; 20], vec![3]],
            dry_run: false,
        });

        // let the relay and directive loops run
        for _ in 0..50 {
            if !chain.sent_funds().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = chain.sent_funds();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "neo");
        assert_eq!(sent[0].2, 3);
        drop(service);
    }

    #[tokio::test]
    async fn background_loops_stop_with_the_service() {
        let chain = MockChain::new();
        let provider = MockWalletProvider::new();
        let service = Service::build(
            &test_config(false),
            Arc::new(chain.clone()),
            Arc::new(provider),
        );
        drop(service);

        // a post-shutdown event must go nowhere
        chain.push_event(NotificationEvent {
            kind: "transfer".into(),
            payload: vec![vec![1; 20], vec![2; 20], vec![3]],
            dry_run: false,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(chain.sent_funds().is_empty());
    }
}
