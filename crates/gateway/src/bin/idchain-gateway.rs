use std::sync::Arc;

use clap::Parser;

use idchain_gateway::chain::rpc::NodeRpcClient;
use idchain_gateway::config::{self, ConfigArgs};
use idchain_gateway::service::Service;

async fn run(config: config::Config) -> anyhow::Result<()> {
    let node = Arc::new(NodeRpcClient::from_config(&config));
    let service = Service::build(&config, node.clone(), node);
    tracing::info!(
        contract = %config.contract,
        node = %config.node_rpc_url,
        "identity gateway starting"
    );
    service.run().await
}

fn main() -> anyhow::Result<()> {
    let config = ConfigArgs::parse().build()?;
    config::set_logger(config.log_level);
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()?;
    rt.block_on(run(config))
}
