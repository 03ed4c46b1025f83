//! Local Chat Protocol node binary.

use clap::Parser;
use lcp_node::config::{Args, NodeConfig};
use lcp_node::Engine;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lcp_node=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();
    let config: NodeConfig = args.into();

    info!("Local Chat Protocol node v{}", VERSION);
    info!("user_id={} broadcast_interval={:?}", config.user_id, config.broadcast_interval);

    let engine = match Engine::new(config).await {
        Ok(e) => e,
        Err(e) => {
            error!("failed to start node: {}", e);
            return;
        }
    };

    engine.start().await;
    info!(
        "node online: id={} ip={}",
        engine.local_id(),
        engine.local_ip()
    );

    let status_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let peers = status_engine.peers().await;
            info!("status: {} known peers", peers.len());
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    engine.shutdown().await;
}
