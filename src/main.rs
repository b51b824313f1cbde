use dkv_cluster::config::{NodeConfig, USAGE};
use dkv_cluster::node::ClusterNode;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Serialize)]
struct NodeStats {
    node: String,
    cloud_version: u64,
    cloud_hash: String,
    settled: bool,
    members: Vec<MemberStats>,
    local_keys: usize,
    memory_used: usize,
}

#[derive(Debug, Serialize)]
struct MemberStats {
    id: String,
    gossip: String,
    rpc: String,
    state: String,
    incarnation: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config = match NodeConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            eprintln!("{}", USAGE);
            eprintln!("Example: {} --bind 127.0.0.1:5000", args[0]);
            eprintln!(
                "Example: {} --bind 127.0.0.1:5001 --seed 127.0.0.1:5000",
                args[0]
            );
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(if config.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        })
        .init();

    tracing::info!("Starting node on {}", config.bind);
    if !config.seeds.is_empty() {
        tracing::info!("Seed nodes: {:?}", config.seeds);
    } else {
        tracing::info!("Starting as seed node (founder)");
    }

    // 1. Membership, store and task engine:
    let node = ClusterNode::launch(&config).await?;
    tracing::info!("Node ID: {:?}", node.id());

    // 2. Stats reporter:
    let stats_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;
            let cloud = stats_node.current_cloud();
            let stats = NodeStats {
                node: stats_node.id().0.clone(),
                cloud_version: cloud.version(),
                cloud_hash: format!("{:x}", cloud.hash()),
                settled: stats_node.cloud().is_settled(),
                members: cloud
                    .members()
                    .iter()
                    .map(|m| MemberStats {
                        id: m.id.0.clone(),
                        gossip: m.gossip_addr.to_string(),
                        rpc: m.http_addr.to_string(),
                        state: format!("{:?}", m.state),
                        incarnation: m.incarnation,
                    })
                    .collect(),
                local_keys: stats_node.store().local_key_count(),
                memory_used: stats_node.store().memory_used(),
            };
            match serde_json::to_string(&stats) {
                Ok(json) => tracing::info!("Cluster stats: {}", json),
                Err(e) => tracing::warn!("Failed to encode stats: {}", e),
            }
        }
    });

    // 3. RPC server:
    let http_addr = match node.membership() {
        Some(membership) => membership.local_node.http_addr,
        None => anyhow::bail!("launched node has no membership service"),
    };

    tracing::info!("RPC server listening on {}", http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(http_addr).await?;
    axum::serve(listener, node.router()).await?;

    Ok(())
}
