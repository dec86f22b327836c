// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use statechannel_config::Config;
use statechannel_node::config::ChannelNodeConfig;
use statechannel_node::crypto::ChannelSigner;
use statechannel_node::messenger::DisconnectedMessenger;
use statechannel_node::metrics::{start_prometheus_server, ChannelMetrics};
use statechannel_node::monitor::eth::EthEventMonitor;
use statechannel_node::node::{ChannelContext, ChannelNode, EffectDispatcher};
use statechannel_node::policy::PolicyEngine;
use statechannel_node::store::ChannelStore;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(rename_all = "kebab-case")]
#[clap(name = env!("CARGO_BIN_NAME"))]
#[clap(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    #[clap(long)]
    pub config_path: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ChannelNodeConfig::load(&args.config_path)?;
    let server_config = config.validate().await?;

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(ChannelMetrics::new(&registry));
    let metrics_address = SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
        server_config.metrics_port,
    );
    let _metrics_server = start_prometheus_server(metrics_address, registry).await?;

    let store = Arc::new(match &server_config.store_path {
        Some(path) => ChannelStore::open(path)?,
        None => ChannelStore::new_in_memory(),
    });
    let cancel = CancellationToken::new();
    let monitor = Arc::new(EthEventMonitor::new(
        server_config.provider.clone(),
        store.clone(),
        server_config.monitor_poll_interval,
        server_config.monitor_block_delay,
        server_config.protocol.tx_retry_max_elapsed,
        cancel.clone(),
    ));

    let ctx = ChannelContext {
        signer: server_config.signer.clone(),
        store,
        ledger: server_config.ledger.clone(),
        monitor,
        messenger: Arc::new(DisconnectedMessenger),
        effects: Arc::new(EffectDispatcher::new(metrics.clone(), None)),
        metrics,
        protocol: server_config.protocol.clone(),
    };
    let node = Arc::new(ChannelNode::new(
        ctx,
        PolicyEngine::new(server_config.policy.clone()),
    ));
    node.start().await?;
    info!(
        "Channel node {:?} started (osp: {})",
        server_config.signer.address(),
        server_config.protocol.is_osp
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down channel node");
    cancel.cancel();
    Ok(())
}
