//! The per-host router daemon: one control socket for local clients, one UDP
//!  endpoint for gossip with the other routers.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::sync::watch;
use tracing::{info, warn, Level};

use vroute::gossip::udp_disseminator::UdpDisseminator;
use vroute::mapping::MappingManager;
use vroute::membership::MembershipHandler;
use vroute::router::host_ops::NixHostSockets;
use vroute::router::RouterServer;
use vroute::router_config::RouterConfig;

fn env_var(name: &str) -> anyhow::Result<String> {
    std::env::var(name).map_err(|_| anyhow!("environment variable {} is not set", name))
}

fn config_from_env() -> anyhow::Result<(RouterConfig, Vec<SocketAddr>)> {
    let control_socket_path = PathBuf::from(env_var("VROUTE_SOCKET_PATH")?);
    let gossip_bind_addr = env_var("VROUTE_GOSSIP_ADDR")?
        .parse::<SocketAddr>()
        .context("parsing VROUTE_GOSSIP_ADDR")?;
    let host_ip = env_var("VROUTE_HOST_IP")?
        .parse::<Ipv4Addr>()
        .context("parsing VROUTE_HOST_IP")?;

    // the initial peer set; later joins and leaves come through the membership API
    let mut peers = Vec::new();
    if let Ok(peer_list) = std::env::var("VROUTE_PEERS") {
        for peer in peer_list.split(',').filter(|s| !s.is_empty()) {
            peers.push(peer.trim().parse::<SocketAddr>()
                .with_context(|| format!("parsing peer address {:?} in VROUTE_PEERS", peer))?);
        }
    }

    Ok((RouterConfig::new(control_socket_path, gossip_bind_addr, host_ip), peers))
}

fn log_level() -> Level {
    match std::env::var("VROUTE_LOG").as_deref() {
        Ok("trace") => Level::TRACE,
        Ok("debug") => Level::DEBUG,
        Ok("warn") => Level::WARN,
        Ok("error") => Level::ERROR,
        Ok(other) => {
            eprintln!("unknown VROUTE_LOG value {:?}, using info", other);
            Level::INFO
        }
        Err(_) => Level::INFO,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(log_level())
        .try_init()
        .ok();

    let (config, peers) = config_from_env()?;
    let config = Arc::new(config);
    info!("starting router: control socket {}, gossip endpoint {}, host IP {}",
        config.control_socket_path.display(), config.gossip_bind_addr, config.host_ip);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let disseminator = UdpDisseminator::bind(&config, shutdown_rx.clone()).await?;
    let membership = MembershipHandler::new(disseminator.clone());
    for peer in peers {
        membership.on_join(peer).await;
    }

    let mapping_manager = Arc::new(MappingManager::new(disseminator.clone()));
    let server = RouterServer::new(
        config.clone(),
        mapping_manager.clone(),
        Arc::new(NixHostSockets),
        shutdown_rx,
    );

    let receive_loop = tokio::spawn(disseminator.clone().run_receive_loop());
    let regossip_loop = tokio::spawn(disseminator.clone().run_regossip_loop());
    let replication_loop = tokio::spawn(async move { mapping_manager.run_replication_loop().await });
    let server_task = tokio::spawn(async move { server.run().await });

    tokio::signal::ctrl_c().await?;
    info!("received ctrl-c, shutting down");
    let _ = shutdown_tx.send(true);

    // the server stops accepting and joins its handlers; the receive loop closes the
    //  delivery queue, which ends the replication loop
    if let Err(e) = server_task.await? {
        warn!("control channel terminated with error: {:#}", e);
    }
    receive_loop.await?;
    regossip_loop.await?;
    replication_loop.await?;

    info!("shutdown complete");
    Ok(())
}
