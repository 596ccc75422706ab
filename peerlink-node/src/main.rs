// peerlink node: relay signaling, WebRTC data channels, and a terminal bridge.

mod bridge;
mod config;
mod relay_server;
mod relay_wire;
mod rtc;
mod ws_relay;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use peerlink_core::{PeerClient, PeerId, Relay, RelayOptions};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("peerlink {}", VERSION);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("peerlink=info,peerlink_core=info")))
        .with_writer(std::io::stderr)
        .init();

    let mut cfg = config::load();
    config::apply_args(&mut cfg, &args).map_err(anyhow::Error::msg)?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: config::Config) -> anyhow::Result<()> {
    if let Some(listen) = &cfg.relay_listen {
        let addr: SocketAddr = listen.parse().with_context(|| format!("bad relay address {}", listen))?;
        tokio::spawn(async move {
            if let Err(e) = relay_server::run(addr).await {
                error!("relay server: {}", e);
            }
        });
    }

    let identity = cfg.peer_id.clone().map(PeerId::from).unwrap_or_else(PeerId::random);
    let mut options = RelayOptions::new(cfg.relay_url.as_str(), identity.as_str());
    // tokio intervals reject a zero period
    options.keepalive = cfg.core.relay_keepalive().max(Duration::from_secs(1));
    options.reconnect_period = cfg.core.relay_reconnect().max(Duration::from_secs(1));
    let relay: Arc<dyn Relay> = Arc::new(ws_relay::WsRelay::new(options));

    let (client, events) = PeerClient::start(
        cfg.core.clone(),
        Some(identity),
        relay,
        Arc::new(rtc::WebRtcFactory),
        cfg.secret.as_deref(),
    );
    info!("peer id {}", client.id());

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            println!("{}", line);
        }
    });

    let (lines_tx, lines_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if lines_tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut bridge = bridge::Bridge::new(&client, &cfg.core, out_tx);
    if let Some(peer) = &cfg.call {
        bridge.follow(PeerId::from(peer.as_str()));
    }

    tokio::select! {
        res = bridge.run(events, lines_rx) => res?,
        res = shutdown_signal() => {
            res?;
            info!("shutting down");
            client.stop();
        }
    }
    // let the disconnect notice reach the relay
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
