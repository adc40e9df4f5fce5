//! peerlink CLI
//!
//! Runs a standalone P2P node or checks a configuration file.

use clap::{Parser, Subcommand};
use peerlink::config::NetworkConfig;
use peerlink::network::{Endpoint, NetworkEvent, Node};
use std::path::PathBuf;
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "peerlink")]
#[command(version)]
#[command(about = "Peer-to-peer networking node", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node until Ctrl+C
    Run {
        /// JSON configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Explicit peer (host:port), may be repeated
        #[arg(long = "peer")]
        peers: Vec<String>,

        /// Minimum number of peers to maintain
        #[arg(long)]
        min_peers: Option<usize>,

        /// Maximum number of peers
        #[arg(long)]
        max_peers: Option<usize>,

        /// Do not use bootstrap peers or DNS seeds
        #[arg(long)]
        no_bootstrap: bool,
    },

    /// Validate a configuration file
    CheckConfig {
        /// JSON configuration file
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            port,
            peers,
            min_peers,
            max_peers,
            no_bootstrap,
        } => {
            let mut settings = match config {
                Some(path) => NetworkConfig::load(&path)?,
                None => NetworkConfig::default(),
            };
            if let Some(port) = port {
                settings.listen_port = port;
            }
            for peer in peers {
                peer.parse::<Endpoint>()?;
                settings.peers.push(peer);
            }
            if let Some(min) = min_peers {
                settings.min_peers = min;
            }
            if let Some(max) = max_peers {
                settings.max_peers = max;
            }
            if no_bootstrap {
                settings.enable_bootstrap = false;
            }

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_node(settings))?;
        }

        Commands::CheckConfig { config } => {
            let settings = NetworkConfig::load(&config)?;
            let warnings = settings.validate();

            println!("Configuration {} is valid", config.display());
            println!("  listen:    {}", settings.listen_endpoint());
            println!(
                "  peers:     min {} / max {}",
                settings.min_peers, settings.max_peers
            );
            println!(
                "  bootstrap: {} ({} static, {} DNS seeds)",
                if settings.enable_bootstrap { "on" } else { "off" },
                settings.bootstrap_peers.len(),
                settings.dns_seeds.len()
            );
            for warning in &warnings {
                println!("  warning:   {}", warning);
            }
        }
    }

    Ok(())
}

async fn run_node(config: NetworkConfig) -> Result<(), Box<dyn std::error::Error>> {
    let node = Node::start(config).await?;
    let mut events = node.subscribe();

    println!("Listening on {}", node.local_endpoint());
    println!("Session {}", node.identity().session_id);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => log::warn!("Missed {} network events", missed),
                Err(RecvError::Closed) => break,
            },
        }
    }

    node.shutdown().await;
    Ok(())
}

fn log_event(event: &NetworkEvent) {
    match event {
        NetworkEvent::PeerConnected { key, identity } => {
            log::info!("Peer connected: {} ({})", key, identity.user_agent())
        }
        NetworkEvent::PeerDisconnected { key } => log::info!("Peer disconnected: {}", key),
        NetworkEvent::PeerBanned { address, permanent } => {
            log::warn!("Banned {} (permanent: {})", address, permanent)
        }
        NetworkEvent::MisbehaviorDetected { key, reason, score } => {
            log::debug!("Misbehavior {} from {}, score {}", reason, key, score)
        }
        NetworkEvent::Message { key, kind, .. } => log::trace!("{} from {}", kind, key),
        NetworkEvent::ConnectivityLost => log::error!("Lost all peer connectivity"),
        NetworkEvent::Listening { endpoint } => log::debug!("Listening on {}", endpoint),
    }
}
