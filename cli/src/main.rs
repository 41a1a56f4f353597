// torshare — relay-assisted peer-to-peer file transfer over Tor
//
// The relay never sees file bytes; peers negotiate a direct channel and
// stream chunks over it, verified end to end.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use config::CliConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use torshare_core::relay::{RelayServer, RelayServerConfig};
use torshare_core::transfer::Direction;
use torshare_core::{Node, NodeConfig, NodeEvent, SessionId};

#[derive(Parser)]
#[command(name = "torshare")]
#[command(about = "Torshare — anonymous peer-to-peer file transfer", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rendezvous relay server
    Relay {
        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:3000")]
        bind: String,
    },
    /// Start a node and open the interactive console
    Start {
        /// Relay server address (overrides config)
        #[arg(short, long)]
        server: Option<String>,
        /// Connect directly, without the SOCKS proxy (development mode)
        #[arg(long)]
        no_proxy: bool,
        /// Destination directory for received files (overrides config)
        #[arg(short, long)]
        downloads: Option<PathBuf>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Relay { bind } => run_relay(bind).await,
        Commands::Start {
            server,
            no_proxy,
            downloads,
        } => run_node(server, no_proxy, downloads).await,
        Commands::Config { action } => run_config(action),
    }
}

async fn run_relay(bind: String) -> Result<()> {
    let server = Arc::new(RelayServer::with_config(RelayServerConfig {
        bind_addr: bind,
        ..Default::default()
    }));
    let addr = server.start().await.context("Failed to start relay")?;
    println!("{} {}", "Relay listening on".green(), addr.to_string().bold());

    // Periodic stats until interrupted
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let stats = server.stats();
                println!(
                    "sessions: {} active / {} total, forwarded: {}, dropped: {}",
                    stats.sessions_active,
                    stats.sessions_total,
                    stats.messages_forwarded,
                    stats.forwards_dropped
                );
            }
        }
    }
    println!("{}", "Relay stopped".yellow());
    Ok(())
}

async fn run_node(
    server: Option<String>,
    no_proxy: bool,
    downloads: Option<PathBuf>,
) -> Result<()> {
    let cli_config = CliConfig::load()?;
    let config = NodeConfig {
        server_addr: server.unwrap_or_else(|| cli_config.relay_server.clone()),
        socks_proxy: if no_proxy {
            None
        } else {
            cli_config.socks_proxy.clone()
        },
        download_dir: downloads.unwrap_or_else(|| cli_config.effective_download_dir()),
        discovery_interval: Duration::from_secs(cli_config.discovery_interval_secs),
        hash_outgoing: cli_config.verify_hashes,
        verify_incoming: cli_config.verify_hashes,
        ..Default::default()
    };

    println!(
        "{} {}{}",
        "Connecting to".cyan(),
        config.server_addr.bold(),
        match &config.socks_proxy {
            Some(proxy) => format!(" via SOCKS5 {}", proxy),
            None => " (direct)".to_string(),
        }
    );

    let (node, mut events) = Node::start(config)
        .await
        .context("Failed to start node")?;
    println!(
        "{} {}",
        "Connected. Your session ID:".green(),
        node.session_id().to_string().bold()
    );
    print_help();

    let mut peers: Vec<SessionId> = Vec::new();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Ok(Some(line)) = line else { break };
                if !handle_line(&node, &peers, line.trim()) {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                render_event(event, &mut peers);
            }
        }
    }

    node.shutdown();
    println!("{}", "Goodbye".yellow());
    Ok(())
}

fn print_help() {
    println!("{}", "Commands:".bold());
    println!("  peers                list discovered peers");
    println!("  send <n> <path>      send a file to peer number n");
    println!("  accept <n>           accept the pending transfer from peer n");
    println!("  reject <n>           reject the pending transfer from peer n");
    println!("  refresh              refresh the peer list now");
    println!("  quit                 exit");
}

/// Returns false when the console should exit
fn handle_line(node: &torshare_core::NodeHandle, peers: &[SessionId], line: &str) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("peers") => {
            if peers.is_empty() {
                println!("{}", "No peers discovered yet".dimmed());
            }
            for (i, peer) in peers.iter().enumerate() {
                println!("  [{}] {}", i, peer);
            }
        }
        Some("send") => match (resolve_peer(peers, parts.next()), parts.next()) {
            (Some(peer), Some(path)) => node.send_file(peer, PathBuf::from(path)),
            _ => println!("{}", "Usage: send <n> <path>".red()),
        },
        Some("accept") => match resolve_peer(peers, parts.next()) {
            Some(peer) => node.accept(peer),
            None => println!("{}", "Usage: accept <n>".red()),
        },
        Some("reject") => match resolve_peer(peers, parts.next()) {
            Some(peer) => node.reject(peer),
            None => println!("{}", "Usage: reject <n>".red()),
        },
        Some("refresh") => node.refresh(),
        Some("help") => print_help(),
        Some("quit") | Some("exit") => return false,
        Some(other) => println!("{} {}", "Unknown command:".red(), other),
        None => {}
    }
    true
}

/// Accept either a peer index from the last listing or a full session ID
fn resolve_peer(peers: &[SessionId], arg: Option<&str>) -> Option<SessionId> {
    let arg = arg?;
    if let Ok(index) = arg.parse::<usize>() {
        return peers.get(index).cloned();
    }
    Some(SessionId::from(arg))
}

fn render_event(event: NodeEvent, peers: &mut Vec<SessionId>) {
    match event {
        NodeEvent::PeersUpdated(list) => {
            if list != *peers {
                *peers = list;
                println!("{} {} peer(s) online", "•".cyan(), peers.len());
            }
        }
        NodeEvent::PeerDisconnected(id) => {
            println!("{} peer {} disconnected", "•".yellow(), short(&id));
        }
        NodeEvent::TransferRequestReceived { peer, name, size } => {
            println!(
                "{} {} wants to send {} ({} bytes): accept or reject it",
                "?".bold().cyan(),
                short(&peer),
                name.bold(),
                size
            );
        }
        NodeEvent::TransferProgress {
            peer,
            direction,
            name,
            percent,
            throughput,
            ..
        } => {
            let arrow = match direction {
                Direction::Outgoing => "→",
                Direction::Incoming => "←",
            };
            let rate = throughput
                .map(|r| format!(" {:.0} KiB/s", r / 1024.0))
                .unwrap_or_default();
            print!(
                "\r{} {} {} {:.1}%{}   ",
                arrow,
                short(&peer),
                name,
                percent,
                rate
            );
            use std::io::Write;
            let _ = std::io::stdout().flush();
        }
        NodeEvent::TransferCompleted {
            peer,
            direction,
            name,
            size,
            path,
        } => {
            println!();
            match direction {
                Direction::Outgoing => println!(
                    "{} sent {} ({} bytes) to {}",
                    "✓".green(),
                    name.bold(),
                    size,
                    short(&peer)
                ),
                Direction::Incoming => println!(
                    "{} received {} ({} bytes) from {} → {}",
                    "✓".green(),
                    name.bold(),
                    size,
                    short(&peer),
                    path.map(|p| p.display().to_string()).unwrap_or_default()
                ),
            }
        }
        NodeEvent::TransferRejected { peer, name } => {
            println!("{} transfer of {} with {} rejected", "✗".red(), name, short(&peer));
        }
        NodeEvent::TransferFailed { peer, name, reason } => {
            println!(
                "{} transfer of {} with {} failed: {}",
                "✗".red(),
                name,
                short(&peer),
                reason
            );
        }
        NodeEvent::ChannelOpen(peer) => {
            println!("{} direct channel open to {}", "•".green(), short(&peer));
        }
        NodeEvent::ConnectionFailed { peer, reason } => {
            println!(
                "{} connection to {} failed: {}",
                "✗".red(),
                short(&peer),
                reason
            );
        }
        NodeEvent::RelayDisconnected => {
            println!("{}", "Relay connection lost".red().bold());
        }
    }
}

/// First eight characters of a session ID, for display
fn short(id: &SessionId) -> String {
    id.as_str().chars().take(8).collect()
}

fn run_config(action: ConfigAction) -> Result<()> {
    let mut config = CliConfig::load()?;
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "Set".green(), key, value);
        }
        ConfigAction::Get { key } => {
            println!("{}", config.get(&key)?);
        }
        ConfigAction::List => {
            for key in [
                "relay_server",
                "socks_proxy",
                "download_dir",
                "discovery_interval_secs",
                "verify_hashes",
            ] {
                println!("{} = {}", key.bold(), config.get(key)?);
            }
        }
    }
    Ok(())
}
