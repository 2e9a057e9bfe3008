//! remotedialer - reverse-tunnel dialer
//!
//! `remotedialer server` accepts agent connections and can forward local
//! TCP ports into them; `remotedialer agent` connects out to a server and
//! dials targets on its behalf.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use remotedialer_agent::{Agent, AgentConfig, AllowList};
use remotedialer_common::telemetry::{init_telemetry, TelemetryConfig};
use remotedialer_common::DEFAULT_SERVER_PORT;
use remotedialer_server::{HeaderAuthorizer, Server, ServerConfig};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// remotedialer - dial into agents over their own outbound WebSocket
#[derive(Parser, Debug)]
#[command(name = "remotedialer", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Accept agent connections and hand out dialers
    Server(ServerArgs),

    /// Connect to a server and dial targets it asks for
    Agent(AgentArgs),
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, env = "REMOTEDIALER_LISTEN", default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_SERVER_PORT)))]
    listen: SocketAddr,

    /// Token agents must present as `Authorization: Bearer`; open when unset
    #[arg(long, env = "REMOTEDIALER_TOKEN")]
    token: Option<String>,

    /// This server's id within a federated fleet
    #[arg(long, env = "REMOTEDIALER_PEER_ID")]
    peer_id: Option<String>,

    /// Token shared by every server of the fleet
    #[arg(long, env = "REMOTEDIALER_PEER_TOKEN")]
    peer_token: Option<String>,

    /// Peer server to link to, as ID=URL (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerSpec>,

    /// Forward a local port into a client, as LISTEN=CLIENT/PROTO/ADDRESS (repeatable)
    #[arg(long = "forward", value_parser = parse_forward)]
    forwards: Vec<ForwardSpec>,
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Upgrade URL of the server, e.g. ws://tunnel.example.com:8123/connect
    #[arg(long, env = "REMOTEDIALER_SERVER")]
    server: String,

    /// Identity to register under
    #[arg(long, env = "REMOTEDIALER_CLIENT_ID")]
    id: String,

    /// Bearer token presented to the server
    #[arg(long, env = "REMOTEDIALER_TOKEN")]
    token: Option<String>,

    /// Targets the server may dial, comma-separated proto/address rules
    #[arg(long, env = "REMOTEDIALER_ALLOW", default_value = "")]
    allow: AllowList,

    /// Accept any server certificate on wss:// URLs
    #[arg(long)]
    insecure_skip_verify: bool,

    /// Seconds between reconnect attempts
    #[arg(long, default_value_t = 5)]
    reconnect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PeerSpec {
    id: String,
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ForwardSpec {
    listen: SocketAddr,
    client_key: String,
    proto: String,
    address: String,
}

fn parse_peer(s: &str) -> Result<PeerSpec, String> {
    let (id, url) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=URL, got {s:?}"))?;
    if id.is_empty() || url.is_empty() {
        return Err(format!("expected ID=URL, got {s:?}"));
    }
    Ok(PeerSpec {
        id: id.to_string(),
        url: url.to_string(),
    })
}

fn parse_forward(s: &str) -> Result<ForwardSpec, String> {
    let usage = || format!("expected LISTEN=CLIENT/PROTO/ADDRESS, got {s:?}");
    let (listen, target) = s.split_once('=').ok_or_else(usage)?;
    let listen = listen
        .parse()
        .map_err(|e| format!("invalid listen address {listen:?}: {e}"))?;

    let mut parts = target.splitn(3, '/');
    let (Some(client_key), Some(proto), Some(address)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(usage());
    };
    if client_key.is_empty() || proto.is_empty() || address.is_empty() {
        return Err(usage());
    }

    Ok(ForwardSpec {
        listen,
        client_key: client_key.to_string(),
        proto: proto.to_string(),
        address: address.to_string(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: failed to install crypto provider: {e:?}");
        std::process::exit(1);
    }

    let cli = Cli::parse();

    let (service_name, instance_id) = match &cli.command {
        Commands::Server(args) => ("remotedialer-server", args.peer_id.clone()),
        Commands::Agent(args) => ("remotedialer-agent", Some(args.id.clone())),
    };
    init_telemetry(TelemetryConfig {
        service_name: service_name.to_string(),
        instance_id,
        ..Default::default()
    })
    .context("failed to initialize telemetry")?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
                cancel.cancel();
            }
        });
    }

    match cli.command {
        Commands::Server(args) => run_server(args, cancel).await,
        Commands::Agent(args) => run_agent(args, cancel).await,
    }
}

async fn run_server(args: ServerArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    if args.token.is_none() {
        warn!("no --token configured; any agent that names itself is accepted");
    }

    let config = ServerConfig {
        listen_addr: args.listen,
        peer_id: args.peer_id,
        peer_token: args.peer_token,
        ..Default::default()
    };
    let server = Server::new(config, Arc::new(HeaderAuthorizer::new(args.token)));

    let fleet_token = server.config().peer_token.clone().unwrap_or_default();
    for peer in &args.peers {
        server.add_peer(&peer.url, &peer.id, &fleet_token);
    }

    for forward in args.forwards {
        let listener = TcpListener::bind(forward.listen)
            .await
            .with_context(|| format!("failed to bind forward listener {}", forward.listen))?;
        info!(
            listen = %forward.listen,
            client_key = %forward.client_key,
            target = %format!("{}/{}", forward.proto, forward.address),
            "forwarding port"
        );
        tokio::spawn(run_forward(server.clone(), listener, forward, cancel.clone()));
    }

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;

    {
        let server = server.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            server.shutdown();
        });
    }

    server.serve(listener).await.context("tunnel server failed")
}

async fn run_forward(
    server: Server,
    listener: TcpListener,
    forward: ForwardSpec,
    cancel: CancellationToken,
) {
    loop {
        let (mut local, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "forward accept failed");
                    continue;
                }
            },
        };

        let server = server.clone();
        let forward = forward.clone();
        tokio::spawn(async move {
            let stream = match server.dialer(&forward.client_key) {
                Ok(dialer) => dialer.dial(&forward.proto, &forward.address).await,
                Err(e) => Err(e),
            };
            let mut remote = match stream {
                Ok(remote) => remote,
                Err(e) => {
                    warn!(client_key = %forward.client_key, error = %e, "forward dial failed");
                    return;
                }
            };

            match tokio::io::copy_bidirectional(&mut local, &mut remote).await {
                Ok((up, down)) => debug!(%peer, up, down, "forward closed"),
                Err(e) => debug!(%peer, error = %e, "forward ended"),
            }
            let conn = remote.connection().clone();
            conn.close().await;
        });
    }
}

async fn run_agent(args: AgentArgs, cancel: CancellationToken) -> anyhow::Result<()> {
    if args.allow.is_empty() {
        warn!("no --allow rules configured; every connect will be refused");
    }

    let mut config = AgentConfig::new(args.server, args.id);
    config.token = args.token;
    config.allow = args.allow;
    config.insecure_skip_verify = args.insecure_skip_verify;
    config.reconnect_interval = Duration::from_secs(args.reconnect_secs);

    Agent::new(config).run(cancel).await;
    Ok(())
}
