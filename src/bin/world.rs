//! instance-world binary
//!
//! Builds a data model (root, workspace, one baseplate part) and either
//! serves it to peers or connects to an owner as a peer.
//!
//! ## Configuration (TOML file / env via `config` crate, CLI wins)
//!
//! | Key                            | Default          | Description                      |
//! |--------------------------------|------------------|----------------------------------|
//! | `INSTANCE_WORLD_MODE`          | `serve`          | `serve` or `connect`             |
//! | `INSTANCE_WORLD_ADDR`          | `0.0.0.0:3000` (serve) / `127.0.0.1:3000` (connect) | Bind or dial address |
//! | `INSTANCE_WORLD_SESSION_KEY`   | `default`        | Handshake payload                |
//! | `INSTANCE_WORLD_TICK_RATE_HZ`  | `60`             | Event processing rate            |
//! | `INSTANCE_WORLD_EVENT_BUFFER`  | `1024`           | Event queue capacity             |

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use clap::{Parser, ValueEnum};
use instance_world::{
    kinds,
    protocol::node_delta,
    registry::PART_CLASS,
    types::{NetworkConfig, Vec3},
    NetworkManager, TreeManager,
};
use serde::Deserialize;
use std::time::Duration;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(ValueEnum, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Mode {
    Serve,
    Connect,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Serve => "serve",
            Mode::Connect => "connect",
        }
    }

    fn default_addr(self) -> &'static str {
        match self {
            Mode::Serve => "0.0.0.0:3000",
            Mode::Connect => "127.0.0.1:3000",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "instance-world", about = "Instance World scene graph server", version)]
struct Args {
    /// Optional TOML config file
    #[arg(long, short, env = "INSTANCE_WORLD_CONFIG")]
    config: Option<String>,

    /// Run as owner (serve) or peer (connect)
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Address to bind (serve) or dial (connect)
    #[arg(long)]
    addr: Option<String>,

    /// Session key sent in the handshake
    #[arg(long)]
    session_key: Option<String>,

    /// Event processing rate (Hz)
    #[arg(long)]
    tick_rate_hz: Option<f64>,

    /// Event queue capacity
    #[arg(long)]
    event_buffer: Option<u64>,

    /// Print the initial tree and exit
    #[arg(long)]
    dump_tree: bool,
}

#[derive(Debug, Deserialize)]
struct Settings {
    mode: Mode,
    addr: Option<String>,
    session_key: String,
    tick_rate_hz: f64,
    event_buffer: u64,
}

fn load_settings(args: &Args) -> Result<Settings> {
    let mut builder = config::Config::builder()
        .set_default("mode", "serve")?
        .set_default("session_key", "default")?
        .set_default("tick_rate_hz", 60.0)?
        .set_default("event_buffer", 1024u64)?;

    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::with_name(path));
    }

    let settings: Settings = builder
        .add_source(config::Environment::with_prefix("INSTANCE_WORLD").try_parsing(true))
        .set_override_option("mode", args.mode.map(Mode::as_str))?
        .set_override_option("addr", args.addr.clone())?
        .set_override_option("session_key", args.session_key.clone())?
        .set_override_option("tick_rate_hz", args.tick_rate_hz)?
        .set_override_option("event_buffer", args.event_buffer)?
        .build()
        .context("failed to load configuration")?
        .try_deserialize()
        .context("invalid configuration")?;

    if !settings.tick_rate_hz.is_finite() || settings.tick_rate_hz <= 0.0 {
        bail!("tick_rate_hz must be positive, got {}", settings.tick_rate_hz);
    }
    Ok(settings)
}

// ---------------------------------------------------------------------------
// Tree setup
// ---------------------------------------------------------------------------

fn build_tree() -> TreeManager {
    let tree = TreeManager::with_data_model();

    let workspace = tree.find_by_path("Workspace");
    let baseplate = tree.create_named(PART_CLASS, "Baseplate");
    if let (Some(workspace), Some(baseplate)) = (workspace, baseplate) {
        baseplate.edit_part(|part| {
            part.position = Vec3::new(0.0, -0.5, 0.0);
            part.size = Vec3::new(64.0, 1.0, 64.0);
        });
        if let Err(e) = baseplate.set_parent(Some(&workspace)) {
            log::warn!("Failed to place baseplate: {}", e);
        }
    }
    tree
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn register_owner_handlers(net: &NetworkManager, session_key: Bytes) {
    net.register_handler(kinds::PING, |_tree, _payload, peer| {
        if let Some(peer) = peer {
            if let Err(e) = peer.send_packet(kinds::ACK.ptype, kinds::ACK.subtype, "pong") {
                log::warn!("Ping reply to {} failed: {}", peer.id(), e);
            }
        }
    });

    net.register_handler(kinds::HANDSHAKE, move |tree, payload, peer| {
        let Some(peer) = peer else { return };
        if payload != &session_key[..] {
            log::warn!("{} sent an unknown session key, ignoring", peer.id());
            return;
        }
        log::info!("{} joined the session", peer.id());

        let mut sent = peer
            .send_packet(kinds::ACK.ptype, kinds::ACK.subtype, Bytes::new())
            .is_ok();
        for node in tree.root().get_descendants() {
            if !sent {
                break;
            }
            let delta = node_delta::encode(node.id(), &[]);
            sent = peer
                .send_packet(kinds::NODE_ADDED.ptype, kinds::NODE_ADDED.subtype, delta)
                .is_ok();
        }
        if !sent {
            log::warn!("{} went away during the initial sync", peer.id());
        }
    });
}

fn register_peer_handlers(net: &NetworkManager) {
    net.register_handler(kinds::ACK, |_tree, payload, _peer| {
        log::info!("Owner acknowledged ({} bytes)", payload.len());
    });
    net.register_handler(kinds::NODE_ADDED, |_tree, payload, _peer| {
        log::debug!("Node added: {}", String::from_utf8_lossy(payload));
    });
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("instance_world=debug".parse()?),
        )
        .init();

    let args = Args::parse();
    let settings = load_settings(&args)?;
    let tree = build_tree();

    if args.dump_tree {
        tree.root().print_hierarchy(0);
        println!("{}", serde_json::to_string_pretty(&tree.snapshot())?);
        return Ok(());
    }

    let addr = settings
        .addr
        .clone()
        .unwrap_or_else(|| settings.mode.default_addr().to_string());

    log::info!(
        "Starting instance-world (mode={}, addr={}, tick={}Hz, buffer={})",
        settings.mode.as_str(),
        addr,
        settings.tick_rate_hz,
        settings.event_buffer,
    );

    let event_buffer = usize::try_from(settings.event_buffer).context("event_buffer out of range")?;
    let net = NetworkManager::new(NetworkConfig::with_event_buffer(event_buffer));

    match settings.mode {
        Mode::Serve => {
            register_owner_handlers(&net, Bytes::from(settings.session_key.clone()));
            net.serve(&addr).await.context("failed to start server")?;
        }
        Mode::Connect => {
            register_peer_handlers(&net);
            net.connect(&addr, settings.session_key.clone())
                .await
                .context("failed to connect")?;
        }
    }

    let mut timer = tokio::time::interval(Duration::from_secs_f64(1.0 / settings.tick_rate_hz));
    let mut status_timer = tokio::time::interval(Duration::from_secs(10));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = timer.tick() => {
                net.process_events(&tree);
            }
            _ = status_timer.tick() => {
                if settings.mode == Mode::Connect {
                    if let Err(e) = net.send_packet(kinds::PING.ptype, kinds::PING.subtype, "ping") {
                        log::warn!("Ping failed: {}", e);
                    }
                }
                let stats = tree.stats();
                log::info!(
                    "Tree: {} instances, {} renderables; {} peers",
                    stats.instance_count,
                    stats.renderable_count,
                    net.connection_count(),
                );
            }
            _ = &mut ctrl_c => {
                log::info!("Shutdown signal received");
                break;
            }
        }
    }

    net.close().await;
    let leftover = net.process_events(&tree);
    if leftover > 0 {
        log::debug!("Dispatched {} events queued before shutdown", leftover);
    }
    Ok(())
}
