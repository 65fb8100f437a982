use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use clap::Parser;
use conduit_broker::{Broker, BrokerConfig, heartbeat};
use conduit_utils::spawn_named;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Stream broker between a VM guest and its host over two shared-memory
/// ring regions. All settings come from `CONN_SERVER_*` env vars; flags
/// override them.
#[derive(Parser, Debug)]
#[command(name = "conduit-broker")]
struct Args {
    /// Run as the guest peer.
    #[arg(long, conflicts_with = "host")]
    guest: bool,
    /// Run as the host peer.
    #[arg(long)]
    host: bool,
    /// Broker Socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Host-to-guest region backing file.
    #[arg(long)]
    h2g: Option<PathBuf>,
    /// Guest-to-host region backing file.
    #[arg(long)]
    g2h: Option<PathBuf>,
    /// Don't hold a heartbeat to the peer (bench rigs without a supervisor).
    #[arg(long)]
    no_heartbeat: bool,
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let mut config = BrokerConfig::from_env();
    if args.guest {
        config.is_guest = true;
    }
    if args.host {
        config.is_guest = false;
    }
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(h2g) = args.h2g {
        config.h2g_file = h2g;
    }
    if let Some(g2h) = args.g2h {
        config.g2h_file = g2h;
    }

    let term = Arc::new(AtomicBool::new(false));
    for sig in [SIGINT, SIGTERM] {
        signal_hook::flag::register(sig, Arc::clone(&term))
            .expect("couldn't register signal handler");
    }

    let broker = match Broker::new(config.clone()) {
        Ok(broker) => broker,
        Err(e) => {
            error!(%e, "couldn't initialise broker");
            std::process::exit(1);
        }
    };
    if let Err(e) = broker.start() {
        error!(%e, "couldn't start broker");
        std::process::exit(1);
    }

    if !args.no_heartbeat {
        let hb_config = config.clone();
        spawn_named("heartbeat", move || {
            heartbeat::heartbeat_loop(&hb_config);
        });
    }

    info!(guest = config.is_guest, socket = ?config.socket_path, "broker running");
    while !term.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
    }
    info!("signal received, shutting down");
    let _ = std::fs::remove_file(&config.socket_path);
}
