//! triekv server binary: config + CLI parsing, logging setup, signal
//! handling around the staged server.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use triekv::config::{Config, Mode};
use triekv::net::Server;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "triekv", version, about = "Trie-indexed in-memory key-value store")]
struct Args {
    /// Listen address (overrides the config file)
    #[arg(short = 'a', long = "addr")]
    addr: Option<String>,

    /// Listen port (overrides the config file)
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Config file path
    #[arg(short = 'c', long = "conf")]
    conf: Option<PathBuf>,

    /// Mode: STANDALONE or CLUSTER
    #[arg(short = 'm', long = "mode")]
    mode: Option<String>,

    /// Verbose (debug) logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start in cluster mode and announce this node to a seed member
    Join {
        /// Seed host
        host: String,
        /// Seed listening port (the bus port is derived from it)
        port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mut config = match &args.conf {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("triekv: {}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::default(),
    };

    if let Some(addr) = args.addr {
        config.ip_address = addr;
    }
    if let Some(port) = args.port {
        config.ip_port = port;
    }
    if let Some(mode) = &args.mode {
        match Mode::parse(mode) {
            Some(mode) => config.mode = mode,
            None => {
                eprintln!("triekv: invalid mode {:?} (STANDALONE or CLUSTER)", mode);
                return ExitCode::FAILURE;
            }
        }
    }

    let seed = match args.command {
        Some(Command::Join { host, port }) => {
            config.mode = Mode::Cluster;
            Some((host, port))
        }
        None => None,
    };

    init_logging(&config, args.verbose);

    info!("triekv v{} starting", VERSION);
    match &config.unix_socket {
        Some(path) => info!("socket: unix {}", path.display()),
        None => info!("socket: {}:{}", config.ip_address, config.ip_port),
    }
    info!("mode: {:?}", config.mode);
    if let Some((host, port)) = &seed {
        info!("seed: {}:{}", host, port);
    }

    let server = match Server::start(config, seed).await {
        Ok(server) => server,
        Err(e) => {
            error!("startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    wait_for_signal().await;
    server.shutdown().await;
    ExitCode::SUCCESS
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {}", e);
            tokio::signal::ctrl_c().await.ok();
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose {
        "debug"
    } else {
        config.log_level.as_directive()
    };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(format!("triekv={}", level).parse().unwrap());

    let log_file = config.log_path.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| eprintln!("triekv: cannot open log file {}: {}", path.display(), e))
            .ok()
    });

    match log_file {
        Some(file) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Arc::new(file))
            .with_ansi(false)
            .init(),
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
