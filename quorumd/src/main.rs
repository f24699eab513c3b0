//! quorumd - per-node shared-disk quorum agent
//!
//! Reads and writes its status block on a shared disk sector once per
//! cycle, tracks peers through the same mechanism, and contributes a
//! quorum vote to the surrounding cluster-membership service.
//!
//! # Usage
//!
//! ```bash
//! # Run in the foreground against a shared device, logging at info level
//! quorumd -f --device /dev/disk/by-id/quorum-disk --node-id 1
//!
//! # Debug logging and the full peer-record dump in the status report
//! quorumd -f -d --device /dev/disk/by-id/quorum-disk --node-id 1
//! ```

mod device;
mod membership_stub;

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use clap::Parser;
use quorum_core::{
    clock_for, codec, reactor, CancelToken, Config, Error, MapConfigSource, NodeId,
    ProcessProbeRunner, QuorumLoop, Reactor, Scorer, TomlConfigSource,
};
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;

use device::FileBlockDevice;
use membership_stub::StubMembership;

/// Per-node shared-disk quorum agent
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run in the foreground instead of detaching
    #[arg(short = 'f', long)]
    foreground: bool,

    /// Enable debug logging and the full peer-record dump in status reports
    #[arg(short = 'd', long)]
    debug: bool,

    /// Silence the stdout/stderr logging layer
    #[arg(short = 'Q', long)]
    quiet: bool,

    /// This node's id (`1..=128`)
    #[arg(long)]
    node_id: NodeId,

    /// Path to the shared block device or backing file
    #[arg(long)]
    device: String,

    /// Optional TOML configuration file; CLI/defaults are used for any
    /// key it does not set
    #[arg(long)]
    config: Option<PathBuf>,

    /// Other node ids the surrounding cluster currently considers live,
    /// standing in for the real cluster-membership client
    #[arg(long, value_delimiter = ',')]
    live_members: Vec<NodeId>,
}

fn install_tracing(args: &Args) {
    if args.quiet {
        return;
    }
    let default_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn load_config(args: &Args) -> quorum_core::Result<Config> {
    match &args.config {
        Some(path) => Config::resolve(&TomlConfigSource::load(path)?),
        None => Config::resolve(&MapConfigSource::default()),
    }
}

#[cfg(feature = "linux-sched")]
fn reactor_for_platform() -> Box<dyn Reactor> {
    Box::new(reactor::linux::LinuxReactor)
}

#[cfg(not(feature = "linux-sched"))]
fn reactor_for_platform() -> Box<dyn Reactor> {
    Box::new(reactor::RecordingReactor::new())
}

fn install_signal_handler(cancel: CancelToken) {
    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build signal-handling runtime");
        rt.block_on(async move {
            #[cfg(unix)]
            {
                let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            info!("shutdown signal received");
            cancel.cancel();
        });
    });
}

fn run(args: Args) -> quorum_core::Result<()> {
    let config = load_config(&args)?;

    let device = FileBlockDevice::open(&args.device, codec::DEFAULT_SECTOR_SIZE)
        .map_err(|e| Error::Configuration(format!("opening {}: {e}", args.device)))?;

    let mut live: HashSet<NodeId> = args.live_members.iter().copied().collect();
    live.insert(args.node_id);
    let membership = StubMembership::new(args.node_id, live);

    let reactor = reactor_for_platform();
    reactor.request_scheduling(&config.scheduler, config.priority);

    let clock = clock_for(config.use_uptime);

    // No probes configured: the degenerate scorer mode (score, max_score)
    // = (1, 1) makes this node always eligible.
    let scorer = Scorer::new(Vec::new());
    let board = scorer.board();
    let shutdown = Arc::new(AtomicBool::new(false));
    let scorer_handle = scorer.spawn(ProcessProbeRunner, shutdown);

    let incarnation = quorum_core::unix_timestamp();
    let mut quorum_loop = QuorumLoop::open(device, incarnation, membership, reactor, clock, config, board, args.debug)?;

    let cancel = CancelToken::new();
    install_signal_handler(cancel.clone());

    let result = quorum_loop.run(&cancel);
    scorer_handle.join();
    result
}

fn main() -> ExitCode {
    let args = Args::parse();
    install_tracing(&args);

    if !args.foreground {
        info!("daemonizing is left to the service supervisor; running in place");
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "quorumd exiting on fatal error");
            ExitCode::FAILURE
        }
    }
}
