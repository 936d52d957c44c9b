// fedlink: keep an authenticated control channel open to every configured federation peer.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use fedlink_client::config;
use fedlink_client::supervisor::{self, Backoff};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
struct Args {
    version: bool,
    verbose: bool,
    config: Option<PathBuf>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--verbose" | "-v" => out.verbose = true,
            "--config" | "-c" => match args.next() {
                Some(path) => out.config = Some(PathBuf::from(path)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unknown argument {:?}", other),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("fedlink {}", VERSION);
        return Ok(());
    }

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg = config::load(args.config.as_deref()).context("loading configuration")?;
    let identity = cfg.identity()?;
    let trust = cfg.trust_material().context("loading trust material")?;
    for fingerprint in trust.anchor_fingerprints() {
        info!(sha256 = %fingerprint, "pinned trust anchor");
    }
    let peers = cfg.peer_endpoints();
    if peers.is_empty() {
        warn!("no federation peers configured");
    }
    info!(uuid = %identity, peers = peers.len(), "fedlink {} starting", VERSION);

    let options = cfg.session_options();
    let backoff = Backoff::new(
        Duration::from_secs(cfg.reconnect_delay_secs),
        Duration::from_secs(cfg.max_reconnect_delay_secs),
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        for peer in peers {
            tokio::spawn(supervisor::run_peer(
                peer,
                trust.clone(),
                identity,
                options.clone(),
                backoff,
            ));
        }
        shutdown_signal().await
    })?;
    info!("shutting down");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix). Dropping the runtime closes every session.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
