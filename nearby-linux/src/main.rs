// Nearby Linux: discovery daemon. The radio itself is driven by a helper
// process attached over stdin/stdout.

use std::path::PathBuf;

use anyhow::{bail, Context};
use nearby_core::{AdvertiseError, DiscoveryCore, RosterEntry};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use nearby_linux::bridge::{self, BridgeTransport};
use nearby_linux::config;
use nearby_linux::driver::{self, DiscoveryListener, Driver};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    version: bool,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Args> {
    let mut out = Args::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => out.version = true,
            "--config" | "-c" => match args.next() {
                Some(path) => out.config = Some(PathBuf::from(path)),
                None => bail!("--config needs a path"),
            },
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(out)
}

fn main() -> anyhow::Result<()> {
    let args = parse_args(std::env::args().skip(1))?;
    if args.version {
        println!("nearby-linux {}", VERSION);
        return Ok(());
    }

    let cfg = config::load(args.config.as_deref())?;
    init_logging(cfg.log.as_deref());
    let core = DiscoveryCore::new(cfg.discovery()).context("invalid discovery settings")?;
    info!(version = VERSION, name = %cfg.local_name, service = %cfg.service_id, "nearby starting");

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(run(core));
    // stdin reads block a runtime thread; do not wait for them.
    rt.shutdown_background();
    result
}

/// `RUST_LOG` wins over the config `log` key; default info. Stdout carries
/// bridge frames, so logs go to stderr.
fn init_logging(directive: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directive.unwrap_or("info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(core: DiscoveryCore) -> anyhow::Result<()> {
    let (discovery, inbox) = driver::channel();
    let (transport, writer) = BridgeTransport::spawn(tokio::io::stdout());
    let reader = tokio::spawn(bridge::read_loop(tokio::io::stdin(), discovery.events()));
    let driver = tokio::spawn(Driver::new(core, transport, RosterLog, inbox).run());

    tokio::select! {
        res = shutdown_signal() => res?,
        res = reader => match res? {
            Ok(()) => info!("radio helper gone; shutting down"),
            Err(e) => error!(%e, "bridge failed; shutting down"),
        },
    }

    discovery.shutdown();
    driver.await?;
    if let Err(e) = writer.await? {
        warn!(%e, "bridge writer failed");
    }
    Ok(())
}

struct RosterLog;

impl DiscoveryListener for RosterLog {
    fn on_roster_changed(&mut self, peers: &[RosterEntry], changed: bool) {
        if changed {
            let names: Vec<&str> = peers.iter().map(|p| p.display_name.as_str()).collect();
            info!(count = peers.len(), ?names, "nearby peers changed");
        }
    }

    fn on_advertising_failed(&mut self, error: AdvertiseError) {
        error!(%error, "advertising gave up");
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix). On shutdown the driver stops scanning and advertising.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    info!("shutdown signal received");
    Ok(())
}
