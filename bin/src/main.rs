#![allow(clippy::cognitive_complexity)]
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{
    runtime::Builder,
    signal::unix::{signal, SignalKind},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use athena_server::CoreContext;

#[derive(Parser, Debug, Clone)]
#[command(name = "athena-dhcpd", about = "RFC 2131 DHCPv4 server with HA and conflict detection")]
struct Cli {
    /// path to the server config (JSON or YAML)
    #[arg(long, short, env = "ATHENA_CONFIG")]
    config: PathBuf,
    /// tracing filter, e.g. `info` or `athena_server=debug`
    #[arg(long, default_value = "info", env = "ATHENA_LOG")]
    log: String,
    /// worker threads; defaults to the number of logical CPUs
    #[arg(long, env = "ATHENA_THREADS")]
    threads: Option<usize>,
}

fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .init();
    debug!(?cli);

    let mut builder = Builder::new_multi_thread();
    builder.thread_name("athena-dhcpd").enable_all();
    if let Some(num) = cli.threads {
        builder.worker_threads(num);
    }
    let rt = match builder.build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(?err, "failed to build runtime");
            std::process::exit(1);
        }
    };

    if let Err(err) = rt.block_on(start(cli)) {
        error!(?err, "exited with error");
        std::process::exit(1);
    }
    info!("clean shutdown");
}

async fn start(cli: Cli) -> Result<()> {
    debug!("parsing DHCP config");
    let bootstrap = config::parse(&cli.config)?;

    let pid_file = bootstrap.server.pid_file.clone();
    if let Some(path) = &pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .with_context(|| format!("failed to write pid file {}", path.display()))?;
    }

    let token = CancellationToken::new();
    let ctx = CoreContext::build(bootstrap, token.clone())?;

    spawn_signal_handlers(cli.config.clone(), ctx.clone(), token.clone())?;

    let result = ctx.serve().await;

    // serve() returned: make sure every subsystem winds down
    token.cancel();
    if let Some(path) = &pid_file {
        if let Err(err) = std::fs::remove_file(path) {
            warn!(?err, path = %path.display(), "failed to remove pid file");
        }
    }
    result
}

fn spawn_signal_handlers(
    config_path: PathBuf,
    ctx: std::sync::Arc<CoreContext>,
    token: CancellationToken,
) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("caught SIGINT, shutting down");
                    token.cancel();
                    return;
                }
                _ = sigterm.recv() => {
                    info!("caught SIGTERM, shutting down");
                    token.cancel();
                    return;
                }
                _ = sighup.recv() => {
                    info!("caught SIGHUP, reloading config");
                    match config::parse(&config_path) {
                        Ok(fresh) => ctx.reload(fresh),
                        Err(err) => error!(?err, "reload failed, keeping current config"),
                    }
                }
            }
        }
    });
    Ok(())
}
