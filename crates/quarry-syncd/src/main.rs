use std::time::Duration;

use clap::Parser;
use miette::IntoDiagnostic;
use quarry_sync::{parse_idle_timeout, Server, ServerConfig, SocketFamily};
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

/// Command line options of the lock daemon.
///
/// When spawned by a client, the three positional arguments carry the
/// handshake: the daemon dials the rendezvous address once, advertises the
/// nonce and its final listening address, and then serves. Without them
/// the daemon binds, logs its address, and serves directly.
#[derive(Debug, Parser)]
#[clap(name = "quarry-syncd", version, about = "Cross-process lock daemon for the quarry resolver", long_about = None)]
struct Opt {
    /// Socket family to serve on (`unix` or `inet`); falls back to
    /// QUARRY_SYNC_FAMILY.
    family: Option<String>,

    /// One-shot rendezvous address of the spawning client.
    rendezvous: Option<String>,

    /// Nonce echoed back during the handshake.
    nonce: Option<String>,

    /// Idle grace period before auto-shutdown, in seconds or `<n>ms`;
    /// falls back to QUARRY_SYNC_IDLE_TIMEOUT.
    #[clap(long)]
    idle_timeout: Option<String>,

    /// Verbose logging; falls back to QUARRY_SYNC_DEBUG.
    #[clap(long)]
    debug: bool,
}

/// Entry point of the `quarry-syncd` daemon.
fn main() -> miette::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(async_main())
}

async fn async_main() -> miette::Result<()> {
    let opt = Opt::parse();

    // Determine the logging level based on the debug flag and the RUST_LOG
    // environment variable.
    let debug = opt.debug || std::env::var("QUARRY_SYNC_DEBUG").is_ok_and(|v| v == "true");
    let default_filter = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .into_diagnostic()?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .without_time()
        .finish()
        .try_init()
        .into_diagnostic()?;

    let family: SocketFamily = match opt
        .family
        .or_else(|| std::env::var("QUARRY_SYNC_FAMILY").ok())
    {
        Some(value) => value.parse().into_diagnostic()?,
        None => SocketFamily::default(),
    };
    let idle_timeout = match opt
        .idle_timeout
        .or_else(|| std::env::var("QUARRY_SYNC_IDLE_TIMEOUT").ok())
    {
        Some(value) => parse_idle_timeout(&value).map_err(miette::Report::msg)?,
        None => Duration::from_secs(300),
    };

    let server = Server::bind(ServerConfig {
        family,
        idle_timeout,
        debug,
    })
    .await
    .into_diagnostic()?;

    match (&opt.rendezvous, &opt.nonce) {
        (Some(rendezvous), Some(nonce)) => {
            server.handshake(rendezvous, nonce).await.into_diagnostic()?;
        }
        _ => tracing::info!("listening on {}:{}", family, server.address()),
    }

    // A termination signal shuts the daemon down the same way idle expiry
    // does.
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });

    server.serve().await.into_diagnostic()?;
    Ok(())
}
