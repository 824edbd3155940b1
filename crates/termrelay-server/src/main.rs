//! termrelay-server: real-time terminal relay.
//!
//! Accepts authenticated WebSocket connections and bridges each one to a
//! PTY-backed local shell or SSH channel that survives brief disconnects.

use anyhow::{bail, Context};
use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use termrelay_core::issue_token;
use termrelay_server::transport::tls::generate_self_signed_cert;
use termrelay_server::{ConfigOverrides, RelayServer, ServerConfig};
use tracing::{error, info, warn};

/// termrelay-server: terminal relay over WebSocket
#[derive(Parser, Debug)]
#[command(name = "termrelay-server", version, about = "Terminal relay server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Config file path
    #[arg(long, default_value = "~/.termrelay/config.toml")]
    config: String,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Generate a self-signed certificate for development and serve wss://
    #[arg(long)]
    generate_cert: bool,

    /// Maximum concurrent sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Seconds a detached session waits for its client to come back
    #[arg(long)]
    grace_window: Option<u64>,

    /// Seconds without activity before an attached session is closed
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Program run for local-shell sessions
    #[arg(long)]
    shell: Option<String>,

    /// Print a bearer token for OWNER and exit
    #[arg(long, value_name = "OWNER")]
    issue_token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let (cert, key) = if cli.generate_cert {
        let dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".termrelay");
        let (cert, key) = generate_self_signed_cert(&dir)
            .context("failed to generate self-signed certificate")?;
        info!(cert = %cert.display(), key = %key.display(), "generated self-signed certificate");
        (
            Some(cert.display().to_string()),
            Some(key.display().to_string()),
        )
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = ConfigOverrides {
        bind: cli.bind,
        port: cli.port,
        cert,
        key,
        max_sessions: cli.max_sessions,
        grace_window_secs: cli.grace_window,
        idle_timeout_secs: cli.idle_timeout,
        shell: cli.shell.clone(),
    };
    let config_path = PathBuf::from(&cli.config);
    let config =
        ServerConfig::load(Some(&config_path), overrides).context("failed to load config")?;

    if let Some(owner) = &cli.issue_token {
        let Some(secret) = &config.auth_secret else {
            bail!("--issue-token needs a fixed [auth] secret in the config file");
        };
        let token = issue_token(secret, owner, config.token_ttl_secs)
            .context("failed to issue token")?;
        println!("{token}");
        return Ok(());
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.port,
        "starting termrelay-server"
    );

    let server = Arc::new(RelayServer::from_config(config).context("failed to create server")?);
    let shutdown = server.shutdown_token();
    let mut run = tokio::spawn(server.clone().run());

    let result = tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            shutdown.cancel();
            run.await
        }
    };

    match result {
        Ok(Ok(())) => {
            info!("termrelay-server stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, "server error");
            Err(e).context("server failed")
        }
        Err(e) => Err(e).context("server task panicked"),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
