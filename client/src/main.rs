use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hookline::capture::{CaptureConfig, CaptureRelay};
use hookline::config::{parse_port, HooklineConfig, SessionIdentity};
use hookline::forwarder::{Forwarder, ForwarderConfig};
use hookline::observer::{ConsoleObserver, SharedObserver};
use hookline::session::{ConnectionState, TunnelSession};
use hookline::supervisor::Supervisor;
use hookline_shared::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hookline")]
#[command(author = "Hookline Team")]
#[command(version)]
#[command(about = "Tunnel webhooks to a local service and capture outbound requests", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config.yml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// API token (overrides the config file)
    #[arg(long, env = "HOOKLINE_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,

    /// Relay / API base URL (overrides the config file)
    #[arg(long, env = "HOOKLINE_API_URL", global = true)]
    api_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward tunnel traffic to a local HTTP port
    Tunnel {
        /// Local port to forward to
        #[arg(value_parser = port_arg)]
        port: u16,

        /// Tunnel to attach to
        #[arg(long)]
        tunnel_id: String,

        /// Also capture outbound requests into this bin
        #[arg(long)]
        capture: Option<String>,

        /// Port for the capture proxy
        #[arg(long, default_value = "8081", value_parser = port_arg)]
        proxy_port: u16,
    },
    /// Only run the capture proxy
    Capture {
        /// Bin that receives captured requests
        bin_id: String,

        /// Port for the capture proxy
        #[arg(long, default_value = "8081", value_parser = port_arg)]
        proxy_port: u16,
    },
}

fn port_arg(s: &str) -> std::result::Result<u16, String> {
    parse_port(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let mut config = HooklineConfig::load_or_default(cli.config.as_deref())?;
    if let Some(token) = cli.token {
        config.api_token = Some(token);
    }
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }

    match cli.command {
        Commands::Tunnel {
            port,
            tunnel_id,
            capture,
            proxy_port,
        } => run_tunnel(config, port, tunnel_id, capture, proxy_port).await,
        Commands::Capture { bin_id, proxy_port } => run_capture(config, bin_id, proxy_port).await,
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "hookline=debug,hookline_shared=debug"
    } else {
        "hookline=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_tunnel(
    config: HooklineConfig,
    port: u16,
    tunnel_id: String,
    capture: Option<String>,
    proxy_port: u16,
) -> Result<()> {
    let token = config.api_token.clone().context(
        "Not authenticated: set api_token in config.yml, pass --token or export HOOKLINE_TOKEN",
    )?;
    let identity = SessionIdentity::new(tunnel_id, port, token, &config.api_url)?;
    let observer: SharedObserver = Arc::new(ConsoleObserver);

    let forwarder = Forwarder::new(
        ForwarderConfig::new(port).with_timeout(config.forward_timeout()),
        observer.clone(),
    )?;
    let session = TunnelSession::new(identity, forwarder).with_handshake_timeout(config.handshake_timeout());
    let banner = tokio::spawn(print_banner_when_connected(
        session.state(),
        session.identity().tunnel_id().to_string(),
        port,
    ));
    let (supervisor, shutdown) = Supervisor::new(session, config.reconnect_policy());

    let (relay_stop, relay_stopped) = oneshot::channel::<()>();
    let relay = match capture {
        Some(bin_id) => {
            let relay = start_capture(&config, bin_id, proxy_port, observer.clone()).await?;
            Some(tokio::spawn(relay.serve(async move {
                let _ = relay_stopped.await;
            })))
        }
        None => None,
    };

    let signals = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        println!("\nShutting down tunnel...");
        signals.shutdown();
    });

    let result = supervisor.run().await;
    banner.abort();
    let _ = relay_stop.send(());
    if let Some(relay) = relay {
        if let Ok(Err(e)) = relay.await {
            warn!("Capture relay error: {}", e);
        }
    }

    match result {
        Ok(()) => {
            println!("Tunnel closed.");
            Ok(())
        }
        Err(Error::ReconnectExhausted(attempts)) => {
            eprintln!("Max reconnection attempts reached ({}). Exiting.", attempts);
            std::process::exit(1);
        }
        Err(e) => Err(e).context("Failed to establish tunnel"),
    }
}

async fn run_capture(config: HooklineConfig, bin_id: String, proxy_port: u16) -> Result<()> {
    let observer: SharedObserver = Arc::new(ConsoleObserver);
    let relay = start_capture(&config, bin_id, proxy_port, observer).await?;
    relay.serve(shutdown_signal()).await?;
    println!("Capture proxy stopped.");
    Ok(())
}

async fn start_capture(
    config: &HooklineConfig,
    bin_id: String,
    proxy_port: u16,
    observer: SharedObserver,
) -> Result<CaptureRelay> {
    let mut capture = CaptureConfig::new(bin_id, config.api_url.clone());
    capture.listen_port = proxy_port;
    capture.sink_path = config.sink_path.clone();
    capture.viewer_base = config.viewer_base().to_string();
    capture.timeout = config.forward_timeout();

    let relay = CaptureRelay::bind(capture, observer)
        .await
        .with_context(|| format!("Failed to start capture proxy on port {}", proxy_port))?;
    let addr = relay.local_addr()?;

    println!("\n📦 Capture mode enabled");
    println!("   Capturing requests to bin: {}", relay.config().bin_id);
    println!("   Proxy listening on http://localhost:{}", addr.port());
    println!("   Configure your app: HTTP_PROXY=http://localhost:{}\n", addr.port());
    Ok(relay)
}

async fn print_banner_when_connected(
    mut state: tokio::sync::watch::Receiver<ConnectionState>,
    tunnel_id: String,
    port: u16,
) {
    if state
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .is_err()
    {
        return;
    }
    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║  🚀 Hookline Tunnel Active                                   ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Tunnel:     {:<47} ║", tunnel_id);
    println!("║  Forwarding: http://localhost:{:<30} ║", port);
    println!("╚══════════════════════════════════════════════════════════════╝\n");
    println!("Press Ctrl+C to stop the tunnel\n");
    info!("Waiting for requests...");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
