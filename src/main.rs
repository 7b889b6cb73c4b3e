use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mhub::config::Config;
use mhub::pki::{self, store};
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mhub",
    about = "Topic-based message hub over mutual TLS",
    version = concat!(env!("CARGO_PKG_VERSION"), " (", env!("GIT_REVISION"), ")")
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the hub (default)
    Serve(ServeArgs),
    /// Issue a fresh certificate bundle and print the client credentials
    Certs(CertsArgs),
}

#[derive(Args, Default)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Bind address, overrides HUB_ADDR
    #[arg(long)]
    address: Option<String>,
    /// Bind port, overrides HUB_PORT
    #[arg(long)]
    port: Option<u16>,
    /// Accept plain TCP instead of mutual TLS
    #[arg(long)]
    insecure: bool,
}

#[derive(Args)]
struct CertsArgs {
    /// Directory to write the PEM files into
    #[arg(long, default_value = ".", env = "HUB_CERT_DIR")]
    out: PathBuf,
    /// Organization and DNS fallback for the server certificate
    #[arg(long)]
    host: Option<String>,
    /// IP address for the server certificate, repeatable
    #[arg(long = "ip")]
    ips: Vec<IpAddr>,
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(args: &ServeArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    config
        .apply_env_overrides()
        .context("Invalid environment configuration")?;

    if let Some(address) = &args.address {
        config.address = address.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if args.insecure {
        config.secure = false;
    }
    Ok(config)
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = load_config(&args)?;
    init_tracing(&config.log_level);

    info!("Starting mhub {}", env!("GIT_REVISION"));

    let server = mhub::server::start(config)
        .await
        .context("Failed to start hub")?;

    // Handle UNIX signals
    tokio::select! {
        // SIGINT (Ctrl+C) - graceful shutdown
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating graceful shutdown...");
            server.stop().await?;
            info!("Graceful shutdown completed");
        }

        // SIGTERM - immediate quit
        _ = terminate() => {
            warn!("Received SIGTERM, quitting immediately");
            std::process::exit(0);
        }
    }

    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await
            }
        }
    }
    #[cfg(not(unix))]
    {
        // On non-Unix systems, just wait forever (SIGTERM not available)
        std::future::pending::<()>().await
    }
}

fn certs(args: CertsArgs) -> Result<()> {
    init_tracing("warn");

    let host = pki::discover_host();
    let host_hint = args.host.unwrap_or(host.hostname);
    let addresses = if args.ips.is_empty() {
        host.addresses
    } else {
        args.ips
    };

    let bundle = pki::issue_bundle(&host_hint, &addresses).context("Failed to issue certificates")?;
    store::write_bundle(&bundle, &args.out)
        .with_context(|| format!("Failed to write certificates to {}", args.out.display()))?;

    print!("{}", bundle.client.pem());
    print!("{}", bundle.client_key.pem());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(args).await,
        Command::Certs(args) => certs(args),
    }
}
