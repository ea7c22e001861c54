//! HTTPeek - Intercepting HTTP/HTTPS debugging proxy
//!
//! Configure a client to use the proxy listener as its forward proxy; every
//! exchange is captured to a persistent transcript, streamed to the
//! inspection UI, and available for replay and HAR export. HTTPS is
//! observed by MITM interception with a locally-generated root CA.

mod bus;
mod ca;
mod capture;
mod config;
mod error;
mod har;
mod proxy;
mod record;
mod replay;
mod store;
mod ui;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::bus::EventBus;
use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::proxy::ProxyServer;
use crate::replay::Replayer;
use crate::store::TranscriptStore;

const STORE_FILE: &str = "httpeek.db";

/// Intercepting HTTP/HTTPS debugging proxy
#[derive(Parser, Debug)]
#[command(name = "httpeek")]
#[command(author, version, about = "Intercepting HTTP/HTTPS debugging proxy", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "HTTPEEK_CONFIG")]
    config: Option<String>,

    /// Proxy listen address
    #[arg(long, env = "HTTPEEK_PROXY_ADDR")]
    proxy_addr: Option<String>,

    /// Inspection UI listen address
    #[arg(long, env = "HTTPEEK_UI_ADDR")]
    ui_addr: Option<String>,

    /// Data directory for CA files and the transcript database
    #[arg(short, long, env = "HTTPEEK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Disable HTTPS interception; CONNECT tunnels are spliced opaquely
    #[arg(long, env = "HTTPEEK_NO_MITM")]
    no_mitm: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HTTPEEK_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables daily-rotated file logging)
    #[arg(long, env = "HTTPEEK_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Enable JSON structured logging
    #[arg(long, env = "HTTPEEK_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23 requires an installed process-wide crypto provider.
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install rustls crypto provider");

    let cli = Cli::parse();

    if cli.generate_config {
        let toml = toml::to_string_pretty(&Config::default())
            .context("failed to serialize configuration")?;
        println!("{toml}");
        return Ok(());
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting HTTPeek");

    let config = load_config(&cli)?;
    let data_dir = config.capture.data_dir.clone();
    create_data_dir(&data_dir)?;

    // CA failures are fatal; the proxy listener never starts without a
    // usable root.
    let ca = if config.proxy.mitm {
        let ca = CertificateAuthority::load_or_create(&data_dir)?;
        Some(Arc::new(ca))
    } else {
        tracing::warn!("MITM disabled; CONNECT tunnels will not be captured");
        None
    };

    let store = Arc::new(TranscriptStore::open(&data_dir.join(STORE_FILE))?);
    let bus = Arc::new(EventBus::new());

    let proxy_listener = TcpListener::bind(&config.proxy.listen_addr)
        .await
        .with_context(|| format!("failed to bind proxy listener on {}", config.proxy.listen_addr))?;
    let ui_listener = TcpListener::bind(&config.ui.listen_addr)
        .await
        .with_context(|| format!("failed to bind ui listener on {}", config.ui.listen_addr))?;

    tracing::info!("proxy listening on {}", config.proxy.listen_addr);
    tracing::info!(
        "inspection UI on http://{}/ui/ (CA download at /api/ca)",
        config.ui.listen_addr
    );

    let app_state = Arc::new(ui::AppState {
        store: store.clone(),
        bus: bus.clone(),
        replayer: Replayer::new(Duration::from_secs(config.ui.replay_timeout_secs))?,
        ca_cert_pem: ca.as_ref().map(|ca| ca.ca_cert_pem().to_string()),
    });
    let proxy = Arc::new(ProxyServer::new(ca, store, bus));

    tokio::select! {
        result = proxy.serve(proxy_listener) => result,
        result = ui::serve(app_state, ui_listener) => result,
        _ = shutdown_signal() => {
            tracing::info!("shutting down");
            Ok(())
        }
    }
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        let dir = log_path.parent().filter(|p| !p.as_os_str().is_empty());
        let filename = log_path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("httpeek.log");
        let file_appender = RollingFileAppender::new(
            Rotation::DAILY,
            dir.unwrap_or(Path::new(".")),
            filename,
        );

        if cli.log_json {
            subscriber
                .with(fmt::layer().json().with_writer(file_appender).with_ansi(false))
                .init();
        } else {
            subscriber
                .with(fmt::layer().with_writer(file_appender).with_ansi(false))
                .init();
        }
    } else if cli.log_json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(addr) = &cli.proxy_addr {
        config.proxy.listen_addr = addr.clone();
    }
    if let Some(addr) = &cli.ui_addr {
        config.ui.listen_addr = addr.clone();
    }
    if let Some(dir) = &cli.data_dir {
        config.capture.data_dir = dir.clone();
    }
    if cli.no_mitm {
        config.proxy.mitm = false;
    }

    config.validate()?;
    Ok(config)
}

fn create_data_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");

        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to register Ctrl+C handler");
        tracing::info!("received Ctrl+C");
    }
}
