//! AMQP connection supervisor - Main Entry Point

use amqp_supervisor::config::SupervisorConfig;
use amqp_supervisor::credentials::{EnvPropertySource, PropertySource, TomlFilePropertySource};
use amqp_supervisor::observability::logging::{init_logging, LogFormat};
use amqp_supervisor::observability::{init_default_logging, HealthServer};
use amqp_supervisor::supervisor::ConnectionSupervisor;
use amqp_supervisor::tls::TlsContextBuilder;
use amqp_supervisor::transport::LapinConnector;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn, Level};

/// Supervised AMQP broker connection
#[derive(Parser)]
#[command(name = "amqp-supervisor")]
#[command(about = "Supervised AMQP broker connection with credential rotation and TLS")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "AMQP_SUPERVISOR_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and supervise until SIGINT or SIGTERM
    Run,
    /// Validate configuration and TLS material without touching the network
    Check,
    /// Configuration commands
    Config {
        /// Print the effective configuration with secrets masked
        #[arg(long)]
        show: bool,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_cli_logging(cli.verbose);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting amqp-supervisor"
    );

    let config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_supervisor(config).await,
        Commands::Check => check_configuration(&config),
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!(
            "Command failed: {}",
            amqp_supervisor::error::sanitize_message(&e.to_string())
        );
        process::exit(1);
    }
}

fn init_cli_logging(verbose: u8) {
    if verbose == 0 {
        init_default_logging();
        return;
    }

    let level = match verbose {
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let format = std::env::var("LOG_FORMAT")
        .map(|f| LogFormat::parse(&f))
        .unwrap_or(LogFormat::Pretty);
    init_logging(level, format, false);
}

fn load_configuration(config_path: Option<&Path>) -> CliResult<SupervisorConfig> {
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loading configuration");
        return Ok(SupervisorConfig::load_from_file(path)?);
    }

    for candidate in ["amqp-supervisor.toml", "config/amqp-supervisor.toml"] {
        let path = Path::new(candidate);
        if path.exists() {
            info!(path = %path.display(), "Loading configuration");
            return Ok(SupervisorConfig::load_from_file(path)?);
        }
    }

    Err("No configuration file found. Provide one with -c/--config or create amqp-supervisor.toml".into())
}

fn property_source(config: &SupervisorConfig) -> Arc<dyn PropertySource> {
    match &config.credentials.property_file {
        Some(path) => Arc::new(TomlFilePropertySource::new(path.clone())),
        None => Arc::new(EnvPropertySource::new()),
    }
}

async fn run_supervisor(config: SupervisorConfig) -> CliResult<()> {
    debug!(config = ?config.redacted(), "Effective configuration");
    let health_port = config.observability.health_port;
    let interval = Duration::from_millis(config.recovery.interval_ms.max(1));

    let source = property_source(&config);
    let supervisor = Arc::new(ConnectionSupervisor::new(
        config,
        Arc::new(LapinConnector::new()),
        source,
    )?);
    supervisor.validate_properties()?;

    if let Some(port) = health_port {
        let health_server = Arc::new(HealthServer::for_supervisor(&supervisor, port));
        tokio::spawn(health_server.start());
    }

    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let shutdown_signal = async move {
        tokio::select! {
            _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
        }
    };
    tokio::pin!(shutdown_signal);

    // A signal during the initial retry loop aborts startup cleanly
    tokio::select! {
        result = supervisor.connect() => result?,
        _ = &mut shutdown_signal => {
            supervisor.shutdown().await;
            return Ok(());
        }
    }
    if supervisor.using_default_exchange() {
        info!("Publishing through the default exchange");
    }

    let watcher = {
        let supervisor = Arc::clone(&supervisor);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if supervisor.is_shutting_down() {
                    break;
                }
                if let Err(e) = supervisor.reconnect_if_credentials_changed().await {
                    warn!(error = %e.sanitized_message(), "Credential rotation check failed");
                }
            }
        })
    };

    info!("Supervisor running, waiting for signals");
    shutdown_signal.await;

    supervisor.shutdown().await;
    watcher.abort();
    Ok(())
}

fn check_configuration(config: &SupervisorConfig) -> CliResult<()> {
    let ignored = config.validate()?;
    for field in ignored {
        warn!(field, "Ignored because broker.uri is set");
    }

    let names = config.credentials.property_names();
    if names.is_configured() {
        amqp_supervisor::credentials::CredentialResolver::new(property_source(config))
            .validate_properties(&names)?;
    }

    if config.tls.enabled {
        let context = TlsContextBuilder::build(&config.tls)?;
        info!(protocol = context.protocol.as_str(), "TLS material loaded");
    }

    println!("Configuration OK ({})", config.endpoint()?);
    Ok(())
}

fn handle_config_command(config: &SupervisorConfig, show: bool) -> CliResult<()> {
    if show {
        println!("{}", config.redacted().to_toml_string()?);
    }

    info!("Configuration validation complete");
    Ok(())
}
