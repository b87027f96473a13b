//! kun - reverse tunnel proxy
//!
//! `kun server` runs a backend node; `kun client` exposes a local service
//! through one.

mod config;
mod duration;
mod server;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Configuration, LogFormat};
use kun_auth::{hash_secret, AuthPlugin, PluginRegistry};
use kun_client::{run_with_reconnect, ClientConfig};
use kun_connection::{BackoffConfig, ClientTlsConfig, Dialer};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("KUN_COMMIT"),
    ", built ",
    env!("KUN_BUILT_AT"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "kun")]
#[command(about = "Expose local services through a cluster of tunnel backends")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a backend node
    Server {
        /// YAML configuration file (defaults apply when omitted)
        #[arg(short, long, env = "KUN_CONFIG")]
        config: Option<PathBuf>,

        /// Overrides log.level
        #[arg(long, env = "KUN_LOG_LEVEL")]
        log_level: Option<String>,

        /// Overrides peer.node_id
        #[arg(long, env = "KUN_NODE_ID")]
        node_id: Option<String>,
    },

    /// Connect to a backend and relay its traffic to a local service
    Client {
        /// Backend control address
        #[arg(long, env = "KUN_SERVER")]
        server: String,

        #[arg(long, env = "KUN_ACCESS_KEY_ID", requires = "secret")]
        access_key_id: Option<String>,

        #[arg(long, env = "KUN_SECRET", hide_env_values = true)]
        secret: Option<String>,

        /// Login token instead of an access key
        #[arg(long, env = "KUN_TOKEN", hide_env_values = true, conflicts_with = "access_key_id")]
        token: Option<String>,

        /// Domain to register (repeatable)
        #[arg(long = "domain", required = true)]
        domains: Vec<String>,

        /// Local service, e.g. 127.0.0.1:3000
        #[arg(long)]
        target: String,

        /// Connect to the backend over TLS
        #[arg(long)]
        tls: bool,

        /// Trusted root certificate for the backend (repeatable)
        #[arg(long = "ca-file", requires = "tls")]
        ca_files: Vec<PathBuf>,

        /// Skip certificate verification (insecure, for development only)
        #[arg(long, requires = "tls")]
        insecure: bool,

        /// Heartbeat interval, overriding the one the backend asks for
        #[arg(long, value_parser = parse_duration)]
        heartbeat_interval: Option<Duration>,

        /// Longest wait between reconnection attempts
        #[arg(long, value_parser = parse_duration, default_value = "1m")]
        max_reconnect_delay: Duration,

        /// Give up after this many consecutive failed attempts (0 = never)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        #[arg(long, env = "KUN_LOG_LEVEL", default_value = "info")]
        log_level: String,
    },

    /// Print an argon2 hash of a secret for the STATIC auth method
    HashSecret {
        #[arg(env = "KUN_SECRET", hide_env_values = true)]
        secret: String,
    },

    /// Validate a configuration file and exit
    CheckConfig {
        #[arg(short, long, env = "KUN_CONFIG")]
        config: PathBuf,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    duration::parse(s)
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
        .map_err(|_| anyhow::anyhow!("Failed to install the rustls crypto provider"))?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            config,
            log_level,
            node_id,
        } => {
            let mut configuration = match &config {
                Some(path) => Configuration::load(path)?,
                None => Configuration::default(),
            };
            if let Some(level) = log_level {
                configuration.log.level = level;
            }
            if let Some(node_id) = node_id {
                configuration.peer.node_id = Some(node_id);
            }
            configuration.validate(&PluginRegistry::with_builtins())?;
            init_logging(&configuration.log.level, configuration.log.format)?;
            info!("kun {}", VERSION);

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));
            server::run(configuration, cancel).await
        }

        Commands::Client {
            server,
            access_key_id,
            secret,
            token,
            domains,
            target,
            tls,
            ca_files,
            insecure,
            heartbeat_interval,
            max_reconnect_delay,
            max_reconnect_attempts,
            log_level,
        } => {
            init_logging(&log_level, LogFormat::Text)?;

            let mut builder = ClientConfig::builder()
                .server(server)
                .target(target)
                .reconnect(BackoffConfig {
                    max_backoff: max_reconnect_delay,
                    max_attempts: (max_reconnect_attempts > 0).then_some(max_reconnect_attempts),
                    ..BackoffConfig::default()
                });
            builder = match (access_key_id, secret, token) {
                (Some(id), Some(secret), _) => builder.access_key(id, secret),
                (None, _, Some(token)) => builder.token(token),
                _ => anyhow::bail!("either --access-key-id with --secret, or --token is required"),
            };
            for domain in domains {
                builder = builder.domain(domain);
            }
            if let Some(interval) = heartbeat_interval {
                builder = builder.heartbeat_interval(interval);
            }
            let client_config = builder.build()?;

            let dialer = if tls {
                let connector = ClientTlsConfig {
                    root_ca_files: ca_files,
                    insecure_skip_verify: insecure,
                    ..ClientTlsConfig::default()
                }
                .connector()
                .context("Failed to set up TLS")?;
                Dialer::tls(connector)
            } else {
                Dialer::plain()
            };

            info!(
                "Exposing {} as {}",
                client_config.target,
                client_config.domains.join(", ")
            );
            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_on_ctrl_c(cancel.clone()));
            run_with_reconnect(client_config, dialer, cancel).await?;
            info!("kun client stopped");
            Ok(())
        }

        Commands::HashSecret { secret } => {
            let hash = hash_secret(&secret).context("Failed to hash secret")?;
            println!("{}", hash);
            Ok(())
        }

        Commands::CheckConfig { config } => {
            let configuration = Configuration::load(&config)?;
            let plugins = PluginRegistry::with_builtins();
            configuration.validate(&plugins)?;

            let plugin = server::create_auth_plugin(&configuration, &plugins).await?;
            if let Err(e) = plugin.close().await {
                error!("Closing auth plugin failed: {}", e);
            }
            println!("{}: configuration is valid", config.display());
            Ok(())
        }
    }
}

async fn shutdown_on_ctrl_c(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received");
            cancel.cancel();
        }
        Err(e) => error!("Error listening for shutdown signal: {}", e),
    }
}

fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }

    Ok(())
}
