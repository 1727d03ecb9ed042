#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use telemetry_unit::broker::tls;
use telemetry_unit::config::{resolve_config_path, Config};
use telemetry_unit::daemon;
use tracing_subscriber::{fmt, EnvFilter};

/// `telemetry-unit` - periodic measurements relayed to an MQTT broker.
#[derive(Parser, Debug)]
#[command(name = "telemetry-unit")]
#[command(version)]
#[command(about = "Generate periodic measurements and relay them to an MQTT broker over mutual TLS.", long_about = None)]
struct Cli {
    /// Config file (default: $TELEMETRY_UNIT_CONFIG, then ./telemetry-unit.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline until Ctrl-C or SIGTERM
    Run {
        /// Publish to an in-process broker that logs each payload; no TLS material needed
        #[arg(long)]
        dry_run: bool,
    },

    /// Validate the config and load the TLS material without connecting
    Check,

    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Print the config JSON Schema
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = rustls::crypto::ring::default_provider().install_default() {
        eprintln!("Warning: Failed to install default crypto provider: {e:?}");
    }

    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    match cli.command {
        Commands::Run { dry_run } => {
            let config = Config::load(cli.config.as_deref()).await?;
            daemon::run(config, dry_run).await
        }

        Commands::Check => {
            let config = Config::load(cli.config.as_deref()).await?;
            config.validate_for_network()?;
            tls::build_client_config(&config.mqtt).context("TLS material check failed")?;

            println!("✅ Config OK: {}", config.config_path.display());
            println!("   Broker:   {}:{}", config.mqtt.broker, config.mqtt.port);
            println!("   Topic:    {} (QoS {})", config.mqtt.topic, config.mqtt.qos);
            println!("   Period:   {}s", config.worker.period_secs);
            println!(
                "   Reconnect: {}",
                if config.reliability.reconnect {
                    "enabled"
                } else {
                    "disabled"
                }
            );
            if config.mqtt.ignore_certificate_revocation_errors {
                println!("   ⚠️  Revocation check failures are tolerated");
            }
            Ok(())
        }

        Commands::Init { force } => {
            let path = resolve_config_path(cli.config.as_deref());
            if path.exists() && !force {
                bail!(
                    "Config file {} already exists. Use --force to overwrite.",
                    path.display()
                );
            }
            Config::template(path.clone()).save().await?;
            println!("✅ Wrote default config to {}", path.display());
            println!("   Edit mqtt.broker and mqtt.client_certificate before running.");
            Ok(())
        }

        Commands::Schema => {
            let schema = schemars::schema_for!(Config);
            println!(
                "{}",
                serde_json::to_string_pretty(&schema).context("failed to serialize JSON Schema")?
            );
            Ok(())
        }
    }
}
