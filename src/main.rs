//! Rivet PBX main application

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info};

use rivet_pbx::{
    config::{PbxConfig, Secrets},
    core::{PbxCore, PbxEvent},
    utils::setup_logging,
    Result,
};

#[derive(Parser)]
#[command(name = "rivet-pbx")]
#[command(about = "Software PBX core: SIP B2BUA with RTP relay")]
#[command(version = rivet_pbx::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the PBX
    Start,
    /// Validate configuration
    ValidateConfig,
    /// Generate default configuration
    GenerateConfig {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Hash a credential for the extensions table
    HashCredential {
        /// The password to hash
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Commands that do not need secrets or logging run first.
    match &cli.command {
        Some(Commands::GenerateConfig { output }) => {
            return generate_default_config(output.clone());
        }
        Some(Commands::HashCredential { password }) => {
            println!("{}", rivet_pbx::store::hash_credential(password));
            return Ok(());
        }
        _ => {}
    }

    let config = load_configuration(&cli)?;
    setup_logging(&config.logging)?;

    info!("Starting {} v{}", rivet_pbx::NAME, rivet_pbx::VERSION);

    match &cli.command {
        Some(Commands::Start) | None => {
            // A PBX without entropy is a PBX without authentication.
            let secrets = Secrets::from_env()?;
            run_pbx(config, cli.config.clone(), secrets).await
        }
        Some(Commands::ValidateConfig) => validate_configuration(&config),
        _ => Ok(()),
    }
}

fn load_configuration(cli: &Cli) -> Result<PbxConfig> {
    let config = if let Some(config_path) = &cli.config {
        PbxConfig::load_from_file(config_path)?
    } else {
        match PbxConfig::load_from_env() {
            Ok(config) => config,
            Err(_) => PbxConfig::default_config(),
        }
    };
    config.validate()?;
    Ok(config)
}

async fn run_pbx(config: PbxConfig, config_path: Option<PathBuf>, secrets: Secrets) -> Result<()> {
    let mut pbx = PbxCore::new(config, secrets)?;
    let mut event_rx = pbx
        .take_event_receiver()
        .ok_or_else(|| rivet_pbx::Error::internal("Failed to get event receiver"))?;

    pbx.start().await?;

    let pbx = Arc::new(tokio::sync::Mutex::new(pbx));

    // Event reporting.
    let event_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            match event {
                PbxEvent::Started => info!("PBX core is up"),
                PbxEvent::Stopped => info!("PBX core stopped"),
                PbxEvent::Error { message } => error!("PBX error: {}", message),
            }
        }
    });

    // SIGHUP reloads the extension snapshot from the config file.
    #[cfg(unix)]
    {
        let pbx_reload = Arc::clone(&pbx);
        tokio::spawn(async move {
            let Ok(mut hup) = signal::unix::signal(signal::unix::SignalKind::hangup()) else {
                return;
            };
            while hup.recv().await.is_some() {
                let Some(path) = config_path.clone() else {
                    info!("Reload requested but no config file was given");
                    continue;
                };
                match PbxConfig::load_from_file(&path) {
                    Ok(config) => {
                        let pbx = pbx_reload.lock().await;
                        if let Err(e) = pbx.reload_extensions(&config) {
                            error!("Reload failed: {}", e);
                        }
                    }
                    Err(e) => error!("Reload failed to parse {}: {}", path.display(), e),
                }
            }
        });
    }
    #[cfg(not(unix))]
    let _ = config_path;

    // Graceful shutdown on Ctrl+C.
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down gracefully");
            let mut pbx = pbx.lock().await;
            if let Err(e) = pbx.stop().await {
                error!("Error during shutdown: {}", e);
            }
        }
        Err(err) => {
            error!("Unable to listen for shutdown signal: {}", err);
        }
    }

    event_task.abort();
    info!("Rivet PBX shutdown complete");
    Ok(())
}

fn validate_configuration(config: &PbxConfig) -> Result<()> {
    config.validate()?;

    println!("✓ Configuration is valid");
    println!("  Node ID: {}", config.general.node_id);
    println!("  SIP Port: {}", config.sip.listen_port);
    println!(
        "  RTP Port Range: {}-{}",
        config.rtp.port_range.min, config.rtp.port_range.max
    );
    println!("  API Port: {}", config.api.port);
    println!("  Extensions: {}", config.extensions.len());
    println!(
        "  Emergency routing: {}",
        config.features.emergency.enabled
    );

    Ok(())
}

fn generate_default_config(output_path: Option<PathBuf>) -> Result<()> {
    let config = PbxConfig::default_config();
    let toml_content = toml::to_string_pretty(&config)
        .map_err(|e| rivet_pbx::Error::internal(format!("Failed to serialize config: {}", e)))?;

    match output_path {
        Some(path) => {
            std::fs::write(&path, toml_content)?;
            println!("✓ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", toml_content);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_generation() {
        assert!(generate_default_config(None).is_ok());
    }

    #[test]
    fn test_config_validation() {
        let config = PbxConfig::default_config();
        assert!(validate_configuration(&config).is_ok());
    }
}
