//! Witness Service
//!
//! Watches a token cashier contract and submits signed witnesses for its
//! deposits to the bridge relayer.
//!
//! ## Overview
//!
//! The witness:
//! 1. Polls the cashier for finalized `Receipt` events in batches
//! 2. Validates each transfer against the token pair whitelist
//! 3. Signs the transfer id and records it in the local store
//! 4. Submits the signature to the relayer
//!
//! ## Security Requirements
//!
//! **CRITICAL**: This service holds the witness private key. Provide it through
//! `WITNESS_PRIVATE_KEY` rather than a checked-in config file.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use witness_service::config::{Config, CONFIG_PATH_ENV, ENV_PREFIX};
use witness_service::{
    cashier, shutdown_channel, Alerter, Recorder, RelayerClient, ServiceSettings, Signer,
    WitnessService, WitnessSigner,
};

/// Command line arguments.
#[derive(Debug, Parser)]
#[command(name = "witness", about = "Bridge witness service")]
struct Args {
    /// Config file path (overrides WITNESS_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,
}

// ============================================================================
// MAIN APPLICATION ENTRY POINT
// ============================================================================

/// Main application entry point that initializes and runs the witness service.
///
/// This function:
/// 1. Initializes logging and tracing
/// 2. Loads configuration from file and environment
/// 3. Builds the cashier, recorder, signer and relayer client
/// 4. Runs the service until Ctrl-C
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Witness Service");

    let args = Args::parse();
    let config_path = args
        .config
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
    if let Some(ref path) = config_path {
        info!("Using config: {}", path.display());
    }

    let config = Config::load_from(config_path.as_deref(), ENV_PREFIX)?;
    let alerter = Alerter::new(config.alert_webhook(), config.request_timeout());

    let service = match build_service(&config, alerter.clone()).await {
        Ok(service) => service,
        Err(e) => {
            alerter
                .alert(&format!("witness service failed to start: {:#}", e))
                .await;
            return Err(e);
        }
    };

    let (handle, signal) = shutdown_channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, stopping"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        handle.stop();
    });

    // Blocks until Ctrl-C or a fatal error; the service alerts on fatal errors itself.
    service.run(signal).await?;
    Ok(())
}

async fn build_service(config: &Config, alerter: Alerter) -> Result<WitnessService> {
    let settings = ServiceSettings::from_config(config)?;
    let signer = WitnessSigner::from_hex(&config.private_key).context("Failed to load witness key")?;
    info!("Witness address: {:?}", signer.address());

    let cashier = cashier::from_config(config).context("Failed to build cashier")?;

    let recorder = Recorder::connect(
        &config.database_url,
        &config.transfer_table_name,
        &config.token_pair_table_name,
    )
    .await
    .context("Failed to open the store")?;
    recorder.start().await.context("Failed to prepare the store")?;

    let relayer = RelayerClient::new(&config.relayer_url, config.request_timeout())?;

    info!(
        "Witness service initialized: chain={} confirmation_depth={}",
        config.chain,
        config.confirmation_depth()
    );
    Ok(WitnessService::new(
        settings,
        cashier,
        recorder,
        Box::new(signer),
        relayer,
        alerter,
    ))
}
