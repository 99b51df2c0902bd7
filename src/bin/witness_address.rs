//! Witness Key Utility
//!
//! Prints the Ethereum-style address of the configured witness key, which is
//! the address to register with the validator contract. With `--generate` it
//! creates a fresh key instead.
//!
//! ## Usage
//!
//! ```bash
//! # Address of the configured key (config file and WITNESS_* environment)
//! cargo run --bin witness_address -- --config config/witness.toml
//!
//! # New key pair
//! cargo run --bin witness_address -- --generate
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use k256::ecdsa::SigningKey;
use std::path::PathBuf;

use witness_service::address::{to_hex_address, to_io_address};
use witness_service::config::{Config, CONFIG_PATH_ENV, ENV_PREFIX};
use witness_service::{Signer, WitnessSigner};

#[derive(Debug, Parser)]
#[command(name = "witness_address", about = "Print or generate the witness key address")]
struct Args {
    /// Config file path (overrides WITNESS_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Generate a new private key instead of reading the configured one
    #[arg(long)]
    generate: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        let private_key_hex = format!("0x{}", hex::encode(key.to_bytes()));
        let signer = WitnessSigner::from_hex(&private_key_hex)?;

        println!("Generated witness key:");
        println!("Private Key (hex): {}", private_key_hex);
        print_address(&signer)?;
        println!();
        println!("Set WITNESS_PRIVATE_KEY to the private key.");
        return Ok(());
    }

    let config_path = args
        .config
        .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from));
    let config = Config::load_from(config_path.as_deref(), ENV_PREFIX)?;
    let signer = WitnessSigner::from_hex(&config.private_key).context("Failed to load witness key")?;
    print_address(&signer)
}

fn print_address(signer: &WitnessSigner) -> Result<()> {
    let address = signer.address();
    println!("Address (hex): {}", to_hex_address(&address));
    println!("Address (io):  {}", to_io_address(&address)?);
    Ok(())
}
