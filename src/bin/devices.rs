//! CLI tool for managing known devices
//!
//! Usage:
//!   syncproxy-devices list [--json]
//!   syncproxy-devices import-cert <serial> <pem>
//!   syncproxy-devices delete <serial>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustls::RootCertStore;
use std::path::PathBuf;
use syncproxy::certificate::client_config;
use syncproxy::{DatabaseManager, DeviceStore, FileCertificateProvider};

/// CLI tool for managing devices known to the proxy
#[derive(Parser, Debug)]
#[command(name = "syncproxy-devices")]
#[command(author = "SyncProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "Manage devices known to SyncProxy")]
struct Args {
    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/devices.db")]
    db_path: PathBuf,

    /// Directory holding device certificates
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List all devices
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Import a device's client certificate and key from a PEM bundle
    ImportCert {
        /// Device serial
        serial: String,

        /// PEM file with the certificate chain and private key
        pem: PathBuf,
    },

    /// Forget a device
    Delete {
        /// Device serial
        serial: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize database
    let db = DatabaseManager::new(&args.db_path)?;

    match args.command {
        Commands::List { json } => {
            let devices = db.load_all()?;

            if devices.is_empty() {
                println!("No devices found");
                return Ok(());
            }

            if json {
                let json_output: Vec<serde_json::Value> = devices
                    .iter()
                    .map(|d| {
                        serde_json::json!({
                            "serial": d.serial,
                            "external_id": d.external_id,
                            "last_ip": d.last_ip,
                            "last_cookie": d.last_cookie,
                            "has_certificate": d.certificate_material.is_some(),
                            "lto": d.lto,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&json_output)?);
            } else {
                println!("{:<24} {:<40} {:<16} {:<6}", "SERIAL", "EXTERNAL_ID", "LAST_IP", "CERT");
                println!("{}", "-".repeat(88));

                for device in &devices {
                    println!(
                        "{:<24} {:<40} {:<16} {:<6}",
                        device.serial,
                        device.external_id.as_deref().unwrap_or("-"),
                        device.last_ip.as_deref().unwrap_or("-"),
                        if device.certificate_material.is_some() { "yes" } else { "no" }
                    );
                }

                println!("\nTotal: {} device(s)", devices.len());
            }
        }

        Commands::ImportCert { serial, pem } => {
            let material = std::fs::read(&pem).with_context(|| format!("Failed to read {}", pem.display()))?;

            // refuse bundles rustls could not present
            client_config(RootCertStore::empty(), &material)
                .with_context(|| format!("{} is not a usable certificate bundle", pem.display()))?;

            let provider = FileCertificateProvider::new(&args.certs_dir)?;
            let path = provider.material_path(&serial)?;
            std::fs::write(&path, &material)?;
            db.set_certificate(&serial, &material)?;

            println!("Imported certificate for {} ({})", serial, path.display());
        }

        Commands::Delete { serial } => {
            if db.delete(&serial)? {
                println!("Deleted device {}", serial);
            } else {
                eprintln!("No device found with serial {}", serial);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
