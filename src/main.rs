//! MDM certificate authentication server
//!
//! Extracts device identity certificates, verifies them against the
//! enrollment association store, and serves the MDM check-in endpoints.

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use mdm_certauth::{
    cert::decode_pem_certificate,
    cli::{Cli, Command},
    config::Config,
    server::Server,
    setup_tracing,
    storage::open_store,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    // Handle subcommands
    match cli.command {
        Some(Command::Hash { ref cert }) => run_hash(cert),
        Some(Command::Associate {
            ref enrollment_id,
            ref cert,
        }) => run_associate(cli.config.as_deref(), enrollment_id, cert).await,
        Some(Command::Serve { port, ref host }) => {
            run_server(cli.config.as_deref(), port, host.clone()).await
        }
        None => run_server(cli.config.as_deref(), None, None).await,
    }
}

/// Print the certificate's association hash
fn run_hash(cert: &Path) -> ExitCode {
    match read_certificate(cert) {
        Ok(hash) => {
            println!("{hash}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ {}: {e}", cert.display());
            ExitCode::FAILURE
        }
    }
}

/// Bind a certificate to an enrollment
async fn run_associate(config: Option<&Path>, enrollment_id: &str, cert: &Path) -> ExitCode {
    let hash = match read_certificate(cert) {
        Ok(hash) => hash,
        Err(e) => {
            eprintln!("❌ {}: {e}", cert.display());
            return ExitCode::FAILURE;
        }
    };

    let config = match Config::load(config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let store = match open_store(&config.storage).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open association store: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = store.associate_cert_hash(enrollment_id, &hash).await {
        error!("Failed to associate certificate: {e}");
        return ExitCode::FAILURE;
    }

    println!("✅ {enrollment_id} → {hash}");
    ExitCode::SUCCESS
}

/// Association hash of a PEM certificate file
fn read_certificate(path: &Path) -> mdm_certauth::Result<String> {
    let pem = std::fs::read(path)?;
    let cert = decode_pem_certificate(&pem)?;
    Ok(cert.hash())
}

/// Run the server
async fn run_server(config: Option<&Path>, port: Option<u16>, host: Option<String>) -> ExitCode {
    // Load configuration
    let config = match Config::load(config) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(host) = host {
                config.server.host = host;
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        tls = config.tls.enabled,
        storage = ?config.storage.backend,
        "Starting MDM certauth"
    );

    let server = match Server::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
