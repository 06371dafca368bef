//! CLI entry point (spec.md §6). Reads a config file, loads every on-disk
//! subsystem, binds the configured addresses with TLS, and serves
//! connections until `ctrl_c` or `SIGTERM`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use wired::config::WiredConfig;
use wired::server::acceptor::{self, ClientWriter};
use wired::Server;

#[derive(Parser, Debug)]
#[command(name = "wired-server", version, about = "A Wired protocol server")]
struct Cli {
    /// Path to the server's TOML configuration file.
    #[arg(short, long, default_value = "wired.toml")]
    config: PathBuf,

    /// Stay attached to the terminal instead of detaching (no-op placeholder
    /// for now; this server never daemonizes itself).
    #[arg(short, long)]
    foreground: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(error) = run(cli).await {
        tracing::error!(%error, "fatal startup error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let _ = cli.foreground;
    let config = WiredConfig::load(&cli.config)?;

    let tls_acceptor = build_tls_acceptor(&config).await?;

    let server: Arc<Server<ClientWriter>> = Arc::new(Server::load(config).await?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let run_handle = tokio::spawn(acceptor::run(server, tls_acceptor, shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("failed to listen for ctrl_c: {e}"))?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    run_handle
        .await
        .map_err(|e| anyhow::anyhow!("accept loop panicked: {e}"))??;
    Ok(())
}

/// Builds the server's `TlsAcceptor` from the configured PEM cert/key pair.
/// Grounded on the teacher's `manager::core::Manager::create_tls_acceptor`
/// (PEM parsing via `rustls_pemfile`, `ServerConfig::builder()` with no
/// client auth), adapted to Wired's flat `tls_cert`/`tls_key` config fields
/// instead of the teacher's feature-gated transport config.
async fn build_tls_acceptor(config: &WiredConfig) -> anyhow::Result<tokio_rustls::TlsAcceptor> {
    let (Some(cert_path), Some(key_path)) = (&config.tls_cert, &config.tls_key) else {
        anyhow::bail!("tls_cert and tls_key must both be set in the configuration file");
    };

    let cert_bytes = tokio::fs::read(cert_path)
        .await
        .map_err(|e| anyhow::anyhow!("reading cert file {}: {e}", cert_path.display()))?;
    let mut cert_reader = std::io::BufReader::new(&cert_bytes[..]);
    let cert_chain: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("parsing cert file {}: {e}", cert_path.display()))?
            .into_iter()
            .map(|c| c.into_owned())
            .collect();
    if cert_chain.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_path.display());
    }

    let key_bytes = tokio::fs::read(key_path)
        .await
        .map_err(|e| anyhow::anyhow!("reading key file {}: {e}", key_path.display()))?;
    let mut key_reader = std::io::BufReader::new(&key_bytes[..]);
    let pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut key_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("parsing private key {}: {e}", key_path.display()))?;
    let key: rustls::pki_types::PrivateKeyDer<'static> = if let Some(key) = pkcs8.into_iter().next() {
        rustls::pki_types::PrivateKeyDer::from(key)
    } else {
        let mut key_reader = std::io::BufReader::new(&key_bytes[..]);
        let rsa = rustls_pemfile::rsa_private_keys(&mut key_reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("parsing private key {}: {e}", key_path.display()))?;
        let key = rsa
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no private keys found in {}", key_path.display()))?;
        rustls::pki_types::PrivateKeyDer::from(key)
    };

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .map_err(|e| anyhow::anyhow!("building TLS server config: {e}"))?;

    Ok(tokio_rustls::TlsAcceptor::from(Arc::new(server_config)))
}
