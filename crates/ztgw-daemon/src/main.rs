//! Zero-trust gateway daemon.
//!
//! Bootstraps the certificate authority and data store, then serves the
//! DNS-over-TLS resolver, mTLS transport proxy, and administrative API as
//! three concurrent tasks. Also carries a handful of read-only inspection
//! subcommands that hit the same on-disk store/CA directly, since this
//! binary is the gateway -- there is no separate admin client to ask.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use ztgw_api::{AppState, ApiConfig, GatewayAddressing};
use ztgw_ca::CertificateAuthority;
use ztgw_core::config::{GatewayConfig, GatewayConfigLoader};
use ztgw_proxy::{ProxyConfig, ProxyServer};
use ztgw_resolver::{ResolverConfig, ResolverServer};
use ztgw_store::DataStore;

#[derive(Parser)]
#[command(name = "ztgw")]
#[command(author = "Zero Trust Gateway")]
#[command(version)]
#[command(about = "Zero-trust DNS and transport gateway", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "ZTGW_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the resolver, proxy, and admin API until stopped
    Serve,

    /// Inspect the data store
    #[command(subcommand)]
    List(ListCommands),

    /// Inspect the certificate authority
    #[command(subcommand)]
    Ca(CaCommands),
}

#[derive(Subcommand)]
enum ListCommands {
    /// List registered endpoints
    Endpoints,
    /// List private zones
    Zones,
    /// List service routes
    Routes,
}

#[derive(Subcommand)]
enum CaCommands {
    /// Print the CA certificate's subject, validity, and fingerprint
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = GatewayConfigLoader::new()
        .with_cli_path(cli.config.clone())
        .load()?;

    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.gateway.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::List(ListCommands::Endpoints) => list_endpoints(config).await,
        Commands::List(ListCommands::Zones) => list_zones(config).await,
        Commands::List(ListCommands::Routes) => list_routes(config).await,
        Commands::Ca(CaCommands::Show) => ca_show(config).await,
    }
}

/// Bootstraps CA and store, then runs resolver/proxy/API concurrently.
/// Any one task failing tears down the whole daemon, mirroring the
/// teacher's habit of letting a capture-pipeline task failure propagate out
/// of its `tokio::main` rather than limping along half-started.
async fn serve(config: GatewayConfig) -> anyhow::Result<()> {
    let certs_dir = config.certs_dir();
    let ca = Arc::new(CertificateAuthority::bootstrap(&certs_dir)?);
    ca.ensure_server_cert(config.gateway.external_addr)?;

    let store = Arc::new(DataStore::load(config.data_files_dir()).await?);

    let resolver = Arc::new(ResolverServer::new(
        store.clone(),
        ca.clone(),
        ResolverConfig {
            listen_addr: config.resolver.listen_addr.clone(),
            certs_dir: certs_dir.clone(),
            upstream: config.resolver.upstream.parse()?,
            upstream_timeout: Duration::from_secs(config.resolver.upstream_timeout_secs),
            handshake_timeout: Duration::from_secs(config.resolver.handshake_timeout_secs),
            read_timeout: Duration::from_secs(config.resolver.read_timeout_secs),
        },
    ));

    let proxy = Arc::new(ProxyServer::new(
        store.clone(),
        ca.clone(),
        ProxyConfig {
            listen_addr: config.proxy.listen_addr.clone(),
            certs_dir: certs_dir.clone(),
            peek_len: config.proxy.peek_bytes,
            handshake_timeout: Duration::from_secs(config.proxy.handshake_timeout_secs),
            peek_timeout: Duration::from_secs(config.proxy.peek_timeout_secs),
            dial_timeout: Duration::from_secs(config.proxy.dial_timeout_secs),
        },
    ));

    let addressing = GatewayAddressing {
        server_addr: format!("{}:{}", config.gateway.external_addr, resolver_port(&config.resolver.listen_addr)),
        proxy_addr: format!("{}:{}", config.gateway.external_addr, proxy_port(&config.proxy.listen_addr)),
        server_name: config.gateway.external_addr.to_string(),
        token_ttl: Duration::from_secs(365 * 24 * 3600),
    };
    let api_state = Arc::new(AppState { store: store.clone(), ca: ca.clone(), addressing });

    info!(
        resolver = %config.resolver.listen_addr,
        proxy = %config.proxy.listen_addr,
        api = %format!("{}:{}", config.api.host, config.api.port),
        "zero-trust gateway starting"
    );

    tokio::try_join!(
        async { resolver.run().await.map_err(anyhow::Error::from) },
        async { proxy.run().await.map_err(anyhow::Error::from) },
        ztgw_api::serve(ApiConfig { host: config.api.host.clone(), port: config.api.port }, api_state),
    )?;

    Ok(())
}

fn resolver_port(listen_addr: &str) -> u16 {
    listen_addr.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(853)
}

fn proxy_port(listen_addr: &str) -> u16 {
    listen_addr.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(8443)
}

async fn list_endpoints(config: GatewayConfig) -> anyhow::Result<()> {
    let store = DataStore::load(config.data_files_dir()).await?;
    for endpoint in store.list_endpoints().await {
        println!(
            "{:<16} {:<8} {:<20} {}",
            endpoint.cn,
            format!("{:?}", endpoint.role),
            endpoint.name,
            endpoint.domains.join(",")
        );
    }
    Ok(())
}

async fn list_zones(config: GatewayConfig) -> anyhow::Result<()> {
    let store = DataStore::load(config.data_files_dir()).await?;
    for zone in store.list_zones().await {
        println!(
            "{:<32} service={:<16} access={}",
            zone.name,
            zone.service_cn.as_deref().unwrap_or("-"),
            zone.access_list.len()
        );
    }
    Ok(())
}

async fn list_routes(config: GatewayConfig) -> anyhow::Result<()> {
    let store = DataStore::load(config.data_files_dir()).await?;
    for route in store.list_routes().await {
        println!("{:<16} -> {}:{} ({})", route.service_cn, route.host, route.port, route.name);
    }
    Ok(())
}

async fn ca_show(config: GatewayConfig) -> anyhow::Result<()> {
    use sha2::{Digest, Sha256};
    use x509_parser::certificate::X509Certificate;

    let ca = CertificateAuthority::bootstrap(&config.certs_dir())?;
    let der = ca.ca_cert_der();

    let fingerprint = Sha256::digest(der).iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":");
    let (_, cert) = X509Certificate::from_der(der).map_err(|err| anyhow::anyhow!("failed to parse CA certificate: {err}"))?;

    println!("subject:     {}", cert.subject());
    println!("fingerprint: sha256:{fingerprint}");
    println!("not before:  {}", cert.validity().not_before);
    println!("not after:   {}", cert.validity().not_after);
    Ok(())
}
