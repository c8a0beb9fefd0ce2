//! SyncProxy - Main entry point
//!
//! A man-in-the-middle proxy for e-reader sync traffic

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use syncproxy::config::normalize_server_url;
use syncproxy::{
    DatabaseManager, Features, FileCertificateProvider, NoCatalog, ProxyConfig, ProxyServer, Registry, RewriteEngine,
    RewriteRules, UpstreamHosts,
};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// SyncProxy - A man-in-the-middle proxy for e-reader sync traffic
#[derive(Parser, Debug)]
#[command(name = "syncproxy")]
#[command(author = "SyncProxy Contributors")]
#[command(version = "1.0.0")]
#[command(about = "A man-in-the-middle proxy for e-reader sync traffic")]
struct Args {
    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Public base URL of the proxy, as devices reach it
    #[arg(long, env = "SERVER_URL", default_value = "http://localhost:8080/")]
    server_url: String,

    /// Database path
    #[arg(long, env = "DB_PATH", default_value = "./data/devices.db")]
    db_path: PathBuf,

    /// Directory holding device certificates (<serial>.pem)
    #[arg(long, env = "CERTS_DIR", default_value = "./certs")]
    certs_dir: PathBuf,

    /// JSON file with URL rewrite rules; defaults to redirecting the vendor hosts to SERVER_URL
    #[arg(long, env = "REWRITE_RULES")]
    rewrite_rules: Option<PathBuf>,

    /// Let devices upload logs and telemetry
    #[arg(long, env = "ALLOW_LOGS_UPLOAD", default_value = "false")]
    allow_logs_upload: bool,

    /// Let devices fetch firmware updates
    #[arg(long, env = "ALLOW_FIRMWARE_UPDATES", default_value = "false")]
    allow_firmware_updates: bool,

    /// Push updated library items to devices
    #[arg(long, env = "DOWNLOAD_UPDATED_BOOKS", default_value = "false")]
    download_updated_books: bool,

    /// Todo service upstream
    #[arg(long, env = "TODO_UPSTREAM", default_value = "https://todo-ta-g7g.amazon.com")]
    todo_upstream: String,

    /// Content delivery service upstream
    #[arg(long, env = "CDE_UPSTREAM", default_value = "https://cde-ta-g7g.amazon.com")]
    cde_upstream: String,

    /// Firs service upstream
    #[arg(long, env = "FIRS_UPSTREAM", default_value = "https://firs-ta-g7g.amazon.com")]
    firs_upstream: String,

    /// Device event service upstream
    #[arg(long, env = "DET_UPSTREAM", default_value = "https://det-ta-g7g.amazon.com")]
    det_upstream: String,

    /// Upstream request timeout in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT", default_value = "30")]
    upstream_timeout: u64,

    /// Identify devices by X-Forwarded-For (only behind a trusted reverse proxy)
    #[arg(long, env = "TRUST_FORWARDED_FOR", default_value = "false")]
    trust_forwarded_for: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting SyncProxy v1.0.0");
    info!("HTTP port: {}", args.http_port);

    let config = ProxyConfig {
        http_port: args.http_port,
        server_url: normalize_server_url(&args.server_url),
        features: Features {
            allow_logs_upload: args.allow_logs_upload,
            allow_firmware_updates: args.allow_firmware_updates,
            download_updated_books: args.download_updated_books,
        },
        upstreams: UpstreamHosts {
            todo: args.todo_upstream,
            cde: args.cde_upstream,
            firs: args.firs_upstream,
            det: args.det_upstream,
        },
        upstream_timeout: Duration::from_secs(args.upstream_timeout),
        trust_forwarded_for: args.trust_forwarded_for,
    };
    info!("Server URL: {}", config.server_url);

    // Initialize database manager
    let db_manager = Arc::new(DatabaseManager::new(&args.db_path)?);
    info!("Database initialized at: {}", args.db_path.display());

    // Initialize certificate provider
    let certificates = Arc::new(
        FileCertificateProvider::new(&args.certs_dir)
            .with_context(|| format!("Failed to open certificates directory {}", args.certs_dir.display()))?,
    );
    info!("Certificate provider initialized at: {}", args.certs_dir.display());

    let registry = Arc::new(Registry::load(db_manager, certificates)?);
    info!("Loaded {} device(s)", registry.len());

    let rules = match &args.rewrite_rules {
        Some(path) => RewriteRules::from_json_file(path)
            .with_context(|| format!("Failed to load rewrite rules from {}", path.display()))?,
        None => RewriteRules::for_server(&config.server_url),
    };
    info!("Loaded {} rewrite rule(s)", rules.len());

    let engine = Arc::new(RewriteEngine::new(&config, rules, Arc::new(NoCatalog)));

    // Create and run proxy server
    let server = Arc::new(ProxyServer::new(config, registry.clone(), engine));

    info!("SyncProxy started successfully");

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    if let Err(e) = registry.save_all() {
        error!("Failed to save devices: {:#}", e);
    }

    Ok(())
}
