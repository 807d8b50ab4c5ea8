use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use saml_sp::{AppState, config::AdapterConfig, observability, routes::build_app, saml};

const DEFAULT_CONFIG_PATH: &str = "saml-sp.toml";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// CLI arguments for the SAML Service Provider adapter
#[derive(Parser, Debug)]
#[command(version, about = "SAML 2.0 Service Provider adapter", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (defaults to ./saml-sp.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Start the adapter server (default)
    Serve,
    /// Print the SP metadata of a tenant
    Metadata {
        #[arg(short, long)]
        tenant: String,
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load and validate the configuration, including key material, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config_path = args
        .config
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match args.command {
        Some(Command::Metadata { tenant, output }) => run_metadata_export(&config_path, &tenant, output),
        Some(Command::CheckConfig) => run_check_config(&config_path),
        Some(Command::Serve) | None => run_server(&config_path).await,
    }
}

fn load_config(path: &PathBuf) -> AdapterConfig {
    match AdapterConfig::from_file(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", path.display(), e);
            std::process::exit(1);
        }
    }
}

fn run_check_config(path: &PathBuf) {
    let config = load_config(path);
    match config.trust_store() {
        Ok(store) => {
            println!(
                "Configuration OK: {} tenant(s) loaded from {}",
                store.tenant_ids().len(),
                path.display()
            );
        }
        Err(e) => {
            eprintln!("Invalid tenant configuration: {}", e);
            std::process::exit(1);
        }
    }
}

fn run_metadata_export(path: &PathBuf, tenant_id: &str, output: Option<PathBuf>) {
    let config = load_config(path);
    let Some(tenant) = config.tenant(tenant_id) else {
        eprintln!("Unknown tenant '{}'", tenant_id);
        std::process::exit(1);
    };
    let metadata = tenant
        .to_trust_config(&config.server.base_url())
        .map_err(|e| e.to_string())
        .and_then(|trust| saml::sp_metadata(&trust).map_err(|e| e.to_string()));
    let metadata = match metadata {
        Ok(xml) => xml,
        Err(e) => {
            eprintln!("Failed to build metadata for '{}': {}", tenant_id, e);
            std::process::exit(1);
        }
    };

    match output {
        Some(file) => {
            if let Err(e) = std::fs::write(&file, metadata) {
                eprintln!("Failed to write {}: {}", file.display(), e);
                std::process::exit(1);
            }
            eprintln!("SP metadata written to {}", file.display());
        }
        None => println!("{}", metadata),
    }
}

/// Run the adapter server
async fn run_server(config_path: &PathBuf) {
    let config = load_config(config_path);

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("Failed to initialize tracing: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        tracing::warn!(error = %e, "Failed to initialize metrics: {e}");
    }

    tracing::info!(
        config_file = %config_path.display(),
        tenants = config.tenants.len(),
        "Starting SAML SP adapter"
    );

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = match AppState::from_config(config) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load tenant key material");
            std::process::exit(1);
        }
    };

    let engine = Arc::clone(&state.engine);
    let sweeper = tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            let dropped = engine.sweep_expired();
            if dropped > 0 {
                tracing::debug!(dropped, "Swept expired SAML requests and assertion IDs");
            }
            if let Err(e) = engine.sessions().cleanup().await {
                tracing::warn!(error = %e, "Session cleanup failed");
            }
        }
    });

    let app = build_app(state);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, address = %bind_addr, "Failed to bind to address");
            std::process::exit(1);
        }
    };
    tracing::info!("Server listening on http://{}", bind_addr);

    // Graceful shutdown: wait for SIGINT/SIGTERM, then drain in-flight requests
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }
    sweeper.abort();
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
