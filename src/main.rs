use std::{net::SocketAddr, path::Path, sync::Arc};

use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use portcullis::{
    adapters::{
        BasicRuleEvaluator, FileConfigProvider, GatewayHandler, HardenedTransport,
        LiteralHeaderBuilder,
    },
    config::{ConfigValidator, GatewayConfig, load_config},
    core::{RELOAD_DEBOUNCE, RoutingManager, spawn_reload_worker},
    ports::config_provider::ConfigProvider,
    tracing_setup,
};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "gateway.yaml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "gateway.yaml")]
        config: String,
    },
    /// Write a starter configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "gateway.yaml")]
        config: String,
    },
    /// Start the gateway server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "gateway.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    tracing::info!("Loading initial configuration from {config_path}");

    let provider: Arc<dyn ConfigProvider> = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );
    let config: GatewayConfig = provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    ConfigValidator::validate(&config).context("Initial configuration is invalid")?;

    let components = HardenedTransport::components(&config.transport)
        .context("Failed to create upstream transport")?;
    let manager = Arc::new(RoutingManager::new(components));
    manager.set_proxies(config.proxies.clone());

    let _reload_handle = spawn_reload_worker(provider, Arc::clone(&manager), RELOAD_DEBOUNCE)
        .context("Failed to start config watcher")?;

    let handler = GatewayHandler::new(
        Arc::clone(&manager),
        Arc::new(BasicRuleEvaluator::new()),
        Arc::new(LiteralHeaderBuilder::new()),
    );
    let app = handler
        .router(&config.metrics_path)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!(
        "Gateway listening on {} ({} active route(s), metrics at {})",
        addr,
        manager.table().len(),
        config.metrics_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("Server error")?;

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Shutdown signal received: Ctrl-C"),
        _ = terminate => tracing::info!("Shutdown signal received: SIGTERM"),
    }
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e:?}");
            std::process::exit(1);
        }
    };

    match ConfigValidator::validate(&config) {
        Ok(()) => {
            let active = config.proxies.iter().filter(|p| p.active).count();
            let capped = config
                .proxies
                .iter()
                .filter(|p| p.max_concurrent > 0)
                .count();
            let breakers = config
                .proxies
                .iter()
                .filter(|p| p.circuit_breaker.is_some_and(|cb| cb.enabled))
                .count();

            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Listen Address: {}", config.listen_addr);
            println!("   • Metrics Path: {}", config.metrics_path);
            println!("   • Proxies: {} ({} active)", config.proxies.len(), active);
            println!("   • Concurrency-capped: {capped}");
            println!("   • Circuit breakers: {breakers}");
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Ensure upstream URLs start with http:// or https://");
            println!("   • Keep proxy paths out of /api/ and /_/");
            println!("   • Use timeouts between 1 and 300 seconds");
            println!("   • Verify listen address format (e.g., '127.0.0.1:8090')");
            std::process::exit(1);
        }
    }
}

/// Write a starter configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Portcullis gateway configuration

listen_addr: "127.0.0.1:8090"
metrics_path: "/api/gateway/metrics"

transport:
  dial_timeout: 2
  response_header_timeout: 30
  idle_conn_timeout: 90
  max_idle_conns: 1000          # upper bound for max_idle_conns_per_host
  max_idle_conns_per_host: 100

proxies:
  # Hosted API, prefix stripped: /-/openai/v1/models -> https://api.openai.com/v1/models
  - id: "openai"
    path: "/-/openai"
    upstream: "https://api.openai.com"
    headers:
      Authorization: "Bearer sk-replace-me"
    timeout: 120
    circuit_breaker:
      enabled: true
      failure_threshold: 5
      recovery_timeout: 30

  # Local sidecar, streaming responses: no first-byte timeout, capped concurrency
  - id: "ollama"
    path: "/-/ollama"
    upstream: "http://127.0.0.1:11434"
    max_concurrent: 4
    timeout_config:
      dial: 2
      response_header: 0
      idle: 90
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'portcullis serve --config {config_path}' to start the server");
    Ok(())
}
