use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::middleware;
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use portico::{
    AdminSync, FileSeedProvider, GracefulShutdown, HttpClientAdapter, HttpHandler,
    HttpSeedProvider, MemoryDocumentStore, MemoryKvStore, Pipeline,
    adapters::{request_id_middleware, request_timing_middleware},
    config::{ServerConfig, ServerConfigValidator, load_config, load_seed_file},
    ports::{http_client::HttpClient, seed_provider::SeedProvider},
    tracing_setup,
};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Check a configuration file and the seed documents it points to
    Validate {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Write a starter configuration and seed file
    Init {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Run the gateway
    Serve {
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn create_seed_provider(config: &ServerConfig) -> Result<Option<Arc<dyn SeedProvider>>> {
    let Some(seed) = &config.store.seed else {
        return Ok(None);
    };
    let provider: Arc<dyn SeedProvider> = if config.store.is_remote() {
        tracing::info!("Polling seed documents from {seed}");
        Arc::new(HttpSeedProvider::new(
            seed.clone(),
            config.store.poll_interval(),
        ))
    } else {
        tracing::info!("Watching seed file {seed}");
        Arc::new(FileSeedProvider::new(seed)?)
    };
    Ok(Some(provider))
}

/// Load, validate and publish the current seed documents.
async fn publish_seed(provider: &dyn SeedProvider, admin: &AdminSync) -> Result<()> {
    let seed = provider.load_seed().await?;
    ServerConfigValidator::validate_seed(&seed).map_err(|e| eyre!("Invalid seed: {e}"))?;
    let report = admin
        .apply(seed)
        .await
        .map_err(|e| eyre!("Failed to store seed documents: {e}"))?;
    tracing::info!(
        gateways = report.gateways,
        routes = report.routes,
        "Seed documents published"
    );
    Ok(())
}

fn spawn_seed_watcher(provider: Arc<dyn SeedProvider>, admin: Arc<AdminSync>) -> JoinHandle<()> {
    let debounce_duration = Duration::from_secs(2);
    let mut notify_rx = provider.watch();

    tokio::spawn(async move {
        tracing::info!("Seed watcher task started.");
        while notify_rx.recv().await.is_some() {
            // Editors often write a file in several steps.
            tokio::time::sleep(debounce_duration).await;
            while notify_rx.try_recv().is_ok() {}

            tracing::info!("Reloading seed documents");
            if let Err(e) = publish_seed(provider.as_ref(), &admin).await {
                tracing::error!("Failed to reload seed documents: {}. Keeping current documents.", e);
            }
        }
        tracing::info!("Seed watcher task is shutting down.");
    })
}

fn spawn_log_purger(store: Arc<MemoryDocumentStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            store.purge_expired_logs(chrono::Utc::now()).await;
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let config_path = match args.command {
        Some(Commands::Validate { config }) => return validate_config_command(&config).await,
        Some(Commands::Init { config }) => return init_config_command(&config).await,
        Some(Commands::Serve { config }) => config,
        None => args.config,
    };

    let config = load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    ServerConfigValidator::validate(&config).map_err(|e| eyre!("Invalid configuration: {e}"))?;

    tracing_setup::init_tracing(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            A provider was probably installed already.",
            e
        );
    }

    let tracker = TaskTracker::new();
    let store = Arc::new(MemoryDocumentStore::new());
    let kv = Arc::new(MemoryKvStore::new());
    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);

    let pipeline = Arc::new(Pipeline::new(
        &config,
        store.clone(),
        kv.clone(),
        http_client,
        tracker.clone(),
    ));
    let admin = Arc::new(AdminSync::new(
        store.clone(),
        Arc::clone(pipeline.loader()),
        pipeline.cache().clone(),
    ));

    let mut background: Vec<JoinHandle<()>> = Vec::new();
    match create_seed_provider(&config).context("Failed to create seed provider")? {
        Some(seed_provider) => {
            publish_seed(seed_provider.as_ref(), &admin)
                .await
                .context("Failed to load initial seed documents")?;
            background.push(spawn_seed_watcher(seed_provider, admin.clone()));
        }
        None => tracing::warn!("No seed configured; every tenant will answer 404"),
    }

    background.push(kv.spawn_sweeper(config.kv_sweep_interval()));
    background.push(spawn_log_purger(store.clone(), config.kv_sweep_interval()));

    let graceful_shutdown = Arc::new(GracefulShutdown::with_timeout(config.shutdown_timeout()));
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        signal_handler_shutdown.run_signal_handler().await;
    });

    let app = HttpHandler::new(pipeline.clone(), &config)
        .router()
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn(request_timing_middleware))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    tracing::info!(
        "Starting Portico gateway on {} ({:?})",
        addr,
        config.environment
    );

    let shutdown_signal = graceful_shutdown.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let reason = shutdown_signal.wait_for_shutdown_signal().await;
        tracing::info!("Shutdown signal received: {:?}", reason);
    })
    .await
    .context("Server error")?;

    for handle in background {
        handle.abort();
    }
    graceful_shutdown.drain(&tracker).await;

    tracing::info!("Graceful shutdown completed");
    Ok(())
}

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
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = ServerConfigValidator::validate(&config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        println!();
        println!("💡 Common fixes:");
        println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
        println!("   • Durations use humantime units (e.g., '30s', '1h', '30d')");
        println!("   • A remote seed URL must start with http:// or https://");
        std::process::exit(1);
    }
    println!("✅ Configuration validation: OK");

    let mut seed_summary = None;
    if let Some(seed_path) = config.store.seed.as_deref().filter(|_| !config.store.is_remote()) {
        let seed = match load_seed_file(Path::new(seed_path)) {
            Ok(seed) => seed,
            Err(e) => {
                eprintln!("❌ Seed parsing failed:");
                eprintln!("   {e:#}");
                std::process::exit(1);
            }
        };
        if let Err(e) = ServerConfigValidator::validate_seed(&seed) {
            eprintln!("❌ Seed validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
        println!("✅ Seed validation: OK");
        seed_summary = Some((seed.gateways.len(), seed.routes.len()));
    }

    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    println!("   • Environment: {:?}", config.environment);
    println!("   • Upstream Timeout: {:?}", config.upstream_timeout());
    println!(
        "   • Execution Logs: {} (retention {:?})",
        config.execution_log.enabled,
        config.execution_log.retention()
    );
    match (config.store.seed.as_deref(), seed_summary) {
        (Some(seed), Some((gateways, routes))) => {
            println!("   • Seed: {seed} ({gateways} gateways, {routes} routes)")
        }
        (Some(seed), None) => println!("   • Seed: {seed} (remote)"),
        (None, _) => println!("   • Seed: none"),
    }
    println!();
    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}

async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }
    let seed_path = path.with_file_name("gateways.toml");

    let default_config = format!(
        r#"# Portico Gateway Configuration

# The address to listen on
listen_addr = "127.0.0.1:8080"

# "development" enables the ?_gateway=<subdomain> override
environment = "development"

upstream_timeout = "30s"
config_cache_ttl = "1h"

[logging]
level = "info"
json = false

[execution_log]
enabled = true
retention = "30d"
max_body_bytes = 10240

[store]
# Local file (watched) or http(s) URL (polled)
seed = "{}"
"#,
        seed_path.display()
    );

    let default_seed = r#"# Gateways and routes served by Portico

[[gateways]]
id = "gw-demo"
subdomain = "demo"
base_url = "https://jsonplaceholder.typicode.com"

[gateways.variables.source]
value = "portico"

[[routes]]
id = "rt-posts"
gateway_id = "gw-demo"
name = "posts"
path = "/posts/:id"
methods = ["GET"]
priority = 10

[routes.validation.id]
kind = "integer"

[routes.cache]
ttl_secs = 300

[[routes.mutations.post]]
type = "header"
action = "set"
key = "x-served-by"
value = "${variables.source}"
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    if !seed_path.exists() {
        tokio::fs::write(&seed_path, default_seed)
            .await
            .context("Failed to write seed file")?;
        println!("✅ Created sample seed at: {}", seed_path.display());
    }
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'portico serve --config {config_path}' to start the server");
    Ok(())
}
