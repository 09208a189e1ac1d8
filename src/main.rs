use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use authgate::app::{self, AppState};
use authgate::config::{self, Config, LogFormat};
use authgate::jobs;
use authgate::models::target::AuthScheme;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load()?;
    init_tracing(cfg.log_format)?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Cache { command }) => handle_cache_command(cfg, command).await,
        Some(cli::Commands::Targets { command }) => handle_targets_command(cfg, command).await,
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "authgate"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "authgate=debug,tower_http=debug".into()),
    );
    let (pretty, json) = match format {
        LogFormat::Pretty => (Some(tracing_subscriber::fmt::layer()), None),
        LogFormat::Json => (None, Some(tracing_subscriber::fmt::layer().json())),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .with(telemetry_layer)
        .try_init()?;
    Ok(())
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    if cfg.targets.is_empty() {
        tracing::warn!("no backend targets configured; only /healthz and the admin API are useful");
    }
    let sweep_interval = cfg.sweep_interval;
    let state = Arc::new(AppState::build(cfg).await?);

    jobs::cleanup::spawn(state.engine.cache().clone(), sweep_interval);
    tracing::info!(interval_secs = sweep_interval.as_secs(), "background cache sweep started");

    let app = app::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("authgate listening on {}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    opentelemetry::global::shutdown_tracer_provider();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn handle_cache_command(cfg: Config, cmd: cli::CacheCommands) -> anyhow::Result<()> {
    let state = AppState::build(cfg).await?;
    let cache = state.engine.cache();
    match cmd {
        cli::CacheCommands::Sweep => {
            let removed = cache.sweep().await?;
            println!("Removed {} expired entries ({} backend).", removed, cache.backend());
        }
        cli::CacheCommands::Stats => {
            let stats = cache.stats().await?;
            println!("Backend:          {}", cache.backend());
            println!("Total entries:    {}", stats.total_entries);
            println!("Active entries:   {}", stats.active_entries);
            println!("Total hits:       {}", stats.total_hits);
            println!("Avg hits/entry:   {:.2}", stats.average_hits_per_entry);
        }
    }
    Ok(())
}

async fn handle_targets_command(cfg: Config, cmd: cli::TargetCommands) -> anyhow::Result<()> {
    match cmd {
        cli::TargetCommands::List => {
            if cfg.targets.is_empty() {
                println!("No targets configured.");
                return Ok(());
            }
            println!("{:<16} {:<40} {:<16} {:<8}", "NAME", "URL", "AUTH", "CACHE");
            for t in &cfg.targets {
                let auth = match t.auth {
                    AuthScheme::None => "none",
                    AuthScheme::PasswordGrant { .. } => "password",
                };
                let cache = t
                    .cache_ttl
                    .map(|d| format!("{}s", d.as_secs()))
                    .unwrap_or_else(|| "-".to_string());
                println!("{:<16} {:<40} {:<16} {:<8}", t.name, t.url_for(""), auth, cache);
            }
        }
        cli::TargetCommands::Probe { name } => {
            let state = AppState::build(cfg).await?;
            let report = state.engine.probe(&name).await?;
            println!(
                "{}: HTTP {} in {} ms (authenticated: {})",
                report.target, report.status, report.latency_ms, report.authenticated
            );
        }
    }
    Ok(())
}
