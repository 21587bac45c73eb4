//! FacilityWatch CLI
//!
//! Command-line interface for the FacilityWatch alerting engine.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use uuid::Uuid;

use facilitywatch::alerting::{
    AlertLifecycleManager, AlertRepository, BroadcastSink, EvaluationScheduler, FanoutSink,
    RedisSink, WebhookSink,
};
use facilitywatch::api::{AppState, HttpServer};
use facilitywatch::config::LoggingConfig;
use facilitywatch::db::{Database, PgReadingStore, PgSensorDirectory, RedisStreamer};
use facilitywatch::models::AlertRuleInput;
use facilitywatch::Config;

/// FacilityWatch - Alert rule evaluation for facilities
#[derive(Parser)]
#[command(name = "facilitywatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "FACILITYWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the API server and the evaluation scheduler
    Serve {
        /// HTTP API port
        #[arg(long, env = "FACILITYWATCH_HTTP_PORT")]
        http_port: Option<u16>,
    },

    /// Run one evaluation cycle for a tenant
    Evaluate {
        /// Tenant to evaluate
        #[arg(long)]
        tenant: Uuid,

        /// Evaluation instant (RFC 3339), defaults to now
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Work with alert rule definitions
    Rules {
        #[command(subcommand)]
        command: RulesCommands,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },

    /// Show system health status
    Health,
}

#[derive(Subcommand)]
enum RulesCommands {
    /// Validate rule definitions from a JSON file (one rule or an array)
    Validate {
        /// JSON file with rule definitions
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging; the guard flushes file output on exit
    let _log_guard = init_logging(&config.logging, cli.verbose);

    // Execute command
    let result = match cli.command {
        Commands::Serve { http_port } => run_serve(config, http_port).await,
        Commands::Evaluate { tenant, at } => run_evaluate(config, tenant, at, cli.format).await,
        Commands::Rules { command } => run_rules(command, cli.format),
        Commands::Db { command } => run_db(config, command).await,
        Commands::Health => run_health(config, cli.format).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(logging: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let (writer, guard) = match &logging.directory {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "facilitywatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stdout), None),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);

    match logging.format.as_str() {
        "json" => builder.json().init(),
        "pretty" => builder.pretty().init(),
        _ => builder.init(),
    }

    guard
}

fn install_metrics(config: &Config) -> anyhow::Result<()> {
    if !config.metrics.enabled {
        return Ok(());
    }

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics.port))
        .install()
        .context("failed to install Prometheus exporter")?;

    info!(port = config.metrics.port, "Prometheus exporter listening");
    Ok(())
}

/// Wire the engine to Postgres, Redis and the configured sinks
fn build_engine(
    config: &Config,
    db: &Database,
) -> anyhow::Result<(Arc<AlertLifecycleManager>, Arc<BroadcastSink>)> {
    let broadcast = Arc::new(BroadcastSink::new(config.notifications.broadcast_capacity));

    let mut sink = FanoutSink::new().with(broadcast.clone());
    if config.notifications.redis_enabled {
        sink = sink.with(Arc::new(RedisSink::new(RedisStreamer::new(&db.redis))));
    }
    if let Some(url) = &config.notifications.webhook_url {
        sink = sink.with(Arc::new(WebhookSink::new(
            url.clone(),
            config.notifications.webhook_timeout,
        )?));
    }

    let repository = Arc::new(AlertRepository::new(db.postgres.pool().clone()));
    let manager = AlertLifecycleManager::new(
        repository.clone(),
        Arc::new(PgReadingStore::new(&db.postgres)),
        Arc::new(PgSensorDirectory::new(&db.postgres)),
        repository,
        Arc::new(sink),
        config.alerting.clone(),
    );

    Ok((Arc::new(manager), broadcast))
}

async fn run_serve(mut config: Config, http_port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = http_port {
        config.server.http_port = port;
    }

    install_metrics(&config)?;

    let db = Database::new(&config).await.context("failed to connect to storage")?;
    db.migrate().await?;

    let (manager, broadcast) = build_engine(&config, &db)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = config.alerting.enabled.then(|| {
        tokio::spawn(EvaluationScheduler::new(manager.clone()).run(shutdown_rx.clone()))
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
        }
        let _ = shutdown_tx.send(true);
    });

    let mut server_shutdown = shutdown_rx;
    let signal = async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    };

    let addr = format!("{}:{}", config.server.host, config.server.http_port);
    info!(
        addr = %addr,
        check_interval = %humantime::format_duration(config.alerting.check_interval),
        auto_clear = config.alerting.auto_clear.enabled,
        "Starting FacilityWatch"
    );

    HttpServer::new(AppState {
        manager: manager.clone(),
        broadcast,
    })
    .serve(&addr, signal)
    .await?;

    if let Some(handle) = scheduler {
        handle.await?;
    }
    manager.flush_notifications().await;

    Ok(())
}

async fn run_evaluate(
    config: Config,
    tenant: Uuid,
    at: Option<DateTime<Utc>>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let db = Database::new(&config).await.context("failed to connect to storage")?;
    let (manager, _) = build_engine(&config, &db)?;

    let now = at.unwrap_or_else(Utc::now);
    let report = manager.run_evaluation_cycle_at(tenant, now).await?;
    manager.flush_notifications().await;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => {
            println!("Evaluation of tenant {tenant} at {now}");
            println!("  rules evaluated:      {}", report.rules_evaluated);
            println!("  pairs evaluated:      {}", report.pairs_evaluated);
            println!("  alerts created:       {}", report.alerts_created);
            println!("  alerts refreshed:     {}", report.alerts_refreshed);
            println!("  alerts auto-resolved: {}", report.alerts_auto_resolved);
            println!("  transient failures:   {}", report.transient_failures);
            println!("  write failures:       {}", report.write_failures);
        }
    }

    Ok(())
}

fn run_rules(command: RulesCommands, format: OutputFormat) -> anyhow::Result<()> {
    match command {
        RulesCommands::Validate { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let value: serde_json::Value = serde_json::from_str(&raw)?;
            let inputs: Vec<AlertRuleInput> = match value {
                serde_json::Value::Array(_) => serde_json::from_value(value)?,
                other => vec![serde_json::from_value(other)?],
            };

            let mut invalid = 0;
            let mut results = Vec::with_capacity(inputs.len());
            for (idx, input) in inputs.into_iter().enumerate() {
                match input.into_rule(Uuid::nil()) {
                    Ok(rule) => results.push(serde_json::json!({
                        "index": idx,
                        "valid": true,
                        "rule": rule.display_name(),
                    })),
                    Err(e) => {
                        invalid += 1;
                        results.push(serde_json::json!({
                            "index": idx,
                            "valid": false,
                            "error": e.to_string(),
                        }));
                    }
                }
            }

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&results)?),
                OutputFormat::Text => {
                    for result in &results {
                        match result["valid"].as_bool() {
                            Some(true) => println!("#{} ok: {}", result["index"], result["rule"]),
                            _ => println!("#{} invalid: {}", result["index"], result["error"]),
                        }
                    }
                }
            }

            if invalid > 0 {
                anyhow::bail!("{invalid} invalid rule definition(s)");
            }
        }
    }
    Ok(())
}

async fn run_db(config: Config, command: DbCommands) -> anyhow::Result<()> {
    match command {
        DbCommands::Migrate => {
            let db = Database::new(&config).await?;
            db.migrate().await?;
            println!("Migrations applied");
        }
    }
    Ok(())
}

async fn run_health(config: Config, format: OutputFormat) -> anyhow::Result<()> {
    let db = Database::new(&config).await;
    let postgres = match &db {
        Ok(db) => db.postgres.health_check().await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };
    let redis = match &db {
        Ok(db) => db.redis.health_check().await.map_err(|e| e.to_string()),
        Err(e) => Err(e.to_string()),
    };

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "postgres": postgres.as_ref().err(),
                "redis": redis.as_ref().err(),
                "healthy": postgres.is_ok() && redis.is_ok(),
            })
        ),
        OutputFormat::Text => {
            println!("System Health Check");
            for (name, status) in [("Database", &postgres), ("Redis", &redis)] {
                match status {
                    Ok(()) => println!("{name:<9} connected"),
                    Err(e) => println!("{name:<9} unavailable: {e}"),
                }
            }
        }
    }

    if postgres.is_err() || redis.is_err() {
        anyhow::bail!("one or more dependencies are unhealthy");
    }
    Ok(())
}
