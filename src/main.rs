//! Tessera worker: runs one long-running maintenance job until SIGINT,
//! SIGTERM or a fatal setup error.
//!
//! Exit codes: 0 on clean shutdown, 1 on bad arguments, 2 on an unknown
//! job, -1 on an unexpected fatal error.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tessera::config::Config;
use tessera::jobs::binaries_cleanup::{BinariesCleanupJob, CleanupOptions};
use tessera::jobs::event_production::{EventProductionJob, ProductionMode, ProductionOptions};
use tessera::jobs::lock_cleanup::LockCleanupJob;
use tessera::kafka::{KafkaEventConsumer, KafkaEventProducer};
use tessera::lock::InMemoryLockStore;
use tessera::s3_store::S3ObjectStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_BAD_ARGUMENTS: i32 = 1;
const EXIT_UNKNOWN_JOB: i32 = 2;
const EXIT_FATAL: i32 = -1;

#[derive(Parser)]
#[command(name = "tessera-worker", about = "Tessera maintenance worker", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a garbage collection job (`locks` or `binaries`)
    Collect(CollectArgs),
    /// Run an event production job (`events`)
    Produce(ProduceArgs),
}

#[derive(Args)]
struct CollectArgs {
    /// What to collect: locks | binaries
    target: String,

    /// Lookback window for the reference horizon, e.g. 24h
    #[arg(long, default_value = "24h", value_parser = parse_duration)]
    range: Duration,

    /// Sleep between passes, e.g. 30s
    #[arg(long, default_value = "30s", value_parser = parse_duration)]
    delay: Duration,
}

#[derive(Args)]
struct ProduceArgs {
    /// What to produce: events
    target: String,

    /// Derivation mode: versions | binaries
    #[arg(long)]
    mode: String,
}

/// Resolved job selection.
enum Job {
    CollectLocks,
    CollectBinaries { range: Duration, delay: Duration },
    ProduceEvents(ProductionMode),
}

fn resolve_job(command: &Command) -> Result<Job, String> {
    match command {
        Command::Collect(args) => match args.target.as_str() {
            "locks" => Ok(Job::CollectLocks),
            "binaries" => Ok(Job::CollectBinaries {
                range: args.range,
                delay: args.delay,
            }),
            other => Err(format!("unknown collect job '{other}'")),
        },
        Command::Produce(args) => {
            if args.target != "events" {
                return Err(format!("unknown produce job '{}'", args.target));
            }
            match args.mode.as_str() {
                "versions" => Ok(Job::ProduceEvents(ProductionMode::Versions)),
                "binaries" => Ok(Job::ProduceEvents(ProductionMode::Binaries)),
                other => Err(format!("unknown production mode '{other}'")),
            }
        }
    }
}

/// Parse durations like `30s`, `15m`, `24h`, `7d` or plain seconds.
fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let unit_len = value
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphabetic())
        .count();
    if value.len() == unit_len {
        return Err(format!("invalid duration '{value}'"));
    }
    let (digits, unit) = value.split_at(value.len() - unit_len);
    let number: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{value}'"))?;
    let seconds = match unit {
        "" | "s" => number,
        "m" => number * 60,
        "h" => number * 3600,
        "d" => number * 86400,
        other => return Err(format!("unknown duration unit '{other}'")),
    };
    Ok(Duration::from_secs(seconds))
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => EXIT_BAD_ARGUMENTS,
            };
            let _ = e.print();
            return code;
        }
    };

    let job = match resolve_job(&cli.command) {
        Ok(job) => job,
        Err(message) => {
            eprintln!("{message}");
            return EXIT_UNKNOWN_JOB;
        }
    };

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            return EXIT_FATAL;
        }
    };

    init_tracing(&config.service.log_level);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return EXIT_FATAL;
        }
    };

    match runtime.block_on(run_job(job, config)) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "worker failed");
            EXIT_FATAL
        }
    }
}

async fn run_job(job: Job, config: Config) -> Result<()> {
    init_metrics(config.service.metrics_port)?;

    info!(service = %config.service.name, "starting tessera worker");

    let token = CancellationToken::new();
    let handle = match job {
        Job::CollectLocks => {
            // Sweeps the process-local lock store; only meaningful in
            // deployments embedding the in-memory lock implementation.
            let store = Arc::new(InMemoryLockStore::new());
            let job = LockCleanupJob::new(store, config.lock_sweep_interval());
            let token = token.clone();
            tokio::spawn(async move { job.run(token).await })
        }
        Job::CollectBinaries { range, delay } => {
            let sessions = KafkaEventConsumer::subscribed(
                &config.kafka,
                &config.kafka.topics.session_events,
                &config.cleanup.consumer_group,
            )?;
            let references = KafkaEventConsumer::assigned(
                &config.kafka,
                &config.kafka.topics.binaries_references,
                &config.cleanup.references_group,
            )?;
            let binaries = S3ObjectStore::new(&config.s3, config.s3.binaries_bucket.clone())
                .await
                .context("failed to initialize binaries store")?;
            let options = CleanupOptions {
                range: chrono::Duration::from_std(range)
                    .context("range out of bounds")?,
                delay,
                poll_timeout: config.cleanup_poll_timeout(),
                error_backoff: config.cleanup_error_backoff(),
                batch_size: config.cleanup.batch_size,
            };
            let job = BinariesCleanupJob::new(
                Arc::new(sessions),
                Arc::new(references),
                Arc::new(binaries),
                options,
            );
            let token = token.clone();
            tokio::spawn(async move { job.run(token).await })
        }
        Job::ProduceEvents(mode) => {
            let (group, output_topic) = match mode {
                ProductionMode::Versions => (
                    &config.production.versions_group,
                    &config.kafka.topics.object_versions,
                ),
                ProductionMode::Binaries => (
                    &config.production.binaries_group,
                    &config.kafka.topics.binaries_references,
                ),
            };
            let consumer = KafkaEventConsumer::subscribed(
                &config.kafka,
                &config.kafka.topics.object_events,
                group,
            )?;
            let producer = KafkaEventProducer::new(&config.kafka)?;
            let store = S3ObjectStore::new(&config.s3, config.s3.objects_bucket.clone())
                .await
                .context("failed to initialize objects store")?;
            let options = ProductionOptions {
                poll_timeout: config.production_poll_timeout(),
                retry_delay: config.production_retry_delay(),
            };
            let job = EventProductionJob::new(
                mode,
                Arc::new(consumer),
                Arc::new(producer),
                Arc::new(store),
                output_topic,
                options,
            );
            let token = token.clone();
            tokio::spawn(async move { job.run(token).await })
        }
    };

    shutdown_signal().await;
    info!("shutdown signal received");
    token.cancel();
    handle.await.context("job task panicked")?;

    info!("tessera worker stopped");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("failed to install Prometheus metrics exporter")?;

    info!(port, "Prometheus metrics exporter started");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C signal");
        }
        _ = terminate => {
            info!("received SIGTERM signal");
        }
    }
}
