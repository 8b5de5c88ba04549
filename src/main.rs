use clap::Parser;
use order_router::kafka::{KafkaSink, KafkaSource, TopicManager};
use order_router::{Config, Error, Result, Router, RouterStats};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "order-router")]
#[command(about = "Routes orders to regional Kafka topics", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file (defaults plus ORDER_ROUTER__* variables when omitted)"
    )]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Interrupt,
    Terminate,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::from_file(path),
        None => Config::from_env(),
    };
    let log_level = config
        .as_ref()
        .map(|cfg| cfg.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(args.json_logs, args.verbose, &log_level);

    info!("Starting order-router");

    let config = match config {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    info!(
        kafka_brokers = ?config.kafka.brokers,
        group_id = %config.kafka.group_id,
        input_topic = %config.routing.input_topic,
        us_topic = %config.routing.output_topics.us,
        eu_topic = %config.routing.output_topics.eu,
        other_topic = %config.routing.output_topics.other,
        "Configuration summary"
    );

    let shutdown = CancellationToken::new();
    let signals = tokio::spawn(wait_for_signal(shutdown.clone()));

    let result = run(&config, shutdown.clone()).await;

    shutdown.cancel();
    let signal = signals.await.ok().flatten();

    match result {
        Ok(stats) => {
            info!(routed = stats.total_routed(), "Shutdown complete");
            exit_status(signal)
        }
        Err(Error::Shutdown) => {
            info!("Shutdown before routing started");
            exit_status(signal)
        }
        Err(e) => {
            error!("Router failed: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(config: &Config, shutdown: CancellationToken) -> Result<RouterStats> {
    let topics = TopicManager::new(config)?;
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => return Err(Error::Shutdown),
        checked = topics.ensure_output_topics(config) => checked?,
    }

    let source = KafkaSource::new(config)?;
    let sink = KafkaSink::new(config)?;

    Router::new(config, source, sink).run(shutdown).await
}

fn exit_status(signal: Option<Signal>) -> ExitCode {
    match signal {
        Some(Signal::Interrupt) => ExitCode::from(EXIT_INTERRUPTED),
        Some(Signal::Terminate) | None => ExitCode::SUCCESS,
    }
}

/// Cancel `shutdown` on SIGINT/SIGTERM. Returns `None` if the token was
/// cancelled for another reason first.
async fn wait_for_signal(shutdown: CancellationToken) -> Option<Signal> {
    let signal = tokio::select! {
        _ = shutdown.cancelled() => return None,
        interrupted = tokio::signal::ctrl_c() => match interrupted {
            Ok(()) => Signal::Interrupt,
            Err(e) => {
                warn!("Failed to listen for Ctrl+C: {}", e);
                shutdown.cancelled().await;
                return None;
            }
        },
        _ = terminate() => Signal::Terminate,
    };

    info!(?signal, "Shutdown signal received, draining in-flight records");
    shutdown.cancel();
    Some(signal)
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Failed to listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

fn init_logging(json: bool, verbose: bool, level: &str) {
    let env_filter = if verbose {
        EnvFilter::new("order_router=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("order_router={},warn", level)))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
