use anyhow::Context;
use clap::Parser;
use std::io::BufRead;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use txn_pubsub::kafka::KafkaClients;
use txn_pubsub::{codec, Config, Driver};

#[derive(Parser, Debug)]
#[command(name = "txn-pubsub")]
#[command(about = "Transactional Kafka publisher with offset-tracked consumer groups", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting txn-pubsub");
    info!("Loading configuration from {:?}", args.config);

    let config = match Config::from_file(&args.config) {
        Ok(cfg) => {
            info!("Configuration loaded successfully");
            cfg
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e).context("invalid configuration");
        }
    };

    info!(
        brokers = ?config.broker.brokers,
        topic = %config.broker.topic,
        schema_registry = %config.schema_registry.url,
        codec = ?config.codec.format,
        transactional_id = %config.publisher.transactional_id,
        groups = ?config.groups.iter().map(|g| g.id.as_str()).collect::<Vec<_>>(),
        "Configuration summary"
    );

    let codec = codec::from_config(&config).context("failed to build record codec")?;
    let driver = Driver::new(config, KafkaClients, codec);

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        on_signal.cancel();
    });

    // stdin reads block, so they stay off the runtime
    let (triggers, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        println!("Press Enter to send a message (Ctrl+C to quit)");
        for line in std::io::stdin().lock().lines() {
            if line.is_err() || triggers.blocking_send(()).is_err() {
                break;
            }
        }
    });

    let report = driver.run(rx, shutdown).await?;
    for group in &report.groups {
        match &group.result {
            Ok(stats) => info!(group = %group.group, stats = ?stats, "Subscriber summary"),
            Err(e) => error!(group = %group.group, error = %e, "Subscriber failed"),
        }
    }
    info!(
        published = report.published,
        failed = report.failed,
        "txn-pubsub stopped"
    );

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("txn_pubsub=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("txn_pubsub=info,warn"))
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
