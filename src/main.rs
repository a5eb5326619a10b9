use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use resilient_rabbitmq::config::{create_default_config_file, find_config_file, load_config};
use resilient_rabbitmq::{ConnectionManager, Message, RabbitConfig};

#[derive(Parser)]
#[command(name = "resilient-rabbitmq")]
#[command(about = "Publish to and consume from RabbitMQ across broker restarts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON config file; without it the environment (and .env) is used
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Look for rabbitmq.json in the usual places before falling back to the environment
    #[arg(long, global = true)]
    discover_config: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish numbered text messages
    Publish {
        /// How many messages to send
        #[arg(long, default_value_t = 10)]
        count: u32,
        /// Pause between messages, in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
        /// Exchange to publish to instead of the configured queue
        #[arg(long)]
        exchange: Option<String>,
        /// Routing key used with --exchange
        #[arg(long, default_value = "")]
        routing_key: String,
        /// Mark messages persistent
        #[arg(long)]
        persistent: bool,
    },
    /// Print and acknowledge deliveries until Ctrl+C
    Consume {
        /// Bind the configured queue to this exchange before consuming
        #[arg(long)]
        exchange: Option<String>,
        /// Exchange type used with --exchange
        #[arg(long, default_value = "direct")]
        kind: String,
        /// Binding key used with --exchange
        #[arg(long, default_value = "")]
        routing_key: String,
    },
    /// Write a default config file
    InitConfig {
        #[arg(default_value = "rabbitmq.json")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::InitConfig { path } = &cli.command {
        return create_default_config_file(path);
    }

    let config = resolve_config(&cli)?;
    info!(
        queue = %config.connection.queue_name,
        exchange = %config.connection.exchange_name,
        "Starting RabbitMQ client"
    );

    let manager = ConnectionManager::from_config(config);
    if let Err(e) = manager.connect().await {
        // Keep going; the supervisor brings the connection up when the broker does.
        warn!(error = %e, "Initial connection failed, reconnecting in the background");
        manager.trigger_reconnect();
    }

    let outcome = match cli.command {
        Commands::Publish {
            count,
            interval_ms,
            exchange,
            routing_key,
            persistent,
        } => {
            tokio::select! {
                result = run_publisher(&manager, count, interval_ms, exchange, routing_key, persistent) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, stopping publisher");
                    Ok(())
                }
            }
        }
        Commands::Consume {
            exchange,
            kind,
            routing_key,
        } => run_consumer(&manager, exchange, kind, routing_key).await,
        Commands::InitConfig { .. } => Ok(()),
    };

    if let Err(e) = manager.close().await {
        warn!(error = %e, "Error while closing RabbitMQ connection");
    }
    outcome
}

fn resolve_config(cli: &Cli) -> Result<RabbitConfig> {
    if let Some(path) = &cli.config {
        return load_config(path);
    }
    if cli.discover_config {
        match find_config_file() {
            Ok(path) => return load_config(&path),
            Err(e) => info!("{e}, using environment"),
        }
    }
    RabbitConfig::from_env().context("Failed to read RabbitMQ settings from the environment")
}

async fn run_publisher(
    manager: &ConnectionManager,
    count: u32,
    interval_ms: u64,
    exchange: Option<String>,
    routing_key: String,
    persistent: bool,
) -> Result<()> {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));

    for i in 1..=count {
        interval.tick().await;

        let mut message = Message::new(format!("Message: {i}"));
        if persistent {
            message = message.persistent();
        }
        let message = match &exchange {
            Some(exchange) => message.with_exchange(exchange.as_str()).with_routing_key(routing_key.as_str()),
            None => message.with_routing_key(manager.queue_name()),
        };

        match manager.publish_with_options(message).await {
            Ok(()) => info!(sequence = i, "Published message"),
            Err(e) => error!(sequence = i, error = %e, "Failed to publish message"),
        }
    }
    Ok(())
}

async fn run_consumer(
    manager: &ConnectionManager,
    exchange: Option<String>,
    kind: String,
    routing_key: String,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);

    let consumer = {
        let manager = manager.clone();
        tokio::spawn(async move {
            match exchange {
                Some(exchange) => {
                    let queue = manager.queue_name().to_string();
                    manager
                        .consume_from_exchange(&exchange, &kind, &queue, &routing_key, tx)
                        .await
                }
                None => manager.consume_with_reconnect(tx).await,
            }
        })
    };

    loop {
        tokio::select! {
            delivery = rx.recv() => {
                let Some(delivery) = delivery else { break };
                println!(
                    "[{}] {}",
                    delivery.routing_key,
                    delivery.message.body_str()
                );
                if let Err(e) = delivery.ack().await {
                    warn!(error = %e, "Failed to acknowledge delivery");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, stopping consumer");
                break;
            }
        }
    }

    drop(rx);
    consumer
        .await
        .context("Consumer task panicked")?
        .context("Consumer stopped with an error")
}
