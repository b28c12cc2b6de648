use anyhow::{Context, Result};
use envconfig::Envconfig;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_facade::config::RunnerConfig;
use kafka_facade::{DeferredCommit, KafkaFacade, Outcome, Record};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

fn log_record(record: &Record) -> Outcome {
    info!(
        topic = record.topic(),
        partition = record.partition().partition_number(),
        offset = record.offset(),
        bytes = record.payload().len(),
        "Received record"
    );
    Outcome::Accepted
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    info!("Starting kafka-facade consumer");

    let config = RunnerConfig::init_from_env()
        .context("Failed to load configuration from environment variables")?;

    let topics = config.topics();
    let deferred = (!config.commit_interval().is_zero()).then(|| {
        DeferredCommit::new(
            |topic: &str| {
                warn!(topic, "Retrying deferred commit");
                Outcome::Accepted
            },
            config.commit_interval(),
        )
    });

    let (facade, waiter) = KafkaFacade::new(config.kafka.clone());
    let group = facade
        .new_consumer_group(
            &config.kafka_client_id,
            &config.kafka_consumer_group,
            &topics,
            log_record,
            deferred,
            config.kafka_skip_unread,
        )
        .await
        .with_context(|| {
            format!(
                "Failed to join consumer group {}. Check your Kafka connection.",
                config.kafka_consumer_group
            )
        })?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    group.stop();
    waiter.wait().await;

    info!("All consumer groups stopped");
    Ok(())
}
