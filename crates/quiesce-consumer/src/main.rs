// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quiesce demo consumer.
//!
//! Runs a consumer against the in-process loopback broker with a deliberately
//! slow handler, plus a small producer task publishing a message every couple
//! of seconds. Send SIGTERM (or press Ctrl-C) while messages are in flight to
//! watch the drain: intake stops immediately, running handlers finish, then
//! the broker closes and the process exits.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use uuid::Uuid;

use quiesce_consumer::{ConfigError, ConsumerConfig, GracefulConsumer, handler_fn};
use quiesce_transport::{MemoryBroker, QueueTransport};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("quiesce_consumer=info".parse().unwrap())
                .add_directive("quiesce_transport=info".parse().unwrap()),
        )
        .init();

    info!("Starting quiesce demo consumer");

    // Environment overrides are honored; with no environment at all the demo
    // falls back to the stock "messages" queue.
    let config = match ConsumerConfig::from_env() {
        Ok(config) => config,
        Err(ConfigError::Missing(_)) => ConsumerConfig::new("messages"),
        Err(e) => {
            error!("Configuration error: {}", e);
            return Err(e.into());
        }
    };

    info!(
        queue = %config.queue_name,
        prefetch = config.prefetch_count,
        drain_timeout_ms = config.drain.timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let broker = Arc::new(MemoryBroker::new());

    // The handler takes five seconds per message and acknowledges manually,
    // so an in-flight message is easy to catch with a signal.
    let handler = handler_fn(|delivery, transport: Arc<dyn QueueTransport>| async move {
        info!(
            delivery_tag = delivery.delivery_tag,
            payload = %String::from_utf8_lossy(&delivery.payload),
            "Start handling message"
        );
        tokio::time::sleep(Duration::from_secs(5)).await;
        if let Err(e) = transport.ack(delivery.delivery_tag).await {
            warn!(delivery_tag = delivery.delivery_tag, "Failed to ack message: {}", e);
        }
        info!(delivery_tag = delivery.delivery_tag, "Finished handling message");
        Ok(())
    });

    let consumer = GracefulConsumer::new(
        broker.clone() as Arc<dyn QueueTransport>,
        handler,
        config.clone(),
    );
    consumer
        .setup_intake(|| info!("Intake live, waiting for messages"))
        .await?;

    // Stand-in for an external publisher: one message every two seconds.
    let producer_broker = Arc::clone(&broker);
    let producer_queue = config.queue_name.clone();
    let producer = tokio::spawn(async move {
        loop {
            let message = serde_json::json!({
                "pattern": "message",
                "data": Uuid::new_v4().to_string(),
            });
            if let Err(e) = producer_broker
                .publish(&producer_queue, message.to_string().into_bytes(), None)
                .await
            {
                info!("Producer stopping: {}", e);
                break;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    });

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }

    producer.abort();

    match consumer.close().await {
        Ok(()) => {
            info!("Shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Shutdown failed: {}", e);
            std::process::exit(1);
        }
    }
}
