// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Quiesce Consumer - Graceful-drain runtime for queue consumers
//!
//! This crate lets a long-lived queue consumer stop accepting new work, wait
//! for in-flight message handlers to finish (up to a bounded timeout), and
//! only then release broker-side and transport-side resources. A rolling
//! deployment or process restart never drops a message that was already being
//! processed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          Host process                             │
//! │         (signal handling, bootstrap, business handlers)           │
//! └───────────────┬─────────────────────────────────┬────────────────┘
//!                 │ setup_intake() / close()        │ MessageHandler
//!                 ▼                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       GracefulConsumer                            │
//! │                                                                   │
//! │   ┌────────────────┐        ┌─────────────────────────────┐      │
//! │   │ InFlightTracker │◄──────│  per-delivery handle() wrap  │      │
//! │   │  (begin/end)    │       │  (guard on every exit path)  │      │
//! │   └────────────────┘        └─────────────────────────────┘      │
//! └───────────────────────────────┬──────────────────────────────────┘
//!                                 │ Arc<dyn QueueTransport>
//!                                 ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       quiesce-transport                           │
//! │        (declare / prefetch / consume / cancel / ack / close)      │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Shutdown sequence
//!
//! [`GracefulConsumer::close`] runs exactly one shutdown pass:
//!
//! | Step | Action |
//! |------|--------|
//! | 1 | Flip the closing flag; later `setup_intake` calls become no-ops |
//! | 2 | Cancel the consumer registration so no new deliveries arrive |
//! | 3 | Poll the in-flight count until zero, racing the drain timeout |
//! | 4 | Force the count to zero (abandoned handlers finish untracked) |
//! | 5 | Close the transport channel |
//!
//! Cancellation always precedes the drain wait, and the drain wait always
//! precedes the transport close. A drain timeout of zero waits indefinitely.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use quiesce_consumer::{ConsumerConfig, GracefulConsumer, handler_fn};
//! use quiesce_transport::{MemoryBroker, QueueTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let handler = handler_fn(|delivery, transport| async move {
//!         process(&delivery.payload).await?;
//!         transport.ack(delivery.delivery_tag).await?;
//!         Ok(())
//!     });
//!
//!     let consumer = GracefulConsumer::new(
//!         broker.clone() as Arc<dyn QueueTransport>,
//!         handler,
//!         ConsumerConfig::from_env()?,
//!     );
//!     consumer.setup_intake(|| println!("intake live")).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     consumer.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from environment variables (see
//! [`ConsumerConfig::from_env`]):
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `QUIESCE_QUEUE` | Yes | - | Queue to consume from |
//! | `QUIESCE_PREFETCH_COUNT` | No | `1` | Max unacknowledged deliveries |
//! | `QUIESCE_GLOBAL_PREFETCH` | No | `false` | Channel-wide prefetch bound |
//! | `QUIESCE_AUTO_ACK` | No | `false` | Acknowledge on receipt |
//! | `QUIESCE_NO_ASSERT_QUEUE` | No | `false` | Skip queue declaration |
//! | `QUIESCE_DRAIN_TIMEOUT_MS` | No | `30000` | Drain timeout (0 disables) |
//! | `QUIESCE_DRAIN_POLL_INTERVAL_MS` | No | `500` | Drain poll cadence |
//!
//! # Modules
//!
//! - [`config`]: consumer and drain configuration
//! - [`consumer`]: the drain coordinator
//! - [`error`]: setup and shutdown error types
//! - [`handler`]: the opaque message-handler seam
//! - [`tracker`]: in-flight invocation tracking

#![deny(missing_docs)]

/// Consumer and drain configuration.
pub mod config;

/// The drain coordinator and its shutdown state machine.
pub mod consumer;

/// Error types for intake setup and shutdown.
pub mod error;

/// The opaque message-handler seam.
pub mod handler;

/// In-flight invocation tracking.
pub mod tracker;

pub use config::{ConfigError, ConsumerConfig, DrainConfig};
pub use consumer::GracefulConsumer;
pub use error::{CloseError, SetupError};
pub use handler::{MessageHandler, handler_fn};
pub use tracker::{InFlightGuard, InFlightTracker};
