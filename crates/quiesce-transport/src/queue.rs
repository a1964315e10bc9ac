// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue transport contract and delivery types.
//!
//! [`QueueTransport`] is the seam between the consumer runtime and the broker.
//! It is object-safe so the runtime can hold an `Arc<dyn QueueTransport>` and
//! be tested against a mock adapter.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by a transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The named queue does not exist on the broker.
    #[error("queue '{0}' not found")]
    QueueNotFound(String),

    /// The queue already has an active consumer registration.
    #[error("queue '{0}' is already being consumed")]
    QueueBusy(String),

    /// No consumer registration matches the given tag.
    #[error("unknown consumer tag '{0}'")]
    UnknownConsumer(String),

    /// No unacknowledged delivery matches the given tag.
    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),

    /// The transport channel has been closed.
    #[error("transport closed")]
    Closed,

    /// Adapter-specific failure (connection loss, protocol error, ...).
    #[error("transport error: {0}")]
    Adapter(String),
}

/// Opaque identifier for an active consumer registration.
///
/// Assigned by the transport when [`QueueTransport::consume`] succeeds and
/// handed back to [`QueueTransport::cancel_consumer`] to stop that specific
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsumerTag(String);

impl ConsumerTag {
    /// Wrap a broker-assigned tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The raw tag string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single inbound message handed to the consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    /// Broker-assigned tag identifying this delivery for acknowledgement.
    pub delivery_tag: u64,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Application correlation id, if the publisher set one.
    pub correlation_id: Option<String>,
}

/// Options applied when declaring a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueOptions {
    /// Queue survives a broker restart.
    pub durable: bool,
    /// Queue is scoped to this connection.
    pub exclusive: bool,
    /// Queue is deleted when the last consumer unsubscribes.
    pub auto_delete: bool,
    /// Skip queue declaration entirely; the caller guarantees the queue
    /// already exists.
    pub no_assert: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            no_assert: false,
        }
    }
}

/// Options applied when registering a consumer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConsumeOptions {
    /// Deliveries are considered acknowledged as soon as they are handed to
    /// the callback; [`QueueTransport::ack`] is not required (and prefetch
    /// does not apply, matching broker semantics for auto-acknowledge).
    pub auto_ack: bool,
}

/// Per-delivery callback registered with [`QueueTransport::consume`].
///
/// Boxed so the trait stays object-safe; the future must be `'static` because
/// adapters run it on their own delivery tasks.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// The transport surface the consumer runtime requires from a broker.
///
/// Implementations must be safe to share behind an `Arc` across tasks; every
/// method takes `&self`.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Declare the named queue. Idempotent; callers may skip it via
    /// [`QueueOptions::no_assert`].
    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<(), TransportError>;

    /// Bound the number of unacknowledged deliveries handed to this consumer.
    /// A count of zero means unlimited. `global` applies the bound across all
    /// consumers on the channel rather than per-consumer.
    async fn set_prefetch(&self, count: u16, global: bool) -> Result<(), TransportError>;

    /// Begin consuming from the queue, invoking `on_delivery` for each
    /// message. Returns the registration tag used to cancel the subscription.
    async fn consume(
        &self,
        queue: &str,
        on_delivery: DeliveryCallback,
        options: ConsumeOptions,
    ) -> Result<ConsumerTag, TransportError>;

    /// Stop the consumer registration identified by `tag`. Messages already
    /// handed to the callback are unaffected; no further deliveries occur.
    async fn cancel_consumer(&self, tag: &ConsumerTag) -> Result<(), TransportError>;

    /// Acknowledge a delivery. Only meaningful when the consumer was
    /// registered without [`ConsumeOptions::auto_ack`].
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Close the transport channel. No further operations are valid.
    async fn close(&self) -> Result<(), TransportError>;
}
