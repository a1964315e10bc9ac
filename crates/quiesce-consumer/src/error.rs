// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for intake setup and shutdown.
//!
//! Handler failures are deliberately absent: the handler's error is opaque to
//! the coordinator and propagates through [`crate::GracefulConsumer::handle`]
//! unchanged as an [`anyhow::Error`].

use thiserror::Error;

use quiesce_transport::TransportError;

/// Errors raised while setting up intake. Fatal to the setup attempt and
/// never retried by the coordinator.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SetupError {
    /// The transport rejected the queue declaration.
    #[error("queue declaration failed: {0}")]
    DeclareQueue(TransportError),

    /// The transport rejected the prefetch configuration.
    #[error("prefetch configuration failed: {0}")]
    Prefetch(TransportError),

    /// The transport rejected the consumer registration.
    #[error("consumer registration failed: {0}")]
    Consume(TransportError),
}

/// Errors raised while closing the consumer.
///
/// A consumer-cancel failure is logged and never surfaces here; the shutdown
/// sequence always proceeds to the drain wait and the transport close.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CloseError {
    /// The transport failed to close its channel.
    #[error("transport close failed: {0}")]
    Transport(TransportError),
}
