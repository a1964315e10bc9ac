// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The opaque message-handler seam.
//!
//! The drain coordinator treats a handler as an asynchronous unit of work
//! returning success or failure; it never retries or inspects the outcome
//! beyond bookkeeping. Acknowledge/reject policy stays with the handler and
//! the transport it is handed.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use quiesce_transport::{Delivery, QueueTransport};

/// An application message handler.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. The transport handle is provided for manual
    /// acknowledgement.
    async fn handle(
        &self,
        delivery: Delivery,
        transport: Arc<dyn QueueTransport>,
    ) -> anyhow::Result<()>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Delivery, Arc<dyn QueueTransport>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(
        &self,
        delivery: Delivery,
        transport: Arc<dyn QueueTransport>,
    ) -> anyhow::Result<()> {
        (self.f)(delivery, transport).await
    }
}

/// Adapt an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Delivery, Arc<dyn QueueTransport>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}
