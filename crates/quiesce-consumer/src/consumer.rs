// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Drain coordinator: the consumer shutdown state machine.
//!
//! [`GracefulConsumer`] wires three concerns together: an unbounded stream of
//! deliveries each spawning an asynchronous handler, a shutdown request that
//! can arrive at any time, and a bounded drain wait. The ordering invariants
//! are strict: intake is cancelled before the drain wait begins, and the
//! drain wait ends before the transport is closed.
//!
//! ```text
//!                 ┌─────────┐
//!                 │ Running │◄── setup_intake() registers the consumer
//!                 └────┬────┘
//!              close() │ flips the closing flag (setup_intake becomes a no-op)
//!                      ▼
//!                 ┌─────────┐
//!                 │ Closing │── cancel consumer registration at the transport
//!                 └────┬────┘
//!                      ▼
//!                 ┌──────────┐   poll in-flight count at poll_interval,
//!                 │ Draining │   racing the drain timeout (0 = unbounded)
//!                 └────┬─────┘
//!                      ▼
//!                 ┌─────────┐
//!                 │ Closed  │── count force-reset, transport closed
//!                 └─────────┘
//! ```
//!
//! There is no transition back to `Running`; a consumer is built, runs, and
//! is closed exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use quiesce_transport::{ConsumeOptions, ConsumerTag, Delivery, DeliveryCallback, QueueTransport};

use crate::config::ConsumerConfig;
use crate::error::{CloseError, SetupError};
use crate::handler::MessageHandler;
use crate::tracker::InFlightTracker;

struct Inner {
    transport: Arc<dyn QueueTransport>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    in_flight: InFlightTracker,
    closing: AtomicBool,
    consumer_tag: Mutex<Option<ConsumerTag>>,
}

/// A queue consumer that drains in-flight handlers before releasing the
/// transport.
///
/// Cheap to clone; all clones share one coordinator. The host process is
/// expected to call [`GracefulConsumer::close`] exactly once on its
/// termination signal, though a second call is a safe no-op.
#[derive(Clone)]
pub struct GracefulConsumer {
    inner: Arc<Inner>,
}

impl GracefulConsumer {
    /// Create a consumer over the given transport and handler.
    pub fn new(
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                handler,
                config,
                in_flight: InFlightTracker::new(),
                closing: AtomicBool::new(false),
                consumer_tag: Mutex::new(None),
            }),
        }
    }

    /// The configuration this consumer was built with.
    pub fn config(&self) -> &ConsumerConfig {
        &self.inner.config
    }

    /// Number of handler invocations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.running()
    }

    /// Whether shutdown has been requested.
    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// The active consumer registration, if intake is live.
    pub async fn consumer_tag(&self) -> Option<ConsumerTag> {
        self.inner.consumer_tag.lock().await.clone()
    }

    /// Set up intake: declare the queue (unless opted out), configure
    /// prefetch, and begin consuming. `on_ready` is invoked once intake is
    /// live.
    ///
    /// If shutdown has already been requested the call is a silent no-op: no
    /// transport calls are made and `on_ready` is not invoked. This guards
    /// the race between a pending setup callback and an in-flight shutdown.
    ///
    /// Transport errors during the sequence are fatal to the attempt and
    /// surface as [`SetupError`]; nothing is retried.
    pub async fn setup_intake<F>(&self, on_ready: F) -> Result<(), SetupError>
    where
        F: FnOnce(),
    {
        if self.is_closing() {
            debug!("setup_intake skipped, consumer is closing");
            return Ok(());
        }

        let config = &self.inner.config;

        if !config.queue_options.no_assert {
            self.inner
                .transport
                .declare_queue(&config.queue_name, &config.queue_options)
                .await
                .map_err(SetupError::DeclareQueue)?;
        }

        self.inner
            .transport
            .set_prefetch(config.prefetch_count, config.global_prefetch)
            .await
            .map_err(SetupError::Prefetch)?;

        let callback: DeliveryCallback = {
            let consumer = self.clone();
            Arc::new(move |delivery: Delivery| {
                let consumer = consumer.clone();
                async move {
                    if let Err(e) = consumer.handle(delivery).await {
                        error!("message handler failed: {:#}", e);
                    }
                }
                .boxed()
            })
        };

        let tag = self
            .inner
            .transport
            .consume(
                &config.queue_name,
                callback,
                ConsumeOptions {
                    auto_ack: config.auto_ack,
                },
            )
            .await
            .map_err(SetupError::Consume)?;

        info!(queue = %config.queue_name, consumer_tag = %tag, "intake live");
        *self.inner.consumer_tag.lock().await = Some(tag);

        on_ready();
        Ok(())
    }

    /// Run the opaque handler for one delivery, tracked as in flight for the
    /// whole invocation.
    ///
    /// The handler's outcome is returned unchanged; the wrapping is
    /// transparent to error semantics. The in-flight count decrements on
    /// every exit path, failures included.
    pub async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        let _guard = self.inner.in_flight.begin();
        self.inner
            .handler
            .handle(delivery, Arc::clone(&self.inner.transport))
            .await
    }

    /// Shut the consumer down: stop intake, wait for in-flight handlers (up
    /// to the drain timeout), then close the transport.
    ///
    /// The sequence is: flip the closing flag, cancel the consumer
    /// registration (if any) so the in-flight count can only shrink, race
    /// "drained" against the timeout, force the count to zero, close the
    /// transport. A transport-close failure surfaces as [`CloseError`]; a
    /// cancellation failure is logged and does not stop the sequence.
    ///
    /// Calling `close` again after it has started is a safe no-op.
    pub async fn close(&self) -> Result<(), CloseError> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            debug!("close requested more than once, ignoring");
            return Ok(());
        }

        info!(
            queue = %self.inner.config.queue_name,
            in_flight = self.in_flight(),
            "closing consumer"
        );

        // Cancel intake before draining so the count can only shrink.
        let tag = self.inner.consumer_tag.lock().await.take();
        if let Some(tag) = tag {
            if let Err(e) = self.inner.transport.cancel_consumer(&tag).await {
                warn!(consumer_tag = %tag, "failed to cancel consumer, draining anyway: {}", e);
            }
        } else {
            debug!("no consumer registration to cancel");
        }

        self.drain().await;

        // Anything still running past the drain finishes in the background
        // untracked.
        self.inner.in_flight.reset();

        self.inner
            .transport
            .close()
            .await
            .map_err(CloseError::Transport)?;

        info!("consumer closed");
        Ok(())
    }

    /// Wait until all in-flight handlers finish or the drain timeout
    /// elapses, whichever comes first. A zero timeout waits indefinitely.
    async fn drain(&self) {
        let drain = &self.inner.config.drain;

        if drain.timeout.is_zero() {
            self.wait_for_drain().await;
            debug!("drain complete");
            return;
        }

        tokio::select! {
            _ = self.wait_for_drain() => {
                debug!("drain complete");
            }
            _ = tokio::time::sleep(drain.timeout) => {
                warn!(
                    in_flight = self.in_flight(),
                    timeout_ms = drain.timeout.as_millis() as u64,
                    "drain timed out, abandoning wait"
                );
            }
        }
    }

    async fn wait_for_drain(&self) {
        while !self.inner.in_flight.is_drained() {
            tokio::time::sleep(self.inner.config.drain.poll_interval).await;
        }
    }
}
