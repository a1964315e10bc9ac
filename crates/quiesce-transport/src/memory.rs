// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process loopback broker.
//!
//! [`MemoryBroker`] implements [`QueueTransport`] against per-queue in-memory
//! channels, standing in for a networked broker in tests and the demo binary.
//! Each consumer registration runs its own delivery task; prefetch is enforced
//! by holding a semaphore permit per unacknowledged delivery, released by
//! [`QueueTransport::ack`]. Cancelling a consumer stops deliveries and leaves
//! undelivered messages queued for a later registration.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::queue::{
    ConsumeOptions, ConsumerTag, Delivery, DeliveryCallback, QueueOptions, QueueTransport,
    TransportError,
};

struct QueueSlot {
    tx: UnboundedSender<Delivery>,
    /// Taken by the active consumer's delivery task, handed back on cancel.
    rx: Option<UnboundedReceiver<Delivery>>,
}

struct ConsumerSlot {
    queue: String,
    cancel: Arc<Notify>,
}

struct Inner {
    queues: Mutex<HashMap<String, QueueSlot>>,
    consumers: Mutex<HashMap<String, ConsumerSlot>>,
    /// Semaphore permits held on behalf of unacknowledged deliveries.
    unacked: Mutex<HashMap<u64, OwnedSemaphorePermit>>,
    prefetch: AtomicU64,
    delivery_seq: AtomicU64,
    closed: AtomicBool,
}

/// In-process [`QueueTransport`] implementation.
///
/// Cheap to clone; all clones share the same broker state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty broker with no queues declared.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                queues: Mutex::new(HashMap::new()),
                consumers: Mutex::new(HashMap::new()),
                unacked: Mutex::new(HashMap::new()),
                prefetch: AtomicU64::new(0),
                delivery_seq: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Publish a message to a declared queue, returning its delivery tag.
    ///
    /// This is the producing side of the loopback and is not part of the
    /// [`QueueTransport`] contract.
    pub async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        correlation_id: Option<String>,
    ) -> Result<u64, TransportError> {
        self.ensure_open()?;

        let queues = self.inner.queues.lock().await;
        let slot = queues
            .get(queue)
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;

        let delivery_tag = self.inner.delivery_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let delivery = Delivery {
            delivery_tag,
            payload,
            redelivered: false,
            correlation_id,
        };

        slot.tx
            .send(delivery)
            .map_err(|_| TransportError::Closed)?;
        debug!(queue = %queue, delivery_tag, "message published");

        Ok(delivery_tag)
    }

    /// Number of unacknowledged deliveries currently outstanding.
    pub async fn unacked_count(&self) -> usize {
        self.inner.unacked.lock().await.len()
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    async fn delivery_loop(
        inner: Arc<Inner>,
        queue: String,
        mut rx: UnboundedReceiver<Delivery>,
        limiter: Option<Arc<Semaphore>>,
        cancel: Arc<Notify>,
        on_delivery: DeliveryCallback,
    ) {
        loop {
            // With prefetch active, reserve capacity before pulling the next
            // message so at most `prefetch` deliveries are unacknowledged.
            let permit = match &limiter {
                Some(semaphore) => {
                    let acquired = tokio::select! {
                        biased;

                        _ = cancel.notified() => break,
                        permit = semaphore.clone().acquire_owned() => permit,
                    };
                    match acquired {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    }
                }
                None => None,
            };

            let delivery = tokio::select! {
                biased;

                _ = cancel.notified() => break,
                message = rx.recv() => match message {
                    Some(delivery) => delivery,
                    None => break,
                },
            };

            if let Some(permit) = permit {
                inner
                    .unacked
                    .lock()
                    .await
                    .insert(delivery.delivery_tag, permit);
            }

            debug!(queue = %queue, delivery_tag = delivery.delivery_tag, "delivering message");
            tokio::spawn(on_delivery(delivery));
        }

        // Hand the receiver back so a later consume() resumes where this
        // registration stopped; queued messages are not lost.
        if let Some(slot) = inner.queues.lock().await.get_mut(&queue) {
            slot.rx = Some(rx);
        }
        debug!(queue = %queue, "delivery loop stopped");
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueTransport for MemoryBroker {
    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;

        let mut queues = self.inner.queues.lock().await;
        if queues.contains_key(queue) {
            return Ok(());
        }

        let (tx, rx) = unbounded_channel();
        queues.insert(queue.to_string(), QueueSlot { tx, rx: Some(rx) });
        info!(queue = %queue, durable = options.durable, "queue declared");
        Ok(())
    }

    async fn set_prefetch(&self, count: u16, global: bool) -> Result<(), TransportError> {
        self.ensure_open()?;

        // The loopback has a single logical channel, so the global flag makes
        // no observable difference here.
        if global {
            debug!("global prefetch requested; loopback applies it per consumer");
        }
        self.inner.prefetch.store(count as u64, Ordering::SeqCst);
        debug!(count, "prefetch configured");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        on_delivery: DeliveryCallback,
        options: ConsumeOptions,
    ) -> Result<ConsumerTag, TransportError> {
        self.ensure_open()?;

        let rx = {
            let mut queues = self.inner.queues.lock().await;
            let slot = queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
            slot.rx
                .take()
                .ok_or_else(|| TransportError::QueueBusy(queue.to_string()))?
        };

        // Prefetch bounds unacknowledged deliveries; in auto-ack mode nothing
        // is ever unacknowledged, matching broker behavior.
        let prefetch = self.inner.prefetch.load(Ordering::SeqCst);
        let limiter = if options.auto_ack || prefetch == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(prefetch as usize)))
        };

        let tag = ConsumerTag::new(format!("ctag-{}", Uuid::new_v4()));
        let cancel = Arc::new(Notify::new());

        self.inner.consumers.lock().await.insert(
            tag.as_str().to_string(),
            ConsumerSlot {
                queue: queue.to_string(),
                cancel: cancel.clone(),
            },
        );

        tokio::spawn(Self::delivery_loop(
            self.inner.clone(),
            queue.to_string(),
            rx,
            limiter,
            cancel,
            on_delivery,
        ));

        info!(queue = %queue, consumer_tag = %tag, auto_ack = options.auto_ack, "consumer registered");
        Ok(tag)
    }

    async fn cancel_consumer(&self, tag: &ConsumerTag) -> Result<(), TransportError> {
        self.ensure_open()?;

        let slot = self
            .inner
            .consumers
            .lock()
            .await
            .remove(tag.as_str())
            .ok_or_else(|| TransportError::UnknownConsumer(tag.as_str().to_string()))?;

        slot.cancel.notify_one();
        info!(queue = %slot.queue, consumer_tag = %tag, "consumer cancelled");
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.ensure_open()?;

        // Dropping the permit frees prefetch capacity for the next delivery.
        self.inner
            .unacked
            .lock()
            .await
            .remove(&delivery_tag)
            .ok_or(TransportError::UnknownDelivery(delivery_tag))?;
        debug!(delivery_tag, "delivery acknowledged");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut consumers = self.inner.consumers.lock().await;
        for (tag, slot) in consumers.drain() {
            debug!(consumer_tag = %tag, queue = %slot.queue, "stopping consumer on close");
            slot.cancel.notify_one();
        }
        drop(consumers);

        // Dropping the senders ends any delivery loop still waiting on its
        // channel; dropping the permits releases all prefetch capacity.
        self.inner.queues.lock().await.clear();
        let outstanding = {
            let mut unacked = self.inner.unacked.lock().await;
            let outstanding = unacked.len();
            unacked.clear();
            outstanding
        };
        if outstanding > 0 {
            warn!(outstanding, "closed with unacknowledged deliveries");
        }

        info!("loopback broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;
    use tokio::sync::mpsc;

    use super::*;

    fn collecting_callback() -> (DeliveryCallback, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callback: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(delivery);
            }
            .boxed()
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn test_declare_queue_is_idempotent() {
        let broker = MemoryBroker::new();
        let options = QueueOptions::default();

        broker.declare_queue("orders", &options).await.unwrap();
        broker.declare_queue("orders", &options).await.unwrap();

        // Messages published after a re-declare still land on the original
        // channel.
        broker.publish("orders", b"m1".to_vec(), None).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_to_missing_queue_fails() {
        let broker = MemoryBroker::new();
        let err = broker
            .publish("missing", b"m1".to_vec(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::QueueNotFound(_)));
    }

    #[tokio::test]
    async fn test_consume_delivers_published_messages() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("orders", &QueueOptions::default())
            .await
            .unwrap();

        let (callback, mut deliveries) = collecting_callback();
        broker
            .consume("orders", callback, ConsumeOptions { auto_ack: true })
            .await
            .unwrap();

        broker.publish("orders", b"m1".to_vec(), None).await.unwrap();
        broker
            .publish("orders", b"m2".to_vec(), Some("corr".to_string()))
            .await
            .unwrap();

        let first = deliveries.recv().await.unwrap();
        let second = deliveries.recv().await.unwrap();
        assert_eq!(first.payload, b"m1");
        assert_eq!(second.payload, b"m2");
        assert_eq!(second.correlation_id.as_deref(), Some("corr"));
        assert!(second.delivery_tag > first.delivery_tag);
    }

    #[tokio::test]
    async fn test_double_consume_fails() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("orders", &QueueOptions::default())
            .await
            .unwrap();

        let (callback, _deliveries) = collecting_callback();
        broker
            .consume("orders", callback.clone(), ConsumeOptions::default())
            .await
            .unwrap();

        let err = broker
            .consume("orders", callback, ConsumeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::QueueBusy(_)));
    }

    #[tokio::test]
    async fn test_prefetch_bounds_unacked_deliveries() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("orders", &QueueOptions::default())
            .await
            .unwrap();
        broker.set_prefetch(2, false).await.unwrap();

        let (callback, mut deliveries) = collecting_callback();
        broker
            .consume("orders", callback, ConsumeOptions { auto_ack: false })
            .await
            .unwrap();

        for i in 0..5u8 {
            broker
                .publish("orders", vec![i], None)
                .await
                .unwrap();
        }

        let first = deliveries.recv().await.unwrap();
        let second = deliveries.recv().await.unwrap();

        // Third delivery must wait for an ack.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(deliveries.try_recv().is_err());
        assert_eq!(broker.unacked_count().await, 2);

        broker.ack(first.delivery_tag).await.unwrap();
        let third = deliveries.recv().await.unwrap();
        assert_eq!(third.payload, vec![2]);

        broker.ack(second.delivery_tag).await.unwrap();
        broker.ack(third.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_stops_deliveries_and_keeps_messages() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("orders", &QueueOptions::default())
            .await
            .unwrap();

        let (callback, mut deliveries) = collecting_callback();
        let tag = broker
            .consume("orders", callback, ConsumeOptions { auto_ack: true })
            .await
            .unwrap();

        broker.publish("orders", b"m1".to_vec(), None).await.unwrap();
        assert_eq!(deliveries.recv().await.unwrap().payload, b"m1");

        broker.cancel_consumer(&tag).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        broker.publish("orders", b"m2".to_vec(), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(deliveries.try_recv().is_err());

        // A fresh registration picks up the undelivered message.
        let (callback, mut deliveries) = collecting_callback();
        broker
            .consume("orders", callback, ConsumeOptions { auto_ack: true })
            .await
            .unwrap();
        assert_eq!(deliveries.recv().await.unwrap().payload, b"m2");
    }

    #[tokio::test]
    async fn test_cancel_unknown_consumer_fails() {
        let broker = MemoryBroker::new();
        let err = broker
            .cancel_consumer(&ConsumerTag::new("ctag-missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::UnknownConsumer(_)));
    }

    #[tokio::test]
    async fn test_ack_unknown_delivery_fails() {
        let broker = MemoryBroker::new();
        let err = broker.ack(99).await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownDelivery(99)));
    }

    #[tokio::test]
    async fn test_operations_fail_after_close() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("orders", &QueueOptions::default())
            .await
            .unwrap();
        broker.close().await.unwrap();

        let err = broker
            .declare_queue("orders", &QueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));

        let err = broker.publish("orders", b"m".to_vec(), None).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));

        let err = broker.close().await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn test_close_stops_active_consumer() {
        let broker = MemoryBroker::new();
        broker
            .declare_queue("orders", &QueueOptions::default())
            .await
            .unwrap();

        let (callback, mut deliveries) = collecting_callback();
        broker
            .consume("orders", callback, ConsumeOptions { auto_ack: true })
            .await
            .unwrap();

        broker.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(deliveries.try_recv().is_err());
    }
}
