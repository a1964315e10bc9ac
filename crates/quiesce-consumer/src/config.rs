// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Consumer configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use quiesce_transport::QueueOptions;

/// How the drain wait behaves during shutdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainConfig {
    /// Upper bound on the drain wait. A zero duration disables the timeout
    /// entirely: `close()` waits however long the in-flight handlers take.
    pub timeout: Duration,
    /// Cadence at which the coordinator re-checks the in-flight count while
    /// draining. Must be positive.
    pub poll_interval: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Configuration for a [`crate::GracefulConsumer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Queue to consume from.
    pub queue_name: String,
    /// Options applied when the queue is declared during intake setup.
    pub queue_options: QueueOptions,
    /// Maximum unacknowledged deliveries handed to this consumer (0 = no
    /// limit).
    pub prefetch_count: u16,
    /// Apply the prefetch bound channel-wide instead of per consumer.
    pub global_prefetch: bool,
    /// Let the transport acknowledge deliveries on receipt instead of the
    /// handler acknowledging manually.
    pub auto_ack: bool,
    /// Drain behavior during shutdown.
    pub drain: DrainConfig,
}

impl ConsumerConfig {
    /// Create a configuration for the given queue with defaults: declared
    /// durable queue, prefetch of 1, manual acknowledgement, 30 s drain
    /// timeout, 500 ms drain poll interval.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            queue_options: QueueOptions::default(),
            prefetch_count: 1,
            global_prefetch: false,
            auto_ack: false,
            drain: DrainConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `QUIESCE_QUEUE`: queue to consume from
    ///
    /// Optional (with defaults):
    /// - `QUIESCE_PREFETCH_COUNT`: max unacknowledged deliveries (default: 1)
    /// - `QUIESCE_GLOBAL_PREFETCH`: channel-wide prefetch (default: false)
    /// - `QUIESCE_AUTO_ACK`: acknowledge on receipt (default: false)
    /// - `QUIESCE_NO_ASSERT_QUEUE`: skip queue declaration (default: false)
    /// - `QUIESCE_DRAIN_TIMEOUT_MS`: drain timeout, 0 disables (default: 30000)
    /// - `QUIESCE_DRAIN_POLL_INTERVAL_MS`: drain poll cadence, must be
    ///   positive (default: 500)
    pub fn from_env() -> Result<Self, ConfigError> {
        let queue_name =
            std::env::var("QUIESCE_QUEUE").map_err(|_| ConfigError::Missing("QUIESCE_QUEUE"))?;

        let prefetch_count: u16 = std::env::var("QUIESCE_PREFETCH_COUNT")
            .unwrap_or_else(|_| "1".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("QUIESCE_PREFETCH_COUNT", "must be an integer in 0..=65535")
            })?;

        let global_prefetch = flag_from_env("QUIESCE_GLOBAL_PREFETCH");
        let auto_ack = flag_from_env("QUIESCE_AUTO_ACK");

        let queue_options = QueueOptions {
            no_assert: flag_from_env("QUIESCE_NO_ASSERT_QUEUE"),
            ..QueueOptions::default()
        };

        let timeout_ms: u64 = std::env::var("QUIESCE_DRAIN_TIMEOUT_MS")
            .unwrap_or_else(|_| "30000".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "QUIESCE_DRAIN_TIMEOUT_MS",
                    "must be a non-negative integer (0 disables the timeout)",
                )
            })?;

        let poll_interval_ms: u64 = std::env::var("QUIESCE_DRAIN_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "QUIESCE_DRAIN_POLL_INTERVAL_MS",
                    "must be a positive integer",
                )
            })?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "QUIESCE_DRAIN_POLL_INTERVAL_MS",
                "must be a positive integer",
            ));
        }

        Ok(Self {
            queue_name,
            queue_options,
            prefetch_count,
            global_prefetch,
            auto_ack,
            drain: DrainConfig {
                timeout: Duration::from_millis(timeout_ms),
                poll_interval: Duration::from_millis(poll_interval_ms),
            },
        })
    }

    /// Set the queue declaration options.
    pub fn with_queue_options(mut self, options: QueueOptions) -> Self {
        self.queue_options = options;
        self
    }

    /// Set the prefetch count (0 = no limit).
    pub fn with_prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    /// Apply the prefetch bound channel-wide.
    pub fn with_global_prefetch(mut self, global: bool) -> Self {
        self.global_prefetch = global;
        self
    }

    /// Acknowledge deliveries on receipt.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    /// Set the drain timeout. Zero disables the timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain.timeout = timeout;
        self
    }

    /// Set the drain poll interval.
    pub fn with_drain_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.drain.poll_interval = poll_interval;
        self
    }
}

fn flag_from_env(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
