//! Structured logging setup.
//!
//! One-time `tracing-subscriber` initialization driven by [`crate::config::LoggingConfig`].
//! The node loop and p2p handlers open a span per iteration / per message with
//! `batch_id`, `iteration`, and `peer_id` fields so a single iteration's log
//! lines can be correlated (§2.1).

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize the global `tracing` subscriber. Call once from `main`.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let subscriber = fmt().with_env_filter(filter).with_target(true);

    if config.json {
        subscriber.json().init();
    } else {
        subscriber.compact().init();
    }
}

/// Span fields attached to every node-loop iteration, matching the
/// correlation fields named in the ambient-stack expansion.
#[macro_export]
macro_rules! iteration_span {
    ($iteration:expr) => {
        tracing::info_span!("iteration", iteration = $iteration)
    };
}

/// Span fields attached to a batch-scoped operation.
#[macro_export]
macro_rules! batch_span {
    ($batch_id:expr) => {
        tracing::info_span!("batch", batch_id = %$batch_id)
    };
}

/// Span fields attached to a single p2p message exchange.
#[macro_export]
macro_rules! peer_span {
    ($peer_id:expr) => {
        tracing::info_span!("peer", peer_id = %$peer_id)
    };
}
