//! Observability for plockd.
//!
//! Provides logging initialization and metric recording helpers.

use crate::config::ObservabilityConfig;
use crate::error::{PlockError, Result};
use crate::types::OpKind;
use metrics::{counter, gauge};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| PlockError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| PlockError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Register standard metrics.
pub fn register_metrics() {
    counter!("plockd_ops_read_total").absolute(0);
    counter!("plockd_messages_total").absolute(0);
    counter!("plockd_rate_delays_total").absolute(0);
    counter!("plockd_purged_total").absolute(0);
    gauge!("plockd_resources").set(0.0);
}

/// Record one lock operation read from the kernel channel.
pub fn record_op_read(kind: OpKind) {
    counter!("plockd_ops_read_total", "op" => kind.tag()).increment(1);
}

/// Record one delivered plock-class message.
pub fn record_message(kind: &'static str) {
    counter!("plockd_messages_total", "kind" => kind).increment(1);
}

/// Record a rate-limit stall of the kernel channel.
pub fn record_rate_delay() {
    counter!("plockd_rate_delays_total").increment(1);
}

/// Record purged lock/waiter entries.
pub fn record_purged(count: usize) {
    counter!("plockd_purged_total").increment(count as u64);
}

/// Update the resource-count gauge for a mount group.
pub fn update_resource_count(group: &str, count: usize) {
    gauge!("plockd_resources", "group" => group.to_string()).set(count as f64);
}
