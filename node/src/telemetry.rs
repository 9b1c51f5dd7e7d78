// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub const RECORDS_APPENDED: &str = "artemis_records_appended_total";
pub const RECORDS_REPLICATED: &str = "artemis_records_replicated_total";
pub const ACKS_RECEIVED: &str = "artemis_replication_acks_total";
pub const REPLICATION_TIMEOUTS: &str = "artemis_replication_timeouts_total";
pub const RECONNECT_ATTEMPTS: &str = "artemis_replication_reconnects_total";
pub const ROLE_CHANGES: &str = "artemis_role_changes_total";
pub const FENCING_EVENTS: &str = "artemis_fencing_events_total";
pub const PAGING_FAILURES: &str = "artemis_paging_failures_total";
pub const QUEUE_OVERFLOWS: &str = "artemis_replication_queue_overflows_total";
pub const APPLY_FAILURES: &str = "artemis_replication_apply_failures_total";

/// Installs the log subscriber and the Prometheus recorder. Safe to call more
/// than once; only the first call has an effect.
pub fn init_telemetry() {
    if PROM_HANDLE.get().is_some() {
        return;
    }

    let filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| "artemis_node=debug,artemis_journal=info".into()),
    );
    if tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_err()
    {
        tracing::debug!("a global subscriber is already installed");
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROM_HANDLE.set(handle).is_err() {
                tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to install Prometheus recorder");
            return;
        }
    }

    metrics::describe_counter!(RECORDS_APPENDED, "Records appended by clients");
    metrics::describe_counter!(RECORDS_REPLICATED, "Records applied from the live node");
    metrics::describe_counter!(ACKS_RECEIVED, "Acks received from the backup");
    metrics::describe_counter!(REPLICATION_TIMEOUTS, "Synchronous writes whose ack timed out");
    metrics::describe_counter!(RECONNECT_ATTEMPTS, "Replication connection attempts");
    metrics::describe_counter!(ROLE_CHANGES, "Failover role transitions");
    metrics::describe_counter!(FENCING_EVENTS, "Times this node fenced itself");
    metrics::describe_counter!(PAGING_FAILURES, "Page writes that switched an address to memory-only mode");

    metrics::gauge!("artemis_node_up", 1.0);
}

/// Prometheus exposition text.
pub fn render_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
