//! Global tunnelkeeper metrics, exposed at `GET /metrics`.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter, IntCounterVec,
    IntGauge,
};

pub static TUNNELS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_tunnels_created_total",
        "Number of tunnels successfully provisioned"
    )
    .expect("Failed to register tunnelkeeper_tunnels_created_total counter")
});

pub static TUNNELS_DESTROYED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tunnelkeeper_tunnels_destroyed_total",
        "Number of tunnels destroyed, by reason",
        &["reason"]
    )
    .expect("Failed to register tunnelkeeper_tunnels_destroyed_total counter")
});

pub static ACTIVE_TUNNELS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "tunnelkeeper_active_tunnels",
        "Number of live (non-terminal) tunnel records"
    )
    .expect("Failed to register tunnelkeeper_active_tunnels gauge")
});

pub static DOWNLOAD_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_download_bytes_total",
        "Bytes attributed to tunnel downloads from the access log"
    )
    .expect("Failed to register tunnelkeeper_download_bytes_total counter")
});

pub static ACCESS_LOG_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tunnelkeeper_access_log_events_total",
        "Access log lines seen by the monitor, by outcome",
        &["outcome"]
    )
    .expect("Failed to register tunnelkeeper_access_log_events_total counter")
});

pub static ACCESS_LOG_ROTATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_access_log_rotations_total",
        "Times the monitor reopened the access log after rotation"
    )
    .expect("Failed to register tunnelkeeper_access_log_rotations_total counter")
});

pub static ACCESS_LOG_CHECKPOINTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_access_log_checkpoints_total",
        "Offset checkpoints persisted to the state store"
    )
    .expect("Failed to register tunnelkeeper_access_log_checkpoints_total counter")
});

pub static EDGE_OPERATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tunnelkeeper_edge_operations_total",
        "Edge provider invocations, by operation and outcome",
        &["op", "outcome"]
    )
    .expect("Failed to register tunnelkeeper_edge_operations_total counter")
});

pub static MONITOR_TICKS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "tunnelkeeper_monitor_ticks_total",
        "Trigger evaluation passes, by outcome",
        &["outcome"]
    )
    .expect("Failed to register tunnelkeeper_monitor_ticks_total counter")
});

pub static MONITOR_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_monitor_errors_total",
        "Errors swallowed by the monitor loops"
    )
    .expect("Failed to register tunnelkeeper_monitor_errors_total counter")
});

pub static TOKENS_MINTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_tokens_minted_total",
        "Capability tokens minted"
    )
    .expect("Failed to register tunnelkeeper_tokens_minted_total counter")
});

pub static TOKENS_CONSUMED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_tokens_consumed_total",
        "Capability tokens successfully consumed"
    )
    .expect("Failed to register tunnelkeeper_tokens_consumed_total counter")
});

pub static TOKENS_REJECTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_tokens_rejected_total",
        "Token presentations rejected as invalid, expired or consumed"
    )
    .expect("Failed to register tunnelkeeper_tokens_rejected_total counter")
});

pub static TOKENS_SWEPT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "tunnelkeeper_tokens_swept_total",
        "Expired token records removed by the sweeper"
    )
    .expect("Failed to register tunnelkeeper_tokens_swept_total counter")
});
