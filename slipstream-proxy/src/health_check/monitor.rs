//! Background health monitor.
//!
//! Runs on a fixed cadence, probing every node whose last check has aged
//! past the configured minimum. Probes to different nodes run
//! concurrently; a pass never blocks request handling. Monitor failures
//! are logged and absorbed — they never surface to a client request.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, warn};

use slipstream_core::domain::node::{
    now_epoch_ms, SharedNode, PROBE_FAILURE_EVICTION_THRESHOLD,
};
use slipstream_core::Error;

use crate::health_check::probe::probe_node;
use crate::AppState;

/// Spawns the periodic reconciliation task.
pub fn spawn_health_monitor(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let check_interval = state.config.health_check_interval();

    tokio::spawn(async move {
        let mut interval = time::interval(check_interval);

        // Prevent immediately ticking when spawned
        interval.tick().await;

        loop {
            interval.tick().await;
            run_pass(&state).await;
        }
    })
}

/// Runs one reconciliation pass over the registry.
///
/// Exposed so tests can drive passes without waiting out the cadence.
pub async fn run_pass(state: &Arc<AppState>) {
    let nodes = state.registry.snapshot();
    if nodes.is_empty() {
        return;
    }

    let now = now_epoch_ms();
    let mut probes = JoinSet::new();
    for node in nodes.iter() {
        if !node.probe_due(state.config.probe_min_age_ms, now) {
            continue;
        }
        let state = Arc::clone(state);
        let node = Arc::clone(node);
        probes.spawn(async move {
            probe_and_update(&state, node).await;
        });
    }
    while probes.join_next().await.is_some() {}

    // Full-snapshot save; the registry is expected to stay small.
    if let Err(err) = state.persist_registry().await {
        warn!(error = %err, "failed to persist node snapshots");
    }

    // Refreshed capacity may unblock parked requests.
    state.queue.drain(&state.registry);
}

async fn probe_and_update(state: &Arc<AppState>, node: SharedNode) {
    match probe_node(&state.client, node.url(), state.config.probe_timeout()).await {
        Ok(report) if report.status.accepted() => {
            node.apply_probe(&report, state.config.probe_recovery);
            debug!(
                node = %node.url(),
                status = %report.status,
                slots_idle = report.slots_idle,
                slots_processing = report.slots_processing,
                "probe succeeded"
            );
        }
        Ok(report) => {
            record_probe_failure(
                state,
                &node,
                Error::UnhealthyBackend {
                    url: node.url().to_string(),
                    status: report.status.to_string(),
                },
            )
            .await;
        }
        Err(err) => {
            record_probe_failure(state, &node, err).await;
        }
    }
}

async fn record_probe_failure(state: &Arc<AppState>, node: &SharedNode, err: Error) {
    node.touch_health_check();
    let failures = node.record_probe_failure();
    warn!(node = %node.url(), error = %err, failures, "health probe failed");

    if failures >= PROBE_FAILURE_EVICTION_THRESHOLD {
        state.registry.remove(node.url());
        if let Err(err) = state.store.remove_one(node.url()).await {
            warn!(node = %node.url(), error = %err, "failed to remove node from store");
        }
        info!(node = %node.url(), failures, "node evicted after repeated probe failures");
    }
}
