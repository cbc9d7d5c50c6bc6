//! Health-monitor reconciliation behavior.

mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use slipstream_core::load_balancer::selector::select_best;
use slipstream_proxy::health_check::monitor::run_pass;

#[tokio::test]
async fn three_failed_probes_evict_the_node() {
    let backend = Arc::new(BackendControl::default());
    backend.health_fails.store(true, Ordering::SeqCst);
    let url = spawn_backend(Arc::clone(&backend)).await;

    let state = test_state(test_config());
    add_node(&state, &url, 2);

    run_pass(&state).await;
    assert!(state.registry.contains(&url), "one failure keeps the node");
    run_pass(&state).await;
    assert!(state.registry.contains(&url), "two failures keep the node");
    run_pass(&state).await;

    assert!(!state.registry.contains(&url), "third failure evicts");
    assert!(select_best(&state.registry).is_none());
    assert!(state.store.load_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn accepted_probe_refreshes_capacity_and_recovers_availability() {
    let backend = Arc::new(BackendControl::default());
    backend.slots_idle.store(3, Ordering::SeqCst);
    backend.slots_processing.store(1, Ordering::SeqCst);
    let url = spawn_backend(Arc::clone(&backend)).await;

    let state = test_state(test_config());
    let node = add_node(&state, &url, 1);
    node.set_available(false);

    run_pass(&state).await;

    assert!(node.is_available(), "probe-driven recovery is the default");
    assert_eq!(node.capacity_slots(), 3);
    assert_eq!(node.slots_processing(), 1);
    // The pass persists the refreshed snapshot.
    let persisted = state.store.load_all().await.unwrap();
    assert_eq!(persisted[&node.url().to_string()].capacity_slots, 3);
}

#[tokio::test]
async fn recovery_can_be_disabled_by_policy() {
    let backend = Arc::new(BackendControl::default());
    let url = spawn_backend(Arc::clone(&backend)).await;

    let mut config = test_config();
    config.probe_recovery = false;
    let state = test_state(config);
    let node = add_node(&state, &url, 1);
    node.set_available(false);

    run_pass(&state).await;

    assert!(!node.is_available(), "accepted probe must not recover");
    assert!(state.registry.contains(&url));
}

#[tokio::test]
async fn status_only_health_falls_back_to_the_slots_endpoint() {
    let backend = Arc::new(BackendControl::default());
    backend.health_without_slots.store(true, Ordering::SeqCst);
    backend.slots_idle.store(2, Ordering::SeqCst);
    backend.slots_processing.store(1, Ordering::SeqCst);
    let url = spawn_backend(Arc::clone(&backend)).await;

    let state = test_state(test_config());
    let node = add_node(&state, &url, 1);

    run_pass(&state).await;

    assert_eq!(node.capacity_slots(), 2);
    assert_eq!(node.slots_processing(), 1);
}

#[tokio::test]
async fn failing_slots_endpoint_assumes_one_idle_slot() {
    let backend = Arc::new(BackendControl::default());
    backend.health_without_slots.store(true, Ordering::SeqCst);
    backend.slots_fails.store(true, Ordering::SeqCst);
    backend.slots_idle.store(7, Ordering::SeqCst);
    let url = spawn_backend(Arc::clone(&backend)).await;

    let state = test_state(test_config());
    let node = add_node(&state, &url, 3);

    run_pass(&state).await;

    assert_eq!(node.capacity_slots(), 1, "conservative fallback");
    assert!(node.is_available());
}

#[tokio::test]
async fn unhealthy_status_marks_unavailable_without_immediate_eviction() {
    let backend = Arc::new(BackendControl::default());
    *backend.health_status.lock().unwrap() = "loading model".to_string();
    let url = spawn_backend(Arc::clone(&backend)).await;

    let state = test_state(test_config());
    let node = add_node(&state, &url, 2);

    run_pass(&state).await;

    assert!(!node.is_available());
    assert_eq!(node.consecutive_failures(), 1);
    assert!(state.registry.contains(&url));
}

#[tokio::test]
async fn fresh_probes_are_not_repeated_within_the_minimum_age() {
    let backend = Arc::new(BackendControl::default());
    backend.health_fails.store(true, Ordering::SeqCst);
    let url = spawn_backend(Arc::clone(&backend)).await;

    let mut config = test_config();
    config.probe_min_age_ms = 5_000;
    let state = test_state(config);
    let node = add_node(&state, &url, 1);
    node.touch_health_check();

    run_pass(&state).await;

    // The node was just checked, so the failing probe never ran.
    assert_eq!(node.consecutive_failures(), 0);
    assert!(node.is_available());
}
