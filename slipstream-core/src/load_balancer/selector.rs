//! Best-node selection.
//!
//! Selection is deterministic: the highest finite score wins, and exact
//! ties break to the lexicographically lowest URL so behavior is
//! reproducible under test.

use crate::domain::node::SharedNode;
use crate::domain::registry::NodeRegistry;
use crate::load_balancer::affinity::AffinityTable;

/// Picks the best-scoring node among `candidates`.
///
/// Nodes scoring `-inf` (unavailable) never qualify. `weight` is added to
/// every candidate's score before comparison.
fn best_scored<'a, I>(candidates: I, weight: f64) -> Option<SharedNode>
where
    I: Iterator<Item = &'a SharedNode>,
{
    let mut best: Option<(&'a SharedNode, f64)> = None;

    for node in candidates {
        let score = node.score();
        if score == f64::NEG_INFINITY {
            continue;
        }
        let score = score + weight;

        let replace = match best {
            None => true,
            Some((current, current_score)) => {
                score > current_score || (score == current_score && node.url() < current.url())
            }
        };
        if replace {
            best = Some((node, score));
        }
    }

    best.map(|(node, _)| node.clone())
}

/// Returns the node with the maximum score, regardless of free capacity.
///
/// Used by observers and tests; unavailable nodes score `-inf` and are
/// therefore never returned. `None` when the registry is empty or every
/// node is unavailable.
pub fn select_best(registry: &NodeRegistry) -> Option<SharedNode> {
    let nodes = registry.snapshot();
    best_scored(nodes.iter(), 0.0)
}

/// Returns the best available node with at least `required_slots` free.
///
/// This is the admission gate: `None` means the request must queue.
pub fn select_with_capacity(registry: &NodeRegistry, required_slots: u32) -> Option<SharedNode> {
    let nodes = registry.snapshot();
    best_scored(
        nodes
            .iter()
            .filter(|node| node.is_available() && node.free_slots() >= required_slots),
        0.0,
    )
}

/// Like [`select_with_capacity`], skipping the node at `exclude_url`.
///
/// Used by the retry path so the second attempt lands elsewhere.
pub fn select_with_capacity_excluding(
    registry: &NodeRegistry,
    required_slots: u32,
    exclude_url: &str,
) -> Option<SharedNode> {
    let nodes = registry.snapshot();
    best_scored(
        nodes.iter().filter(|node| {
            node.url() != exclude_url
                && node.is_available()
                && node.free_slots() >= required_slots
        }),
        0.0,
    )
}

/// Capacity-aware selection with a soft client binding.
///
/// Prefers the client's previously bound node when it is still registered,
/// available, capacity-eligible, and was used within the affinity window;
/// otherwise falls back to segment-weighted scored selection and records
/// the new binding. Affinity never overrides availability or capacity.
pub fn select_with_affinity(
    registry: &NodeRegistry,
    affinity: &AffinityTable,
    client_key: &str,
    segment: u64,
    required_slots: u32,
) -> Option<SharedNode> {
    if let Some(bound_url) = affinity.bound_node(client_key) {
        if let Some(node) = registry.get(&bound_url) {
            if node.is_available() && node.free_slots() >= required_slots {
                affinity.bind(client_key, node.url());
                return Some(node);
            }
        }
    }

    let weight = (segment.max(1) as f64).sqrt();
    let nodes = registry.snapshot();
    let chosen = best_scored(
        nodes
            .iter()
            .filter(|node| node.is_available() && node.free_slots() >= required_slots),
        weight,
    )?;
    affinity.bind(client_key, chosen.url());
    Some(chosen)
}
