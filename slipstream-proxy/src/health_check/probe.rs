//! Single-node health and capacity probing.

use std::time::Duration;
use tracing::debug;

use slipstream_core::domain::probe::{
    parse_health_body, parse_slots_body, HealthBody, ProbeReport, FALLBACK_IDLE_SLOTS,
};
use slipstream_core::{Error, Result};

use crate::client::UpstreamClient;

/// Probes one node for health and capacity.
///
/// `GET {node}/health` is authoritative for the status. Legacy backends
/// report slot counts inline; newer ones expose them on `GET {node}/slots`,
/// and when that supplementary call fails the node is assumed to have
/// exactly one idle slot.
pub async fn probe_node(
    client: &UpstreamClient,
    url: &str,
    timeout: Duration,
) -> Result<ProbeReport> {
    let response = client.get(&format!("{url}/health"), timeout).await?;
    if !response.status().is_success() {
        return Err(Error::UnhealthyBackend {
            url: url.to_string(),
            status: format!("http {}", response.status().as_u16()),
        });
    }

    let body = UpstreamClient::read_body(response).await?;
    match parse_health_body(&body)? {
        HealthBody::Complete(report) => Ok(report),
        HealthBody::StatusOnly(status) => {
            let (slots_idle, slots_processing) = match fetch_slots(client, url, timeout).await {
                Ok(counts) => counts,
                Err(err) => {
                    debug!(node = %url, error = %err, "slots probe failed, assuming one idle slot");
                    (FALLBACK_IDLE_SLOTS, 0)
                }
            };
            Ok(ProbeReport {
                status,
                slots_idle,
                slots_processing,
            })
        }
    }
}

async fn fetch_slots(client: &UpstreamClient, url: &str, timeout: Duration) -> Result<(u32, u32)> {
    let response = client.get(&format!("{url}/slots"), timeout).await?;
    if !response.status().is_success() {
        return Err(Error::http(format!(
            "slots endpoint answered http {}",
            response.status().as_u16()
        )));
    }
    let body = UpstreamClient::read_body(response).await?;
    parse_slots_body(&body)
}
