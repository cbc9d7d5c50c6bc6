//! Probe payload parsing.
//!
//! Backends answer `GET /health` in one of two generations: legacy bodies
//! carry `slots_idle` / `slots_processing` inline, newer ones only carry a
//! status and expose slot detail on `GET /slots`. Both shapes normalize
//! into a [`ProbeReport`]; anything else is a parse failure, not a crash.

use serde::Deserialize;
use std::fmt;

use crate::error::{Error, Result};

/// Idle slots assumed when both `/health` detail and `/slots` are missing.
pub const FALLBACK_IDLE_SLOTS: u32 = 1;

/// Health status reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    /// Backend is serving and has free capacity.
    Ok,
    /// Backend is serving but every slot is busy.
    NoSlotAvailable,
    /// Any other status string; never accepted.
    Other(String),
}

impl HealthStatus {
    /// Whether this status keeps the node in the pool.
    pub fn accepted(&self) -> bool {
        matches!(self, HealthStatus::Ok | HealthStatus::NoSlotAvailable)
    }

    /// The wire representation of the status.
    pub fn as_str(&self) -> &str {
        match self {
            HealthStatus::Ok => "ok",
            HealthStatus::NoSlotAvailable => "no slot available",
            HealthStatus::Other(status) => status,
        }
    }
}

impl From<&str> for HealthStatus {
    fn from(status: &str) -> Self {
        match status {
            "ok" => HealthStatus::Ok,
            "no slot available" => HealthStatus::NoSlotAvailable,
            other => HealthStatus::Other(other.to_string()),
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized outcome of probing one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Status the node reported.
    pub status: HealthStatus,
    /// Idle slot count.
    pub slots_idle: u32,
    /// Busy slot count.
    pub slots_processing: u32,
}

/// A parsed `/health` body, before slot counts are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthBody {
    /// Legacy shape: status and slot counts in one payload.
    Complete(ProbeReport),
    /// New shape: status only; slot detail lives on `/slots`.
    StatusOnly(HealthStatus),
}

#[derive(Deserialize)]
struct RawHealth {
    status: String,
    slots_idle: Option<u32>,
    slots_processing: Option<u32>,
}

#[derive(Deserialize)]
struct RawSlot {
    state: i64,
}

/// Parses a `/health` response body.
pub fn parse_health_body(body: &[u8]) -> Result<HealthBody> {
    let raw: RawHealth = serde_json::from_slice(body).map_err(Error::probe_parse)?;
    let status = HealthStatus::from(raw.status.as_str());

    match (raw.slots_idle, raw.slots_processing) {
        (Some(slots_idle), Some(slots_processing)) => Ok(HealthBody::Complete(ProbeReport {
            status,
            slots_idle,
            slots_processing,
        })),
        _ => Ok(HealthBody::StatusOnly(status)),
    }
}

/// Parses a `/slots` response body into `(idle, busy)` counts.
///
/// A slot with `state == 0` is idle, anything else is busy.
pub fn parse_slots_body(body: &[u8]) -> Result<(u32, u32)> {
    let slots: Vec<RawSlot> = serde_json::from_slice(body).map_err(Error::probe_parse)?;
    let idle = slots.iter().filter(|slot| slot.state == 0).count() as u32;
    let busy = slots.len() as u32 - idle;
    Ok((idle, busy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_health_body_carries_slot_counts() {
        let body = br#"{"status":"ok","slots_idle":3,"slots_processing":2}"#;
        let parsed = parse_health_body(body).unwrap();
        assert_eq!(
            parsed,
            HealthBody::Complete(ProbeReport {
                status: HealthStatus::Ok,
                slots_idle: 3,
                slots_processing: 2,
            })
        );
    }

    #[test]
    fn new_health_body_is_status_only() {
        let body = br#"{"status":"no slot available"}"#;
        let parsed = parse_health_body(body).unwrap();
        assert_eq!(
            parsed,
            HealthBody::StatusOnly(HealthStatus::NoSlotAvailable)
        );
    }

    #[test]
    fn unknown_status_is_never_accepted() {
        let body = br#"{"status":"loading model"}"#;
        match parse_health_body(body).unwrap() {
            HealthBody::StatusOnly(status) => {
                assert!(!status.accepted());
                assert_eq!(status.as_str(), "loading model");
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn malformed_health_body_is_a_parse_error() {
        assert!(matches!(
            parse_health_body(b"not json"),
            Err(Error::ProbeParse { .. })
        ));
        assert!(matches!(
            parse_health_body(br#"{"slots_idle":1}"#),
            Err(Error::ProbeParse { .. })
        ));
    }

    #[test]
    fn slots_body_splits_idle_and_busy() {
        let body = br#"[{"state":0},{"state":1},{"state":0},{"state":2}]"#;
        assert_eq!(parse_slots_body(body).unwrap(), (2, 2));
    }

    #[test]
    fn slots_body_tolerates_extra_fields() {
        let body = br#"[{"id":0,"state":0,"prompt":""}]"#;
        assert_eq!(parse_slots_body(body).unwrap(), (1, 0));
    }
}
