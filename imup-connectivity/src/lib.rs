//! Reachability probe engines.
//!
//! Two engines implement the [`StatCollector`] contract: ICMP echo probes
//! ([`ping::PingCollector`]) with an optional internal-gateway comparator,
//! and TCP dial probes ([`dial::DialCollector`]) for hosts where raw ICMP is
//! unavailable. Both share the semi-random target rotation with a temporary
//! avoid set, and both reduce a window of collected statistics to a
//! downtime summary.

mod icmp;

pub mod dial;
pub mod ping;

use std::{
    collections::HashSet,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use rand::prelude::IndexedRandom;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use dial::DialCollector;
pub use ping::PingCollector;

/// Construction options shared by both probe engines.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Version string stamped onto every measurement.
    pub client_version: String,
    /// Internal gateway target; empty disables the internal comparator.
    pub internal_addr: String,
    /// Echo requests / dial attempts per cycle.
    pub count: usize,
    /// Extra diagnostics for failed attempts.
    pub debug: bool,
    /// Spacing between individual requests within a cycle.
    pub delay: Duration,
    /// Time between cycles; also bounds a whole cycle.
    pub interval: Duration,
    /// Upper bound for one cycle's probing.
    pub timeout: Duration,
}

/// One probe measurement, shaped exactly like the connectivity ingest wire
/// format. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingStats {
    #[serde(rename = "pingAddress", skip_serializing_if = "String::is_empty")]
    pub ping_address: String,
    #[serde(skip_serializing_if = "is_false")]
    pub success: bool,
    #[serde(rename = "packetsRecv", skip_serializing_if = "is_zero_usize")]
    pub packets_recv: usize,
    #[serde(rename = "packetsSent", skip_serializing_if = "is_zero_usize")]
    pub packets_sent: usize,
    #[serde(rename = "packetLoss", skip_serializing_if = "is_zero_f64")]
    pub packet_loss: f64,
    /// RTTs in nanoseconds.
    #[serde(rename = "minRtt", skip_serializing_if = "is_zero_i64")]
    pub min_rtt: i64,
    #[serde(rename = "maxRtt", skip_serializing_if = "is_zero_i64")]
    pub max_rtt: i64,
    #[serde(rename = "avgRtt", skip_serializing_if = "is_zero_i64")]
    pub avg_rtt: i64,
    #[serde(rename = "stdDevRtt", skip_serializing_if = "is_zero_i64")]
    pub std_dev_rtt: i64,
    #[serde(rename = "timestamp", skip_serializing_if = "is_zero_i64")]
    pub timestamp: i64,
    #[serde(rename = "clientVersion", skip_serializing_if = "String::is_empty")]
    pub client_version: String,
    #[serde(rename = "operatingSystem", skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(rename = "endpointType", skip_serializing_if = "String::is_empty")]
    pub endpoint_type: String,
    #[serde(rename = "successInternal", skip_serializing_if = "is_false")]
    pub success_internal: bool,
}

/// Downtime summary over a window of measurements.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Downtime {
    /// Whether consecutive records disagree about reachability.
    pub status_changed: bool,
    /// Number of records counted as WAN downtime.
    pub downtime: usize,
}

/// A connectivity probe engine.
///
/// Future engine variants (HTTP, UDP) plug in behind this same contract.
#[async_trait]
pub trait StatCollector: Send + Sync {
    /// Time the supervisor waits between cycles.
    fn interval(&self) -> Duration;

    /// Run one probe cycle against the external target list.
    async fn collect(&self, token: &CancellationToken, addresses: &[String]) -> Vec<PingStats>;

    /// Reduce an ordered window of measurements to a downtime summary.
    /// Pure: reads the sequence and nothing else.
    fn detect_downtime(&self, data: &[PingStats]) -> Downtime;
}

/// Choose a semi-random probe target from `addresses`, skipping entries in
/// the avoid set. When the avoid set would exhaust the whole list it is
/// cleared and every target becomes eligible again.
#[must_use]
pub fn ping_address(addresses: &[String], avoid: &mut HashSet<String>) -> Option<String> {
    if addresses.is_empty() {
        return None;
    }

    if addresses.iter().all(|addr| avoid.contains(addr)) {
        avoid.clear();
    }

    let eligible: Vec<&String> = addresses
        .iter()
        .filter(|addr| !avoid.contains(*addr))
        .collect();

    eligible.choose(&mut rand::rng()).map(|addr| (*addr).clone())
}

pub(crate) fn timestamp_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addrs(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn rotator_skips_avoided_addresses() {
        let addresses = addrs(&["1.1.1.1", "8.8.8.8", "9.9.9.9"]);
        let mut avoid: HashSet<String> = ["1.1.1.1", "8.8.8.8"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();

        let picked = ping_address(&addresses, &mut avoid).expect("one address remains");
        assert_eq!(picked, "9.9.9.9");
    }

    #[test]
    fn rotator_clears_exhausted_avoid_set() {
        let addresses = addrs(&["1.1.1.1", "8.8.8.8", "9.9.9.9"]);
        let mut avoid: HashSet<String> = addresses.iter().cloned().collect();

        let picked = ping_address(&addresses, &mut avoid).expect("avoid set cleared");
        assert!(addresses.contains(&picked));
        assert!(avoid.is_empty());
    }

    #[test]
    fn rotator_with_empty_list() {
        let mut avoid = HashSet::new();
        assert!(ping_address(&[], &mut avoid).is_none());
    }

    #[test]
    fn rotator_eventually_picks_every_eligible_address() {
        let addresses = addrs(&["1.1.1.1", "8.8.8.8"]);
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let mut avoid = HashSet::new();
            if let Some(addr) = ping_address(&addresses, &mut avoid) {
                seen.insert(addr);
            }
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn stats_serialization_uses_wire_names_and_omits_empty() {
        let stats = PingStats {
            ping_address: "1.1.1.1".to_string(),
            success: true,
            packets_recv: 10,
            packets_sent: 10,
            packet_loss: 0.0,
            min_rtt: 1_000_000,
            max_rtt: 2_000_000,
            avg_rtt: 1_500_000,
            std_dev_rtt: 100_000,
            timestamp: 1_700_000_000_000_000_000,
            client_version: "0.1.0".to_string(),
            os: "linux".to_string(),
            endpoint_type: "external".to_string(),
            success_internal: true,
        };

        let value = serde_json::to_value(&stats).expect("serializes");
        let object = value.as_object().expect("object");
        assert_eq!(object["pingAddress"], "1.1.1.1");
        assert_eq!(object["packetsRecv"], 10);
        assert_eq!(object["minRtt"], 1_000_000);
        assert_eq!(object["endpointType"], "external");
        assert_eq!(object["successInternal"], true);
        // zero loss is omitted, like the rest of the zero values
        assert!(!object.contains_key("packetLoss"));

        let failed = PingStats {
            timestamp: 1,
            packet_loss: 100.0,
            ..PingStats::default()
        };
        let value = serde_json::to_value(&failed).expect("serializes");
        let object = value.as_object().expect("object");
        assert!(!object.contains_key("success"));
        assert!(!object.contains_key("pingAddress"));
        assert_eq!(object["packetLoss"], 100.0);
    }
}
