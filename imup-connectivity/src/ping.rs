//! ICMP reachability engine.
//!
//! Each cycle probes one rotated external target and, when a gateway is
//! configured, the internal target in parallel. The pairing separates WAN
//! outages from LAN outages: an external failure only counts as downtime
//! when the gateway stayed reachable.

use std::{
    collections::HashSet,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    icmp, ping_address, timestamp_nanos, Downtime, Options, PingStats, StatCollector,
};

const EXTERNAL: &str = "external";
const INTERNAL: &str = "internal";

const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// ICMP echo probe engine.
pub struct PingCollector {
    address_internal: String,
    avoid: Mutex<HashSet<String>>,
    client_version: String,
    count: usize,
    delay: Duration,
    interval: Duration,
    timeout: Duration,
}

impl PingCollector {
    #[must_use]
    pub fn new(opts: Options) -> Self {
        Self {
            address_internal: opts.internal_addr,
            avoid: Mutex::new(HashSet::new()),
            client_version: opts.client_version,
            count: opts.count,
            delay: opts.delay,
            interval: opts.interval,
            timeout: opts.timeout,
        }
    }

    /// Pick an external target that answers a one-shot verification ping.
    ///
    /// Unresponsive candidates go on the avoid set and the next candidate
    /// is tried until the list is exhausted.
    async fn verified_target(
        &self,
        token: &CancellationToken,
        addresses: &[String],
    ) -> Option<String> {
        let mut candidates: Vec<String> = addresses.to_vec();

        while !candidates.is_empty() && !token.is_cancelled() {
            let picked = {
                let mut avoid = self.avoid.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                ping_address(&candidates, &mut avoid)?
            };

            match icmp::ping(token, &picked, 1, Duration::ZERO, VERIFY_TIMEOUT).await {
                Ok(stats) if stats.packets_recv > 0 => return Some(picked),
                Ok(_) => {
                    debug!(address = %picked, "avoiding unresponsive external endpoint for next check");
                }
                Err(err) => {
                    warn!(address = %picked, error = %err, "cannot set up external pinger");
                }
            }

            self.avoid
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(picked.clone());
            candidates.retain(|addr| *addr != picked);
        }

        None
    }

    async fn check_external(
        &self,
        token: &CancellationToken,
        addresses: &[String],
        timestamp: i64,
    ) -> (PingStats, bool) {
        let Some(target) = self.verified_target(token, addresses).await else {
            warn!("could not resolve any ping address to run pinger");
            return (self.failed_stats(EXTERNAL, timestamp), false);
        };

        match icmp::ping(token, &target, self.count, self.delay, self.timeout).await {
            Ok(stats) => {
                let success = stats.packets_recv > 0;
                (self.stats_from(EXTERNAL, timestamp, &stats, success, true), success)
            }
            Err(err) => {
                warn!(address = %target, error = %err, "error sending ping");
                (self.failed_stats(EXTERNAL, timestamp), false)
            }
        }
    }

    async fn check_internal(&self, token: &CancellationToken, timestamp: i64) -> (PingStats, bool) {
        // verify the gateway answers at all before the long run
        match icmp::ping(token, &self.address_internal, 1, Duration::ZERO, VERIFY_TIMEOUT).await {
            Ok(stats) if stats.packets_recv > 0 => {}
            Ok(_) => return (self.failed_stats(INTERNAL, timestamp), false),
            Err(err) => {
                warn!(address = %self.address_internal, error = %err, "cannot set up internal pinger");
                return (self.failed_stats(INTERNAL, timestamp), false);
            }
        }

        match icmp::ping(token, &self.address_internal, self.count, self.delay, self.timeout).await
        {
            Ok(stats) => {
                let success = stats.packets_recv > 0;
                (
                    self.stats_from(INTERNAL, timestamp, &stats, success, success),
                    success,
                )
            }
            Err(err) => {
                warn!(address = %self.address_internal, error = %err, "error sending ping");
                (self.failed_stats(INTERNAL, timestamp), false)
            }
        }
    }

    fn stats_from(
        &self,
        endpoint_type: &str,
        timestamp: i64,
        stats: &icmp::EchoStats,
        success: bool,
        success_internal: bool,
    ) -> PingStats {
        let loss = if stats.packet_loss.is_nan() {
            100.0
        } else {
            stats.packet_loss
        };

        PingStats {
            ping_address: stats.addr.clone(),
            success,
            success_internal,
            packets_recv: stats.packets_recv,
            packets_sent: stats.packets_sent,
            packet_loss: loss,
            min_rtt: duration_nanos(stats.min_rtt),
            max_rtt: duration_nanos(stats.max_rtt),
            avg_rtt: duration_nanos(stats.avg_rtt),
            std_dev_rtt: duration_nanos(stats.std_dev_rtt),
            timestamp,
            client_version: self.client_version.clone(),
            os: std::env::consts::OS.to_string(),
            endpoint_type: endpoint_type.to_string(),
        }
    }

    fn failed_stats(&self, endpoint_type: &str, timestamp: i64) -> PingStats {
        PingStats {
            packet_loss: 100.0,
            timestamp,
            client_version: self.client_version.clone(),
            os: std::env::consts::OS.to_string(),
            endpoint_type: endpoint_type.to_string(),
            // external records default the internal comparator to true
            success_internal: endpoint_type == EXTERNAL,
            ..PingStats::default()
        }
    }
}

#[async_trait]
impl StatCollector for PingCollector {
    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&self, token: &CancellationToken, addresses: &[String]) -> Vec<PingStats> {
        let timestamp = timestamp_nanos();

        if self.address_internal.is_empty() {
            let (external, _) = self.check_external(token, addresses, timestamp).await;
            return vec![external];
        }

        let ((mut external, success), (internal, internal_success)) = tokio::join!(
            self.check_external(token, addresses, timestamp),
            self.check_internal(token, timestamp),
        );

        if success {
            return vec![external];
        }

        if internal_success {
            info!(
                gateway = %self.address_internal,
                "no external endpoint could be reached but the gateway was reachable"
            );
        } else {
            info!(
                gateway = %self.address_internal,
                "no external endpoint could be reached and the gateway was unreachable"
            );
        }

        // the external record carries the comparator verdict and must come
        // last so downtime detection sees the cycle's final state
        external.success_internal = internal_success;
        vec![internal, external]
    }

    fn detect_downtime(&self, data: &[PingStats]) -> Downtime {
        let externals: Vec<&PingStats> = data
            .iter()
            .filter(|stats| stats.endpoint_type == EXTERNAL)
            .collect();

        let downtime = externals
            .iter()
            .filter(|stats| !stats.success && stats.success_internal)
            .count();

        let status_changed = externals
            .windows(2)
            .any(|pair| pair[0].success != pair[1].success);

        Downtime {
            status_changed,
            downtime,
        }
    }
}

fn duration_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
