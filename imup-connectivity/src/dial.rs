//! TCP dial engine, used where ICMP is disabled or unavailable.
//!
//! Reachability is scored by opening and closing TCP connections to the
//! target's DNS port: +1 for every successful connect, -1 for every
//! failure. A positive score after a full cycle counts as connectivity.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ping_address, timestamp_nanos, Downtime, Options, PingStats, StatCollector};

const DIAL_PORT: u16 = 53;

/// TCP connect probe engine.
pub struct DialCollector {
    avoid: Mutex<HashSet<String>>,
    client_version: String,
    count: usize,
    debug: bool,
    port: u16,
    delay: Duration,
    interval: Duration,
    timeout: Duration,
}

impl DialCollector {
    #[must_use]
    pub fn new(opts: Options) -> Self {
        Self {
            avoid: Mutex::new(HashSet::new()),
            client_version: opts.client_version,
            count: opts.count,
            debug: opts.debug,
            port: DIAL_PORT,
            delay: opts.delay,
            interval: opts.interval,
            timeout: opts.timeout,
        }
    }

    /// Run one cycle of connect attempts, returning the cumulative score.
    async fn check_connectivity(&self, token: &CancellationToken, address: &str) -> i64 {
        let mut connected = 0_i64;
        let mut ticker = tokio::time::interval(self.delay);
        ticker.tick().await;

        for _ in 0..self.count {
            tokio::select! {
                _ = ticker.tick() => {
                    connected += match self.dial(address).await {
                        Ok(()) => 1,
                        Err(err) => {
                            if self.debug {
                                warn!(address, error = %err, "dialer failed");
                            }
                            -1
                        }
                    };
                }
                () = token.cancelled() => {
                    debug!("shutdown detected, canceling connectivity check");
                    break;
                }
            }
        }

        connected
    }

    async fn dial(&self, address: &str) -> std::io::Result<()> {
        let target: SocketAddr = format!("{}:{}", address, self.port)
            .parse()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err))?;

        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(target))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        drop(stream);

        Ok(())
    }
}

#[async_trait]
impl StatCollector for DialCollector {
    fn interval(&self) -> Duration {
        self.interval
    }

    async fn collect(&self, token: &CancellationToken, addresses: &[String]) -> Vec<PingStats> {
        let picked = {
            let mut avoid = self
                .avoid
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            ping_address(addresses, &mut avoid)
        };

        let Some(address) = picked else {
            warn!("no dial addresses configured");
            return vec![PingStats {
                timestamp: timestamp_nanos(),
                client_version: self.client_version.clone(),
                os: std::env::consts::OS.to_string(),
                ..PingStats::default()
            }];
        };

        let connected = self.check_connectivity(token, &address).await;
        debug!(result = connected, "check connectivity");

        if connected < 0 {
            info!(address = %address, "unable to verify connectivity, avoid ip next check");
            self.avoid
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(address.clone());
        }

        vec![PingStats {
            ping_address: address,
            success: connected > 0,
            timestamp: timestamp_nanos(),
            client_version: self.client_version.clone(),
            os: std::env::consts::OS.to_string(),
            ..PingStats::default()
        }]
    }

    fn detect_downtime(&self, data: &[PingStats]) -> Downtime {
        let downtime = data.iter().filter(|stats| !stats.success).count();
        let status_changed = data
            .windows(2)
            .any(|pair| pair[0].success != pair[1].success);

        Downtime {
            status_changed,
            downtime,
        }
    }
}
