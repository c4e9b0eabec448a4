//! Allow/block list evaluation and CIDR expansion for target lists.

use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

/// Expand a list of addresses, interpreting CIDR entries as every address in
/// the network (network and broadcast addresses included, in increasing
/// order). Entries that do not parse as CIDR are kept as individual
/// addresses; empty entries are dropped.
#[must_use]
pub fn expand_addresses(entries: &[String]) -> Vec<String> {
    let mut hosts = Vec::new();

    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        match entry.parse::<IpNet>() {
            Ok(IpNet::V4(net)) => {
                let start: u32 = net.network().into();
                let end: u32 = net.broadcast().into();
                for addr in start..=end {
                    hosts.push(std::net::Ipv4Addr::from(addr).to_string());
                }
            }
            Ok(IpNet::V6(net)) => {
                let start: u128 = net.network().into();
                let end: u128 = net.broadcast().into();
                for addr in start..=end {
                    hosts.push(std::net::Ipv6Addr::from(addr).to_string());
                }
            }
            Err(err) => {
                if entry.parse::<IpAddr>().is_err() {
                    warn!(address = entry, error = %err, "cannot parse as cidr, assuming individual ip address");
                }
                hosts.push(entry.to_string());
            }
        }
    }

    hosts
}

/// Decide whether the host's public IP should be used for connectivity and
/// speed testing: allowed when the allow list is empty or contains the
/// address, and the block list does not contain it. Empty entries are
/// ignored.
#[must_use]
pub fn ip_monitored(public_ip: &str, allowed: &[String], blocked: &[String]) -> bool {
    ip_allowed(public_ip, allowed) && !ip_blocked(public_ip, blocked)
}

fn ip_allowed(public_ip: &str, ips: &[String]) -> bool {
    let mut allowed = true;
    for entry in ips {
        if entry.is_empty() {
            continue;
        }

        if public_ip == entry {
            return true;
        }

        allowed = false;
    }

    allowed
}

fn ip_blocked(public_ip: &str, ips: &[String]) -> bool {
    ips.iter().any(|entry| !entry.is_empty() && public_ip == entry)
}
