//! Raw-socket ICMP echo sessions.
//!
//! One session sends `count` echo requests at a fixed spacing, collects
//! replies until the deadline and reduces the round trips to summary
//! statistics. The socket work is blocking and runs on the blocking pool;
//! cancellation is observed between packets, so a session ends within one
//! read-timeout slice of the token firing.
//!
//! Raw ICMP sockets need CAP_NET_RAW (or root) on Linux; failure to open
//! the socket surfaces as an error and the caller records a failed probe.

use std::{
    collections::HashMap,
    io::Read,
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

use pnet_packet::{
    icmp::{echo_reply::EchoReplyPacket, echo_request::MutableEchoRequestPacket, IcmpPacket, IcmpTypes},
    ipv4::Ipv4Packet,
    Packet,
};
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

// 8 byte echo header plus payload padding
const ECHO_PACKET_LEN: usize = 32;
const RECV_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub(crate) enum IcmpError {
    #[error("cannot parse ping address {0}")]
    Address(String),

    #[error("only IPv4 targets are supported: {0}")]
    Unsupported(String),

    #[error("icmp socket: {0}")]
    Socket(#[from] std::io::Error),

    #[error("icmp session worker gone: {0}")]
    Join(String),
}

/// Summary of one echo session.
#[derive(Debug, Clone, Default)]
pub(crate) struct EchoStats {
    pub(crate) addr: String,
    pub(crate) packets_sent: usize,
    pub(crate) packets_recv: usize,
    pub(crate) packet_loss: f64,
    pub(crate) min_rtt: Duration,
    pub(crate) max_rtt: Duration,
    pub(crate) avg_rtt: Duration,
    pub(crate) std_dev_rtt: Duration,
}

/// Run one echo session against `addr`.
///
/// # Errors
///
/// Address parse failures, non-IPv4 targets and socket setup failures.
/// A session that sent packets but received nothing is not an error; it
/// comes back as statistics with 100% loss.
pub(crate) async fn ping(
    token: &CancellationToken,
    addr: &str,
    count: usize,
    interval: Duration,
    timeout: Duration,
) -> Result<EchoStats, IcmpError> {
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| IcmpError::Address(addr.to_string()))?;
    let IpAddr::V4(ipv4) = ip else {
        return Err(IcmpError::Unsupported(addr.to_string()));
    };

    let token = token.clone();
    let addr = addr.to_string();

    tokio::task::spawn_blocking(move || echo_session(&token, &addr, ipv4, count, interval, timeout))
        .await
        .map_err(|err| IcmpError::Join(err.to_string()))?
}

fn echo_session(
    token: &CancellationToken,
    addr: &str,
    ip: std::net::Ipv4Addr,
    count: usize,
    interval: Duration,
    timeout: Duration,
) -> Result<EchoStats, IcmpError> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_read_timeout(Some(RECV_SLICE))?;
    let target = SocketAddr::new(IpAddr::V4(ip), 0);
    socket.connect(&target.into())?;

    let ident = (std::process::id() & 0xffff) as u16;
    let start = Instant::now();
    let deadline = start + timeout;

    let mut sent = 0_usize;
    let mut inflight: HashMap<u16, Instant> = HashMap::new();
    let mut rtts: Vec<Duration> = Vec::with_capacity(count);
    let mut next_send = Instant::now();
    let mut recv_buf = [0_u8; 1600];

    while Instant::now() < deadline && !token.is_cancelled() {
        if sent < count && Instant::now() >= next_send {
            let seq = u16::try_from(sent % usize::from(u16::MAX)).unwrap_or_default();
            send_echo(&socket, ident, seq)?;
            inflight.insert(seq, Instant::now());
            sent += 1;
            next_send = Instant::now() + interval;
        }

        match (&socket).read(&mut recv_buf) {
            Ok(len) => {
                if let Some(seq) = parse_echo_reply(&recv_buf[..len], ident) {
                    if let Some(sent_at) = inflight.remove(&seq) {
                        let rtt = sent_at.elapsed();
                        trace!(addr, seq, ?rtt, "echo reply");
                        rtts.push(rtt);
                    }
                }
            }
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }

        if sent == count && inflight.is_empty() {
            break;
        }
    }

    Ok(summarize(addr, sent, &rtts))
}

fn send_echo(socket: &Socket, ident: u16, seq: u16) -> Result<(), std::io::Error> {
    let mut buf = [0_u8; ECHO_PACKET_LEN];

    {
        let mut packet = MutableEchoRequestPacket::new(&mut buf)
            .ok_or_else(|| std::io::Error::other("echo request buffer too small"))?;
        packet.set_icmp_type(IcmpTypes::EchoRequest);
        packet.set_identifier(ident);
        packet.set_sequence_number(seq);
    }

    let checksum = IcmpPacket::new(&buf)
        .map(|packet| pnet_packet::icmp::checksum(&packet))
        .unwrap_or_default();

    if let Some(mut packet) = MutableEchoRequestPacket::new(&mut buf) {
        packet.set_checksum(checksum);
    }

    socket.send(&buf)?;
    Ok(())
}

/// Pull the sequence number out of an echo reply addressed to us. Raw
/// ICMPv4 sockets deliver the full IP datagram, so the IP header is
/// stripped first.
fn parse_echo_reply(datagram: &[u8], ident: u16) -> Option<u16> {
    let ip = Ipv4Packet::new(datagram)?;
    let reply = EchoReplyPacket::new(ip.payload())?;

    if reply.get_icmp_type() != IcmpTypes::EchoReply || reply.get_identifier() != ident {
        return None;
    }

    Some(reply.get_sequence_number())
}

fn summarize(addr: &str, sent: usize, rtts: &[Duration]) -> EchoStats {
    let recv = rtts.len();
    let loss = if sent == 0 {
        100.0
    } else {
        #[allow(clippy::cast_precision_loss)]
        let loss = (sent - recv) as f64 / sent as f64 * 100.0;
        loss
    };

    let mut stats = EchoStats {
        addr: addr.to_string(),
        packets_sent: sent,
        packets_recv: recv,
        packet_loss: loss,
        ..EchoStats::default()
    };

    if rtts.is_empty() {
        return stats;
    }

    let total: Duration = rtts.iter().sum();
    stats.min_rtt = rtts.iter().min().copied().unwrap_or_default();
    stats.max_rtt = rtts.iter().max().copied().unwrap_or_default();
    stats.avg_rtt = total / u32::try_from(rtts.len()).unwrap_or(1);

    let avg_secs = stats.avg_rtt.as_secs_f64();
    #[allow(clippy::cast_precision_loss)]
    let variance = rtts
        .iter()
        .map(|rtt| {
            let diff = rtt.as_secs_f64() - avg_secs;
            diff * diff
        })
        .sum::<f64>()
        / rtts.len() as f64;
    stats.std_dev_rtt = Duration::from_secs_f64(variance.sqrt());

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_statistics() {
        let rtts = [
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(30),
        ];
        let stats = summarize("1.1.1.1", 4, &rtts);

        assert_eq!(stats.packets_sent, 4);
        assert_eq!(stats.packets_recv, 3);
        assert!((stats.packet_loss - 25.0).abs() < f64::EPSILON);
        assert_eq!(stats.min_rtt, Duration::from_millis(10));
        assert_eq!(stats.max_rtt, Duration::from_millis(30));
        assert_eq!(stats.avg_rtt, Duration::from_millis(20));
        // population standard deviation of 10/20/30ms
        let expected = (200.0_f64 / 3.0).sqrt() / 1_000.0;
        assert!((stats.std_dev_rtt.as_secs_f64() - expected).abs() < 1e-9);
    }

    #[test]
    fn summary_with_no_replies() {
        let stats = summarize("1.1.1.1", 5, &[]);
        assert_eq!(stats.packets_recv, 0);
        assert!((stats.packet_loss - 100.0).abs() < f64::EPSILON);
        assert_eq!(stats.min_rtt, Duration::ZERO);
    }

    #[test]
    fn summary_with_nothing_sent_is_total_loss() {
        let stats = summarize("1.1.1.1", 0, &[]);
        assert!((stats.packet_loss - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn echo_reply_parsing_checks_identity() {
        // hand-built IPv4 header (20 bytes) + ICMP echo reply
        let mut datagram = vec![0_u8; 20 + 8];
        datagram[0] = 0x45; // version 4, ihl 5
        datagram[2] = 0;
        datagram[3] = 28; // total length
        datagram[9] = 1; // protocol icmp
        datagram[20] = 0; // type echo reply
        datagram[24] = 0x12; // identifier
        datagram[25] = 0x34;
        datagram[26] = 0x00; // sequence
        datagram[27] = 0x07;

        assert_eq!(parse_echo_reply(&datagram, 0x1234), Some(7));
        assert_eq!(parse_echo_reply(&datagram, 0x9999), None);

        datagram[20] = 8; // echo request, not a reply
        assert_eq!(parse_echo_reply(&datagram, 0x1234), None);
    }
}
