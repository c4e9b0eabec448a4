//! Minimal NDT7 protocol client.
//!
//! Speaks just enough of the NDT7 websocket protocol for the driver in
//! [`crate`]: locate a nearby server through M-Lab's locate service, run a
//! ~10 second download phase draining frames, run a ~10 second upload phase
//! pushing binary frames, and surface the server's final TCP-info counters
//! plus the client's application-level byte counts.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest, http::HeaderValue, protocol::Message,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Options, SpeedTestError};

const LOCATE_URL: &str = "https://locate.measurementlab.net/v2/nearest/ndt/ndt7";
const WS_PROTOCOL: &str = "net.measurementlab.ndt.v7";

const PHASE_DURATION: Duration = Duration::from_secs(10);
const PHASE_DEADLINE: Duration = Duration::from_secs(15);

const UPLOAD_MESSAGE_MIN: usize = 1 << 13;
const UPLOAD_MESSAGE_MAX: usize = 1 << 20;

/// Server-side TCP counters, as reported in NDT7 measurement frames.
/// Times are microseconds, sizes are bytes.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct TcpInfo {
    #[serde(rename = "BytesSent")]
    pub bytes_sent: i64,
    #[serde(rename = "BytesReceived")]
    pub bytes_received: i64,
    #[serde(rename = "BytesRetrans")]
    pub bytes_retrans: i64,
    #[serde(rename = "MinRTT")]
    pub min_rtt: i64,
    #[serde(rename = "RTTVar")]
    pub rtt_var: i64,
    #[serde(rename = "ElapsedTime")]
    pub elapsed_time: i64,
}

/// Flow identity echoed by the server.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionInfo {
    #[serde(rename = "Client")]
    pub client: String,
    #[serde(rename = "Server")]
    pub server: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct Measurement {
    #[serde(rename = "TCPInfo")]
    tcp_info: Option<TcpInfo>,
    #[serde(rename = "ConnectionInfo")]
    connection_info: Option<ConnectionInfo>,
}

/// Outcome of one test phase: the client's application-level accounting
/// plus the server's last measurement frame.
#[derive(Debug, Clone, Default)]
pub struct PhaseResult {
    /// Application-level elapsed time, microseconds.
    pub app_elapsed_us: i64,
    /// Application-level bytes moved.
    pub app_num_bytes: i64,
    pub tcp_info: Option<TcpInfo>,
    pub connection_info: Option<ConnectionInfo>,
}

/// A located NDT7 server with its phase URLs.
#[derive(Debug, Clone)]
pub(crate) struct Target {
    pub(crate) fqdn: String,
    pub(crate) download_url: String,
    pub(crate) upload_url: String,
}

#[derive(Debug, Deserialize)]
struct LocateResponse {
    results: Vec<LocateResult>,
}

#[derive(Debug, Deserialize)]
struct LocateResult {
    machine: String,
    urls: HashMap<String, String>,
}

/// Ask the locate service for the nearest NDT7 server.
pub(crate) async fn locate(client: &reqwest::Client, opts: &Options) -> Result<Target, SpeedTestError> {
    let response: LocateResponse = client
        .get(LOCATE_URL)
        .send()
        .await
        .map_err(|err| SpeedTestError::Locate(err.to_string()))?
        .json()
        .await
        .map_err(|err| SpeedTestError::Locate(err.to_string()))?;

    let result = response
        .results
        .into_iter()
        .next()
        .ok_or_else(|| SpeedTestError::Locate("locate returned no servers".to_string()))?;

    let scheme = if opts.insecure { "ws" } else { "wss" };
    let download_key = format!("{scheme}:///ndt/v7/download");
    let upload_key = format!("{scheme}:///ndt/v7/upload");

    let download_url = result
        .urls
        .get(&download_key)
        .cloned()
        .ok_or_else(|| SpeedTestError::Locate(format!("no {download_key} url for server")))?;
    let upload_url = result
        .urls
        .get(&upload_key)
        .cloned()
        .ok_or_else(|| SpeedTestError::Locate(format!("no {upload_key} url for server")))?;

    Ok(Target {
        fqdn: result.machine,
        download_url,
        upload_url,
    })
}

/// Run the download phase: drain frames until the server closes, counting
/// received bytes and keeping the server's latest measurement.
pub(crate) async fn download(
    token: &CancellationToken,
    url: &str,
) -> Result<PhaseResult, SpeedTestError> {
    let mut stream = connect(url).await?;

    let start = Instant::now();
    let deadline = start + PHASE_DEADLINE;
    let mut result = PhaseResult::default();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let frame = tokio::select! {
            frame = tokio::time::timeout(remaining, stream.next()) => frame,
            () = token.cancelled() => break,
        };

        match frame {
            Ok(Some(Ok(Message::Binary(payload)))) => {
                result.app_num_bytes += payload.len() as i64;
            }
            Ok(Some(Ok(Message::Text(payload)))) => {
                result.app_num_bytes += payload.len() as i64;
                absorb_measurement(&mut result, &payload);
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(err))) => {
                return Err(SpeedTestError::WebSocket(err.to_string()));
            }
            Err(_) => break,
        }
    }

    result.app_elapsed_us = elapsed_us(start);
    let _ = stream.close(None).await;

    debug!(
        bytes = result.app_num_bytes,
        elapsed_us = result.app_elapsed_us,
        "download phase complete"
    );

    Ok(result)
}

/// Run the upload phase: push binary frames for the phase duration while
/// absorbing the server's measurement frames.
pub(crate) async fn upload(token: &CancellationToken, url: &str) -> Result<PhaseResult, SpeedTestError> {
    let stream = connect(url).await?;
    let (mut sink, mut source) = stream.split();

    let start = Instant::now();
    let mut result = PhaseResult::default();
    let mut message_size = UPLOAD_MESSAGE_MIN;

    while start.elapsed() < PHASE_DURATION && !token.is_cancelled() {
        // scale the message up as more data flows so framing overhead
        // stays negligible on fast links
        if message_size < UPLOAD_MESSAGE_MAX
            && (result.app_num_bytes / 16) > i64::try_from(message_size).unwrap_or(i64::MAX)
        {
            message_size *= 2;
        }

        let payload = vec![0_u8; message_size];
        tokio::select! {
            sent = sink.send(Message::Binary(payload.into())) => {
                if let Err(err) = sent {
                    return Err(SpeedTestError::WebSocket(err.to_string()));
                }
                result.app_num_bytes += message_size as i64;
            }
            () = token.cancelled() => break,
        }

        // drain whatever the server has said so far without blocking the
        // send loop
        while let Some(frame) = source.next().now_or_never().flatten() {
            match frame {
                Ok(Message::Text(payload)) => absorb_measurement(&mut result, &payload),
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }

    result.app_elapsed_us = elapsed_us(start);
    let _ = sink.close().await;

    // collect any final measurements the server flushed at close
    let drain_deadline = Instant::now() + Duration::from_secs(1);
    while let Ok(Some(Ok(frame))) = tokio::time::timeout(
        drain_deadline.saturating_duration_since(Instant::now()),
        source.next(),
    )
    .await
    {
        if let Message::Text(payload) = frame {
            absorb_measurement(&mut result, &payload);
        }
    }

    debug!(
        bytes = result.app_num_bytes,
        elapsed_us = result.app_elapsed_us,
        "upload phase complete"
    );

    Ok(result)
}

async fn connect(
    url: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    SpeedTestError,
> {
    let mut request = url
        .into_client_request()
        .map_err(|err| SpeedTestError::WebSocket(err.to_string()))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(WS_PROTOCOL),
    );

    let handshake = tokio_tungstenite::connect_async(request);
    let (stream, _) = tokio::time::timeout(Duration::from_secs(10), handshake)
        .await
        .map_err(|_| SpeedTestError::WebSocket("websocket handshake timed out".to_string()))?
        .map_err(|err| SpeedTestError::WebSocket(err.to_string()))?;

    Ok(stream)
}

fn absorb_measurement(result: &mut PhaseResult, payload: &str) {
    match serde_json::from_str::<Measurement>(payload) {
        Ok(measurement) => {
            if measurement.tcp_info.is_some() {
                result.tcp_info = measurement.tcp_info;
            }
            if measurement.connection_info.is_some() {
                result.connection_info = measurement.connection_info;
            }
        }
        Err(err) => debug!(error = %err, "ignoring unparsable measurement frame"),
    }
}

fn elapsed_us(start: Instant) -> i64 {
    i64::try_from(start.elapsed().as_micros()).unwrap_or(i64::MAX)
}
