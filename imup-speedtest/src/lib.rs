//! NDT7 speed-test driver.
//!
//! [`SpeedTester::run`] drives one download + upload measurement against a
//! located M-Lab server, guaranteeing at most one test in flight per
//! process. Failed runs are retried with a normally distributed wait whose
//! mean doubles per retry, per the NDT7 non-interactive client
//! requirements.

mod ndt7;

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use imup_common::backoff;

pub use ndt7::{ConnectionInfo, PhaseResult, TcpInfo};

const MAX_RETRIES: u32 = 10;
const RETRY_MEAN_START_SECS: f64 = 60.0;

#[derive(Debug, Error)]
pub enum SpeedTestError {
    #[error("cannot locate an ndt7 server: {0}")]
    Locate(String),

    #[error("websocket failure: {0}")]
    WebSocket(String),

    #[error("speed test cancelled")]
    Cancelled,

    #[error("error running speed test after {retries} retries: {last}")]
    Exhausted { retries: u32, last: String },
}

/// Per-run options.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Use `ws://` instead of `wss://`.
    pub insecure: bool,
    /// Version string stamped onto the result.
    pub client_version: String,
}

/// Speed-test summary in the ingest wire shape. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedTestResult {
    #[serde(rename = "downloadMbps", skip_serializing_if = "is_zero")]
    pub download_mbps: f64,
    #[serde(rename = "downloadedBytes", skip_serializing_if = "is_zero")]
    pub downloaded_bytes: f64,
    #[serde(rename = "downloadRetrans", skip_serializing_if = "is_zero")]
    pub download_retrans: f64,
    #[serde(rename = "downloadMinRTT", skip_serializing_if = "is_zero")]
    pub download_min_rtt: f64,
    #[serde(rename = "downloadRTTVar", skip_serializing_if = "is_zero")]
    pub download_rtt_var: f64,

    #[serde(rename = "uploadMbps", skip_serializing_if = "is_zero")]
    pub upload_mbps: f64,
    #[serde(rename = "uploadedBytes", skip_serializing_if = "is_zero")]
    pub uploaded_bytes: f64,
    #[serde(rename = "uploadRetrans", skip_serializing_if = "is_zero")]
    pub upload_retrans: f64,
    #[serde(rename = "uploadMinRTT", skip_serializing_if = "is_zero")]
    pub upload_min_rtt: f64,
    #[serde(rename = "uploadRTTVar", skip_serializing_if = "is_zero")]
    pub upload_rtt_var: f64,

    #[serde(rename = "timestampStart", skip_serializing_if = "is_zero_i64")]
    pub timestamp_start: i64,
    #[serde(rename = "timestampFinish", skip_serializing_if = "is_zero_i64")]
    pub timestamp_finish: i64,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(rename = "clientVersion", skip_serializing_if = "String::is_empty")]
    pub client_version: String,
    #[serde(rename = "operatingSystem", skip_serializing_if = "String::is_empty")]
    pub os: String,
    #[serde(rename = "testServer", skip_serializing_if = "String::is_empty")]
    pub test_server: String,
}

/// Raw output of one protocol run, before summarisation.
#[derive(Debug, Clone, Default)]
pub struct RawSpeedTest {
    pub fqdn: String,
    pub download: Option<PhaseResult>,
    pub upload: Option<PhaseResult>,
}

/// One full protocol run: locate, download, upload.
///
/// The seam exists so the driver's mutual exclusion and retry behaviour
/// are testable without a measurement lab on the other end.
#[async_trait]
pub trait Ndt7Client: Send + Sync {
    async fn run(
        &self,
        token: &CancellationToken,
        opts: &Options,
    ) -> Result<RawSpeedTest, SpeedTestError>;
}

struct WebSocketClient {
    http: reqwest::Client,
}

#[async_trait]
impl Ndt7Client for WebSocketClient {
    async fn run(
        &self,
        token: &CancellationToken,
        opts: &Options,
    ) -> Result<RawSpeedTest, SpeedTestError> {
        let target = ndt7::locate(&self.http, opts).await?;
        debug!(server = %target.fqdn, "located ndt7 server");

        let download = ndt7::download(token, &target.download_url).await?;
        let upload = ndt7::upload(token, &target.upload_url).await?;

        Ok(RawSpeedTest {
            fqdn: target.fqdn,
            download: Some(download),
            upload: Some(upload),
        })
    }
}

/// Driver around the NDT7 client with process-wide mutual exclusion.
pub struct SpeedTester {
    lock: tokio::sync::Mutex<()>,
    client: Arc<dyn Ndt7Client>,
}

impl Default for SpeedTester {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeedTester {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            client: Arc::new(WebSocketClient {
                http: reqwest::Client::new(),
            }),
        }
    }

    /// Swap the protocol client; used by tests.
    #[must_use]
    pub fn with_client(client: Arc<dyn Ndt7Client>) -> Self {
        Self {
            lock: tokio::sync::Mutex::new(()),
            client,
        }
    }

    /// Run one speed test.
    ///
    /// Concurrent callers queue on the internal mutex, so at most one test
    /// is in flight per process at any time.
    ///
    /// # Errors
    ///
    /// [`SpeedTestError::Cancelled`] when shut down mid-test, otherwise the
    /// final failure once the retry budget is spent.
    pub async fn run(
        &self,
        token: &CancellationToken,
        opts: &Options,
    ) -> Result<SpeedTestResult, SpeedTestError> {
        let _guard = self.lock.lock().await;

        let start = timestamp_nanos();
        let raw = self.run_with_retries(token, opts).await?;
        let finish = timestamp_nanos();

        let mut result = summarize(&raw);
        result.test_server = result.metadata.get("Server").cloned().unwrap_or_default();
        result.timestamp_start = start;
        result.timestamp_finish = finish;
        result.client_version = opts.client_version.clone();
        result.os = std::env::consts::OS.to_string();

        Ok(result)
    }

    async fn run_with_retries(
        &self,
        token: &CancellationToken,
        opts: &Options,
    ) -> Result<RawSpeedTest, SpeedTestError> {
        let mut mean = RETRY_MEAN_START_SECS;
        let mut last = String::new();

        for retry in 0..=MAX_RETRIES {
            if token.is_cancelled() {
                return Err(SpeedTestError::Cancelled);
            }

            match self.client.run(token, opts).await {
                Ok(raw) => return Ok(raw),
                Err(SpeedTestError::Cancelled) => return Err(SpeedTestError::Cancelled),
                Err(err) => {
                    error!(error = %err, retry, "error running speed test");
                    last = err.to_string();
                }
            }

            if retry == MAX_RETRIES {
                break;
            }

            let wait = backoff::ndt7_retry_wait(mean);
            mean *= 2.0;

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = token.cancelled() => return Err(SpeedTestError::Cancelled),
            }
        }

        Err(SpeedTestError::Exhausted {
            retries: MAX_RETRIES,
            last,
        })
    }
}

/// Reduce raw phase output to the ingest summary. Byte-count predicates
/// gate every derived field: without them the field stays at its zero
/// value and is omitted from the wire form.
fn summarize(raw: &RawSpeedTest) -> SpeedTestResult {
    let mut data = SpeedTestResult {
        metadata: BTreeMap::from([("Server".to_string(), raw.fqdn.clone())]),
        ..SpeedTestResult::default()
    };

    if let Some(download) = &raw.download {
        if download.app_elapsed_us > 0 {
            if let Some(connection) = &download.connection_info {
                data.metadata
                    .insert("Client IP".to_string(), connection.client.clone());
            }

            #[allow(clippy::cast_precision_loss)]
            let elapsed = download.app_elapsed_us as f64 / 1e06;
            #[allow(clippy::cast_precision_loss)]
            let bytes = download.app_num_bytes as f64;
            data.downloaded_bytes = bytes;
            data.download_mbps = (8.0 * bytes) / elapsed / (1000.0 * 1000.0);
        }

        if let Some(tcp) = &download.tcp_info {
            if tcp.bytes_sent > 0 {
                #[allow(clippy::cast_precision_loss)]
                {
                    data.download_min_rtt = tcp.min_rtt as f64 / 1000.0;
                    data.download_retrans =
                        tcp.bytes_retrans as f64 / tcp.bytes_sent as f64 * 100.0;
                    data.download_rtt_var = tcp.rtt_var as f64 / 1000.0;
                }
            }
        }
    }

    if let Some(upload) = &raw.upload {
        if let Some(tcp) = &upload.tcp_info {
            if tcp.bytes_received > 0 {
                if let Some(connection) = &upload.connection_info {
                    data.metadata
                        .insert("Server IP".to_string(), connection.server.clone());
                    data.metadata
                        .insert("Server UUID".to_string(), connection.uuid.clone());
                }

                #[allow(clippy::cast_precision_loss)]
                {
                    let elapsed = tcp.elapsed_time as f64 / 1e06;
                    data.uploaded_bytes = tcp.bytes_received as f64;
                    data.upload_mbps = (8.0 * data.uploaded_bytes) / elapsed / (1000.0 * 1000.0);
                    data.upload_min_rtt = tcp.min_rtt as f64 / 1000.0;
                    if tcp.bytes_sent > 0 {
                        data.upload_retrans =
                            tcp.bytes_retrans as f64 / tcp.bytes_sent as f64 * 100.0;
                    }
                    data.upload_rtt_var = tcp.rtt_var as f64 / 1000.0;
                }
            }
        }
    }

    data
}

fn timestamp_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn raw_fixture() -> RawSpeedTest {
        RawSpeedTest {
            fqdn: "ndt-abc123.measurement-lab.org".to_string(),
            download: Some(PhaseResult {
                app_elapsed_us: 10_000_000,
                app_num_bytes: 125_000_000,
                tcp_info: Some(TcpInfo {
                    bytes_sent: 130_000_000,
                    bytes_retrans: 1_300_000,
                    min_rtt: 2_500,
                    rtt_var: 150,
                    ..TcpInfo::default()
                }),
                connection_info: Some(ConnectionInfo {
                    client: "203.0.113.7:53001".to_string(),
                    ..ConnectionInfo::default()
                }),
            }),
            upload: Some(PhaseResult {
                app_elapsed_us: 10_000_000,
                app_num_bytes: 0,
                tcp_info: Some(TcpInfo {
                    bytes_received: 25_000_000,
                    bytes_sent: 25_500_000,
                    bytes_retrans: 255_000,
                    min_rtt: 3_000,
                    rtt_var: 200,
                    elapsed_time: 10_000_000,
                }),
                connection_info: Some(ConnectionInfo {
                    server: "198.51.100.4:443".to_string(),
                    uuid: "host_20260801".to_string(),
                    ..ConnectionInfo::default()
                }),
            }),
        }
    }

    #[test]
    fn summary_formulas_are_bit_exact() {
        let data = summarize(&raw_fixture());

        // 8 * 125e6 bytes over 10 seconds is 100 Mbit/s
        assert!((data.download_mbps - 100.0).abs() < 1e-9);
        assert!((data.downloaded_bytes - 125_000_000.0).abs() < f64::EPSILON);
        assert!((data.download_min_rtt - 2.5).abs() < 1e-9);
        assert!((data.download_retrans - 1.0).abs() < 1e-9);
        assert!((data.download_rtt_var - 0.15).abs() < 1e-9);

        assert!((data.upload_mbps - 20.0).abs() < 1e-9);
        assert!((data.uploaded_bytes - 25_000_000.0).abs() < f64::EPSILON);
        assert!((data.upload_min_rtt - 3.0).abs() < 1e-9);
        assert!((data.upload_retrans - 1.0).abs() < 1e-9);
        assert!((data.upload_rtt_var - 0.2).abs() < 1e-9);

        assert_eq!(
            data.metadata.get("Server").map(String::as_str),
            Some("ndt-abc123.measurement-lab.org")
        );
        assert_eq!(
            data.metadata.get("Client IP").map(String::as_str),
            Some("203.0.113.7:53001")
        );
        assert_eq!(
            data.metadata.get("Server UUID").map(String::as_str),
            Some("host_20260801")
        );
    }

    #[test]
    fn missing_byte_counts_omit_derived_fields() {
        let mut raw = raw_fixture();
        if let Some(download) = raw.download.as_mut() {
            download.tcp_info = Some(TcpInfo::default());
        }
        if let Some(upload) = raw.upload.as_mut() {
            upload.tcp_info = Some(TcpInfo::default());
        }

        let data = summarize(&raw);
        assert!((data.download_retrans).abs() < f64::EPSILON);
        assert!((data.download_min_rtt).abs() < f64::EPSILON);
        assert!((data.upload_mbps).abs() < f64::EPSILON);
        assert!((data.uploaded_bytes).abs() < f64::EPSILON);

        let value = serde_json::to_value(&data).expect("serializes");
        let object = value.as_object().expect("object");
        assert!(!object.contains_key("downloadRetrans"));
        assert!(!object.contains_key("uploadMbps"));
        // download throughput came from the client side and survives
        assert!(object.contains_key("downloadMbps"));
    }

    struct FlakyClient {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl Ndt7Client for FlakyClient {
        async fn run(
            &self,
            _token: &CancellationToken,
            _opts: &Options,
        ) -> Result<RawSpeedTest, SpeedTestError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(SpeedTestError::WebSocket("connection reset".to_string()))
            } else {
                Ok(raw_fixture())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_a_run_succeeds() {
        let client = Arc::new(FlakyClient {
            calls: AtomicUsize::new(0),
            fail_first: 3,
        });
        let tester = SpeedTester::with_client(client.clone());
        let token = CancellationToken::new();

        let result = tester
            .run(&token, &Options {
                insecure: false,
                client_version: "0.1.0".to_string(),
            })
            .await
            .expect("succeeds after retries");

        assert_eq!(client.calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.test_server, "ndt-abc123.measurement-lab.org");
        assert_eq!(result.client_version, "0.1.0");
        assert!(result.timestamp_finish >= result.timestamp_start);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_retry_budget() {
        let client = Arc::new(FlakyClient {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        let tester = SpeedTester::with_client(client.clone());
        let token = CancellationToken::new();

        let err = tester
            .run(&token, &Options::default())
            .await
            .expect_err("budget exhausted");

        assert!(matches!(err, SpeedTestError::Exhausted { retries: 10, .. }));
        assert_eq!(client.calls.load(Ordering::SeqCst), 11);
    }

    struct SlowClient;

    #[async_trait]
    impl Ndt7Client for SlowClient {
        async fn run(
            &self,
            _token: &CancellationToken,
            _opts: &Options,
        ) -> Result<RawSpeedTest, SpeedTestError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(raw_fixture())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_runs_are_serialized() {
        let tester = Arc::new(SpeedTester::with_client(Arc::new(SlowClient)));
        let token = CancellationToken::new();

        let first = {
            let tester = Arc::clone(&tester);
            let token = token.clone();
            tokio::spawn(async move { tester.run(&token, &Options::default()).await })
        };
        let second = {
            let tester = Arc::clone(&tester);
            let token = token.clone();
            tokio::spawn(async move { tester.run(&token, &Options::default()).await })
        };

        let started = tokio::time::Instant::now();
        let (first, second) = tokio::join!(first, second);
        first.expect("join").expect("first run");
        second.expect("join").expect("second run");

        // the second caller blocked on the mutex until the first finished
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn cancelled_token_aborts_without_retrying() {
        let client = Arc::new(FlakyClient {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
        });
        let tester = SpeedTester::with_client(client.clone());
        let token = CancellationToken::new();
        token.cancel();

        let err = tester
            .run(&token, &Options::default())
            .await
            .expect_err("cancelled");
        assert!(matches!(err, SpeedTestError::Cancelled));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }
}
