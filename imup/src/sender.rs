//! The durable send queue and its single worker.
//!
//! Producers enqueue [`SendJob`]s; the worker POSTs them in FIFO order
//! with the durable retry profile. A job interrupted by shutdown is
//! spooled to disk, and whatever is still queued when the worker exits is
//! drained to the spool as well, so a restart loses nothing that was
//! handed to the queue.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use imup_common::http::{post_json, RetryPolicy};
use imup_connectivity::PingStats;
use imup_speedtest::SpeedTestResult;

use crate::cache;

/// Bound on unsent jobs held in memory.
pub const QUEUE_CAPACITY: usize = 300;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("cannot serialise payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One unit of delivery: a destination and an opaque JSON payload.
///
/// The payload is kept as a raw JSON value so spooling to disk and reading
/// back reproduces the job byte for byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendJob {
    #[serde(rename = "IMUPAddress")]
    pub address: String,
    #[serde(rename = "IMUPData")]
    pub data: serde_json::Value,
}

/// Connectivity batch payload for the ingest API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectivityPayload {
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub downtime: usize,
    #[serde(rename = "statusChanged")]
    pub status_changed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(rename = "hostId", default, skip_serializing_if = "String::is_empty")]
    pub host_id: String,
    #[serde(rename = "apiKey", default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(rename = "group_id", default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<PingStats>,
}

/// Speed-test envelope for the ingest API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeedTestPayload {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(rename = "hostId", default, skip_serializing_if = "String::is_empty")]
    pub host_id: String,
    #[serde(rename = "apiKey", default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(rename = "group_id", default, skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    pub data: SpeedTestResult,
}

/// Create the bounded send queue.
#[must_use]
pub fn channel() -> (mpsc::Sender<SendJob>, mpsc::Receiver<SendJob>) {
    mpsc::channel(QUEUE_CAPACITY)
}

/// Build a job from any serialisable payload.
///
/// # Errors
///
/// Serialisation failures.
pub fn job<T: Serialize>(address: String, payload: &T) -> Result<SendJob, SenderError> {
    Ok(SendJob {
        address,
        data: serde_json::to_value(payload)?,
    })
}

/// The single sender worker. Processes jobs in FIFO order until the token
/// fires, then drains the residual queue to the spool directory.
pub async fn send_data_worker(
    client: reqwest::Client,
    token: CancellationToken,
    mut queue: mpsc::Receiver<SendJob>,
    spool_dir: PathBuf,
) {
    loop {
        tokio::select! {
            job = queue.recv() => {
                let Some(job) = job else {
                    return;
                };
                send_imup_data(&client, &token, job, &spool_dir).await;
            }
            () = token.cancelled() => {
                drain(&mut queue, &spool_dir);
                return;
            }
        }
    }
}

async fn send_imup_data(
    client: &reqwest::Client,
    token: &CancellationToken,
    job: SendJob,
    spool_dir: &Path,
) {
    match post_json(client, token, &job.address, &job.data, RetryPolicy::durable()).await {
        Ok(response) => {
            debug!(address = %job.address, status = %response.status(), "job delivered");
        }
        Err(err) if err.is_cancelled() => {
            // shutdown in progress; keep the job for the next start
            if let Err(err) = cache::to_user_cache(spool_dir, &job) {
                error!(error = %err, "cannot spool job during shutdown");
            }
        }
        Err(err) => {
            error!(error = %err, "giving up on job");
        }
    }
}

/// Move everything still queued onto disk.
fn drain(queue: &mut mpsc::Receiver<SendJob>, spool_dir: &Path) {
    let mut drained = 0_usize;
    while let Ok(job) = queue.try_recv() {
        if let Err(err) = cache::to_user_cache(spool_dir, &job) {
            error!(error = %err, "cannot spool queued job");
        }
        drained += 1;
    }

    if drained > 0 {
        info!(jobs = drained, "shutdown detected, persisted queued data");
    }
}

fn is_zero_usize(value: &usize) -> bool {
    *value == 0
}
