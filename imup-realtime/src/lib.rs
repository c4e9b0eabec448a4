//! Server-initiated realtime operations.
//!
//! The realtime family is the short-cadence side of the agent: liveness
//! check-ins, the authorisation poll that can remotely enable or disable
//! the feature set, the on-demand speed-test poll, and the remote
//! configuration poll. All of it is plain JSON POSTs through the shared
//! retrying client.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use imup_common::http::{post_json, HttpError, RetryPolicy};
use imup_config::ConfigHandle;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("error parsing server response: {0}")]
    Decode(String),
}

impl RealtimeError {
    /// Shutdown-driven errors are not failures; callers skip reporting them.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Http(err) if err.is_cancelled())
    }
}

/// The envelope every realtime endpoint expects.
#[derive(Debug, Default, Serialize)]
struct ApiPayload<T: Serialize> {
    #[serde(rename = "hostId", skip_serializing_if = "String::is_empty")]
    host_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    email: String,
    #[serde(rename = "groupID", skip_serializing_if = "String::is_empty")]
    group_id: String,
    #[serde(rename = "apiKey", skip_serializing_if = "String::is_empty")]
    api_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

impl ApiPayload<serde_json::Value> {
    fn identity(cfg: &ConfigHandle) -> Self {
        Self {
            host_id: cfg.host_id(),
            email: cfg.email(),
            api_key: cfg.api_key(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthRequest {
    #[serde(rename = "apiKey", skip_serializing_if = "String::is_empty")]
    api_key: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    email: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ShouldRunResponse {
    #[allow(dead_code)]
    success: bool,
    data: bool,
}

#[derive(Debug, Serialize)]
struct SpeedTestOutcome {
    #[serde(skip_serializing_if = "String::is_empty")]
    data: String,
    #[serde(skip_serializing_if = "is_zero")]
    download: f64,
    #[serde(skip_serializing_if = "is_zero")]
    upload: f64,
}

/// Tell the API this client is alive. Fire-and-forget; the response body is
/// ignored.
///
/// # Errors
///
/// Propagates transport failures once the short realtime retry budget is
/// spent.
pub async fn send_client_healthy(
    client: &reqwest::Client,
    token: &CancellationToken,
    cfg: &ConfigHandle,
) -> Result<(), RealtimeError> {
    let payload = serde_json::to_value(ApiPayload::identity(cfg))
        .map_err(|err| RealtimeError::Decode(err.to_string()))?;

    post_json(
        client,
        token,
        &cfg.liveness_address(),
        &payload,
        RetryPolicy::realtime(),
    )
    .await?;

    Ok(())
}

/// Check whether this client is authorised for realtime features.
///
/// A `200 OK` enables realtime, any other status disables it. Transport
/// failures leave the current state untouched — this poll runs even while
/// realtime is disabled, because it is the mechanism by which realtime is
/// re-enabled remotely.
///
/// # Errors
///
/// Propagates transport failures; cancellation is swallowed.
pub async fn authorized(
    client: &reqwest::Client,
    token: &CancellationToken,
    cfg: &ConfigHandle,
) -> Result<(), RealtimeError> {
    let payload = serde_json::to_value(AuthRequest {
        api_key: cfg.api_key(),
        email: cfg.email(),
    })
    .map_err(|err| RealtimeError::Decode(err.to_string()))?;

    let response = match post_json(
        client,
        token,
        &cfg.realtime_auth_address(),
        &payload,
        RetryPolicy::poll(),
    )
    .await
    {
        Ok(response) => response,
        Err(err) if err.is_cancelled() => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    if response.status() == reqwest::StatusCode::OK {
        cfg.enable_realtime();
    } else {
        cfg.disable_realtime();
    }

    Ok(())
}

/// Ask the API whether an on-demand speed test was requested.
///
/// # Errors
///
/// Transport failures and unparsable response bodies.
pub async fn should_run_speedtest(
    client: &reqwest::Client,
    token: &CancellationToken,
    cfg: &ConfigHandle,
) -> Result<bool, RealtimeError> {
    let payload = serde_json::to_value(ApiPayload::identity(cfg))
        .map_err(|err| RealtimeError::Decode(err.to_string()))?;

    let response = post_json(
        client,
        token,
        &cfg.should_run_speedtest_address(),
        &payload,
        RetryPolicy::should_run(),
    )
    .await?;

    let body: ShouldRunResponse = response
        .json()
        .await
        .map_err(|err| RealtimeError::Decode(err.to_string()))?;

    Ok(body.data)
}

/// Post an on-demand speed-test status update ("running" or "error").
///
/// # Errors
///
/// Propagates transport failures once the realtime retry budget is spent.
pub async fn post_speed_test_status(
    client: &reqwest::Client,
    token: &CancellationToken,
    cfg: &ConfigHandle,
    status: &str,
) -> Result<(), RealtimeError> {
    let mut payload = ApiPayload::identity(cfg);
    payload.data = Some(serde_json::Value::String(status.to_string()));
    let payload =
        serde_json::to_value(payload).map_err(|err| RealtimeError::Decode(err.to_string()))?;

    post_json(
        client,
        token,
        &cfg.speedtest_status_address(),
        &payload,
        RetryPolicy::realtime(),
    )
    .await?;

    Ok(())
}

/// Post the headline numbers of a completed on-demand speed test.
///
/// # Errors
///
/// Propagates transport failures once the realtime retry budget is spent.
pub async fn post_speed_test_results(
    client: &reqwest::Client,
    token: &CancellationToken,
    cfg: &ConfigHandle,
    download_mbps: f64,
    upload_mbps: f64,
) -> Result<(), RealtimeError> {
    let mut payload = ApiPayload::identity(cfg);
    payload.data = Some(
        serde_json::to_value(SpeedTestOutcome {
            data: "complete".to_string(),
            download: download_mbps,
            upload: upload_mbps,
        })
        .map_err(|err| RealtimeError::Decode(err.to_string()))?,
    );
    let payload =
        serde_json::to_value(payload).map_err(|err| RealtimeError::Decode(err.to_string()))?;

    post_json(
        client,
        token,
        &cfg.speedtest_results_address(),
        &payload,
        RetryPolicy::realtime(),
    )
    .await?;

    Ok(())
}

/// Share the current config version with the API and apply whatever newer
/// document it returns.
///
/// Only meaningful for org clients running with an API key; without one the
/// poll is skipped. A `204 No Content` means the configuration is
/// unchanged.
///
/// # Errors
///
/// Propagates transport failures; reload rejections (same version, invalid
/// document) are logged and swallowed, since the running config stays
/// valid.
pub async fn remote_config_reload(
    client: &reqwest::Client,
    token: &CancellationToken,
    cfg: &ConfigHandle,
) -> Result<(), RealtimeError> {
    if cfg.api_key().is_empty() {
        return Ok(());
    }

    let payload = serde_json::to_value(ApiPayload::<serde_json::Value> {
        host_id: cfg.host_id(),
        email: cfg.email(),
        group_id: cfg.group_id(),
        api_key: cfg.api_key(),
        version: cfg.version(),
        data: None,
    })
    .map_err(|err| RealtimeError::Decode(err.to_string()))?;

    let response = match post_json(
        client,
        token,
        &cfg.realtime_config_address(),
        &payload,
        RetryPolicy::poll(),
    )
    .await
    {
        Ok(response) => response,
        Err(err) if err.is_cancelled() => return Ok(()),
        Err(err) => return Err(err.into()),
    };

    match response.status() {
        reqwest::StatusCode::OK => {
            let body = response
                .bytes()
                .await
                .map_err(|err| RealtimeError::Decode(err.to_string()))?;

            match cfg.apply_remote(&body) {
                Ok(()) => {
                    // a fresh document may move the host between networks;
                    // re-resolve the public address it reports under
                    cfg.refresh_public_ip(client).await;
                }
                Err(err) => info!(error = %err, "cannot reload config"),
            }
        }
        reqwest::StatusCode::NO_CONTENT => {
            debug!("config has not changed");
        }
        status => {
            debug!(retcode = %status, "unexpected response returned from api");
        }
    }

    Ok(())
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &f64) -> bool {
    *value == 0.0
}
