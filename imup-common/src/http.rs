//! Retrying JSON POSTs.
//!
//! All traffic to the ingest and realtime APIs flows through
//! [`post_json`]. Transport errors and 5xx responses are retried with a
//! uniformly jittered delay; any other response is returned to the caller
//! for interpretation. Cancellation is observed both mid-request and
//! between attempts so shutdown never waits out a retry window.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backoff::exact_jitter;

/// Retry bounds for a single logical POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Lower jitter bound between attempts.
    pub wait_min: Duration,
    /// Upper jitter bound between attempts.
    pub wait_max: Duration,
}

impl RetryPolicy {
    /// Durable delivery: measurement and speed-test ingest. Roughly two to
    /// four weeks of retries before a job is abandoned.
    #[must_use]
    pub const fn durable() -> Self {
        Self {
            max_attempts: 50_000,
            wait_min: Duration::from_secs(30),
            wait_max: Duration::from_secs(60),
        }
    }

    /// Short-lived realtime traffic: liveness check-ins and speed-test
    /// status updates, where stale delivery is worthless.
    #[must_use]
    pub const fn realtime() -> Self {
        Self {
            max_attempts: 3,
            wait_min: Duration::from_millis(200),
            wait_max: Duration::from_secs(3),
        }
    }

    /// Authorisation and remote-config polling.
    #[must_use]
    pub const fn poll() -> Self {
        Self {
            max_attempts: 50_000,
            wait_min: Duration::from_secs(30),
            wait_max: Duration::from_secs(60),
        }
    }

    /// The on-demand speed-test poll; bounded so a dead API cannot pile up
    /// pollers behind the 10 second cadence.
    #[must_use]
    pub const fn should_run() -> Self {
        Self {
            max_attempts: 3,
            wait_min: Duration::from_secs(30),
            wait_max: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpError {
    /// The shutdown token fired while a request or retry wait was in
    /// flight. Never reported as a failure; callers use it to persist
    /// unsent work.
    #[error("request to {url} cancelled")]
    Cancelled { url: String },

    /// Every attempt failed with a transport error or a 5xx response.
    #[error("request to {url} failed after {attempts} attempts: {last}")]
    Exhausted {
        url: String,
        attempts: u32,
        last: String,
    },
}

impl HttpError {
    /// `true` when the error is shutdown-driven rather than a failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// POST `body` as JSON to `url`, retrying per `policy`.
///
/// Returns the first response that is not a server error; callers decide
/// what non-2xx statuses mean for them.
///
/// # Errors
///
/// [`HttpError::Cancelled`] when the token fires, or
/// [`HttpError::Exhausted`] once the attempt budget is spent.
pub async fn post_json(
    client: &reqwest::Client,
    token: &CancellationToken,
    url: &str,
    body: &serde_json::Value,
    policy: RetryPolicy,
) -> Result<reqwest::Response, HttpError> {
    let mut last = String::from("no attempts made");

    for attempt in 1..=policy.max_attempts {
        let request = client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body)
            .send();

        let outcome = tokio::select! {
            outcome = request => outcome,
            () = token.cancelled() => {
                return Err(HttpError::Cancelled { url: url.to_string() });
            }
        };

        match outcome {
            Ok(response) if !response.status().is_server_error() => {
                return Ok(response);
            }
            Ok(response) => {
                last = format!("server returned {}", response.status());
            }
            Err(err) => {
                last = err.to_string();
            }
        }

        if attempt == policy.max_attempts {
            break;
        }

        let wait = exact_jitter(policy.wait_min, policy.wait_max);
        debug!(url, attempt, ?wait, last = %last, "retrying request");

        tokio::select! {
            () = tokio::time::sleep(wait) => {}
            () = token.cancelled() => {
                return Err(HttpError::Cancelled { url: url.to_string() });
            }
        }
    }

    Err(HttpError::Exhausted {
        url: url.to_string(),
        attempts: policy.max_attempts,
        last,
    })
}
