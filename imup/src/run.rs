//! The supervisor: launches every periodic task, wires cancellation and
//! orchestrates graceful shutdown.
//!
//! Each task is an independent tokio task that runs its body, then waits
//! out its cadence or the shared cancellation token, whichever comes
//! first. Tasks share nothing mutable but the config handle, the send
//! queue and the error map.

use std::{
    future::Future,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use imup_common::backoff;
use imup_config::{ConfigHandle, Verbosity};
use imup_connectivity::{
    DialCollector, Options as ProbeOptions, PingCollector, PingStats, StatCollector,
};
use imup_speedtest::{
    Options as SpeedTestOptions, SpeedTestError, SpeedTestResult, SpeedTester,
};

use crate::{
    cache,
    errors::ErrorMap,
    sender::{self, ConnectivityPayload, SendJob, SpeedTestPayload},
    CLIENT_VERSION,
};

const AUTHORIZATION_INTERVAL: Duration = Duration::from_secs(30 * 60);
const REMOTE_CONFIG_INTERVAL: Duration = Duration::from_secs(60 * 60);
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);
const ON_DEMAND_POLL_INTERVAL: Duration = Duration::from_secs(10);
const PUBLIC_IP_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Shared context handed to every periodic task.
#[derive(Clone)]
pub struct Agent {
    cfg: ConfigHandle,
    client: reqwest::Client,
    errors: Arc<ErrorMap>,
    speedtest: Arc<SpeedTester>,
    speed_test_running: Arc<AtomicBool>,
    queue: mpsc::Sender<SendJob>,
    spool_dir: PathBuf,
}

/// Run the agent until `shutdown` resolves.
///
/// # Errors
///
/// Currently only queue wiring failures during startup recovery.
pub async fn run(
    cfg: ConfigHandle,
    token: CancellationToken,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    run_with_spool(cfg, token, shutdown, cache::cache_root()).await
}

/// [`run`] with an explicit spool directory.
///
/// # Errors
///
/// See [`run`].
pub async fn run_with_spool(
    cfg: ConfigHandle,
    token: CancellationToken,
    shutdown: impl Future<Output = ()>,
    spool_dir: PathBuf,
) -> anyhow::Result<()> {
    debug!(version = CLIENT_VERSION, "starting agent");

    let (queue, queue_rx) = sender::channel();
    let agent = Agent {
        client: reqwest::Client::new(),
        errors: Arc::new(ErrorMap::new(&cfg.host_id())),
        speedtest: Arc::new(SpeedTester::new()),
        speed_test_running: Arc::new(AtomicBool::new(false)),
        queue,
        spool_dir: spool_dir.clone(),
        cfg,
    };

    let mut handles = Vec::new();
    handles.push(tokio::spawn(sender::send_data_worker(
        agent.client.clone(),
        token.clone(),
        queue_rx,
        spool_dir.clone(),
    )));

    // recover spooled jobs before anything fresh is produced
    let recovered = cache::from_cache_dir(&spool_dir);
    if !recovered.is_empty() {
        info!(jobs = recovered.len(), "recovered spooled jobs from user cache");
        for job in recovered {
            agent.queue.send(job).await?;
        }
        cache::clear_cache(&spool_dir);
    }

    // resolve the public address once before the guards start consulting it
    agent.cfg.refresh_public_ip(&agent.client).await;

    handles.push(tokio::spawn(agent.clone().authorization_task(token.clone())));
    handles.push(tokio::spawn(agent.clone().speed_test_task(token.clone())));
    handles.push(tokio::spawn(agent.clone().connectivity_task(token.clone())));
    handles.push(tokio::spawn(agent.clone().liveness_task(token.clone())));
    handles.push(tokio::spawn(agent.clone().on_demand_task(token.clone())));
    handles.push(tokio::spawn(agent.clone().remote_config_task(token.clone())));
    handles.push(tokio::spawn(agent.public_ip_task(token.clone())));

    shutdown.await;
    info!("shutdown started");
    token.cancel();

    for handle in handles {
        let _ = handle.await;
    }

    info!("shutdown completed");
    Ok(())
}

impl Agent {
    /// Periodically check whether this client is authorised for realtime
    /// features. Runs even while realtime is disabled: a `200 OK` here is
    /// what turns realtime back on.
    async fn authorization_task(self, token: CancellationToken) {
        loop {
            match imup_realtime::authorized(&self.client, &token, &self.cfg).await {
                Ok(()) => self.errors.clear("RealtimeAuthorized"),
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    error!(error = %err, "failed to check client authorization");
                    self.errors.record_failure("RealtimeAuthorized", &err);
                }
            }

            if !sleep_or_cancelled(AUTHORIZATION_INTERVAL, &token).await {
                return;
            }
        }
    }

    /// Randomly scheduled speed testing on a Poisson cadence.
    async fn speed_test_task(self, token: CancellationToken) {
        loop {
            if self.cfg.speed_tests_enabled() && self.cfg.public_ip_monitored() {
                match self.run_speed_test(&token).await {
                    Ok(_) => self.errors.clear("CollectSpeedTestData"),
                    Err(SpeedTestError::Cancelled) => {}
                    Err(err) => {
                        error!(error = %err, "cannot collect speed test data");
                        self.errors.record_failure("CollectSpeedTestData", &err);
                    }
                }
            }

            let wait = backoff::speed_test_interval(backoff::SPEED_TEST_MEAN_SECS);
            debug!(?wait, "next random speed test");
            if !sleep_or_cancelled(wait, &token).await {
                return;
            }
        }
    }

    /// The connectivity core loop: collect a cycle, buffer it, ship a
    /// batch once enough data points accumulate.
    async fn connectivity_task(self, token: CancellationToken) {
        let collector: Arc<dyn StatCollector> = if self.cfg.ping_enabled() {
            Arc::new(PingCollector::new(ProbeOptions {
                client_version: CLIENT_VERSION.to_string(),
                internal_addr: self.cfg.internal_ping_target(),
                count: self.cfg.ping_requests(),
                debug: self.cfg.verbosity() == Verbosity::Debug,
                delay: self.cfg.ping_delay(),
                interval: self.cfg.ping_interval(),
                timeout: self.cfg.ping_interval(),
            }))
        } else {
            Arc::new(DialCollector::new(ProbeOptions {
                client_version: CLIENT_VERSION.to_string(),
                internal_addr: String::new(),
                count: self.cfg.conn_requests(),
                debug: self.cfg.verbosity() == Verbosity::Debug,
                delay: self.cfg.conn_delay(),
                interval: self.cfg.conn_interval(),
                timeout: self.cfg.conn_interval(),
            }))
        };

        let mut data: Vec<PingStats> = Vec::new();

        loop {
            if self.cfg.public_ip_monitored() {
                let collected = collector.collect(&token, &self.cfg.ping_targets()).await;
                data.extend(collected.iter().cloned());
                debug!(points = data.len(), "data points collected");

                if self.cfg.store_jobs_on_disk() {
                    let summary = collector.detect_downtime(&data);
                    self.spool_connectivity(summary.status_changed, summary.downtime, collected);
                }

                if data.len() >= self.cfg.batch_length() {
                    let summary = collector.detect_downtime(&data);
                    let payload =
                        self.connectivity_payload(summary.status_changed, summary.downtime, std::mem::take(&mut data));

                    match sender::job(self.cfg.connectivity_address(), &payload) {
                        Ok(job) => {
                            if self.queue.send(job).await.is_err() {
                                error!("send queue closed, dropping connectivity batch");
                            } else if self.cfg.store_jobs_on_disk() {
                                cache::clear_cache(&self.spool_dir);
                            }
                        }
                        Err(err) => error!(error = %err, "cannot build connectivity job"),
                    }
                }
            }

            tokio::select! {
                () = tokio::time::sleep(collector.interval()) => {}
                () = token.cancelled() => {
                    debug!(pending = data.len(), "connectivity task stopping");
                    if !data.is_empty() {
                        let summary = collector.detect_downtime(&data);
                        debug!("persisting pending conn data");
                        self.spool_connectivity(summary.status_changed, summary.downtime, data);
                    }
                    return;
                }
            }
        }
    }

    /// Realtime liveness check-in.
    async fn liveness_task(self, token: CancellationToken) {
        loop {
            if self.cfg.realtime() {
                match imup_realtime::send_client_healthy(&self.client, &token, &self.cfg).await {
                    Ok(()) => self.errors.clear("SendClientHealthy"),
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        error!(error = %err, "cannot send liveness checkin");
                        self.errors.record_failure("SendClientHealthy", &err);
                    }
                }
            }

            if !sleep_or_cancelled(LIVENESS_INTERVAL, &token).await {
                return;
            }
        }
    }

    /// On-demand speed-test poll with the running/complete/error status
    /// choreography.
    async fn on_demand_task(self, token: CancellationToken) {
        loop {
            if self.cfg.realtime() {
                self.poll_on_demand(&token).await;
            }

            if !sleep_or_cancelled(ON_DEMAND_POLL_INTERVAL, &token).await {
                return;
            }
        }
    }

    async fn poll_on_demand(&self, token: &CancellationToken) {
        match imup_realtime::should_run_speedtest(&self.client, token, &self.cfg).await {
            Err(err) if err.is_cancelled() => {}
            Err(err) => {
                error!(error = %err, "cannot check for on-demand speed test");
                self.errors.record_failure("ShouldRunSpeedtest", &err);
            }
            Ok(true) if !self.speed_test_running.load(Ordering::SeqCst) => {
                // let the api know we're ready to run the speed test
                if let Err(err) =
                    imup_realtime::post_speed_test_status(&self.client, token, &self.cfg, "running")
                        .await
                {
                    if !err.is_cancelled() {
                        error!(error = %err, "cannot post speed test status");
                        self.errors.record_failure("PostSpeedTestStatus", &err);
                    }
                }

                match self.run_speed_test(token).await {
                    Ok(result) => {
                        if let Err(err) = imup_realtime::post_speed_test_results(
                            &self.client,
                            token,
                            &self.cfg,
                            result.download_mbps,
                            result.upload_mbps,
                        )
                        .await
                        {
                            if !err.is_cancelled() {
                                error!(error = %err, "cannot post speed test results");
                            }
                        }
                    }
                    Err(SpeedTestError::Cancelled) => {}
                    Err(err) => {
                        error!(error = %err, "on-demand speed test failed");
                        self.errors.record_failure("RunSpeedTestOnce", &err);

                        if let Err(err) = imup_realtime::post_speed_test_status(
                            &self.client,
                            token,
                            &self.cfg,
                            "error",
                        )
                        .await
                        {
                            if !err.is_cancelled() {
                                error!(error = %err, "cannot post speed test status");
                            }
                        }
                    }
                }
            }
            Ok(_) => {
                // nothing to do; flush anything that persisted since the
                // last on-demand run
                self.errors.report("ShouldRunSpeedtest");
                self.errors.report("PostSpeedTestStatus");
                self.errors.report("RunSpeedTestOnce");
            }
        }
    }

    /// Remote configuration poll.
    async fn remote_config_task(self, token: CancellationToken) {
        loop {
            if self.cfg.realtime() {
                match imup_realtime::remote_config_reload(&self.client, &token, &self.cfg).await {
                    Ok(()) => self.errors.clear("RemoteConfigReload"),
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => {
                        error!(error = %err, "cannot reload remote config");
                        self.errors.record_failure("RemoteConfigReload", &err);
                    }
                }
            }

            if !sleep_or_cancelled(REMOTE_CONFIG_INTERVAL, &token).await {
                return;
            }
        }
    }

    /// Keep the public address fresh while IP allow/block lists are in
    /// play; without lists the probes don't consult it between reloads.
    async fn public_ip_task(self, token: CancellationToken) {
        loop {
            if self.cfg.has_ip_lists() {
                self.cfg.refresh_public_ip(&self.client).await;
            }

            if !sleep_or_cancelled(PUBLIC_IP_INTERVAL, &token).await {
                return;
            }
        }
    }

    /// Run one speed test and enqueue its ingest job.
    async fn run_speed_test(
        &self,
        token: &CancellationToken,
    ) -> Result<SpeedTestResult, SpeedTestError> {
        self.speed_test_running.store(true, Ordering::SeqCst);
        let outcome = self
            .speedtest
            .run(
                token,
                &SpeedTestOptions {
                    insecure: self.cfg.insecure_speed_tests(),
                    client_version: CLIENT_VERSION.to_string(),
                },
            )
            .await;
        self.speed_test_running.store(false, Ordering::SeqCst);

        let result = outcome?;

        let payload = SpeedTestPayload {
            email: self.cfg.email(),
            host_id: self.cfg.host_id(),
            api_key: self.cfg.api_key(),
            group_id: self.cfg.group_id(),
            data: result.clone(),
        };

        match sender::job(self.cfg.speedtest_address(), &payload) {
            Ok(job) => {
                if self.queue.send(job).await.is_err() {
                    error!("send queue closed, dropping speed test result");
                }
            }
            Err(err) => error!(error = %err, "cannot build speed test job"),
        }

        Ok(result)
    }

    fn connectivity_payload(
        &self,
        status_changed: bool,
        downtime: usize,
        data: Vec<PingStats>,
    ) -> ConnectivityPayload {
        ConnectivityPayload {
            downtime,
            status_changed,
            email: self.cfg.email(),
            host_id: self.cfg.host_id(),
            api_key: self.cfg.api_key(),
            group_id: self.cfg.group_id(),
            data,
        }
    }

    fn spool_connectivity(&self, status_changed: bool, downtime: usize, data: Vec<PingStats>) {
        let payload = self.connectivity_payload(status_changed, downtime, data);
        match sender::job(self.cfg.connectivity_address(), &payload) {
            Ok(job) => {
                if let Err(err) = cache::to_user_cache(&self.spool_dir, &job) {
                    error!(error = %err, "cannot spool connectivity data");
                }
            }
            Err(err) => error!(error = %err, "cannot build connectivity job"),
        }
    }
}

/// Wait out `duration` unless the token fires first. Returns `false` on
/// cancellation.
async fn sleep_or_cancelled(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        () = tokio::time::sleep(duration) => true,
        () = token.cancelled() => false,
    }
}
