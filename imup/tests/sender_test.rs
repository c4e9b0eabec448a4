//! Sender worker behaviour: FIFO delivery, shutdown spooling, restart
//! recovery.

mod support;

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use imup::cache;
use imup::sender::{self, SendJob};
use support::mock_api::MockApi;

fn job(address: String, seq: u64) -> SendJob {
    SendJob {
        address,
        data: json!({ "statusChanged": false, "downtime": seq }),
    }
}

#[tokio::test]
async fn jobs_are_delivered_in_fifo_order() {
    let api = MockApi::start().await;
    let spool = tempfile::tempdir().expect("tempdir");
    let token = CancellationToken::new();
    let (tx, rx) = sender::channel();

    let worker = tokio::spawn(sender::send_data_worker(
        reqwest::Client::new(),
        token.clone(),
        rx,
        spool.path().to_path_buf(),
    ));

    for seq in 1..=3 {
        tx.send(job(api.url("/v1/data/connectivity"), seq))
            .await
            .expect("enqueue");
    }

    let requests = api.wait_for_requests(3, Duration::from_secs(5)).await;
    let downtimes: Vec<u64> = requests
        .iter()
        .map(|r| r.body["downtime"].as_u64().expect("downtime"))
        .collect();
    assert_eq!(downtimes, vec![1, 2, 3]);
    assert!(requests.iter().all(|r| r.path == "/v1/data/connectivity"));

    // nothing was spooled on the happy path
    assert!(cache::from_cache_dir(spool.path()).is_empty());

    token.cancel();
    worker.await.expect("worker exits");
}

#[tokio::test]
async fn cancellation_spools_every_unsent_job() {
    // reserve a port nothing listens on so delivery fails immediately
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let dead_addr = format!("http://{}/v1/data/connectivity", dead.local_addr().expect("addr"));
    drop(dead);

    let spool = tempfile::tempdir().expect("tempdir");
    let token = CancellationToken::new();
    let (tx, rx) = sender::channel();

    let worker = tokio::spawn(sender::send_data_worker(
        reqwest::Client::new(),
        token.clone(),
        rx,
        spool.path().to_path_buf(),
    ));

    for seq in 1..=3 {
        tx.send(job(dead_addr.clone(), seq)).await.expect("enqueue");
    }

    // let the worker take the first job and fail its first attempt, then
    // shut down while it waits out the retry delay
    tokio::time::sleep(Duration::from_millis(300)).await;
    token.cancel();
    worker.await.expect("worker exits");

    let spooled = cache::from_cache_dir(spool.path());
    assert_eq!(spooled.len(), 3, "every queued job lands in the spool");

    // a subsequent startup reads exactly those jobs back and clears the
    // directory
    let recovered: Vec<u64> = spooled
        .iter()
        .map(|j| j.data["downtime"].as_u64().expect("downtime"))
        .collect();
    let mut sorted = recovered.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, vec![1, 2, 3]);

    cache::clear_cache(spool.path());
    assert!(cache::from_cache_dir(spool.path()).is_empty());
}

#[tokio::test]
async fn spooled_jobs_survive_a_round_trip_byte_for_byte() {
    let spool = tempfile::tempdir().expect("tempdir");
    let original = job("https://api.imup.io/v1/data/connectivity".to_string(), 7);

    cache::to_user_cache(spool.path(), &original).expect("spool");
    let recovered = cache::from_cache_dir(spool.path());
    assert_eq!(recovered, vec![original]);
}
