//! Mock imUp API for integration tests.
//!
//! A tiny HTTP/1.1 responder over a tokio listener: it records every
//! request (path + JSON body) and answers with a per-path configured
//! status and body, defaulting to `200 {"success":true}`.
#![allow(dead_code)] // test utility module, not every test uses every helper

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::Mutex,
};

/// One recorded request.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub path: String,
    pub body: serde_json::Value,
}

/// Canned response for a path.
#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub body: String,
}

pub struct MockApiBuilder {
    responses: HashMap<String, CannedResponse>,
}

impl MockApiBuilder {
    #[must_use]
    pub fn with_response(mut self, path: &str, status: u16, body: &str) -> Self {
        self.responses.insert(
            path.to_string(),
            CannedResponse {
                status,
                body: body.to_string(),
            },
        );
        self
    }

    pub async fn build(self) -> MockApi {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock api listener");
        let addr = listener.local_addr().expect("mock api address");

        let requests: Arc<Mutex<Vec<ReceivedRequest>>> = Arc::new(Mutex::new(Vec::new()));
        let responses = Arc::new(self.responses);

        let accept_requests = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let requests = Arc::clone(&accept_requests);
                let responses = Arc::clone(&responses);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, requests, responses).await;
                });
            }
        });

        MockApi {
            addr,
            requests,
            handle,
        }
    }
}

pub struct MockApi {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl MockApi {
    #[must_use]
    pub fn builder() -> MockApiBuilder {
        MockApiBuilder {
            responses: HashMap::new(),
        }
    }

    pub async fn start() -> Self {
        Self::builder().build().await
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn requests(&self) -> Vec<ReceivedRequest> {
        self.requests.lock().await.clone()
    }

    /// Wait until at least `count` requests have arrived.
    ///
    /// # Panics
    ///
    /// Panics when the timeout elapses first.
    pub async fn wait_for_requests(&self, count: usize, timeout: Duration) -> Vec<ReceivedRequest> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let requests = self.requests.lock().await;
            if requests.len() >= count {
                return requests.clone();
            }
            drop(requests);

            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} requests"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for MockApi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    stream: TcpStream,
    requests: Arc<Mutex<Vec<ReceivedRequest>>>,
    responses: Arc<HashMap<String, CannedResponse>>,
) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }

        let path = request_line
            .split_whitespace()
            .nth(1)
            .unwrap_or("/")
            .to_string();

        let mut content_length = 0_usize;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).await? == 0 {
                return Ok(());
            }
            let header = header.trim();
            if header.is_empty() {
                break;
            }
            if let Some(value) = header
                .to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(str::trim)
            {
                content_length = value.parse().unwrap_or(0);
            }
        }

        let mut body = vec![0_u8; content_length];
        reader.read_exact(&mut body).await?;

        let parsed = serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null);
        requests.lock().await.push(ReceivedRequest {
            path: path.clone(),
            body: parsed,
        });

        let canned = responses.get(&path).cloned().unwrap_or(CannedResponse {
            status: 200,
            body: r#"{"success":true}"#.to_string(),
        });

        let reason = match canned.status {
            200 => "OK",
            204 => "No Content",
            401 => "Unauthorized",
            500 => "Internal Server Error",
            _ => "Status",
        };
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            canned.status,
            reason,
            canned.body.len(),
            canned.body,
        );

        reader.get_mut().write_all(response.as_bytes()).await?;
        reader.get_mut().flush().await?;
    }
}
