//! Poll-style HTTP connections for the download workers.
//!
//! Drivers never block on the network: `start_get` hands the request to a
//! tokio task and the pipeline tick polls [`HttpConnection::state`] until a
//! terminal state shows up. The actual transfer goes through the
//! [`Transport`] trait so tests can swap reqwest for an in-memory stub.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Inclusive byte range of an HTTP `Range: bytes=start-end` request.
pub type ByteRange = (u64, u64);

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn get(&self, url: &str, range: Option<ByteRange>) -> Result<(u16, Bytes), String>;
    async fn head(&self, url: &str) -> Result<u16, String>;
}

/// reqwest-backed transport; follows redirects and reuses connections via
/// the shared client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> ReqwestTransport {
        ReqwestTransport {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str, range: Option<ByteRange>) -> Result<(u16, Bytes), String> {
        let mut request = self.client.get(url);
        if let Some((start, end)) = range {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-{}", start, end));
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok((status, bytes))
    }

    async fn head(&self, url: &str) -> Result<u16, String> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        Ok(response.status().as_u16())
    }
}

/// Observable request lifecycle.
#[derive(Debug, Clone)]
pub enum ConnectionState {
    Idle,
    InProgress,
    Completed {
        status: u16,
        bytes: Bytes,
        duration: Duration,
    },
    Failed {
        reason: String,
    },
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Completed { .. } | ConnectionState::Failed { .. }
        )
    }
}

/// One logical connection with at most one outstanding request.
pub struct HttpConnection {
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<ConnectionState>>,
    cancel: Mutex<CancellationToken>,
    timeout: Duration,
}

impl HttpConnection {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration) -> HttpConnection {
        HttpConnection {
            transport,
            state: Arc::new(Mutex::new(ConnectionState::Idle)),
            cancel: Mutex::new(CancellationToken::new()),
            timeout,
        }
    }

    /// Issues a GET. Panics in debug builds if a request is already in
    /// flight; drivers guarantee one outstanding request per connection.
    pub fn start_get(&self, url: String, range: Option<ByteRange>) {
        {
            let mut state = self.state.lock().unwrap();
            debug_assert!(
                !matches!(*state, ConnectionState::InProgress),
                "request already in flight"
            );
            *state = ConnectionState::InProgress;
        }
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = token.clone();
        let transport = Arc::clone(&self.transport);
        let state = Arc::clone(&self.state);
        let timeout = self.timeout;
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = tokio::select! {
                _ = token.cancelled() => {
                    debug!("request aborted: {}", url);
                    ConnectionState::Idle
                }
                result = tokio::time::timeout(timeout, transport.get(&url, range)) => {
                    match result {
                        Ok(Ok((status, bytes))) => ConnectionState::Completed {
                            status,
                            bytes,
                            duration: started.elapsed(),
                        },
                        Ok(Err(reason)) => {
                            error!("fetch failed for {}: {}", url, reason);
                            ConnectionState::Failed { reason }
                        }
                        Err(_) => {
                            error!("fetch timed out for {}", url);
                            ConnectionState::Failed {
                                reason: "timeout".to_string(),
                            }
                        }
                    }
                }
            };
            *state.lock().unwrap() = outcome;
        });
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    /// Consumes a terminal state, resetting the connection to idle.
    pub fn take_result(&self) -> Option<ConnectionState> {
        let mut state = self.state.lock().unwrap();
        if state.is_terminal() {
            Some(std::mem::replace(&mut *state, ConnectionState::Idle))
        } else {
            None
        }
    }

    pub fn abort(&self) {
        self.cancel.lock().unwrap().cancel();
        let mut state = self.state.lock().unwrap();
        if matches!(*state, ConnectionState::InProgress) {
            *state = ConnectionState::Idle;
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(*self.state.lock().unwrap(), ConnectionState::InProgress)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;

    /// In-memory transport keyed by URL; serves byte ranges off stored
    /// blobs and records every request.
    pub struct StubTransport {
        resources: Mutex<HashMap<String, Bytes>>,
        pub requests: Mutex<Vec<(String, Option<ByteRange>)>>,
        pub fail_next: Mutex<usize>,
    }

    impl StubTransport {
        pub fn new() -> StubTransport {
            StubTransport {
                resources: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                fail_next: Mutex::new(0),
            }
        }

        pub fn insert(&self, url: &str, bytes: Bytes) {
            self.resources.lock().unwrap().insert(url.to_string(), bytes);
        }

        pub fn request_count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        async fn get(&self, url: &str, range: Option<ByteRange>) -> Result<(u16, Bytes), String> {
            self.requests
                .lock()
                .unwrap()
                .push((url.to_string(), range));
            {
                let mut fail = self.fail_next.lock().unwrap();
                if *fail > 0 {
                    *fail -= 1;
                    return Err("injected failure".to_string());
                }
            }
            // a missing resource models a slow server: wait briefly for it
            // to appear before giving up
            let mut bytes = None;
            for _ in 0..100 {
                if let Some(found) = self.resources.lock().unwrap().get(url).cloned() {
                    bytes = Some(found);
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
            let Some(bytes) = bytes else {
                return Ok((404, Bytes::new()));
            };
            let bytes = &bytes;
            match range {
                Some((start, end)) => {
                    let start = start as usize;
                    let end = ((end + 1) as usize).min(bytes.len());
                    if start >= bytes.len() {
                        return Ok((416, Bytes::new()));
                    }
                    Ok((206, bytes.slice(start..end)))
                }
                None => Ok((200, bytes.clone())),
            }
        }

        async fn head(&self, url: &str) -> Result<u16, String> {
            let resources = self.resources.lock().unwrap();
            Ok(if resources.contains_key(url) { 200 } else { 404 })
        }
    }
}
