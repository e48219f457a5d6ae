//! etcd v2 key API client.
//!
//! Requests go to the last endpoint that answered and fail over to the next
//! one on connection errors. Long-poll watches carry no request timeout; every
//! other call is bounded by `REQUEST_TIMEOUT`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{CoordinationStore, StoreEntry, StoreError, WatchEvent};

/// Endpoint used when the configuration lists none.
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const INDEX_HEADER: &str = "x-etcd-index";

const CODE_NOT_A_FILE: u32 = 102;
const CODE_NODE_EXIST: u32 = 105;
const CODE_EVENT_INDEX_CLEARED: u32 = 401;

#[derive(Debug, Deserialize)]
struct KeysResponse {
    action: String,
    node: Option<Node>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Node {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    modified_index: u64,
    #[serde(default)]
    created_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    error_code: u32,
    message: String,
    #[serde(default)]
    index: u64,
}

/// Shared etcd client; one instance serves every task of a process.
#[derive(Debug)]
pub struct EtcdClient {
    endpoints: Vec<String>,
    http: reqwest::Client,
    preferred: AtomicUsize,
}

impl EtcdClient {
    pub fn new(endpoints: Vec<String>) -> Result<Self, StoreError> {
        let mut endpoints: Vec<String> = endpoints
            .into_iter()
            .map(|endpoint| endpoint.trim().trim_end_matches('/').to_string())
            .filter(|endpoint| !endpoint.is_empty())
            .collect();
        if endpoints.is_empty() {
            endpoints.push(DEFAULT_ENDPOINT.to_string());
        }
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| StoreError::Connect {
                endpoints: endpoints.join(","),
                reason: format!("build http client: {err}"),
            })?;
        Ok(Self {
            endpoints,
            http,
            preferred: AtomicUsize::new(0),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Send a request to the preferred endpoint, failing over on connect errors.
    async fn send<F>(&self, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&reqwest::Client, &str) -> RequestBuilder + Send,
    {
        let count = self.endpoints.len();
        let start = self.preferred.load(Ordering::Relaxed) % count;
        let mut last_reason = String::new();
        for offset in 0..count {
            let idx = (start + offset) % count;
            let endpoint = &self.endpoints[idx];
            match build(&self.http, endpoint).send().await {
                Ok(response) => {
                    if idx != start {
                        info!(endpoint = %endpoint, "failed over to endpoint");
                        self.preferred.store(idx, Ordering::Relaxed);
                    }
                    return Ok(response);
                }
                Err(err) => {
                    warn!(endpoint = %endpoint, err = %err, "endpoint unreachable");
                    last_reason = err.to_string();
                }
            }
        }
        Err(StoreError::Connect {
            endpoints: self.endpoints.join(","),
            reason: last_reason,
        })
    }
}

fn keys_url(endpoint: &str, key: &str) -> String {
    format!("{endpoint}/v2/keys/{}", key.trim_start_matches('/'))
}

fn header_index(response: &Response) -> u64 {
    response
        .headers()
        .get(INDEX_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn decode_error(key: &str, reason: impl ToString) -> StoreError {
    StoreError::Decode {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_api_error(key: &str, status: StatusCode, body: &[u8]) -> Result<ApiError, StoreError> {
    serde_json::from_slice(body).map_err(|err| {
        decode_error(
            key,
            format!("status {status}: {err}: {}", String::from_utf8_lossy(body)),
        )
    })
}

fn api_error(key: &str, err: ApiError) -> StoreError {
    StoreError::Api {
        key: key.to_string(),
        code: err.error_code,
        message: err.message,
    }
}

fn parse_keys(key: &str, body: &[u8]) -> Result<KeysResponse, StoreError> {
    serde_json::from_slice(body).map_err(|err| decode_error(key, err))
}

fn watch_event(key: &str, response: KeysResponse) -> Result<WatchEvent, StoreError> {
    let node = response
        .node
        .ok_or_else(|| decode_error(key, "watch response without node"))?;
    Ok(WatchEvent {
        action: response.action,
        key: node.key.unwrap_or_default(),
        value: if node.dir { None } else { node.value },
        index: node.modified_index,
    })
}

impl CoordinationStore for EtcdClient {
    #[instrument(skip(self))]
    async fn ensure_dir(&self, key: &str) -> Result<u64, StoreError> {
        let response = self
            .send(|http, endpoint| {
                http.put(keys_url(endpoint, key))
                    .query(&[("dir", "true"), ("prevExist", "false")])
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;
        let status = response.status();
        let index = header_index(&response);
        let body = response
            .bytes()
            .await
            .map_err(|err| decode_error(key, err))?;
        if status.is_success() {
            debug!(index, "directory created");
            return Ok(index);
        }
        let err = parse_api_error(key, status, &body)?;
        match err.error_code {
            CODE_NODE_EXIST | CODE_NOT_A_FILE => {
                debug!(index = err.index, "directory already exists");
                Ok(err.index.max(index))
            }
            _ => Err(api_error(key, err)),
        }
    }

    #[instrument(skip(self, value))]
    async fn append(&self, dir: &str, value: &str) -> Result<StoreEntry, StoreError> {
        let response = self
            .send(|http, endpoint| {
                http.post(keys_url(endpoint, dir))
                    .form(&[("value", value)])
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| decode_error(dir, err))?;
        if !status.is_success() {
            return Err(api_error(dir, parse_api_error(dir, status, &body)?));
        }
        let node = parse_keys(dir, &body)?
            .node
            .ok_or_else(|| decode_error(dir, "append response without node"))?;
        Ok(StoreEntry {
            key: node.key.unwrap_or_default(),
            value: node.value.unwrap_or_else(|| value.to_string()),
            index: node.created_index,
        })
    }

    #[instrument(skip(self))]
    async fn watch(&self, dir: &str, wait_index: u64) -> Result<WatchEvent, StoreError> {
        let wait_index = wait_index.to_string();
        let response = self
            .send(|http, endpoint| {
                http.get(keys_url(endpoint, dir)).query(&[
                    ("wait", "true"),
                    ("recursive", "true"),
                    ("waitIndex", wait_index.as_str()),
                ])
            })
            .await?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| StoreError::WatchTransport {
                key: dir.to_string(),
                reason: err.to_string(),
            })?;
        if body.is_empty() {
            return Err(StoreError::WatchTransport {
                key: dir.to_string(),
                reason: "long-poll closed without an event".to_string(),
            });
        }
        if !status.is_success() {
            let err = parse_api_error(dir, status, &body)?;
            if err.error_code == CODE_EVENT_INDEX_CLEARED {
                return Err(StoreError::EventIndexCleared {
                    key: dir.to_string(),
                    requested: wait_index.parse().unwrap_or(0),
                    current: err.index,
                });
            }
            return Err(api_error(dir, err));
        }
        watch_event(dir, parse_keys(dir, &body)?)
    }

    #[instrument(skip(self, value))]
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let ttl = ttl.as_secs().max(1).to_string();
        let response = self
            .send(|http, endpoint| {
                http.put(keys_url(endpoint, key))
                    .form(&[("value", value), ("ttl", ttl.as_str())])
                    .timeout(REQUEST_TIMEOUT)
            })
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| decode_error(key, err))?;
        Err(api_error(key, parse_api_error(key, status, &body)?))
    }
}
