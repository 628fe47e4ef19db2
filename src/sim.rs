//! In-process batch storage server.
//!
//! Implements [`Transport`] by applying each request to an in-memory
//! collection, so uploads can be exercised end to end without a network.
//! Mirrors the server side of the batch protocol: `202` plus a token when a
//! batch opens, staged records until `commit=true`, `X-Last-Modified` on
//! every success and `412` when `If-Unmodified-Since` is stale.

use crate::config::UploaderConfig;
use crate::upload::request::{BATCH_PARAM, COMMIT_PARAM};
use crate::upload::timestamp::Timestamp;
use crate::upload::transport::{HttpResponse, Transport, TransportError, LAST_MODIFIED_HEADER};
use crate::upload::PostRequest;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

// ============================================================================
// Options
// ============================================================================

/// Server behaviour knobs.
#[derive(Debug, Clone)]
pub struct SimOptions {
    /// Answer `batch=` requests with `202` and a token
    pub batching: bool,
    /// Limits enforced on each request and batch; violations get `400`
    pub limits: UploaderConfig,
    /// Collection timestamp before the first write
    pub start: Timestamp,
    /// Amount the collection timestamp advances on each write
    pub tick_millis: i64,
    /// First batch number handed out
    pub first_batch: u64,
    /// Delay applied to every request
    pub latency: Option<Duration>,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            batching: true,
            limits: UploaderConfig::default(),
            start: Timestamp::from_millis(chrono::Utc::now().timestamp_millis()),
            tick_millis: 10,
            first_batch: 1,
            latency: None,
        }
    }
}

/// Response forced onto an upcoming request.
#[derive(Debug, Clone)]
pub enum Injected {
    /// Answer with this status and no body
    Status(u16),
    /// Fail before reaching the server
    Unreachable,
}

// ============================================================================
// Server
// ============================================================================

#[derive(Debug, Default)]
struct Staged {
    records: Vec<(String, Value)>,
    bytes: usize,
}

#[derive(Debug)]
struct State {
    last_modified: Timestamp,
    next_batch: u64,
    records: BTreeMap<String, Value>,
    batches: HashMap<u64, Staged>,
    rejected_ids: HashSet<String>,
    injected: VecDeque<Injected>,
    requests: Vec<PostRequest>,
}

#[derive(Debug)]
pub struct SimulatedServer {
    options: SimOptions,
    state: Mutex<State>,
}

impl SimulatedServer {
    pub fn new(options: SimOptions) -> Self {
        let state = State {
            last_modified: options.start,
            next_batch: options.first_batch,
            records: BTreeMap::new(),
            batches: HashMap::new(),
            rejected_ids: HashSet::new(),
            injected: VecDeque::new(),
            requests: Vec::new(),
        };
        Self {
            options,
            state: Mutex::new(state),
        }
    }

    /// Server that answers every payload with a plain `200`.
    pub fn without_batching() -> Self {
        Self::new(SimOptions {
            batching: false,
            ..Default::default()
        })
    }

    pub fn options(&self) -> &SimOptions {
        &self.options
    }

    /// Reject this record id with a per-record failure whenever it is posted.
    pub fn reject_id(&self, id: impl Into<String>) {
        self.lock().rejected_ids.insert(id.into());
    }

    /// Queue a forced outcome for the next request that has none yet.
    pub fn inject(&self, injected: Injected) {
        self.lock().injected.push_back(injected);
    }

    /// Simulate another client writing to the collection.
    pub fn touch(&self) -> Timestamp {
        let mut state = self.lock();
        self.bump(&mut state)
    }

    pub fn last_modified(&self) -> Timestamp {
        self.lock().last_modified
    }

    /// Ids visible in the collection, sorted.
    pub fn stored_ids(&self) -> Vec<String> {
        self.lock().records.keys().cloned().collect()
    }

    pub fn record(&self, id: &str) -> Option<Value> {
        self.lock().records.get(id).cloned()
    }

    /// Batches opened but not yet committed.
    pub fn open_batches(&self) -> usize {
        self.lock().batches.len()
    }

    /// Every request received, in arrival order.
    pub fn requests(&self) -> Vec<PostRequest> {
        self.lock().requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump(&self, state: &mut State) -> Timestamp {
        state.last_modified =
            Timestamp::from_millis(state.last_modified.as_millis() + self.options.tick_millis);
        state.last_modified
    }

    fn handle(&self, request: PostRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.lock();
        state.requests.push(request.clone());

        match state.injected.pop_front() {
            Some(Injected::Status(status)) => {
                debug!(status, "Injected failure");
                return Ok(HttpResponse::new(status));
            }
            Some(Injected::Unreachable) => {
                return Err(TransportError::Request("connection refused".to_string()));
            }
            None => {}
        }

        if let Some(since) = request.if_unmodified_since.as_deref() {
            match since.parse::<Timestamp>() {
                Ok(since) if state.last_modified > since => {
                    return Ok(HttpResponse::new(412).with_body("\"precondition failed\""));
                }
                Ok(_) => {}
                Err(e) => return Ok(bad_request(&e.to_string())),
            }
        }

        let records = match parse_records(&request.body) {
            Ok(records) => records,
            Err(reason) => return Ok(bad_request(&reason)),
        };
        let limits = &self.options.limits;
        if records.len() > limits.max_post_records || request.body.len() > limits.max_post_bytes {
            return Ok(bad_request("size limit exceeded"));
        }

        let mut batch = None;
        let mut commit = false;
        for (key, value) in request.uri.query_pairs() {
            if key == BATCH_PARAM {
                batch = Some(value.into_owned());
            } else if key == COMMIT_PARAM {
                commit = value == "true";
            }
        }

        let (accepted, rejected): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|(id, _)| !state.rejected_ids.contains(id));
        let success: Vec<String> = accepted.iter().map(|(id, _)| id.clone()).collect();
        let failed: Map<String, Value> = rejected
            .into_iter()
            .map(|(id, _)| (id, Value::String("invalid record".to_string())))
            .collect();

        let batch = match batch {
            Some(batch) if self.options.batching => batch,
            // Batch parameters are ignored by servers without batching.
            _ => {
                for (id, value) in accepted {
                    state.records.insert(id, value);
                }
                let ts = self.bump(&mut state);
                return Ok(ok(200, ts, json!({ "success": success, "failed": failed })));
            }
        };

        let number = if batch == "true" {
            let number = state.next_batch;
            state.next_batch += 1;
            state.batches.insert(number, Staged::default());
            number
        } else {
            match decode_token(&batch) {
                Some(number) if state.batches.contains_key(&number) => number,
                _ => return Ok(bad_request("unknown batch")),
            }
        };

        let staged = state.batches.entry(number).or_default();
        // Array framing counts once per batch, not once per request.
        staged.bytes += request.body.len().saturating_sub(1);
        staged.records.extend(accepted);
        if staged.records.len() > limits.max_total_records || staged.bytes > limits.max_total_bytes
        {
            state.batches.remove(&number);
            return Ok(bad_request("batch size limit exceeded"));
        }

        if !commit {
            let ts = state.last_modified;
            let token = encode_token(number);
            return Ok(ok(
                202,
                ts,
                json!({ "batch": token, "success": success, "failed": failed }),
            ));
        }

        let staged = state.batches.remove(&number).unwrap_or_default();
        debug!(batch = number, records = staged.records.len(), "Committing batch");
        for (id, value) in staged.records {
            state.records.insert(id, value);
        }
        let ts = self.bump(&mut state);
        Ok(ok(200, ts, json!({ "success": success, "failed": failed })))
    }
}

#[async_trait]
impl Transport for SimulatedServer {
    async fn post(&self, request: PostRequest) -> Result<HttpResponse, TransportError> {
        if let Some(latency) = self.options.latency {
            tokio::time::sleep(latency).await;
        }
        self.handle(request)
    }
}

/// Batch tokens are the batch number, base64 encoded without padding.
pub fn encode_token(number: u64) -> String {
    URL_SAFE_NO_PAD.encode(number.to_string())
}

pub fn decode_token(token: &str) -> Option<u64> {
    let raw = URL_SAFE_NO_PAD.decode(token).ok()?;
    std::str::from_utf8(&raw).ok()?.parse().ok()
}

fn parse_records(body: &[u8]) -> Result<Vec<(String, Value)>, String> {
    let values: Vec<Value> = serde_json::from_slice(body).map_err(|e| e.to_string())?;
    values
        .into_iter()
        .map(|value| match value.get("id").and_then(Value::as_str) {
            Some(id) => Ok((id.to_string(), value)),
            None => Err("record without id".to_string()),
        })
        .collect()
}

fn ok(status: u16, ts: Timestamp, body: Value) -> HttpResponse {
    HttpResponse::new(status)
        .with_header(LAST_MODIFIED_HEADER, ts.to_header_value())
        .with_body(body.to_string())
}

fn bad_request(reason: &str) -> HttpResponse {
    HttpResponse::new(400).with_body(Value::String(reason.to_string()).to_string())
}
