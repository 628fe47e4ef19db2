//! Collaborator seams: the transport that issues requests, and the delegate
//! that receives per-record outcomes.

use crate::error::UploadError;
use crate::upload::request::PostRequest;
use crate::upload::timestamp::Timestamp;
use async_trait::async_trait;

/// Header carrying the collection's modification time on every success
pub const LAST_MODIFIED_HEADER: &str = "X-Last-Modified";

/// Response as seen by the uploader: status, headers, optional body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Why a request produced no response worth interpreting.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Connection, TLS, timeout and the like
    #[error("request failed: {0}")]
    Request(String),
    /// Server answered, but the transport classified the answer as a failure
    #[error("server failure: HTTP {}", .0.status)]
    Failure(HttpResponse),
}

/// Issues one POST and returns the server's answer.
///
/// Retries, timeouts and connection handling belong to implementations.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn post(&self, request: PostRequest) -> Result<HttpResponse, TransportError>;
}

/// Receives the outcome of every record and of the session.
///
/// Called from the worker task, in dispatch order.
pub trait StoreDelegate: Send + Sync + 'static {
    fn on_record_store_succeeded(&self, id: &str);

    fn on_record_store_failed(&self, error: &UploadError, id: &str);

    /// Fired once, after the last payload was processed.
    fn on_store_completed(&self, timestamp: Option<Timestamp>);
}
