//! Response interpretation for one posted payload.
//!
//! Checks a response against what was posted and against the batch state,
//! then updates the whiteboard. The result is a [`PayloadOutcome`]; the
//! dispatcher turns it into delegate callbacks.

use crate::error::UploadError;
use crate::upload::timestamp::Timestamp;
use crate::upload::transport::{HttpResponse, TransportError, LAST_MODIFIED_HEADER};
use crate::upload::whiteboard::Whiteboard;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::{debug, trace, warn};

/// Status for a payload accepted into a still-open batch
pub const STATUS_ACCEPTED: u16 = 202;

/// Status for a failed `If-Unmodified-Since` precondition
pub const STATUS_PRECONDITION_FAILED: u16 = 412;

/// Success/partial-success body: `{"batch": .., "success": [..], "failed": {..}}`
#[derive(Debug, Deserialize)]
struct PostResponseBody {
    #[serde(default)]
    batch: Option<String>,
    #[serde(default)]
    success: Vec<Value>,
    #[serde(default)]
    failed: Map<String, Value>,
}

/// What happened to one payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadOutcome {
    /// Server took the payload; individual records may still have failed
    Succeeded {
        succeeded: Vec<String>,
        failed: Vec<(String, String)>,
        timestamp: Timestamp,
    },
    /// The whole payload failed with one reason
    Failed(UploadError),
}

/// Interprets the response to one POST.
#[derive(Debug)]
pub struct ResponseInterpreter<'a> {
    ids: &'a [String],
    is_commit: bool,
    is_last: bool,
}

impl<'a> ResponseInterpreter<'a> {
    pub fn new(ids: &'a [String], is_commit: bool, is_last: bool) -> Self {
        Self {
            ids,
            is_commit,
            is_last,
        }
    }

    /// Validate a response and apply it to the whiteboard.
    ///
    /// The whiteboard is only touched once the response passed the checks
    /// that do not depend on batch state.
    pub fn interpret(&self, response: &HttpResponse, whiteboard: &mut Whiteboard) -> PayloadOutcome {
        if !response.is_success() {
            return self.handle_status(response.status);
        }

        let Some(raw_ts) = response.header(LAST_MODIFIED_HEADER) else {
            return self.fail(UploadError::MalformedResponse(format!(
                "missing {} header",
                LAST_MODIFIED_HEADER
            )));
        };
        let timestamp: Timestamp = match raw_ts.parse() {
            Ok(ts) => ts,
            Err(e) => return self.fail(UploadError::MalformedResponse(e.to_string())),
        };

        let body = match parse_body(response.body.as_deref()) {
            Ok(body) => body,
            Err(e) => return self.fail(e),
        };

        let accepted = response.status == STATUS_ACCEPTED;
        if accepted && body.batch.is_none() {
            return self.fail(UploadError::MissingBatchToken);
        }
        if !accepted && !self.is_commit {
            if let Some(token) = whiteboard.token() {
                return self.fail(UploadError::UnexpectedPlainSuccess {
                    token: token.to_string(),
                });
            }
        }

        let mode = whiteboard.observed_mode(body.batch.is_some(), self.is_commit);

        if let Err(e) = whiteboard.set_token(body.batch.as_deref(), self.is_commit) {
            return self.fail(e);
        }

        // Without batching every payload is visible as soon as it lands, so
        // the collection's timestamp has to move each time.
        let expecting_change = self.is_commit || mode.is_disabled();
        if let Err(e) = whiteboard.set_last_modified(timestamp, expecting_change) {
            return self.fail(e);
        }

        whiteboard.set_mode(mode);

        let posted: HashSet<&str> = self.ids.iter().map(String::as_str).collect();

        let mut succeeded = Vec::with_capacity(body.success.len());
        for value in body.success {
            match value.as_str() {
                Some(id) if posted.contains(id) => succeeded.push(id.to_string()),
                Some(id) => warn!(id, "Server reported success for a record that was not posted"),
                None => warn!(%value, "Ignoring non-string entry in success list"),
            }
        }

        let mut failed = Vec::with_capacity(body.failed.len());
        for (id, reason) in body.failed {
            if !posted.contains(id.as_str()) {
                warn!(%id, "Server reported failure for a record that was not posted");
                continue;
            }
            let reason = match reason {
                Value::String(s) => s,
                other => other.to_string(),
            };
            failed.push((id, reason));
        }

        trace!(
            status = response.status,
            succeeded = succeeded.len(),
            failed = failed.len(),
            %timestamp,
            "Interpreted payload response"
        );

        PayloadOutcome::Succeeded {
            succeeded,
            failed,
            timestamp,
        }
    }

    /// Transport never produced a response.
    pub fn handle_request_error(&self, error: &TransportError) -> PayloadOutcome {
        match error {
            TransportError::Failure(response) => self.handle_request_failure(response),
            TransportError::Request(message) => {
                self.fail(UploadError::Transport(message.clone()))
            }
        }
    }

    /// Server answered with something the transport treats as a failure.
    pub fn handle_request_failure(&self, response: &HttpResponse) -> PayloadOutcome {
        if response.status == STATUS_PRECONDITION_FAILED {
            return self.fail(UploadError::ConcurrentModification);
        }
        self.fail(UploadError::Transport(format!(
            "server responded with HTTP {}",
            response.status
        )))
    }

    fn handle_status(&self, status: u16) -> PayloadOutcome {
        if status == STATUS_PRECONDITION_FAILED {
            return self.fail(UploadError::ConcurrentModification);
        }
        self.fail(UploadError::RecordNotProcessed { status })
    }

    fn fail(&self, error: UploadError) -> PayloadOutcome {
        debug!(
            records = self.ids.len(),
            is_commit = self.is_commit,
            is_last = self.is_last,
            %error,
            "Payload failed"
        );
        PayloadOutcome::Failed(error)
    }
}

fn parse_body(body: Option<&str>) -> Result<PostResponseBody, UploadError> {
    let raw = body.ok_or_else(|| UploadError::MalformedResponse("empty body".into()))?;
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| UploadError::MalformedResponse(format!("invalid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(UploadError::MalformedResponse(
            "body is not a JSON object".into(),
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| UploadError::MalformedResponse(format!("unexpected body shape: {}", e)))
}
