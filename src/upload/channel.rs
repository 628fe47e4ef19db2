//! Channel types for the upload pipeline.
//!
//! Uploader -> Dispatcher worker, one unbounded queue per session so the
//! producer never blocks and payloads are processed in the order they were
//! flushed. Batching-mode observations flow back over a watch channel.

use crate::upload::payload::Payload;
use crate::upload::timestamp::Timestamp;
use crate::upload::whiteboard::BatchingMode;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

// =============================================================================
// PayloadJob: Uploader -> Dispatcher worker
// =============================================================================

/// One unit of work: a detached payload plus its position in the batch.
#[derive(Debug, Clone)]
pub struct PayloadJob {
    /// Encoded records, in flush order
    pub records: Vec<Bytes>,

    /// Identifiers parallel to `records`
    pub ids: Vec<String>,

    /// Last payload of its batch
    pub is_commit: bool,

    /// Last payload of the session
    pub is_last: bool,

    /// Uploader's batching mode when the payload was flushed
    pub mode: BatchingMode,
}

impl PayloadJob {
    /// Take ownership of a flushed payload.
    pub fn from_payload(payload: Payload, is_commit: bool, is_last: bool) -> Self {
        let (records, ids) = payload.into_parts();
        Self {
            records,
            ids,
            is_commit,
            is_last,
            mode: BatchingMode::Undetermined,
        }
    }

    /// Tag the job with the uploader's batching mode.
    pub fn with_mode(mut self, mode: BatchingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

// =============================================================================
// Channel types
// =============================================================================

/// Sender for payload jobs from the Uploader
pub type PayloadJobSender = mpsc::UnboundedSender<PayloadJob>;

/// Receiver for payload jobs in the worker task
pub type PayloadJobReceiver = mpsc::UnboundedReceiver<PayloadJob>;

/// Create the Uploader -> worker queue
pub fn payload_job_channel() -> (PayloadJobSender, PayloadJobReceiver) {
    mpsc::unbounded_channel()
}

/// Create the worker -> Uploader batching-mode channel
pub fn batching_mode_channel() -> (watch::Sender<BatchingMode>, watch::Receiver<BatchingMode>) {
    watch::channel(BatchingMode::Undetermined)
}

// =============================================================================
// Upload statistics
// =============================================================================

/// Statistics for one upload session
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UploadStats {
    /// Requests issued
    pub payloads_sent: u64,

    /// Payloads that failed as a whole
    pub payloads_failed: u64,

    /// Empty commits skipped because the server does not batch
    pub payloads_skipped: u64,

    /// Commit payloads the server accepted
    pub batches_committed: u64,

    /// Records reported as stored
    pub records_succeeded: u64,

    /// Records reported as failed
    pub records_failed: u64,

    /// Most recent server timestamp
    pub last_modified: Option<Timestamp>,

    /// Server batching support as last observed
    pub batching_mode: BatchingMode,

    /// Session ended without the last payload failing
    pub finished_cleanly: bool,
}

impl UploadStats {
    pub fn new() -> Self {
        Self {
            finished_cleanly: true,
            ..Default::default()
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
