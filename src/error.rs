//! Error types for batchpush.
//!
//! Two layers:
//! - [`Error`] is returned by the public API when the caller misuses the
//!   uploader or when configuration cannot be loaded.
//! - [`UploadError`] describes why a single record was not stored. It never
//!   escapes the dispatcher as a `Result`; it is handed to the
//!   [`StoreDelegate`](crate::upload::StoreDelegate) instead.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for batchpush operations
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Limits are missing, zero, or inconsistent with each other
    #[error("Invalid uploader configuration: {0}")]
    Config(String),

    /// Failed to read a configuration file
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML configuration could not be parsed
    #[error("Failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    /// Server info/configuration document could not be parsed
    #[error("Failed to parse server configuration: {0}")]
    Json(#[from] serde_json::Error),

    /// Base collection URL is not a valid absolute URL
    #[error("Invalid collection URL: {0}")]
    Url(#[from] url::ParseError),

    /// A record was added to a payload that had no room for it
    #[error("Payload budget exceeded: {records} records / {bytes} bytes, cannot add {delta} more bytes")]
    PayloadOverflow { records: usize, bytes: usize, delta: usize },

    /// A record identifier was empty
    #[error("Record identifier must not be empty")]
    EmptyRecordId,

    /// `process` was called after the session was finalised
    #[error("Upload session already finalised")]
    Finalized,

    /// The worker task is no longer accepting payloads
    #[error("Upload worker has shut down")]
    WorkerGone,

    /// The worker task panicked or was cancelled
    #[error("Upload worker failed: {0}")]
    WorkerJoin(#[from] tokio::task::JoinError),
}

/// Reason a single record failed to store.
///
/// Cloned once per identifier when a whole payload fails.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// Server answered with a non-2xx status
    #[error("Record not processed: server responded with HTTP {status}")]
    RecordNotProcessed { status: u16 },

    /// Server rejected the If-Unmodified-Since precondition
    #[error("Collection was modified concurrently by another client")]
    ConcurrentModification,

    /// Response was missing a header, or the body was not the expected JSON object
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// 202 Accepted arrived without a batch token
    #[error("Batch response did not carry a batch token")]
    MissingBatchToken,

    /// A plain success arrived for a non-commit payload while a batch was open
    #[error("Got a plain success for a non-commit payload inside batch '{token}'")]
    UnexpectedPlainSuccess { token: String },

    /// Server changed the batch token mid-batch, or issued one on a commit
    #[error("Batch token conflict: expected {expected:?}, got {actual:?}")]
    TokenConflict {
        expected: Option<String>,
        actual: Option<String>,
    },

    /// Server was required to report a new modification time but did not
    #[error("Last-Modified did not change (still {0})")]
    LastModifiedUnchanged(String),

    /// Modification time changed when it must not have: another writer got in
    #[error("Last-Modified changed unexpectedly from {previous} to {current}")]
    LastModifiedConflict { previous: String, current: String },

    /// Server listed this record under `failed`
    #[error("Server rejected record: {0}")]
    Rejected(String),

    /// Record cannot fit into even an empty payload
    #[error("Record too large to upload: {bytes} bytes exceeds payload limit of {limit} bytes")]
    RecordTooLarge { bytes: usize, limit: usize },

    /// Record could not be encoded
    #[error("Failed to encode record: {0}")]
    Encoding(String),

    /// Request never produced a usable response
    #[error("Transport failure: {0}")]
    Transport(String),

    /// An earlier payload in this session failed, so this one was not sent
    #[error("Upload aborted after an earlier payload failed")]
    Aborted,
}

impl UploadError {
    /// Whether this error came from a broken protocol contract rather than
    /// a record-level rejection.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            UploadError::TokenConflict { .. }
                | UploadError::LastModifiedUnchanged(_)
                | UploadError::LastModifiedConflict { .. }
                | UploadError::UnexpectedPlainSuccess { .. }
                | UploadError::MissingBatchToken
        )
    }
}
