//! Per-batch metadata shared by all payloads of one batch.
//!
//! Owned by the dispatcher's worker task and mutated only while interpreting
//! responses, one at a time, in dispatch order. Token and timestamp checks
//! compare against the immediately preceding response, so applying responses
//! out of order would produce false conflicts.

use crate::error::UploadError;
use crate::upload::timestamp::Timestamp;

/// Whether the server supports batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchingMode {
    /// No response seen yet
    #[default]
    Undetermined,
    /// Server issued a batch token
    Enabled,
    /// Server answered with plain responses; every payload is committed on arrival
    Disabled,
}

impl BatchingMode {
    pub fn is_disabled(self) -> bool {
        self == BatchingMode::Disabled
    }

    pub fn is_enabled(self) -> bool {
        self == BatchingMode::Enabled
    }

    /// Apply a new observation. Batching can be switched off but never back on.
    pub fn transition(self, next: BatchingMode) -> BatchingMode {
        match (self, next) {
            (BatchingMode::Disabled, _) => BatchingMode::Disabled,
            (_, BatchingMode::Undetermined) => self,
            (_, next) => next,
        }
    }
}

impl From<bool> for BatchingMode {
    fn from(enabled: bool) -> Self {
        if enabled {
            BatchingMode::Enabled
        } else {
            BatchingMode::Disabled
        }
    }
}

/// Batch metadata: token, last-modified, confirmed successes, batching mode.
#[derive(Debug, Clone, Default)]
pub struct Whiteboard {
    last_modified: Option<Timestamp>,
    token: Option<String>,
    success_ids: Vec<String>,
    mode: BatchingMode,
}

impl Whiteboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn last_modified(&self) -> Option<Timestamp> {
        self.last_modified
    }

    pub fn mode(&self) -> BatchingMode {
        self.mode
    }

    pub fn success_ids(&self) -> &[String] {
        &self.success_ids
    }

    /// Record a batch token from a response.
    ///
    /// Within a batch the token may be set once and repeated; a commit must
    /// close the batch, leaving no token behind.
    pub fn set_token(&mut self, token: Option<&str>, is_commit: bool) -> Result<(), UploadError> {
        if is_commit {
            if token.is_some() {
                return Err(UploadError::TokenConflict {
                    expected: None,
                    actual: token.map(str::to_string),
                });
            }
            self.token = None;
            return Ok(());
        }

        match (self.token.as_deref(), token) {
            (None, None) => Ok(()),
            (None, Some(new)) => {
                self.token = Some(new.to_string());
                Ok(())
            }
            (Some(current), Some(new)) if current == new => Ok(()),
            (Some(current), new) => Err(UploadError::TokenConflict {
                expected: Some(current.to_string()),
                actual: new.map(str::to_string),
            }),
        }
    }

    /// Record the server's modification time.
    ///
    /// `expecting_change` is true when the previous request made records
    /// visible (a commit, or any payload without batching), so the time must
    /// move. Otherwise it must stay put; a different value means another
    /// writer touched the collection.
    pub fn set_last_modified(
        &mut self,
        value: Timestamp,
        expecting_change: bool,
    ) -> Result<(), UploadError> {
        let Some(previous) = self.last_modified else {
            self.last_modified = Some(value);
            return Ok(());
        };

        match (expecting_change, previous == value) {
            (true, true) => Err(UploadError::LastModifiedUnchanged(value.to_string())),
            (false, false) => Err(UploadError::LastModifiedConflict {
                previous: previous.to_string(),
                current: value.to_string(),
            }),
            _ => {
                self.last_modified = Some(value);
                Ok(())
            }
        }
    }

    /// Remember an identifier the server confirmed.
    pub fn record_succeeded(&mut self, id: &str) -> crate::error::Result<()> {
        if id.is_empty() {
            return Err(crate::error::Error::EmptyRecordId);
        }
        self.success_ids.push(id.to_string());
        Ok(())
    }

    /// Hand over the successes collected so far.
    pub fn take_success_ids(&mut self) -> Vec<String> {
        std::mem::take(&mut self.success_ids)
    }

    /// Batching mode implied by a response, without applying it.
    ///
    /// A token means batching. A plain answer to a non-commit request before
    /// any token means no batching. A plain answer to a commit says nothing:
    /// a batching server closes `batch=true&commit=true` with a plain `200`.
    pub fn observed_mode(&self, carried_token: bool, is_commit: bool) -> BatchingMode {
        let observed = if carried_token {
            BatchingMode::Enabled
        } else if self.mode == BatchingMode::Undetermined && !is_commit {
            BatchingMode::Disabled
        } else {
            BatchingMode::Undetermined
        };
        self.mode.transition(observed)
    }

    /// Apply a batching mode, either observed or forced by the caller.
    pub fn set_mode(&mut self, mode: BatchingMode) {
        self.mode = self.mode.transition(mode);
    }

    /// Metadata for the batch that follows a commit: the server timestamp and
    /// batching mode carry over, token and successes start empty.
    pub fn next_batch(&self) -> Whiteboard {
        Whiteboard {
            last_modified: self.last_modified,
            token: None,
            success_ids: Vec::new(),
            mode: self.mode,
        }
    }
}
