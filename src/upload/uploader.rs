//! Uploader: accepts the record stream and decides where payloads and
//! batches end.
//!
//! Called from a single producer. Flushed payloads are handed to the
//! [`Dispatcher`], which posts them in order on its worker task.

use crate::config::UploaderConfig;
use crate::error::{Error, Result, UploadError};
use crate::upload::budget::{accept, admit, Admission, BatchBudget};
use crate::upload::channel::{PayloadJob, UploadStats};
use crate::upload::dispatcher::Dispatcher;
use crate::upload::payload::{Payload, PAYLOAD_FRAMING_BYTES, RECORD_SEPARATOR_OVERHEAD};
use crate::upload::record::OutgoingRecord;
use crate::upload::transport::{StoreDelegate, Transport};
use crate::upload::whiteboard::BatchingMode;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, trace, warn};
use url::Url;

pub struct Uploader {
    payload: Payload,
    batch: BatchBudget,
    mode: BatchingMode,
    mode_rx: watch::Receiver<BatchingMode>,
    dispatcher: Dispatcher,
    delegate: Arc<dyn StoreDelegate>,
    finalized: bool,
    payloads_queued: u64,
    commits_queued: u64,
}

impl Uploader {
    /// Start an upload session on the current tokio runtime.
    pub fn new<T: Transport>(
        config: UploaderConfig,
        collection: &str,
        transport: Arc<T>,
        delegate: Arc<dyn StoreDelegate>,
    ) -> Result<Self> {
        Self::with_runtime(&Handle::current(), config, collection, transport, delegate)
    }

    /// Start an upload session whose worker runs on `runtime`.
    pub fn with_runtime<T: Transport>(
        runtime: &Handle,
        config: UploaderConfig,
        collection: &str,
        transport: Arc<T>,
        delegate: Arc<dyn StoreDelegate>,
    ) -> Result<Self> {
        config.validate()?;
        let collection = Url::parse(collection)?;

        let dispatcher = Dispatcher::spawn_on(
            runtime,
            transport,
            delegate.clone(),
            collection,
            config.abort_on_payload_failure,
        );

        Ok(Self {
            payload: Payload::new(
                config.effective_post_bytes(),
                config.max_post_records,
                config.early_flush_margin,
            ),
            batch: BatchBudget::new(
                config.max_total_bytes,
                config.max_total_records,
                config.early_flush_margin,
            ),
            mode: BatchingMode::Undetermined,
            mode_rx: dispatcher.batching_mode(),
            dispatcher,
            delegate,
            finalized: false,
            payloads_queued: 0,
            commits_queued: 0,
        })
    }

    /// Add one record to the stream, flushing payloads and committing
    /// batches as their budgets fill up.
    ///
    /// Records that can never be uploaded are reported to the delegate and
    /// skipped; errors here mean the uploader itself was misused.
    pub fn process<R: OutgoingRecord + ?Sized>(&mut self, record: &R) -> Result<()> {
        if self.finalized {
            return Err(Error::Finalized);
        }
        self.sync_mode();

        let id = record.id();
        if id.is_empty() {
            return Err(Error::EmptyRecordId);
        }

        let bytes = match record.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(id, error = %e, "Skipping record that failed to encode");
                self.delegate.on_record_store_failed(&e, id);
                return Ok(());
            }
        };

        let delta = bytes.len() + RECORD_SEPARATOR_OVERHEAD;
        if delta + PAYLOAD_FRAMING_BYTES > self.payload.max_bytes() {
            let error = UploadError::RecordTooLarge {
                bytes: delta,
                limit: self.payload.max_bytes(),
            };
            warn!(id, %error, "Skipping oversized record");
            self.delegate.on_record_store_failed(&error, id);
            return Ok(());
        }

        match admit(&self.payload, &self.batch, delta) {
            Admission::Fits | Admission::BatchFull => {}
            Admission::PayloadFull => {
                debug!("Payload cannot fit incoming record, flushing");
                self.flush(false, false)?;
            }
            Admission::WouldOverflowBatch => {
                debug!("Batch cannot fit incoming record, committing");
                self.flush(true, false)?;
            }
        }

        trace!(id, delta, "Adding record to payload");
        match accept(&mut self.payload, &mut self.batch, delta, bytes, id.to_string())? {
            Admission::BatchFull => {
                debug!("Batch is nearly full, committing early");
                self.flush(true, false)?;
            }
            Admission::PayloadFull => {
                debug!("Payload is nearly full, flushing");
                self.flush(false, false)?;
            }
            Admission::Fits | Admission::WouldOverflowBatch => {}
        }

        Ok(())
    }

    /// Flush whatever is pending after the last record and close any open
    /// batch. Safe to call more than once.
    pub fn commit_if_necessary_after_last_payload(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        self.sync_mode();

        if !self.payload.is_empty() {
            debug!(records = self.payload.len(), "Flushing final payload");
            return self.flush(true, true);
        }

        if self.batch.needs_commit() && !self.mode.is_disabled() {
            debug!("Closing open batch with an empty commit");
            return self.flush(true, true);
        }

        debug!("Nothing left to upload");
        Ok(())
    }

    /// Override the batching policy.
    ///
    /// Turning batching off first commits any batch still open, then drops
    /// batch-level budgets. Later payloads are posted without batch
    /// parameters, and the worker learns the new mode with the next one.
    pub fn set_in_batching_mode(&mut self, enabled: bool) -> Result<()> {
        debug!(enabled, "Batching mode set by caller");
        if !enabled && !self.mode.is_disabled() && self.batch.needs_commit() {
            debug!(records = self.payload.len(), "Closing open batch before disabling batching");
            self.flush(true, false)?;
        }
        self.mode = self.mode.transition(BatchingMode::from(enabled));
        self.batch.set_unlimited(self.mode.is_disabled());
        Ok(())
    }

    pub fn batching_mode(&self) -> BatchingMode {
        self.mode
    }

    /// Records accumulated in the current, not yet flushed payload.
    pub fn pending_records(&self) -> usize {
        self.payload.len()
    }

    pub fn payloads_queued(&self) -> u64 {
        self.payloads_queued
    }

    pub fn commits_queued(&self) -> u64 {
        self.commits_queued
    }

    /// Finalise the session and wait for every payload to be processed.
    pub async fn finish(mut self) -> Result<UploadStats> {
        self.commit_if_necessary_after_last_payload()?;
        self.dispatcher.finish().await
    }

    fn flush(&mut self, is_commit: bool, is_last: bool) -> Result<()> {
        let is_commit = is_commit && !self.mode.is_disabled();
        let fresh = self.payload.fresh();
        let payload = std::mem::replace(&mut self.payload, fresh);

        let job = PayloadJob::from_payload(payload, is_commit, is_last).with_mode(self.mode);
        self.dispatcher.queue_job(job)?;
        self.payloads_queued += 1;

        if is_commit {
            self.commits_queued += 1;
            self.batch.reset();
        }
        Ok(())
    }

    /// Adopt the worker's latest batching-mode observation.
    fn sync_mode(&mut self) {
        if !self.mode_rx.has_changed().unwrap_or(false) {
            return;
        }
        let observed = *self.mode_rx.borrow_and_update();
        let mode = self.mode.transition(observed);
        if mode != self.mode {
            debug!(?mode, "Server batching support observed");
            self.mode = mode;
            self.batch.set_unlimited(mode.is_disabled());
        }
    }
}
